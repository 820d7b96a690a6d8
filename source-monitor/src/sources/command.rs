use crate::types::{FetchAdapter, FetchError, FetchErrorKind, FetchOutcome, Props, SourceKind, SourceSettings};
use crate::utils::{run_shell, ShellError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Runs the configured shell command; its stdout is the content.
#[derive(Debug, Default)]
pub struct CommandSource;

impl CommandSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FetchAdapter for CommandSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Command
    }

    async fn fetch(&self, settings: &SourceSettings, _hints: &Props) -> Result<FetchOutcome, FetchError> {
        let SourceSettings::Command(settings) = settings else {
            return Err(FetchError::permanent(
                FetchErrorKind::Other,
                format!("command adapter got {} settings", settings.kind()),
            ));
        };

        debug!("Running command: {}", settings.command);
        let output = run_shell(&settings.command, None, Duration::from_secs(settings.timeout_seconds))
            .await
            .map_err(|e| match e {
                ShellError::Timeout(_) => FetchError::timeout(settings.timeout_seconds),
                ShellError::Spawn(e) => FetchError::permanent(FetchErrorKind::Subprocess, e.to_string()),
                ShellError::Io(e) => FetchError::retryable(FetchErrorKind::Subprocess, e.to_string()),
            })?;

        if !output.status.success() {
            return Err(FetchError::permanent(
                FetchErrorKind::Subprocess,
                format!("command exited with {}: {}", output.status, output.stderr.trim()),
            ));
        }

        info!("Command produced {} bytes", output.stdout.len());
        Ok(FetchOutcome::single(output.stdout, Props::new()))
    }
}
