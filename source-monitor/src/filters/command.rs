use super::{boxed, parse_params, FilterError, Params};
use crate::traits::{FilterContext, Transform, TransformOutput};
use crate::types::{Item, Result};
use crate::utils::{run_shell, ShellError};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Pipe each item's content through `sh -c cmd`; stdout replaces the content.
pub struct CommandFilter {
    cmd: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandParams {
    cmd: String,
    #[serde(default = "default_timeout")]
    timeout_seconds: u64,
}

fn default_timeout() -> u64 {
    30
}

impl CommandFilter {
    pub const NAME: &'static str = "command";

    pub fn build(params: &Params) -> std::result::Result<Arc<dyn Transform>, FilterError> {
        let params: CommandParams = parse_params(params)?;
        if params.cmd.trim().is_empty() {
            return Err(FilterError::Invalid("cmd is empty".to_string()));
        }
        if params.timeout_seconds == 0 {
            return Err(FilterError::Invalid("timeout_seconds must be at least 1".to_string()));
        }
        boxed(Self {
            cmd: params.cmd,
            timeout: Duration::from_secs(params.timeout_seconds),
        })
    }

    async fn run(&self, item: Item) -> std::result::Result<Item, FilterError> {
        let output = run_shell(&self.cmd, Some(&item.content), self.timeout)
            .await
            .map_err(|e| match e {
                ShellError::Timeout(_) => FilterError::Failed(format!("{} {}", self.cmd, e)),
                other => FilterError::Failed(other.to_string()),
            })?;

        if !output.status.success() {
            return Err(FilterError::Failed(format!(
                "{} exited with {}: {}",
                self.cmd,
                output.status,
                output.stderr.trim()
            )));
        }
        Ok(item.derive(output.stdout))
    }
}

#[async_trait]
impl Transform for CommandFilter {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn apply(
        &self,
        items: Vec<Item>,
        _state: Option<serde_json::Value>,
        _ctx: &FilterContext<'_>,
    ) -> Result<TransformOutput> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let item = self.run(item).await.map_err(|e| e.into_monitor(Self::NAME))?;
            out.push(item);
        }
        debug!("Command filter {} produced {} items", self.cmd, out.len());
        Ok(TransformOutput::items(out))
    }
}
