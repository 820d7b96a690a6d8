use crate::types::{MonitorError, Result};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Parse an update interval such as `3600`, `90s`, `15m`, `6h`, `1d` or `2w`.
///
/// A bare number is seconds. Zero is rejected.
pub fn parse_interval(text: &str) -> Result<Duration> {
    let text = text.trim();
    let invalid = || MonitorError::Configuration(format!("invalid interval: {:?}", text));

    if text.is_empty() {
        return Err(invalid());
    }

    let (digits, unit) = match text.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, "s"),
    };

    let amount: u64 = digits.parse().map_err(|_| invalid())?;
    let multiplier = match unit.trim() {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        "w" => 7 * 86_400,
        _ => return Err(invalid()),
    };

    if amount == 0 {
        return Err(invalid());
    }

    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(invalid)
}

/// Convert to a chrono duration, saturating instead of failing.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    let millis = duration.as_millis().min(i64::MAX as u128 / 2) as i64;
    chrono::Duration::milliseconds(millis)
}

/// Compact human form used in log lines, e.g. `1h30m`.
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    if secs == 0 {
        return format!("{}ms", duration.as_millis());
    }

    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3600), ("m", 60), ("s", 1)] {
        if secs >= size {
            out.push_str(&format!("{}{}", secs / size, unit));
            secs %= size;
        }
    }
    out
}

/// Leading whitespace of a line.
pub fn indent_of(line: &str) -> &str {
    let trimmed = line.trim_start();
    &line[..line.len() - trimmed.len()]
}

pub struct ShellOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("cannot start shell: {0}")]
    Spawn(std::io::Error),
    #[error("i/o error: {0}")]
    Io(std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Run `sh -c command`, optionally feeding `input` on stdin.
///
/// The child is killed if it outlives `timeout`.
pub async fn run_shell(
    command: &str,
    input: Option<&str>,
    timeout: Duration,
) -> std::result::Result<ShellOutput, ShellError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(ShellError::Spawn)?;

    if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
        let data = input.as_bytes().to_vec();
        // A child that exits without reading its input closes the pipe early
        tokio::spawn(async move {
            let _ = stdin.write_all(&data).await;
        });
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ShellError::Timeout(timeout))?
        .map_err(ShellError::Io)?;

    Ok(ShellOutput {
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
