//! Subprocess execution with a hard timeout
//!
//! Every external command runs through [`run`]. On timeout the child is
//! killed and waited for, so no zombie is left behind.

use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Max bytes kept from each output stream
const OUTPUT_LIMIT: usize = 64 * 1024;

/// Grace period for draining output after the child exits
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Run `argv` to completion, killing it after `timeout`
pub async fn run<S: AsRef<str>>(argv: &[S], timeout: Duration) -> Result<CommandOutput, CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;
    let program = program.as_ref().to_string();
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = child.stdout.take().map(|s| tokio::spawn(read_limited(s)));
    let stderr = child.stderr.take().map(|s| tokio::spawn(read_limited(s)));

    debug!(program = %program, pid = ?child.id(), "Spawned command");

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => return Err(CommandError::Wait { program, source }),
        Err(_) => {
            warn!(program = %program, "Command timed out, killing");
            if let Err(e) = child.kill().await {
                warn!(program = %program, "Failed to kill timed out command: {}", e);
            }
            return Err(CommandError::Timeout { program, timeout });
        }
    };

    Ok(CommandOutput {
        code: status.code(),
        stdout: drain(stdout).await,
        stderr: drain(stderr).await,
    })
}

async fn read_limited<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if buf.len() < OUTPUT_LIMIT {
                    let take = n.min(OUTPUT_LIMIT - buf.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// A grandchild holding the pipe open must not stall the caller
async fn drain(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(output)) => output,
        Ok(Err(_)) => String::new(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_output() {
        let output = run(&["sh", "-c", "echo hello; echo oops >&2"], Duration::from_secs(5))
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let output = run(&["sh", "-c", "exit 3"], Duration::from_secs(5)).await.unwrap();

        assert!(!output.success());
        assert_eq!(output.code, Some(3));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let started = std::time::Instant::now();
        let result = run(&["sleep", "30"], Duration::from_millis(200)).await;

        assert!(matches!(result, Err(CommandError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_missing_program() {
        let result = run(&["/nonexistent/hostgate-test-binary"], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CommandError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_run_empty() {
        let empty: [&str; 0] = [];
        assert!(matches!(run(&empty, Duration::from_secs(1)).await, Err(CommandError::Empty)));
    }
}
