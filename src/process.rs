//! Runs external programs on behalf of the delegating identity resolver.
//!
//! This is the only place in the crate that creates processes. Everything else reaches it through
//! [`ProcessRunner`], which lets tests substitute a scripted runner.

use std::io::ErrorKind;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const MAX_STDERR_IN_ERROR: usize = 512;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to start `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` did not finish within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` exited with status {code:?}: {stderr}")]
    ExitNonZero {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("i/o error while talking to `{command}`: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Runs `command_line`, feeds it `stdin`, and returns everything it wrote to stdout.
    async fn run(&self, command_line: &str, stdin: &[u8]) -> Result<Vec<u8>, ProcessError>;
}

/// Runs command lines through the platform shell so operators can pass arguments and quoting
/// the same way they would type them.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    timeout: Duration,
}

impl ShellRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line);
    command
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(command_line);
    command
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, command_line: &str, stdin: &[u8]) -> Result<Vec<u8>, ProcessError> {
        let started_at = Instant::now();
        let mut command = shell_command(command_line);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| {
            warn!(command = command_line, error = %source, "failed to spawn external program");
            ProcessError::SpawnFailed {
                command: command_line.to_string(),
                source,
            }
        })?;

        let stdin_pipe = child.stdin.take();
        let feed = async move {
            let Some(mut pipe) = stdin_pipe else {
                return Ok(());
            };
            match pipe.write_all(stdin).await {
                Ok(()) => {}
                // The program may exit without draining its input.
                Err(err) if err.kind() == ErrorKind::BrokenPipe => return Ok(()),
                Err(err) => return Err(err),
            }
            pipe.shutdown().await.or_else(|err| {
                if err.kind() == ErrorKind::BrokenPipe {
                    Ok(())
                } else {
                    Err(err)
                }
            })
        };

        let exchange = async { tokio::join!(feed, child.wait_with_output()) };
        // Dropping the exchange on timeout drops the child, which kills it.
        let (fed, output) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                warn!(
                    command = command_line,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "external program timed out"
                );
                ProcessError::Timeout {
                    command: command_line.to_string(),
                    timeout: self.timeout,
                }
            })?;

        let io_error = |source| ProcessError::Io {
            command: command_line.to_string(),
            source,
        };
        fed.map_err(io_error)?;
        let output = output.map_err(io_error)?;

        if !output.status.success() {
            let stderr = truncated_stderr(&output.stderr);
            warn!(
                command = command_line,
                exit_code = output.status.code().map(i64::from).unwrap_or(-1),
                stderr = %stderr,
                "external program failed"
            );
            return Err(ProcessError::ExitNonZero {
                command: command_line.to_string(),
                code: output.status.code(),
                stderr,
            });
        }

        debug!(
            command = command_line,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            stdout_bytes = output.stdout.len(),
            "external program finished"
        );
        Ok(output.stdout)
    }
}

fn truncated_stderr(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX_STDERR_IN_ERROR {
        return text.to_string();
    }
    let mut end = MAX_STDERR_IN_ERROR;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runner() -> ShellRunner {
        ShellRunner::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn returns_stdout_of_program() -> anyhow::Result<()> {
        let output = runner().run("cat", b"hello from stdin").await?;
        assert_eq!(output, b"hello from stdin");
        Ok(())
    }

    #[tokio::test]
    async fn passes_arguments_through_shell() -> anyhow::Result<()> {
        let output = runner().run("printf '%s-%s' a b", b"").await?;
        assert_eq!(output, b"a-b");
        Ok(())
    }

    #[tokio::test]
    async fn reports_non_zero_exit_code() {
        let err = runner()
            .run("echo nope >&2; exit 3", b"ignored")
            .await
            .expect_err("non-zero exit should fail");
        match err {
            ProcessError::ExitNonZero { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "nope");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_program_fails_through_shell() {
        let err = runner()
            .run("definitely-not-a-real-program-4711", b"")
            .await
            .expect_err("missing program should fail");
        assert!(
            matches!(err, ProcessError::ExitNonZero { code: Some(127), .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn times_out_slow_program() {
        let runner = ShellRunner::new(Duration::from_millis(100));
        let started = Instant::now();
        let err = runner
            .run("sleep 5", b"")
            .await
            .expect_err("slow program should time out");
        assert!(matches!(err, ProcessError::Timeout { .. }), "unexpected: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn tolerates_program_ignoring_large_stdin() -> anyhow::Result<()> {
        let input = vec![b'x'; 1024 * 1024];
        let output = runner().run("echo done", &input).await?;
        assert_eq!(output, b"done\n");
        Ok(())
    }

    #[test]
    fn stderr_is_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_STDERR_IN_ERROR);
        let truncated = truncated_stderr(long.as_bytes());
        assert!(truncated.ends_with("..."));
        assert!(truncated.len() <= MAX_STDERR_IN_ERROR + 3);
    }
}
