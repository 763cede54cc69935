//! Bounded execution of external commands
//!
//! Every subprocess curfew starts (nft, DNS flush) goes through [`run`]:
//! stdout/stderr are captured, optional input is fed on stdin and the whole
//! exchange is bounded by a timeout. A child that outlives its budget is
//! killed when its handle is dropped.

use crate::core::error::{CommandFailure, Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// Captured output of a successful command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

fn program_name(cmd: &Command) -> String {
    cmd.as_std().get_program().to_string_lossy().into_owned()
}

/// Runs `cmd`, feeding `input` on stdin, and waits at most `timeout`.
///
/// # Errors
///
/// - `Error::Timeout` when the command did not exit in time
/// - `Error::ExternalCommand` when it could not be spawned or exited
///   unsuccessfully; `failure` classifies the diagnostics
pub async fn run(mut cmd: Command, input: Option<&str>, timeout: Duration) -> Result<CommandOutput> {
    let program = program_name(&cmd);

    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let exchange = async {
        let mut child = cmd.spawn()?;
        if let Some(input) = input
            && let Some(mut stdin) = child.stdin.take()
        {
            stdin.write_all(input.as_bytes()).await?;
            // Close stdin so the child sees EOF
            drop(stdin);
        }
        child.wait_with_output().await
    };

    let output = match tokio::time::timeout(timeout, exchange).await {
        Err(_) => {
            error!("{} timed out after {:?}", program, timeout);
            return Err(Error::Timeout {
                program,
                secs: timeout.as_secs(),
            });
        }
        Ok(Err(e)) => {
            error!("Failed to run {}: {}", program, e);
            let failure = match e.kind() {
                std::io::ErrorKind::NotFound => CommandFailure::NotFound,
                std::io::ErrorKind::PermissionDenied => CommandFailure::AccessDenied,
                _ => CommandFailure::Other,
            };
            return Err(Error::ExternalCommand {
                message: format!("could not run {program}: {e}"),
                program,
                stderr: None,
                exit_code: None,
                failure,
            });
        }
        Ok(Ok(output)) => output,
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    if output.status.success() {
        debug!("{} succeeded", program);
        return Ok(CommandOutput { stdout, stderr });
    }

    let message = stderr
        .lines()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("exited unsuccessfully")
        .trim()
        .to_string();
    Err(Error::ExternalCommand {
        program,
        message,
        failure: CommandFailure::classify(&stderr),
        stderr: Some(stderr),
        exit_code: output.status.code(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_stdout_and_feeds_stdin() {
        let out = run(sh("cat"), Some("hello"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_classified() {
        let err = run(
            sh("echo 'Error: Operation not permitted' >&2; exit 1"),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        match err {
            Error::ExternalCommand {
                failure,
                exit_code,
                message,
                ..
            } => {
                assert_eq!(failure, CommandFailure::AccessDenied);
                assert_eq!(exit_code, Some(1));
                assert_eq!(message, "Error: Operation not permitted");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run(sh("sleep 5"), None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run(
            Command::new("curfew_nonexistent_binary_xyz"),
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalCommand {
                failure: CommandFailure::NotFound,
                ..
            }
        ));
    }
}
