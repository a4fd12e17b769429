//! Local subprocess execution for kubectl and calicoctl.

use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Output from a local command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write stdin of '{command}': {source}")]
    Stdin {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with code {exit_code}: {stderr}")]
    Failed {
        command: String,
        exit_code: i32,
        stderr: String,
    },
}

/// Run a command and fail on non-zero exit code.
pub async fn run(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<CommandOutput, ProcessError> {
    let output = run_unchecked(program, args, stdin).await?;

    if !output.success() {
        return Err(ProcessError::Failed {
            command: display_command(program, args),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }

    Ok(output)
}

/// Run a command and return its output regardless of exit code.
pub async fn run_unchecked(
    program: &str,
    args: &[&str],
    stdin: Option<&str>,
) -> Result<CommandOutput, ProcessError> {
    let command = display_command(program, args);
    debug!(target: "netpol.process", command = %command, "Executing");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())
            .await
            .map_err(|source| ProcessError::Stdin {
                command: command.clone(),
                source,
            })?;
        // Dropping the pipe closes stdin so the child sees EOF.
        drop(pipe);
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    debug!(target: "netpol.process", command = %command, exit_code, "Command exited");

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code,
    })
}

fn display_command(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{} {}", program, args.join(" "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let output = run("sh", &["-c", "echo client_address=10.0.1.7"], None)
            .await
            .expect("sh should be available");
        assert_eq!(output.stdout.trim(), "client_address=10.0.1.7");
        assert!(output.success());
    }

    #[tokio::test]
    async fn test_run_passes_stdin() {
        let output = run("cat", &[], Some("kind: NetworkPolicy\n"))
            .await
            .expect("cat should be available");
        assert_eq!(output.stdout, "kind: NetworkPolicy\n");
    }

    #[tokio::test]
    async fn test_run_reports_non_zero_exit() {
        let err = run("sh", &["-c", "echo denied >&2; exit 3"], None)
            .await
            .expect_err("non-zero exit should be an error");
        match err {
            ProcessError::Failed {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "denied");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_unchecked_returns_failure_as_data() {
        let output = run_unchecked("sh", &["-c", "exit 1"], None).await.unwrap();
        assert_eq!(output.exit_code, 1);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let err = run_unchecked("definitely-not-a-real-binary-xyz", &[], None)
            .await
            .expect_err("spawn should fail");
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
