//! External command execution boundary.
//!
//! Every interaction with `ip`, `iptables`, `sh` and the OCI runtime binary
//! goes through these helpers so exit codes, stdout and stderr are captured
//! uniformly and tolerated failure patterns ("already exists", "not found")
//! are recognized in one place.

use std::process::Stdio;

use serde::de::DeserializeOwned;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{BoxfleetError, BoxfleetResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    command: String,
    status: i32,
    stdout: String,
    stderr: String,
}

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Stderr fragments meaning the resource the command tried to create is already there.
const ALREADY_EXISTS_PATTERNS: &[&str] = &["file exists", "already exists"];

/// Stderr fragments meaning the resource the command targeted is absent.
const NOT_FOUND_PATTERNS: &[&str] = &[
    "cannot find device",
    "no such file or directory",
    "no such process",
    "does not exist",
    "not found",
    "no chain/target/match by that name",
    "bad rule (does a matching rule exist",
];

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CommandOutput {
    /// Whether the command exited with status zero.
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// The rendered command line that was run.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The exit status, or -1 if the command was terminated by a signal.
    pub fn status(&self) -> i32 {
        self.status
    }

    /// Captured standard output.
    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Captured standard error.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Whether stderr indicates the resource the command tried to create already exists.
    pub fn is_already_exists(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        ALREADY_EXISTS_PATTERNS.iter().any(|p| stderr.contains(p))
    }

    /// Whether stderr indicates the resource the command targeted is absent.
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        NOT_FOUND_PATTERNS.iter().any(|p| stderr.contains(p))
    }

    /// Converts a failed command into the corresponding error.
    pub fn into_error(self) -> BoxfleetError {
        BoxfleetError::CommandFailed {
            command: self.command,
            status: self.status,
            stderr: self.stderr.trim().to_string(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs a command with captured output.
pub async fn command_output(program: &str, args: &[&str]) -> BoxfleetResult<CommandOutput> {
    let command = render(program, args);
    tracing::debug!("running `{}`", command);

    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await?;

    Ok(CommandOutput {
        command,
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs a command and fails on a non-zero exit status.
pub async fn run(program: &str, args: &[&str]) -> BoxfleetResult<()> {
    let output = command_output(program, args).await?;
    if output.success() {
        Ok(())
    } else {
        Err(output.into_error())
    }
}

/// Runs a command, treating an "already exists" failure as success.
///
/// Returns `true` when the command actually ran clean, `false` when the
/// resource was already present.
pub async fn run_tolerating_exists(program: &str, args: &[&str]) -> BoxfleetResult<bool> {
    let output = command_output(program, args).await?;
    if output.success() {
        return Ok(true);
    }
    if output.is_already_exists() {
        tracing::debug!("`{}`: already exists, continuing", output.command());
        return Ok(false);
    }
    Err(output.into_error())
}

/// Runs a command, treating a "not found" failure as success.
///
/// Teardown paths use this so that removing an absent resource counts as
/// already clean. Returns `true` when the command actually ran clean.
pub async fn run_tolerating_absent(program: &str, args: &[&str]) -> BoxfleetResult<bool> {
    let output = command_output(program, args).await?;
    if output.success() {
        return Ok(true);
    }
    if output.is_not_found() {
        tracing::debug!("`{}`: already absent, continuing", output.command());
        return Ok(false);
    }
    Err(output.into_error())
}

/// Runs a multi-line script under `sh -e -c` as a single invocation.
pub async fn run_script(script: &str) -> BoxfleetResult<()> {
    run("sh", &["-e", "-c", script]).await
}

/// Runs a command feeding `input` on stdin, failing on a non-zero exit status.
pub async fn run_with_stdin(program: &str, args: &[&str], input: &str) -> BoxfleetResult<()> {
    let command = render(program, args);
    tracing::debug!("running `{}` with {} bytes on stdin", command, input.len());

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        return Ok(());
    }

    Err(BoxfleetError::CommandFailed {
        command,
        status: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Runs a command and parses its stdout as JSON.
pub async fn command_json<T>(program: &str, args: &[&str]) -> BoxfleetResult<T>
where
    T: DeserializeOwned,
{
    let output = command_output(program, args).await?;
    if !output.success() {
        return Err(output.into_error());
    }

    serde_json::from_str(output.stdout()).map_err(|e| BoxfleetError::UnexpectedCommandOutput {
        command: output.command().to_string(),
        reason: e.to_string(),
    })
}

fn render(program: &str, args: &[&str]) -> String {
    let mut rendered = String::from(program);
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg);
    }
    rendered
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_output_captures_status_and_streams() -> anyhow::Result<()> {
        let output = command_output("sh", &["-c", "echo out; echo err >&2; exit 3"]).await?;

        assert_eq!(output.status(), 3);
        assert!(!output.success());
        assert_eq!(output.stdout().trim(), "out");
        assert_eq!(output.stderr().trim(), "err");

        Ok(())
    }

    #[tokio::test]
    async fn test_run_fails_with_command_and_stderr() {
        let err = run("sh", &["-c", "echo 'RTNETLINK answers: File exists' >&2; exit 2"])
            .await
            .unwrap_err();

        match err {
            BoxfleetError::CommandFailed {
                command,
                status,
                stderr,
            } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(status, 2);
                assert!(stderr.contains("File exists"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tolerated_patterns() -> anyhow::Result<()> {
        let ran = run_tolerating_exists("sh", &["-c", "echo 'File exists' >&2; exit 2"]).await?;
        assert!(!ran);

        let ran =
            run_tolerating_absent("sh", &["-c", "echo 'Cannot find device \"x\"' >&2; exit 1"])
                .await?;
        assert!(!ran);

        // A genuine failure still surfaces.
        assert!(run_tolerating_absent("sh", &["-c", "echo boom >&2; exit 1"])
            .await
            .is_err());

        Ok(())
    }

    #[tokio::test]
    async fn test_command_json_parses_stdout() -> anyhow::Result<()> {
        #[derive(serde::Deserialize)]
        struct Probe {
            name: String,
        }

        let probes: Vec<Probe> =
            command_json("sh", &["-c", r#"echo '[{"name":"lo"}]'"#]).await?;
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].name, "lo");

        Ok(())
    }

    #[tokio::test]
    async fn test_run_with_stdin_feeds_input() -> anyhow::Result<()> {
        run_with_stdin("sh", &["-c", "grep -q needle"], "hay\nneedle\n").await?;

        assert!(run_with_stdin("sh", &["-c", "grep -q needle"], "hay\n")
            .await
            .is_err());

        Ok(())
    }
}
