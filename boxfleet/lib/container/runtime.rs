//! Thin driver over the machine's OCI runtime binary.
//!
//! Every sandbox gets its own runtime state root, so container ids never
//! collide across sandboxes and deleting a sandbox directory cannot leave
//! stale shared state behind.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::Stdio,
};

use serde::Deserialize;
use tokio::process::Command;

use crate::{
    utils::{self, CONTAINER_ID},
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Handle to one sandbox's container, addressed through the runtime binary
/// and a per-sandbox state root.
#[derive(Debug, Clone)]
pub struct OciRuntime {
    /// Resolved path of the runtime binary.
    binary: String,

    /// The `--root` directory holding this sandbox's runtime state.
    state_root: PathBuf,
}

/// Lifecycle states the runtime reports, plus `Absent` for a container that
/// was never created or has been deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    /// The runtime has no record of the container.
    Absent,
    /// Created but never started.
    Created,
    /// The container process is running.
    Running,
    /// The container process has exited.
    Stopped,
    /// Any state this crate does not model, reported verbatim.
    Other(String),
}

/// Subset of the runtime's `state` output the reconciler reads.
#[derive(Debug, Deserialize)]
struct RuntimeState {
    status: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OciRuntime {
    /// Resolves the runtime binary on PATH and binds it to a state root.
    pub fn new(binary: &str, state_root: impl Into<PathBuf>) -> BoxfleetResult<Self> {
        let binary = which::which(binary)
            .map_err(|_| BoxfleetError::RuntimeNotFound(binary.to_string()))?;

        Ok(Self {
            binary: binary.to_string_lossy().into_owned(),
            state_root: state_root.into(),
        })
    }

    /// Creates the container from a bundle, detached.
    ///
    /// The runtime's stdio is redirected to `log_path` and stays attached to
    /// the container process afterwards, so everything the container writes
    /// lands in that file. On failure the log tail doubles as the error
    /// detail, since stderr went there too.
    pub async fn create(&self, bundle_dir: &Path, log_path: &Path) -> BoxfleetResult<()> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let log_err = log.try_clone()?;

        let root = self.state_root.to_string_lossy();
        let bundle = bundle_dir.to_string_lossy();
        tracing::debug!("creating container from bundle {}", bundle);

        let status = Command::new(&self.binary)
            .args(["--root", &*root, "create", "--bundle", &*bundle, CONTAINER_ID])
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await?;

        if !status.success() {
            return Err(BoxfleetError::CommandFailed {
                command: format!(
                    "{} --root {} create --bundle {} {}",
                    self.binary, root, bundle, CONTAINER_ID
                ),
                status: status.code().unwrap_or(-1),
                stderr: log_tail(log_path).await,
            });
        }

        Ok(())
    }

    /// Starts a created container.
    pub async fn start(&self) -> BoxfleetResult<()> {
        let root = self.state_root.to_string_lossy();
        utils::run(&self.binary, &["--root", &root, "start", CONTAINER_ID]).await
    }

    /// Reports the container's state, `Absent` when the runtime has no
    /// record of it.
    pub async fn status(&self) -> BoxfleetResult<ContainerStatus> {
        let root = self.state_root.to_string_lossy();
        let output =
            utils::command_output(&self.binary, &["--root", &root, "state", CONTAINER_ID]).await?;

        if !output.success() {
            if output.is_not_found() {
                return Ok(ContainerStatus::Absent);
            }
            return Err(output.into_error());
        }

        let state: RuntimeState = serde_json::from_str(output.stdout()).map_err(|e| {
            BoxfleetError::UnexpectedCommandOutput {
                command: output.command().to_string(),
                reason: e.to_string(),
            }
        })?;

        Ok(parse_status(&state.status))
    }

    /// Sends a signal to the container process.
    pub async fn kill(&self, signal: &str) -> BoxfleetResult<()> {
        let root = self.state_root.to_string_lossy();
        utils::run(&self.binary, &["--root", &root, "kill", CONTAINER_ID, signal]).await
    }

    /// Deletes a stopped container. An absent container counts as deleted.
    pub async fn delete(&self) -> BoxfleetResult<()> {
        let root = self.state_root.to_string_lossy();
        utils::run_tolerating_absent(&self.binary, &["--root", &root, "delete", CONTAINER_ID])
            .await?;
        Ok(())
    }

    /// Runs a command inside the running container with inherited stdio and
    /// returns its exit code.
    pub async fn exec(&self, command: &[String], tty: bool) -> BoxfleetResult<i32> {
        let root = self.state_root.to_string_lossy();
        let mut args: Vec<&str> = vec!["--root", &*root, "exec"];
        if tty {
            args.push("-t");
        }
        args.push(CONTAINER_ID);
        args.extend(command.iter().map(|s| s.as_str()));

        let status = Command::new(&self.binary).args(&args).status().await?;
        Ok(status.code().unwrap_or(-1))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn parse_status(status: &str) -> ContainerStatus {
    match status {
        "created" => ContainerStatus::Created,
        "running" => ContainerStatus::Running,
        "stopped" => ContainerStatus::Stopped,
        other => ContainerStatus::Other(other.to_string()),
    }
}

/// The last few lines of a log file, for error messages.
async fn log_tail(path: &Path) -> String {
    let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
    let mut lines: Vec<&str> = contents.lines().rev().take(4).collect();
    lines.reverse();
    lines.join("\n").trim().to_string()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerStatus::Absent => write!(f, "absent"),
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Other(other) => write!(f, "{}", other),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parsing() {
        assert_eq!(parse_status("created"), ContainerStatus::Created);
        assert_eq!(parse_status("running"), ContainerStatus::Running);
        assert_eq!(parse_status("stopped"), ContainerStatus::Stopped);
        assert_eq!(
            parse_status("paused"),
            ContainerStatus::Other("paused".to_string())
        );
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ContainerStatus::Running.to_string(), "running");
        assert_eq!(ContainerStatus::Absent.to_string(), "absent");
        assert_eq!(
            ContainerStatus::Other("creating".to_string()).to_string(),
            "creating"
        );
    }

    #[test]
    fn test_missing_runtime_binary_is_distinguished() {
        let result = OciRuntime::new("definitely-not-a-container-runtime", "/tmp/run");
        assert!(matches!(result, Err(BoxfleetError::RuntimeNotFound(_))));
    }

    #[tokio::test]
    async fn test_log_tail_keeps_last_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("container.log");
        tokio::fs::write(&path, "one\ntwo\nthree\nfour\nfive\nsix\n").await?;

        assert_eq!(log_tail(&path).await, "three\nfour\nfive\nsix");
        assert_eq!(log_tail(&dir.path().join("missing.log")).await, "");

        Ok(())
    }

    #[test]
    fn test_state_parsing_from_runtime_json() {
        let state: RuntimeState =
            serde_json::from_str(r#"{"ociVersion":"1.0.2","id":"sandbox","status":"running","pid":4242,"bundle":"/work/bundle"}"#)
                .unwrap();
        assert_eq!(parse_status(&state.status), ContainerStatus::Running);
    }
}
