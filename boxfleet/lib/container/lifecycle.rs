//! Container lifecycle: resume, bounded stop, destroy.

use std::{
    path::PathBuf,
    time::Duration,
};

use tokio::time::{sleep, Instant};

use crate::{
    utils::{
        BUNDLE_SUBDIR, CONTAINER_ID, CONTAINER_LOG_FILENAME, LOG_SUBDIR, ROOTFS_SUBDIR,
        RUNTIME_STATE_SUBDIR,
    },
    BoxfleetError, BoxfleetResult,
};

use super::{ContainerStatus, OciRuntime};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long to wait for the container to exit after each signal.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How often to re-check the container state while waiting.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives one sandbox's container through its lifecycle.
pub struct ContainerManager {
    runtime: OciRuntime,
    sandbox_dir: PathBuf,
}

/// What bringing the container up requires, given its observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumeAction {
    /// Already running, nothing to do.
    Reuse,
    /// Created but never started.
    Start,
    /// No container on record.
    CreateAndStart,
    /// A stopped container cannot be restarted, only replaced.
    Replace,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerManager {
    /// Binds a runtime handle to a sandbox directory.
    pub fn new(runtime: OciRuntime, sandbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            sandbox_dir: sandbox_dir.into(),
        }
    }

    /// The OCI bundle directory the container is created from.
    pub fn bundle_dir(&self) -> PathBuf {
        self.sandbox_dir.join(BUNDLE_SUBDIR)
    }

    /// Brings the container to running, reusing whatever survived a previous
    /// run-process.
    pub async fn ensure_running(&self) -> BoxfleetResult<()> {
        let status = self.runtime.status().await?;
        match resume_action(&status) {
            Some(ResumeAction::Reuse) => {
                tracing::info!("container already running, reusing it");
                Ok(())
            }
            Some(ResumeAction::Start) => {
                tracing::info!("container already created, starting it");
                self.runtime.start().await
            }
            Some(ResumeAction::CreateAndStart) => self.create_and_start().await,
            Some(ResumeAction::Replace) => {
                tracing::info!("replacing stopped container");
                self.runtime.delete().await?;
                self.create_and_start().await
            }
            None => Err(BoxfleetError::custom(anyhow::anyhow!(
                "container is in unexpected state: {}",
                status
            ))),
        }
    }

    /// The container's current state.
    pub async fn status(&self) -> BoxfleetResult<ContainerStatus> {
        self.runtime.status().await
    }

    /// Whether the container process is currently running.
    pub async fn is_running(&self) -> BoxfleetResult<bool> {
        Ok(self.runtime.status().await? == ContainerStatus::Running)
    }

    /// Runs a command inside the container, returning its exit code.
    pub async fn exec(&self, command: &[String], tty: bool) -> BoxfleetResult<i32> {
        self.runtime.exec(command, tty).await
    }

    /// Stops the container: SIGTERM, a bounded wait, then SIGKILL and one
    /// more bounded wait. A container that survives both is a fatal error.
    pub async fn stop_or_kill(&self) -> BoxfleetResult<()> {
        match self.runtime.status().await? {
            ContainerStatus::Absent | ContainerStatus::Stopped => return Ok(()),
            _ => {}
        }

        if self.signal_and_wait("SIGTERM").await? {
            return Ok(());
        }
        tracing::warn!(
            "container ignored SIGTERM for {:?}, escalating to SIGKILL",
            STOP_TIMEOUT
        );
        if self.signal_and_wait("SIGKILL").await? {
            return Ok(());
        }

        Err(BoxfleetError::ContainerStopTimeout(CONTAINER_ID.to_string()))
    }

    /// Stops the container if needed, deletes it, and removes its root
    /// filesystem and runtime state directories.
    pub async fn destroy(&self) -> BoxfleetResult<()> {
        self.stop_or_kill().await?;
        self.runtime.delete().await?;

        for subdir in [ROOTFS_SUBDIR, RUNTIME_STATE_SUBDIR] {
            let dir = self.sandbox_dir.join(subdir);
            if let Err(error) = tokio::fs::remove_dir_all(&dir).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    return Err(error.into());
                }
            }
        }

        Ok(())
    }

    async fn create_and_start(&self) -> BoxfleetResult<()> {
        let log_path = self.sandbox_dir.join(LOG_SUBDIR).join(CONTAINER_LOG_FILENAME);
        self.runtime.create(&self.bundle_dir(), &log_path).await?;
        self.runtime.start().await
    }

    /// Sends a signal and polls until the container reaches a terminal state
    /// or the wait times out. True when it stopped.
    async fn signal_and_wait(&self, signal: &str) -> BoxfleetResult<bool> {
        if let Err(error) = self.runtime.kill(signal).await {
            // The signal can race the container exiting on its own.
            if self.has_stopped().await? {
                return Ok(true);
            }
            return Err(error);
        }

        let deadline = Instant::now() + STOP_TIMEOUT;
        loop {
            if self.has_stopped().await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(STOP_POLL_INTERVAL).await;
        }
    }

    async fn has_stopped(&self) -> BoxfleetResult<bool> {
        Ok(matches!(
            self.runtime.status().await?,
            ContainerStatus::Absent | ContainerStatus::Stopped
        ))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn resume_action(status: &ContainerStatus) -> Option<ResumeAction> {
    match status {
        ContainerStatus::Running => Some(ResumeAction::Reuse),
        ContainerStatus::Created => Some(ResumeAction::Start),
        ContainerStatus::Absent => Some(ResumeAction::CreateAndStart),
        ContainerStatus::Stopped => Some(ResumeAction::Replace),
        ContainerStatus::Other(_) => None,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resume_action_per_state() {
        assert_eq!(
            resume_action(&ContainerStatus::Running),
            Some(ResumeAction::Reuse)
        );
        assert_eq!(
            resume_action(&ContainerStatus::Created),
            Some(ResumeAction::Start)
        );
        assert_eq!(
            resume_action(&ContainerStatus::Absent),
            Some(ResumeAction::CreateAndStart)
        );
        assert_eq!(
            resume_action(&ContainerStatus::Stopped),
            Some(ResumeAction::Replace)
        );
        assert_eq!(
            resume_action(&ContainerStatus::Other("paused".to_string())),
            None
        );
    }
}
