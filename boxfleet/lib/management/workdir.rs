//! On-disk layout of the machine work directory and per-sandbox state.
//!
//! Every sandbox owns one directory under `<work_dir>/sandboxes/<box_id>`
//! holding its OCI bundle, runtime state root, staged rootfs, logs, and the
//! small metadata files the reconciler and the run-process coordinate
//! through: `sandbox.json` identifies the box the directory belongs to and
//! `sandbox.pid` names the live run-process, if any.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use getset::{CopyGetters, Getters};
use ipnetwork::Ipv4Network;
use nix::{sys::signal, unistd::Pid};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::MachineConfig,
    utils::{
        BUNDLE_SUBDIR, CONTAINERS_SUBDIR, LOG_SUBDIR, RUNNER_LOG_FILENAME, RUNTIME_STATE_SUBDIR,
        SANDBOXES_SUBDIR, SANDBOX_INFO_FILENAME, SANDBOX_PID_FILENAME, STATUS_SUBDIR,
        VOLUMES_SUBDIR,
    },
    BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Identity record persisted in each sandbox directory.
///
/// The uuid pins the directory to one assignment generation: a re-created box
/// with the same id but a new uuid must not silently reuse leftover state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Getters, CopyGetters)]
pub struct SandboxInfo {
    /// The box this sandbox belongs to.
    #[getset(get = "pub with_prefix")]
    box_id: String,

    /// The assignment generation the sandbox was provisioned for.
    #[getset(get_copy = "pub with_prefix")]
    box_uuid: Uuid,

    /// The point-to-point subnet reserved for the sandbox's veth pair.
    #[getset(get_copy = "pub with_prefix")]
    cidr: Ipv4Network,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxInfo {
    /// Creates a new sandbox identity record.
    pub fn new(box_id: impl Into<String>, box_uuid: Uuid, cidr: Ipv4Network) -> Self {
        Self {
            box_id: box_id.into(),
            box_uuid,
            cidr,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates the machine-level directories a reconciler pass relies on.
pub async fn ensure_machine_layout(config: &MachineConfig) -> BoxfleetResult<()> {
    let work_dir = config.get_work_dir();
    tokio::fs::create_dir_all(work_dir.join(SANDBOXES_SUBDIR)).await?;
    tokio::fs::create_dir_all(work_dir.join(STATUS_SUBDIR)).await?;
    tokio::fs::create_dir_all(config.control_dir()).await?;
    tokio::fs::create_dir_all(config.image_store_dir()).await?;
    Ok(())
}

/// Creates the inner directories of a sandbox directory.
///
/// The rootfs directory is deliberately not created here: its absence is how
/// provisioning knows an image still needs to be staged.
pub async fn ensure_sandbox_layout(sandbox_dir: &Path) -> BoxfleetResult<()> {
    for subdir in [
        BUNDLE_SUBDIR,
        RUNTIME_STATE_SUBDIR,
        CONTAINERS_SUBDIR,
        LOG_SUBDIR,
        VOLUMES_SUBDIR,
    ] {
        tokio::fs::create_dir_all(sandbox_dir.join(subdir)).await?;
    }
    Ok(())
}

/// Persists the sandbox identity record.
pub async fn save_sandbox_info(sandbox_dir: &Path, info: &SandboxInfo) -> BoxfleetResult<()> {
    let contents = serde_json::to_string_pretty(info)?;
    tokio::fs::write(sandbox_dir.join(SANDBOX_INFO_FILENAME), contents).await?;
    Ok(())
}

/// Loads the sandbox identity record, if one exists and parses.
pub async fn load_sandbox_info(sandbox_dir: &Path) -> Option<SandboxInfo> {
    let contents = tokio::fs::read_to_string(sandbox_dir.join(SANDBOX_INFO_FILENAME))
        .await
        .ok()?;
    serde_json::from_str(&contents).ok()
}

/// Lists the box ids that have a sandbox directory, sorted.
pub async fn list_sandboxes(work_dir: &Path) -> BoxfleetResult<Vec<String>> {
    let sandboxes_dir = work_dir.join(SANDBOXES_SUBDIR);
    let mut entries = match tokio::fs::read_dir(&sandboxes_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut ids = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    ids.sort();
    Ok(ids)
}

/// Records the calling process as the sandbox's run-process.
pub async fn write_pidfile(sandbox_dir: &Path) -> BoxfleetResult<()> {
    let pid = std::process::id();
    tokio::fs::write(sandbox_dir.join(SANDBOX_PID_FILENAME), pid.to_string()).await?;
    Ok(())
}

/// Reads the recorded run-process pid, if the pidfile exists and parses.
pub async fn read_pidfile(sandbox_dir: &Path) -> Option<i32> {
    let contents = tokio::fs::read_to_string(sandbox_dir.join(SANDBOX_PID_FILENAME))
        .await
        .ok()?;
    contents.trim().parse().ok()
}

/// Removes the run-process pidfile, tolerating its absence.
pub async fn remove_pidfile(sandbox_dir: &Path) {
    let _ = tokio::fs::remove_file(sandbox_dir.join(SANDBOX_PID_FILENAME)).await;
}

/// Whether a process with the given pid exists.
pub fn process_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Returns the path of the run-process log inside a sandbox directory.
pub fn runner_log_path(sandbox_dir: &Path) -> PathBuf {
    sandbox_dir.join(RUNNER_LOG_FILENAME)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_sandbox_layout_and_info_roundtrip() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let sandbox_dir = temp.path().join("sandboxes").join("api");

        ensure_sandbox_layout(&sandbox_dir).await?;

        for subdir in ["bundle", "run", "containers", "logs", "volumes"] {
            assert!(sandbox_dir.join(subdir).is_dir(), "missing {subdir}");
        }
        assert!(!sandbox_dir.join("rootfs").exists());

        let info = SandboxInfo::new("api", Uuid::new_v4(), "10.100.0.0/30".parse()?);
        save_sandbox_info(&sandbox_dir, &info).await?;
        let loaded = load_sandbox_info(&sandbox_dir).await;
        assert_eq!(loaded, Some(info));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_load_sandbox_info_absent_or_corrupt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert_eq!(load_sandbox_info(temp.path()).await, None);

        tokio::fs::write(temp.path().join(SANDBOX_INFO_FILENAME), "not json").await?;
        assert_eq!(load_sandbox_info(temp.path()).await, None);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_list_sandboxes_sorted_dirs_only() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        assert!(list_sandboxes(temp.path()).await?.is_empty());

        let sandboxes_dir = temp.path().join(SANDBOXES_SUBDIR);
        tokio::fs::create_dir_all(sandboxes_dir.join("worker")).await?;
        tokio::fs::create_dir_all(sandboxes_dir.join("api")).await?;
        tokio::fs::write(sandboxes_dir.join("stray.txt"), "x").await?;

        assert_eq!(list_sandboxes(temp.path()).await?, vec!["api", "worker"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_pidfile_roundtrip_and_liveness() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;

        assert_eq!(read_pidfile(temp.path()).await, None);
        write_pidfile(temp.path()).await?;

        let pid = read_pidfile(temp.path()).await.unwrap();
        assert_eq!(pid, std::process::id() as i32);
        assert!(process_alive(pid));

        remove_pidfile(temp.path()).await;
        assert_eq!(read_pidfile(temp.path()).await, None);
        // Removing again must stay quiet.
        remove_pidfile(temp.path()).await;

        Ok(())
    }

    #[test]
    fn test_process_alive_rejects_vanished_pid() {
        // Above the default kernel pid ceiling, so nothing can own it.
        assert!(!process_alive(1_999_999_999));
    }
}
