//! The control-plane boundary: what boxes this machine should run, and
//! where machine and sandbox status get reported.
//!
//! The in-tree implementation is file backed: assignments come from a YAML
//! boxes file that is re-read on every use, and status reports land as JSON
//! files under the work directory. Anything network backed implements the
//! same trait out of tree.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{config::BoxSpec, BoxfleetError, BoxfleetResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One box the control plane has assigned to a machine.
#[derive(Debug, Clone, PartialEq, Eq, Getters, CopyGetters)]
pub struct BoxAssignment {
    /// The box id, which also names the sandbox directory.
    #[getset(get = "pub with_prefix")]
    id: String,

    /// Identifies this assignment of the box; a redeployed box keeps its id
    /// but gets a fresh uuid.
    #[getset(get_copy = "pub with_prefix")]
    uuid: Uuid,

    /// Disabled boxes stay assigned but must not run.
    #[getset(get_copy = "pub with_prefix")]
    enabled: bool,
}

/// Aggregate state of the machine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// The process is up but has not completed a pass yet.
    Starting,
    /// The last pass changed something.
    Reconciling,
    /// The last pass found nothing to do.
    Running,
}

/// State of one sandbox, reported by its run-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    /// Networking and container are being set up.
    Provisioning,
    /// The container is running.
    Running,
    /// The container was stopped deliberately.
    Stopped,
    /// Setup or supervision failed.
    Failed,
}

/// Where assignments come from and status reports go.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// The boxes currently assigned to `machine_id`.
    async fn list_assigned_boxes(&self, machine_id: &str) -> BoxfleetResult<Vec<BoxAssignment>>;

    /// The spec of one assigned box.
    ///
    /// A box that is no longer assigned surfaces as
    /// [`BoxfleetError::AssignmentGone`], which callers treat as a teardown
    /// trigger rather than a failure.
    async fn get_box_spec(&self, box_id: &str) -> BoxfleetResult<BoxSpec>;

    /// Reports aggregate machine status.
    async fn report_machine_status(
        &self,
        machine_id: &str,
        status: MachineStatus,
    ) -> BoxfleetResult<()>;

    /// Reports one sandbox's status.
    async fn report_sandbox_status(
        &self,
        sandbox_id: &str,
        status: SandboxStatus,
    ) -> BoxfleetResult<()>;
}

/// File-backed [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct FileControlPlane {
    /// The YAML desired-boxes file, re-read on every use.
    boxes_path: PathBuf,

    /// Where status reports are dropped as JSON files.
    status_dir: PathBuf,
}

/// On-disk shape of the boxes file.
#[derive(Debug, Deserialize)]
struct BoxesFile {
    #[serde(default)]
    boxes: BTreeMap<String, BoxEntry>,
}

#[derive(Debug, Deserialize)]
struct BoxEntry {
    uuid: Uuid,

    #[serde(default = "BoxEntry::default_enabled")]
    enabled: bool,

    /// Restricts the entry to one machine; unset means every machine.
    #[serde(default)]
    machine: Option<String>,

    #[serde(default)]
    spec: BoxSpec,
}

#[derive(Debug, Serialize)]
struct StatusRecord<'a, S> {
    subject: &'a str,
    status: S,
    updated_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BoxAssignment {
    /// Creates an assignment.
    pub fn new(id: impl Into<String>, uuid: Uuid, enabled: bool) -> Self {
        Self {
            id: id.into(),
            uuid,
            enabled,
        }
    }
}

impl BoxEntry {
    fn default_enabled() -> bool {
        true
    }
}

impl FileControlPlane {
    /// Creates a control plane reading `boxes_path` and writing status files
    /// into `status_dir`.
    pub fn new(boxes_path: impl Into<PathBuf>, status_dir: impl Into<PathBuf>) -> Self {
        Self {
            boxes_path: boxes_path.into(),
            status_dir: status_dir.into(),
        }
    }

    /// Reads and parses the boxes file.
    ///
    /// A missing file counts as the control plane being unreachable, not as
    /// an empty assignment list, so a misplaced file cannot tear down every
    /// sandbox on the machine.
    async fn load(&self) -> BoxfleetResult<BoxesFile> {
        let contents = match tokio::fs::read_to_string(&self.boxes_path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(BoxfleetError::ControlPlaneUnavailable(
                    self.boxes_path.to_string_lossy().into_owned(),
                ));
            }
            Err(error) => return Err(error.into()),
        };

        Ok(serde_yaml::from_str(&contents)?)
    }

    async fn write_status<S: Serialize>(
        &self,
        filename: &str,
        subject: &str,
        status: S,
    ) -> BoxfleetResult<()> {
        tokio::fs::create_dir_all(&self.status_dir).await?;

        let record = StatusRecord {
            subject,
            status,
            updated_at: Utc::now(),
        };
        let contents = serde_json::to_vec_pretty(&record)?;

        // Write-then-rename so collectors never observe a partial file.
        let final_path = self.status_dir.join(filename);
        let tmp_path = self.status_dir.join(format!("{}.tmp", filename));
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ControlPlane for FileControlPlane {
    async fn list_assigned_boxes(&self, machine_id: &str) -> BoxfleetResult<Vec<BoxAssignment>> {
        let file = self.load().await?;

        let assignments = file
            .boxes
            .into_iter()
            .filter(|(_, entry)| {
                entry
                    .machine
                    .as_deref()
                    .map(|machine| machine == machine_id)
                    .unwrap_or(true)
            })
            .map(|(id, entry)| BoxAssignment::new(id, entry.uuid, entry.enabled))
            .collect();

        Ok(assignments)
    }

    async fn get_box_spec(&self, box_id: &str) -> BoxfleetResult<BoxSpec> {
        let mut file = self.load().await?;

        file.boxes
            .remove(box_id)
            .map(|entry| entry.spec)
            .ok_or_else(|| BoxfleetError::AssignmentGone(box_id.to_string()))
    }

    async fn report_machine_status(
        &self,
        machine_id: &str,
        status: MachineStatus,
    ) -> BoxfleetResult<()> {
        self.write_status("machine.json", machine_id, status).await
    }

    async fn report_sandbox_status(
        &self,
        sandbox_id: &str,
        status: SandboxStatus,
    ) -> BoxfleetResult<()> {
        self.write_status(&format!("sandbox-{}.json", sandbox_id), sandbox_id, status)
            .await
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineStatus::Starting => write!(f, "starting"),
            MachineStatus::Reconciling => write!(f, "reconciling"),
            MachineStatus::Running => write!(f, "running"),
        }
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxStatus::Provisioning => write!(f, "provisioning"),
            SandboxStatus::Running => write!(f, "running"),
            SandboxStatus::Stopped => write!(f, "stopped"),
            SandboxStatus::Failed => write!(f, "failed"),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const BOXES: &str = r#"
boxes:
  api:
    uuid: 7b2d7f0a-96d8-4f8a-9d55-5f3b1e9c0a11
    spec:
      image: acme/api:1
      port_forwards:
        - tcp/8080:80
  worker:
    uuid: 0c6a2f31-40e2-4bb5-9e55-2b1d9f6a7c22
    enabled: false
  other-machine:
    uuid: 1d52a9c4-11f7-45f0-8a2e-9e8b5c3d4e33
    machine: m-2
"#;

    fn plane(dir: &std::path::Path) -> FileControlPlane {
        FileControlPlane::new(dir.join("boxes.yaml"), dir.join("status"))
    }

    #[tokio::test]
    async fn test_assignments_filtered_by_machine() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("boxes.yaml"), BOXES).await?;
        let plane = plane(dir.path());

        let assignments = plane.list_assigned_boxes("m-1").await?;
        let ids: Vec<&str> = assignments.iter().map(|a| a.get_id().as_str()).collect();
        assert_eq!(ids, ["api", "worker"]);
        assert!(assignments[0].get_enabled());
        assert!(!assignments[1].get_enabled());

        let on_m2 = plane.list_assigned_boxes("m-2").await?;
        assert_eq!(on_m2.len(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_box_spec_lookup_and_gone() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("boxes.yaml"), BOXES).await?;
        let plane = plane(dir.path());

        let spec = plane.get_box_spec("api").await?;
        assert_eq!(spec.image_or("fallback"), "acme/api:1");
        assert_eq!(spec.get_port_forwards().len(), 1);

        // An entry with no spec still parses, as all-defaults.
        let spec = plane.get_box_spec("worker").await?;
        assert!(spec.get_command().is_empty());

        assert!(matches!(
            plane.get_box_spec("gone").await,
            Err(BoxfleetError::AssignmentGone(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_missing_boxes_file_is_unavailable_not_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let plane = plane(dir.path());

        assert!(matches!(
            plane.list_assigned_boxes("m-1").await,
            Err(BoxfleetError::ControlPlaneUnavailable(_))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn test_status_reports_land_as_json() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        tokio::fs::write(dir.path().join("boxes.yaml"), BOXES).await?;
        let plane = plane(dir.path());

        plane.report_machine_status("m-1", MachineStatus::Running).await?;
        plane
            .report_sandbox_status("api", SandboxStatus::Provisioning)
            .await?;

        let machine: serde_json::Value = serde_json::from_str(
            &tokio::fs::read_to_string(dir.path().join("status/machine.json")).await?,
        )?;
        assert_eq!(machine["subject"], "m-1");
        assert_eq!(machine["status"], "running");
        assert!(machine["updated_at"].is_string());

        let sandbox: serde_json::Value = serde_json::from_str(
            &tokio::fs::read_to_string(dir.path().join("status/sandbox-api.json")).await?,
        )?;
        assert_eq!(sandbox["status"], "provisioning");

        Ok(())
    }

    #[test]
    fn test_status_display() {
        assert_eq!(MachineStatus::Reconciling.to_string(), "reconciling");
        assert_eq!(SandboxStatus::Failed.to_string(), "failed");
    }
}
