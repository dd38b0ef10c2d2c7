//! Machine-level reconciler configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use super::{
    DEFAULT_CIDR_POOL, DEFAULT_INFRA_IMAGE, DEFAULT_OCI_RUNTIME, DEFAULT_POLL_INTERVAL_SECS,
    DEFAULT_WORK_DIR,
};
use crate::{
    net::RESERVATION_PREFIX,
    utils::{BOXES_FILENAME, CONTROL_SUBDIR, IMAGE_STORE_SUBDIR},
    BoxfleetError, BoxfleetResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The per-machine configuration, usually loaded from a YAML file.
///
/// Everything except the machine id has a working default, so a minimal
/// configuration is just `machine_id: some-machine`.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct MachineConfig {
    /// The identifier this machine reports itself to the control plane as.
    #[builder(setter(transform = |id: impl AsRef<str>| id.as_ref().to_string()))]
    pub(super) machine_id: String,

    /// The directory all sandbox and machine state lives under.
    #[serde(default = "MachineConfig::default_work_dir")]
    #[builder(default = MachineConfig::default_work_dir())]
    pub(super) work_dir: PathBuf,

    /// The pool sandbox point-to-point subnets are carved from.
    #[serde(default = "MachineConfig::default_cidr_pool")]
    #[builder(default = MachineConfig::default_cidr_pool())]
    pub(super) cidr_pool: Ipv4Network,

    /// The OCI runtime binary used to drive containers.
    #[serde(default = "MachineConfig::default_oci_runtime")]
    #[builder(default = MachineConfig::default_oci_runtime())]
    pub(super) oci_runtime: String,

    /// The image used for boxes whose spec does not name one.
    #[serde(default = "MachineConfig::default_infra_image")]
    #[builder(default = MachineConfig::default_infra_image())]
    pub(super) infra_image: String,

    /// Seconds between reconciliation passes.
    #[serde(default = "MachineConfig::default_poll_interval_secs")]
    #[builder(default = MachineConfig::default_poll_interval_secs())]
    pub(super) poll_interval_secs: u64,

    /// The local image store directory; `images` under the work dir when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(super) image_store_dir: Option<PathBuf>,

    /// The directory the file-backed control plane reads assignments from;
    /// `control` under the work dir when unset.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(super) control_dir: Option<PathBuf>,

    /// The box assignment file; `boxes.yaml` under the control dir when
    /// unset.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[builder(default)]
    pub(super) boxes_file: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineConfig {
    /// Returns the default work directory.
    pub fn default_work_dir() -> PathBuf {
        DEFAULT_WORK_DIR.clone()
    }

    /// Returns the default CIDR pool.
    pub fn default_cidr_pool() -> Ipv4Network {
        *DEFAULT_CIDR_POOL
    }

    /// Returns the default OCI runtime binary name.
    pub fn default_oci_runtime() -> String {
        DEFAULT_OCI_RUNTIME.to_string()
    }

    /// Returns the default infra image reference.
    pub fn default_infra_image() -> String {
        DEFAULT_INFRA_IMAGE.to_string()
    }

    /// Returns the default poll interval in seconds.
    pub fn default_poll_interval_secs() -> u64 {
        DEFAULT_POLL_INTERVAL_SECS
    }

    /// Loads and validates a configuration from a YAML file.
    pub async fn load(path: impl AsRef<Path>) -> BoxfleetResult<Self> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> BoxfleetResult<()> {
        if self.machine_id.trim().is_empty() {
            return Err(BoxfleetError::InvalidMachineConfig(
                "machine_id must not be empty".to_string(),
            ));
        }
        if self.oci_runtime.trim().is_empty() {
            return Err(BoxfleetError::InvalidMachineConfig(
                "oci_runtime must not be empty".to_string(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(BoxfleetError::InvalidMachineConfig(
                "poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.cidr_pool.prefix() > RESERVATION_PREFIX {
            return Err(BoxfleetError::InvalidMachineConfig(format!(
                "cidr_pool {} cannot hold a /{} per sandbox",
                self.cidr_pool, RESERVATION_PREFIX
            )));
        }
        Ok(())
    }

    /// The poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// The resolved image store directory.
    pub fn image_store_dir(&self) -> PathBuf {
        self.image_store_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(IMAGE_STORE_SUBDIR))
    }

    /// The resolved control plane directory.
    pub fn control_dir(&self) -> PathBuf {
        self.control_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(CONTROL_SUBDIR))
    }

    /// The resolved box assignment file.
    pub fn boxes_path(&self) -> PathBuf {
        self.boxes_file
            .clone()
            .unwrap_or_else(|| self.control_dir().join(BOXES_FILENAME))
    }

    /// Applies command-line overrides on top of the loaded values.
    pub fn with_overrides(
        mut self,
        machine_id: Option<String>,
        work_dir: Option<PathBuf>,
        cidr_pool: Option<Ipv4Network>,
        infra_image: Option<String>,
        boxes_file: Option<PathBuf>,
    ) -> Self {
        if let Some(machine_id) = machine_id {
            self.machine_id = machine_id;
        }
        if let Some(work_dir) = work_dir {
            self.work_dir = work_dir;
        }
        if let Some(cidr_pool) = cidr_pool {
            self.cidr_pool = cidr_pool;
        }
        if let Some(infra_image) = infra_image {
            self.infra_image = infra_image;
        }
        if let Some(boxes_file) = boxes_file {
            self.boxes_file = Some(boxes_file);
        }
        self
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_applies_defaults() -> anyhow::Result<()> {
        let config: MachineConfig = serde_yaml::from_str("machine_id: m-1\n")?;

        assert_eq!(config.get_machine_id(), "m-1");
        assert_eq!(config.get_work_dir(), &*DEFAULT_WORK_DIR);
        assert_eq!(config.get_cidr_pool(), &*DEFAULT_CIDR_POOL);
        assert_eq!(config.get_oci_runtime(), DEFAULT_OCI_RUNTIME);
        assert_eq!(*config.get_poll_interval_secs(), DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(config.image_store_dir(), DEFAULT_WORK_DIR.join("images"));
        config.validate()?;

        Ok(())
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = MachineConfig::builder().machine_id("  ").build();
        assert!(matches!(
            config.validate(),
            Err(BoxfleetError::InvalidMachineConfig(_))
        ));

        let config = MachineConfig::builder()
            .machine_id("m-1")
            .cidr_pool("10.0.0.0/31".parse().unwrap())
            .build();
        assert!(matches!(
            config.validate(),
            Err(BoxfleetError::InvalidMachineConfig(_))
        ));

        let config = MachineConfig::builder()
            .machine_id("m-1")
            .poll_interval_secs(0)
            .build();
        assert!(matches!(
            config.validate(),
            Err(BoxfleetError::InvalidMachineConfig(_))
        ));
    }

    #[test]
    fn test_builder_with_overrides() -> anyhow::Result<()> {
        let config = MachineConfig::builder()
            .machine_id("m-1")
            .work_dir(PathBuf::from("/var/lib/boxfleet"))
            .cidr_pool("10.200.0.0/24".parse()?)
            .oci_runtime("crun".to_string())
            .build();

        config.validate()?;
        assert_eq!(config.get_work_dir(), &PathBuf::from("/var/lib/boxfleet"));
        assert_eq!(config.control_dir(), PathBuf::from("/var/lib/boxfleet/control"));
        assert_eq!(
            config.boxes_path(),
            PathBuf::from("/var/lib/boxfleet/control/boxes.yaml")
        );

        Ok(())
    }

    #[test]
    fn test_overrides_replace_only_given_values() {
        let config = MachineConfig::builder()
            .machine_id("m-1")
            .oci_runtime("crun".to_string())
            .build()
            .with_overrides(
                None,
                Some(PathBuf::from("/srv/fleet")),
                None,
                Some("acme/base:1".to_string()),
                None,
            );

        assert_eq!(config.get_machine_id(), "m-1");
        assert_eq!(config.get_work_dir(), &PathBuf::from("/srv/fleet"));
        assert_eq!(config.get_oci_runtime(), "crun");
        assert_eq!(config.get_infra_image(), "acme/base:1");
        assert_eq!(config.boxes_path(), PathBuf::from("/srv/fleet/control/boxes.yaml"));
    }
}
