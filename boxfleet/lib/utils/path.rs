use std::path::{Path, PathBuf};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory name under the work directory where sandbox directories live.
pub const SANDBOXES_SUBDIR: &str = "sandboxes";

/// The boxfleet home directory name, under the user's home directory.
pub const BOXFLEET_HOME_DIR: &str = ".boxfleet";

/// The subdirectory of the work dir holding the local image store.
pub const IMAGE_STORE_SUBDIR: &str = "images";

/// The subdirectory of the work dir holding control-plane assignment files.
pub const CONTROL_SUBDIR: &str = "control";

/// The name of the desired-boxes file inside the control directory.
pub const BOXES_FILENAME: &str = "boxes.yaml";

/// The directory name under the work directory where the file-backed control
/// plane drops status reports.
pub const STATUS_SUBDIR: &str = "status";

/// The directory name inside a sandbox directory holding the container root filesystem.
pub const ROOTFS_SUBDIR: &str = "rootfs";

/// The directory name inside a sandbox directory holding the OCI bundle.
pub const BUNDLE_SUBDIR: &str = "bundle";

/// The directory name inside a sandbox directory used as the OCI runtime state root.
pub const RUNTIME_STATE_SUBDIR: &str = "run";

/// The directory name inside a sandbox directory bind-mounted for inner containers.
pub const CONTAINERS_SUBDIR: &str = "containers";

/// The directory name inside a sandbox directory bind-mounted for logs.
pub const LOG_SUBDIR: &str = "logs";

/// The directory name inside a sandbox directory bind-mounted for volumes.
pub const VOLUMES_SUBDIR: &str = "volumes";

/// The name of the sandbox-info file inside a sandbox directory.
pub const SANDBOX_INFO_FILENAME: &str = "sandbox.json";

/// The name of the run-process pidfile inside a sandbox directory.
pub const SANDBOX_PID_FILENAME: &str = "sandbox.pid";

/// The name of the veth CIDR reservation file inside a sandbox directory.
pub const CIDR_RESERVATION_FILENAME: &str = "cidr";

/// The name of the lock file guarding veth CIDR allocation, under the work directory.
pub const CIDR_LOCK_FILENAME: &str = "cidr.lock";

/// The name of the log file capturing a detached run-process's own output.
pub const RUNNER_LOG_FILENAME: &str = "runner.log";

/// The name of the generated OCI runtime configuration inside the bundle directory.
pub const OCI_CONFIG_FILENAME: &str = "config.json";

/// The name of the file under the sandbox log directory capturing container stdio.
pub const CONTAINER_LOG_FILENAME: &str = "container.log";

/// The name of the image manifest file inside an image store entry.
pub const IMAGE_MANIFEST_FILENAME: &str = "manifest.json";

/// The fixed container id used for every sandbox's container.
pub const CONTAINER_ID: &str = "sandbox";

/// Where named network namespaces are pinned.
pub const NETNS_RUN_DIR: &str = "/run/netns";

/// The host resolver configuration read by the DNS proxy.
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the sandbox directory for a box id under `work_dir`.
pub fn sandbox_dir(work_dir: &Path, box_id: &str) -> PathBuf {
    work_dir.join(SANDBOXES_SUBDIR).join(box_id)
}

/// Returns the pinned namespace file path for a namespace name.
pub fn netns_path(name: &str) -> PathBuf {
    PathBuf::from(NETNS_RUN_DIR).join(name)
}
