use std::{net::Ipv4Addr, path::PathBuf, sync::LazyLock};

use ipnetwork::Ipv4Network;

use crate::utils::BOXFLEET_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of seconds between reconciliation passes.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// The default number of seconds between unchanged-status heartbeats.
pub const DEFAULT_STATUS_HEARTBEAT_SECS: u64 = 30;

/// The default OCI runtime binary.
pub const DEFAULT_OCI_RUNTIME: &str = "runc";

/// The image a box runs when its spec does not name one.
pub const DEFAULT_INFRA_IMAGE: &str = "boxfleet/infra:latest";

/// The default machine configuration file name.
pub const DEFAULT_MACHINE_CONFIG_FILENAME: &str = "machine.yaml";

/// The path where all boxfleet state is stored.
pub static DEFAULT_WORK_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| dirs::home_dir().unwrap().join(BOXFLEET_HOME_DIR));

/// The pool sandbox point-to-point subnets are carved from.
pub static DEFAULT_CIDR_POOL: LazyLock<Ipv4Network> =
    LazyLock::new(|| Ipv4Network::new(Ipv4Addr::new(10, 115, 0, 0), 16).unwrap());
