//! `boxfleet` is a per-machine reconciler that runs assigned workloads
//! ("boxes") inside network-isolated sandboxes.
//!
//! # Overview
//!
//! A machine process polls the control plane for the boxes assigned to it and
//! drives local state to match. Every box gets one sandbox:
//!
//! - A dedicated network namespace joined to the host through a NAT'd veth
//!   pair, with a point-to-point subnet carved from a per-machine pool
//! - Port forwards published on the host and updated through a two-chain
//!   iptables rotation, so rule changes never leave a gap
//! - Host routes mirrored into the namespace so the box reaches what the
//!   host reaches
//! - A DNS proxy inside the namespace that answers override names locally
//!   and relays everything else to the host's resolver
//! - An OCI container running the box's image, staged from a local store
//!
//! Sandbox lifecycle work runs in dedicated subprocesses spawned from the
//! same binary, so one misbehaving sandbox cannot take the reconciliation
//! loop down with it.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use boxfleet::{config::MachineConfig, management::machine};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = MachineConfig::builder()
//!         .machine_id("machine-01")
//!         .build();
//!
//!     // Reconciles until SIGTERM/SIGINT, then drains every sandbox.
//!     machine::start(config).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line argument parsing and styling
//! - [`config`] - Machine and box configuration types
//! - [`container`] - OCI runtime spec generation and container lifecycle
//! - [`control`] - Control-plane client and the file-backed implementation
//! - [`image`] - Local image store and rootfs staging
//! - [`management`] - The reconciliation loop and sandbox operations
//! - [`net`] - Namespaces, veth pairs, NAT chains, route mirroring and DNS
//! - [`utils`] - Shared helpers for paths and external commands

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod container;
pub mod control;
pub mod image;
pub mod management;
pub mod net;
pub mod utils;

pub use error::*;
