use std::path::PathBuf;

use clap::Parser;
use ipnetwork::Ipv4Network;

use super::styles;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Boxfleet CLI - a per-machine reconciler running boxes in isolated sandboxes
#[derive(Debug, Parser)]
#[command(name = "boxfleet", author, about, version, styles=styles::styles())]
pub struct BoxfleetArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<BoxfleetSubcommand>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum BoxfleetSubcommand {
    /// Run the machine-level daemon
    #[command(name = "machine")]
    Machine {
        /// The machine subcommand
        #[command(subcommand)]
        subcommand: MachineSubcommand,
    },

    /// Manage sandboxes on this machine
    #[command(name = "sandbox")]
    Sandbox {
        /// The sandbox subcommand
        #[command(subcommand)]
        subcommand: SandboxSubcommand,
    },
}

/// Machine daemon subcommands
#[derive(Debug, Parser)]
pub enum MachineSubcommand {
    /// Start the reconciliation daemon
    #[command(name = "start")]
    Start {
        /// Machine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Machine id reported to the control plane
        #[arg(long)]
        machine_id: Option<String>,

        /// Directory holding all sandbox and machine state
        #[arg(long)]
        work_dir: Option<PathBuf>,

        /// Pool sandbox subnets are carved from
        #[arg(long)]
        cidr_pool: Option<Ipv4Network>,

        /// Image for boxes whose spec does not name one
        #[arg(long)]
        infra_image: Option<String>,

        /// Box assignment file to reconcile against
        #[arg(long)]
        boxes_file: Option<PathBuf>,
    },
}

/// Sandbox lifecycle subcommands
#[derive(Debug, Parser)]
pub enum SandboxSubcommand {
    /// Provision a sandbox for an assigned box and supervise it
    #[command(name = "run")]
    Run {
        /// The box to run
        #[arg(long = "box", value_name = "ID")]
        box_id: String,

        /// Machine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Stop a sandbox's run-process and container
    #[command(name = "stop")]
    Stop {
        /// The box to stop
        #[arg(long = "box", value_name = "ID")]
        box_id: String,

        /// Machine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Stop a sandbox and tear down everything it owns
    #[command(name = "remove")]
    Remove {
        /// The box to remove
        #[arg(long = "box", value_name = "ID")]
        box_id: String,

        /// Machine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// List sandboxes on this machine with their container status
    #[command(name = "list")]
    List {
        /// Machine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run a command inside a sandbox's container
    #[command(name = "exec")]
    Exec {
        /// The box whose container to exec into
        #[arg(long = "box", value_name = "ID")]
        box_id: String,

        /// Machine configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// The command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
