use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a boxfleet-related operation.
pub type BoxfleetResult<T> = Result<T, BoxfleetError>;

/// An error that occurred during a sandbox or machine operation.
#[derive(Debug, Error)]
pub enum BoxfleetError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred during a system call.
    #[error("syscall error: {0}")]
    Syscall(#[from] nix::Error),

    /// An error that occurred while serializing or deserializing JSON.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred while serializing or deserializing YAML.
    #[error("serde yaml error: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),

    /// An error that occurred while building an OCI runtime spec.
    #[error("oci spec error: {0}")]
    OciSpec(#[from] oci_spec::OciSpecError),

    /// An error that occurred while encoding or decoding a DNS message.
    #[error("dns proto error: {0}")]
    DnsProto(#[from] hickory_proto::error::ProtoError),

    /// An error that occurred when an external command exited unsuccessfully.
    #[error("command failed: `{command}` (status {status}): {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,

        /// The exit status, or -1 if terminated by a signal.
        status: i32,

        /// Captured standard error output.
        stderr: String,
    },

    /// An error that occurred when external command output could not be interpreted.
    #[error("unexpected output from `{command}`: {reason}")]
    UnexpectedCommandOutput {
        /// The command line that was run.
        command: String,

        /// Why the output was rejected.
        reason: String,
    },

    /// An error that occurred when a CIDR was malformed.
    #[error("invalid cidr: {0}")]
    InvalidCidr(#[from] ipnetwork::IpNetworkError),

    /// An error that occurred when a CIDR was too small to derive addresses from.
    #[error("cidr has too few usable addresses: {0}")]
    CidrTooSmall(String),

    /// An error that occurred when the veth CIDR pool had no free subnet left.
    #[error("veth cidr pool exhausted: {0}")]
    CidrPoolExhausted(String),

    /// An error that occurred when a link already carried an address owned by something else.
    #[error("link {link} already has foreign address {address}")]
    ForeignAddress {
        /// The link carrying the address.
        link: String,

        /// The unexpected address found on it.
        address: String,
    },

    /// An error that occurred when a sandbox directory already serves a different box.
    #[error("sandbox {sandbox} already serves box {existing}, refusing to run {requested}")]
    SandboxConflict {
        /// The sandbox directory name.
        sandbox: String,

        /// The box uuid recorded on disk.
        existing: String,

        /// The box uuid that was requested.
        requested: String,
    },

    /// An error that occurred when a container stayed running after SIGTERM and SIGKILL.
    #[error("container {0} failed to stop within timeout")]
    ContainerStopTimeout(String),

    /// An error that occurred when the host resolver configuration had no nameservers at all.
    #[error("host resolver configuration has no nameservers")]
    NoNameservers,

    /// An error that occurred when the host resolver configuration had only IPv6 nameservers.
    #[error("host resolver configuration has no IPv4 nameserver (IPv6-only resolvers are unsupported)")]
    NoIpv4Nameserver,

    /// An error that occurred when a port forward definition could not be parsed.
    #[error("invalid port forward: {0}")]
    InvalidPortForward(String),

    /// An error that occurred when an environment variable pair could not be parsed.
    #[error("invalid env pair: {0}")]
    InvalidEnvPair(String),

    /// An error that occurred when a box assignment no longer exists on the control plane.
    #[error("box assignment no longer exists: {0}")]
    AssignmentGone(String),

    /// An error that occurred when the control plane could not be reached.
    #[error("control plane unavailable: {0}")]
    ControlPlaneUnavailable(String),

    /// An error that occurred when an image reference was not present in the local store.
    #[error("image not found in store: {0}")]
    ImageNotFound(String),

    /// An error that occurred when the OCI runtime binary could not be located.
    #[error("oci runtime not found: {0}")]
    RuntimeNotFound(String),

    /// An error that occurred when a machine configuration value was invalid.
    #[error("invalid machine config: {0}")]
    InvalidMachineConfig(String),

    /// An error that occurred when a sandbox was not found on disk.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// An error that occurred when an operation was interrupted by shutdown.
    #[error("operation interrupted by shutdown")]
    Interrupted,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BoxfleetError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> BoxfleetError {
        BoxfleetError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Whether the error marks a conflict an operator must resolve before the
    /// sandbox can be touched again.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BoxfleetError::ForeignAddress { .. } | BoxfleetError::SandboxConflict { .. }
        )
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `BoxfleetResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> BoxfleetResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
