use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

/// Errors returned by the fleet SDK.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The descriptor tool failed to create a descriptor.
    #[error("failed to provision descriptor `{name}`: {reason}")]
    Provisioning { name: String, reason: String },

    /// An emulator process could not be spawned.
    #[error("failed to launch `{label}`: {source}")]
    Launch {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// The instance never reported boot completion before the deadline.
    #[error("instance on console port {console_port} did not boot within {timeout:?}")]
    BootTimeout { console_port: u16, timeout: Duration },

    /// A forwarded port could not be exposed.
    #[error("exposure error: {0}")]
    Exposure(#[from] ExposureError),

    /// A termination request could not be delivered.
    #[error("failed to terminate `{label}`: {source}")]
    Shutdown {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// The shared bridge server failed to start or died.
    #[error("bridge server error: {0}")]
    BridgeServer(String),

    /// Malformed fleet configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A host tool binary could not be located.
    #[error("{tool} binary not found (searched {} candidates)", searched.len())]
    ToolNotFound {
        tool: &'static str,
        searched: Vec<PathBuf>,
    },

    /// A short-lived host command exited unsuccessfully.
    #[error("`{program}` failed ({status}): {stderr}")]
    CommandFailed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reasons a port could not be forwarded to the outside network.
#[derive(Debug, thiserror::Error)]
pub enum ExposureError {
    #[error("port {port} was not listening after {waited:?}")]
    PortNotListening { port: u16, waited: Duration },

    #[error("failed to spawn relay for port {port}: {source}")]
    RelaySpawn {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("relay for port {port} exited right after spawn")]
    RelayExited { port: u16 },
}

impl Error {
    /// Whether this error belongs to the provisioning or launch stages.
    pub fn is_launch_stage(&self) -> bool {
        matches!(self, Self::Provisioning { .. } | Self::Launch { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
