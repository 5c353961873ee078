//! Error types for protocol operations

use std::net::Ipv4Addr;
use thiserror::Error;

use crate::channel::CommandOutput;

/// Errors that can occur while managing peers of a tunnel protocol
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Application type string not recognized
    #[error("Unsupported app_type: {0}")]
    UnsupportedAppType(String),

    /// Protocol name not present in the registry
    #[error("Unsupported protocol '{name}'. Available: {available}")]
    UnsupportedProtocol { name: String, available: String },

    /// Protocol is declared but disabled
    #[error("Protocol '{0}' is disabled")]
    ProtocolDisabled(String),

    /// Requested address could not be parsed
    #[error("Invalid address '{0}': expected an IPv4 host address")]
    InvalidAddress(String),

    /// No free host address left in the interface subnet
    #[error("No available IP addresses in subnet {0}")]
    SubnetExhausted(String),

    /// Requested address already belongs to a peer
    #[error("IP address {0} is already in use")]
    AddressInUse(Ipv4Addr),

    /// Requested address outside the interface subnet
    #[error("IP address {0} is not within subnet {1}")]
    AddressNotInSubnet(Ipv4Addr, String),

    /// Requested address is the server's own address
    #[error("IP address {0} is reserved for the server")]
    AddressReserved(Ipv4Addr),

    /// The on-target tunnel config is missing something we need
    #[error("Malformed tunnel config: {0}")]
    ConfigFormat(String),

    /// Command dispatched but failed
    #[error("Command `{command}` failed: {reason}")]
    Execution { command: String, reason: String },

    /// Execution target (container or daemon) could not be reached
    #[error("Execution target '{target}' unreachable: {reason}")]
    TargetUnreachable { target: String, reason: String },

    /// Command did not finish within the time budget
    #[error("Command `{command}` timed out after {secs}s")]
    Timeout { command: String, secs: u64 },

    /// `vpn://` payload failed to decode or failed its length check
    #[error("Corrupt config payload: {0}")]
    CorruptPayload(String),

    /// Peer not present in the live config
    #[error("Peer with public key '{0}' not found")]
    PeerNotFound(String),

    /// Protocol declaration or settings error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Implementation reference could not be resolved
    #[error("Failed to load protocol implementation: {0}")]
    Loading(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Coarse error category, used by callers to map failures to user-facing statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Allocation,
    ConfigFormat,
    Execution,
    CorruptPayload,
    NotFound,
    Configuration,
    Internal,
}

impl ProtocolError {
    /// Build an [`ProtocolError::Execution`] from a command's non-zero exit
    pub fn command_failed(command: &str, output: &CommandOutput) -> Self {
        let stderr = output.stderr.trim();
        let reason = if stderr.is_empty() {
            format!("exit code {}", output.exit_code)
        } else {
            format!("exit code {}: {}", output.exit_code, stderr)
        };
        Self::Execution {
            command: command_label(command),
            reason,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedAppType(_)
            | Self::UnsupportedProtocol { .. }
            | Self::ProtocolDisabled(_)
            | Self::InvalidAddress(_) => ErrorKind::Validation,
            Self::SubnetExhausted(_)
            | Self::AddressInUse(_)
            | Self::AddressNotInSubnet(..)
            | Self::AddressReserved(_) => ErrorKind::Allocation,
            Self::ConfigFormat(_) => ErrorKind::ConfigFormat,
            Self::Execution { .. } | Self::TargetUnreachable { .. } | Self::Timeout { .. } => {
                ErrorKind::Execution
            }
            Self::CorruptPayload(_) => ErrorKind::CorruptPayload,
            Self::PeerNotFound(_) => ErrorKind::NotFound,
            Self::Config(_) | Self::Loading(_) | Self::Yaml(_) => ErrorKind::Configuration,
            Self::Io(_) | Self::Json(_) => ErrorKind::Internal,
        }
    }

    /// Only timeouts may be retried, and only by read-only call sites
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Short label for a shell command, safe to log and to put in errors.
///
/// Keeps the program and first argument of the last pipeline stage: full
/// command lines can carry key material (`wg pubkey` input) or whole file
/// contents.
pub fn command_label(command: &str) -> String {
    let stage = command.rsplit('|').next().unwrap_or(command);
    stage.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
