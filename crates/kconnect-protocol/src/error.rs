//! Error types for kconnect operations.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while materializing, persisting, or using kernel
/// connection credentials and provisioners.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("could not find {name:?} in {search_paths:?}")]
    ConnectionFileNotFound {
        name: String,
        search_paths: Vec<PathBuf>,
    },
    #[error("connection file {path:?} has insecure permissions {mode:#o}")]
    InsecurePermissions { path: PathBuf, mode: u32 },
    #[error("invalid authentication key: {0}")]
    InvalidKey(String),
    #[error("invalid transport: {0}")]
    InvalidTransport(String),
    #[error("invalid signature scheme: {0}")]
    InvalidSignatureScheme(String),
    #[error("invalid file pattern: {0}")]
    InvalidPattern(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("kernel provisioner '{0}' has not been registered")]
    ProvisionerNotFound(String),
    #[error("failed to load kernel provisioner '{name}': {reason}")]
    ProvisionerLoad { name: String, reason: String },
    #[error("no kernel with id '{0}'")]
    KernelNotFound(String),
    #[error("kernel '{0}' already exists")]
    KernelExists(String),
    #[error("invalid kernel id '{0}'")]
    InvalidKernelId(String),
    #[error("can only launch a kernel on a local interface, not {0}")]
    NonLocalAddress(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("tunnel error: {0}")]
    Tunnel(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Convenience result type for kconnect operations.
pub type ConnectResult<T> = Result<T, ConnectError>;
