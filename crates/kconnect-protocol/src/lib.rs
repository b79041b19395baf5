//! # kconnect-protocol — shared contract types
//!
//! This crate defines the data model that every other kconnect crate speaks:
//! how a client reaches one kernel (transport, address, five channel ports,
//! authentication parameters), how a kernel specification names the
//! provisioner that launches it, and the error taxonomy.
//!
//! It carries no runtime dependencies (no tokio, no sockets) so it can be
//! used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — `KernelId`
//! - [`connection`] — `Transport`, `Channel`, `ChannelPorts`, `ConnectionInfo`, `ConnectionInfoPatch`
//! - [`session`] — `Session` (authentication key, signature scheme, digest history)
//! - [`kernelspec`] — `KernelSpec`, `ProvisionerConfig`
//! - [`error`] — `ConnectError`, `ConnectResult`

pub mod connection;
pub mod error;
pub mod ids;
pub mod kernelspec;
pub mod session;

pub use connection::{
    Channel, ChannelPorts, ConnectionInfo, ConnectionInfoPatch, LOCALHOST, Transport, UNSET_PORT,
};
pub use error::{ConnectError, ConnectResult};
pub use ids::KernelId;
pub use kernelspec::{KernelSpec, PROVISIONER_METADATA_KEY, ProvisionerConfig};
pub use session::{DEFAULT_SIGNATURE_SCHEME, Session};
