use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use kconnect_connection::{ConnectionSnapshot, KernelConnection};
use kconnect_ports::LocalPortCache;
use kconnect_protocol::{ConnectResult, KernelId, KernelSpec};
use serde_json::{Map, Value};

/// Strategy that prepares and tears down the environment one kernel runs in.
#[async_trait]
pub trait KernelProvisioner: Send + Sync + fmt::Debug {
    /// Registry name this provisioner was created under.
    fn name(&self) -> &str;

    fn kernel_id(&self) -> &KernelId;

    fn kernel_spec(&self) -> &KernelSpec;

    /// Options from the spec's provisioner stanza; empty if none were given.
    fn config(&self) -> &Map<String, Value>;

    /// Called before the kernel starts. Finalizes and writes the
    /// connection's credentials.
    async fn pre_launch(&mut self, connection: &mut KernelConnection) -> ConnectResult<()>;

    /// Releases what `pre_launch` acquired. With `restart` the provisioner
    /// is about to be launched again and keeps what the next launch reuses.
    async fn cleanup(
        &mut self,
        connection: &mut KernelConnection,
        restart: bool,
    ) -> ConnectResult<()>;

    /// Connection info recorded by the last `pre_launch`.
    fn connection_info(&self) -> Option<&ConnectionSnapshot>;
}

/// What the owning manager shares with its provisioners.
#[derive(Debug, Clone)]
pub struct ProvisionerContext {
    pub port_cache: Arc<LocalPortCache>,
    /// Claim tcp ports through `port_cache` instead of allocating them at
    /// write time.
    pub cache_ports: bool,
}

impl ProvisionerContext {
    pub fn new(port_cache: Arc<LocalPortCache>) -> Self {
        Self {
            port_cache,
            cache_ports: true,
        }
    }

    pub fn with_cache_ports(mut self, cache_ports: bool) -> Self {
        self.cache_ports = cache_ports;
        self
    }
}

/// Everything a provisioner constructor receives.
#[derive(Debug, Clone)]
pub struct ProvisionerArgs {
    pub name: String,
    pub kernel_id: KernelId,
    pub kernel_spec: KernelSpec,
    pub context: ProvisionerContext,
    pub config: Map<String, Value>,
}
