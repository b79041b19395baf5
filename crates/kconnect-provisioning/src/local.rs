use async_trait::async_trait;
use kconnect_connection::{ConnectionSnapshot, KernelConnection};
use kconnect_ports::is_local_ip;
use kconnect_protocol::{
    Channel, ConnectError, ConnectResult, KernelId, KernelSpec, Transport, UNSET_PORT,
};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::provisioner::{KernelProvisioner, ProvisionerArgs, ProvisionerContext};

/// Built-in provisioner for kernels started on this machine.
///
/// Unset tcp ports are claimed from the shared [`kconnect_ports::LocalPortCache`]
/// once per provisioner, so restarts reuse them and concurrently starting
/// kernels never share one. They go back to the cache on final cleanup.
#[derive(Debug)]
pub struct LocalProvisioner {
    name: String,
    kernel_id: KernelId,
    kernel_spec: KernelSpec,
    config: Map<String, Value>,
    context: ProvisionerContext,
    cached_ports: Vec<u16>,
    ports_cached: bool,
    connection_info: Option<ConnectionSnapshot>,
}

impl LocalProvisioner {
    pub fn new(args: ProvisionerArgs) -> Self {
        Self {
            name: args.name,
            kernel_id: args.kernel_id,
            kernel_spec: args.kernel_spec,
            config: args.config,
            context: args.context,
            cached_ports: Vec::new(),
            ports_cached: false,
            connection_info: None,
        }
    }

    pub fn ports_cached(&self) -> bool {
        self.ports_cached
    }

    fn claim_ports(&mut self, connection: &mut KernelConnection) -> ConnectResult<()> {
        let ip = connection.ip();
        for channel in Channel::ALLOCATION_ORDER {
            if connection.port(channel) != UNSET_PORT {
                continue;
            }
            let port = self.context.port_cache.find_available_port(&ip)?;
            connection.set_port(channel, port);
            self.cached_ports.push(port);
        }
        self.ports_cached = true;
        Ok(())
    }
}

#[async_trait]
impl KernelProvisioner for LocalProvisioner {
    fn name(&self) -> &str {
        &self.name
    }

    fn kernel_id(&self) -> &KernelId {
        &self.kernel_id
    }

    fn kernel_spec(&self) -> &KernelSpec {
        &self.kernel_spec
    }

    fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    #[instrument(skip(self, connection), fields(kernel_id = %self.kernel_id))]
    async fn pre_launch(&mut self, connection: &mut KernelConnection) -> ConnectResult<()> {
        let tcp = connection.transport() == Transport::Tcp;
        if tcp {
            let ip = connection.ip();
            if !is_local_ip(&ip) {
                return Err(ConnectError::NonLocalAddress(ip));
            }
        }

        if tcp && self.context.cache_ports && !self.ports_cached {
            self.claim_ports(connection)?;
        }

        let path = connection.write_connection_file()?;
        debug!(path = %path.display(), "connection file ready");
        self.connection_info = Some(connection.get_connection_info(false));
        Ok(())
    }

    async fn cleanup(
        &mut self,
        _connection: &mut KernelConnection,
        restart: bool,
    ) -> ConnectResult<()> {
        if restart {
            return Ok(());
        }
        // includes ports claimed by a pre_launch that failed part way
        for port in self.cached_ports.drain(..) {
            self.context.port_cache.return_port(port);
        }
        self.ports_cached = false;
        Ok(())
    }

    fn connection_info(&self) -> Option<&ConnectionSnapshot> {
        self.connection_info.as_ref()
    }
}
