//! Entry point for code that manages many kernels at once.
//!
//! A [`KernelConnector`] owns the process-wide [`LocalPortCache`] and the
//! [`ProvisionerFactory`], prepares one [`KernelConnection`] plus provisioner
//! per kernel id, and releases both when the kernel goes away.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kconnect_connection::{ConnectionSnapshot, KernelConnection, runtime_dir};
use kconnect_ports::LocalPortCache;
use kconnect_protocol::{Channel, ConnectError, ConnectResult, KernelId, KernelSpec, Transport};
use kconnect_provisioning::{
    BuiltinDiscovery, KernelProvisioner, ProvisionerContext, ProvisionerDiscovery,
    ProvisionerFactory, ProvisionerFactoryConfig,
};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, instrument, warn};

#[derive(Clone)]
pub struct KernelConnectorBuilder {
    connection_dir: PathBuf,
    transport: Transport,
    ip: Option<String>,
    cache_ports: bool,
    factory_config: ProvisionerFactoryConfig,
    discovery: Arc<dyn ProvisionerDiscovery>,
    port_cache: Option<Arc<LocalPortCache>>,
}

impl KernelConnectorBuilder {
    /// Connection files are written to `connection_dir` as
    /// `kernel-<id>.json`.
    pub fn new(connection_dir: impl Into<PathBuf>) -> Self {
        Self {
            connection_dir: connection_dir.into(),
            transport: Transport::Tcp,
            ip: None,
            cache_ports: true,
            factory_config: ProvisionerFactoryConfig::from_env(),
            discovery: Arc::new(BuiltinDiscovery),
            port_cache: None,
        }
    }

    /// Builder writing to the runtime directory.
    pub fn in_runtime_dir() -> Self {
        Self::new(runtime_dir())
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Claim tcp ports through the shared port cache. On by default.
    pub fn cache_ports(mut self, cache_ports: bool) -> Self {
        self.cache_ports = cache_ports;
        self
    }

    pub fn default_provisioner(mut self, name: impl Into<String>) -> Self {
        self.factory_config = self.factory_config.with_default_provisioner(name);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn ProvisionerDiscovery>) -> Self {
        self.discovery = discovery;
        self
    }

    /// Shares an existing cache, e.g. with another connector in the same
    /// process.
    pub fn port_cache(mut self, port_cache: Arc<LocalPortCache>) -> Self {
        self.port_cache = Some(port_cache);
        self
    }

    pub fn build(self) -> KernelConnector {
        let factory = ProvisionerFactory::new(self.factory_config, self.discovery);
        KernelConnector {
            inner: Arc::new(ConnectorInner {
                connection_dir: self.connection_dir,
                transport: self.transport,
                ip: self.ip,
                cache_ports: self.cache_ports,
                port_cache: self.port_cache.unwrap_or_default(),
                factory,
                kernels: Mutex::new(HashMap::new()),
            }),
        }
    }
}

struct PreparedKernel {
    connection: KernelConnection,
    provisioner: Box<dyn KernelProvisioner>,
}

enum KernelSlot {
    Preparing,
    Ready(Arc<AsyncMutex<PreparedKernel>>),
}

struct ConnectorInner {
    connection_dir: PathBuf,
    transport: Transport,
    ip: Option<String>,
    cache_ports: bool,
    port_cache: Arc<LocalPortCache>,
    factory: ProvisionerFactory,
    kernels: Mutex<HashMap<KernelId, KernelSlot>>,
}

/// Holds a kernel id while it is being prepared. Dropped without
/// `commit`, the id is freed again.
struct Reservation<'a> {
    kernels: &'a Mutex<HashMap<KernelId, KernelSlot>>,
    kernel_id: KernelId,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self, prepared: PreparedKernel) {
        self.kernels.lock().insert(
            self.kernel_id.clone(),
            KernelSlot::Ready(Arc::new(AsyncMutex::new(prepared))),
        );
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.kernels.lock().remove(&self.kernel_id);
        }
    }
}

/// Prepares and tracks the connections of many kernels. Cheap to clone.
#[derive(Clone)]
pub struct KernelConnector {
    inner: Arc<ConnectorInner>,
}

impl KernelConnector {
    pub fn connection_dir(&self) -> &Path {
        &self.inner.connection_dir
    }

    pub fn port_cache(&self) -> &Arc<LocalPortCache> {
        &self.inner.port_cache
    }

    pub fn factory(&self) -> &ProvisionerFactory {
        &self.inner.factory
    }

    /// Creates the connection and provisioner for a new kernel and runs the
    /// provisioner's `pre_launch`, which writes `kernel-<id>.json`.
    ///
    /// Without `kernel_id` a UUID is generated. An id that is already in
    /// use, empty, or contains a path separator is rejected.
    #[instrument(skip(self, spec), fields(kernel = %spec.display_name))]
    pub async fn prepare_kernel(
        &self,
        kernel_id: Option<KernelId>,
        spec: &KernelSpec,
    ) -> ConnectResult<KernelId> {
        let kernel_id = kernel_id.unwrap_or_else(KernelId::new_uuid);
        let reservation = self.reserve(&kernel_id)?;

        let prepared = self.launch(&kernel_id, spec).await?;
        debug!(
            kernel_id = %kernel_id,
            provisioner = prepared.provisioner.name(),
            ports = ?prepared.connection.ports(),
            "kernel prepared"
        );
        reservation.commit(prepared);
        Ok(kernel_id)
    }

    fn reserve(&self, kernel_id: &KernelId) -> ConnectResult<Reservation<'_>> {
        let id = kernel_id.as_str();
        if id.is_empty() || id.contains(['/', '\\']) {
            return Err(ConnectError::InvalidKernelId(id.to_owned()));
        }
        let mut kernels = self.inner.kernels.lock();
        if kernels.contains_key(kernel_id) {
            return Err(ConnectError::KernelExists(kernel_id.to_string()));
        }
        kernels.insert(kernel_id.clone(), KernelSlot::Preparing);
        Ok(Reservation {
            kernels: &self.inner.kernels,
            kernel_id: kernel_id.clone(),
            committed: false,
        })
    }

    async fn launch(&self, kernel_id: &KernelId, spec: &KernelSpec) -> ConnectResult<PreparedKernel> {
        let inner = &self.inner;
        tokio::fs::create_dir_all(&inner.connection_dir).await?;

        let mut connection = KernelConnection::new()
            .with_transport(inner.transport)
            .with_connection_file(inner.connection_dir.join(format!("kernel-{kernel_id}.json")))
            .with_kernel_name(spec.display_name.clone());
        if let Some(ip) = &inner.ip {
            connection.set_ip(ip.clone());
        }

        let context = ProvisionerContext::new(Arc::clone(&inner.port_cache))
            .with_cache_ports(inner.cache_ports);
        let mut provisioner = inner.factory.create_instance(kernel_id, spec, context)?;

        if let Err(error) = provisioner.pre_launch(&mut connection).await {
            if let Err(cleanup_error) = provisioner.cleanup(&mut connection, false).await {
                warn!(%kernel_id, error = %cleanup_error, "cleanup after failed launch failed");
            }
            connection.cleanup_connection_file();
            connection.cleanup_ipc_files();
            return Err(error);
        }
        Ok(PreparedKernel {
            connection,
            provisioner,
        })
    }

    fn kernel(&self, kernel_id: &KernelId) -> ConnectResult<Arc<AsyncMutex<PreparedKernel>>> {
        match self.inner.kernels.lock().get(kernel_id) {
            Some(KernelSlot::Ready(kernel)) => Ok(Arc::clone(kernel)),
            Some(KernelSlot::Preparing) | None => {
                Err(ConnectError::KernelNotFound(kernel_id.to_string()))
            }
        }
    }

    pub async fn get_connection_info(
        &self,
        kernel_id: &KernelId,
        include_session: bool,
    ) -> ConnectResult<ConnectionSnapshot> {
        let kernel = self.kernel(kernel_id)?;
        let kernel = kernel.lock().await;
        Ok(kernel.connection.get_connection_info(include_session))
    }

    pub async fn connection_file(&self, kernel_id: &KernelId) -> ConnectResult<PathBuf> {
        let kernel = self.kernel(kernel_id)?;
        let kernel = kernel.lock().await;
        kernel
            .connection
            .connection_file()
            .map(Path::to_path_buf)
            .ok_or_else(|| ConnectError::InvalidState(format!("kernel {kernel_id} has no file")))
    }

    pub async fn connect_channel(
        &self,
        kernel_id: &KernelId,
        channel: Channel,
        identity: Option<&[u8]>,
    ) -> ConnectResult<zmq::Socket> {
        let kernel = self.kernel(kernel_id)?;
        let kernel = kernel.lock().await;
        kernel.connection.connect_channel(channel, identity)
    }

    pub async fn connect_shell(
        &self,
        kernel_id: &KernelId,
        identity: Option<&[u8]>,
    ) -> ConnectResult<zmq::Socket> {
        self.connect_channel(kernel_id, Channel::Shell, identity).await
    }

    pub async fn connect_iopub(
        &self,
        kernel_id: &KernelId,
        identity: Option<&[u8]>,
    ) -> ConnectResult<zmq::Socket> {
        self.connect_channel(kernel_id, Channel::Iopub, identity).await
    }

    pub async fn connect_stdin(
        &self,
        kernel_id: &KernelId,
        identity: Option<&[u8]>,
    ) -> ConnectResult<zmq::Socket> {
        self.connect_channel(kernel_id, Channel::Stdin, identity).await
    }

    pub async fn connect_hb(
        &self,
        kernel_id: &KernelId,
        identity: Option<&[u8]>,
    ) -> ConnectResult<zmq::Socket> {
        self.connect_channel(kernel_id, Channel::Hb, identity).await
    }

    pub async fn connect_control(
        &self,
        kernel_id: &KernelId,
        identity: Option<&[u8]>,
    ) -> ConnectResult<zmq::Socket> {
        self.connect_channel(kernel_id, Channel::Control, identity).await
    }

    /// Prepared kernels, sorted. Kernels still being prepared are left out.
    pub fn list_kernel_ids(&self) -> Vec<KernelId> {
        let mut ids = self
            .inner
            .kernels
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, KernelSlot::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn contains(&self, kernel_id: &KernelId) -> bool {
        matches!(
            self.inner.kernels.lock().get(kernel_id),
            Some(KernelSlot::Ready(_))
        )
    }

    pub fn len(&self) -> usize {
        self.list_kernel_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the provisioner's restart cleanup and `pre_launch` again. Ports
    /// claimed by the provisioner are kept.
    #[instrument(skip(self), fields(kernel_id = %kernel_id))]
    pub async fn restart_kernel(&self, kernel_id: &KernelId) -> ConnectResult<()> {
        let kernel = self.kernel(kernel_id)?;
        let mut kernel = kernel.lock().await;
        let PreparedKernel {
            connection,
            provisioner,
        } = &mut *kernel;
        provisioner.cleanup(connection, true).await?;
        provisioner.pre_launch(connection).await
    }

    /// Forgets a kernel: the provisioner releases its resources and the
    /// connection and ipc files this connector wrote are removed.
    #[instrument(skip(self), fields(kernel_id = %kernel_id))]
    pub async fn release_kernel(&self, kernel_id: &KernelId) -> ConnectResult<()> {
        let kernel = {
            let mut kernels = self.inner.kernels.lock();
            match kernels.remove(kernel_id) {
                Some(KernelSlot::Ready(kernel)) => kernel,
                Some(KernelSlot::Preparing) => {
                    kernels.insert(kernel_id.clone(), KernelSlot::Preparing);
                    return Err(ConnectError::KernelNotFound(kernel_id.to_string()));
                }
                None => return Err(ConnectError::KernelNotFound(kernel_id.to_string())),
            }
        };

        let mut kernel = kernel.lock().await;
        let PreparedKernel {
            connection,
            provisioner,
        } = &mut *kernel;
        let result = provisioner.cleanup(connection, false).await;
        connection.cleanup_connection_file();
        connection.cleanup_ipc_files();
        debug!("kernel released");
        result
    }

    /// Releases every prepared kernel. All are released even if one fails;
    /// the first failure is returned.
    pub async fn release_all(&self) -> ConnectResult<()> {
        let mut first_error = None;
        for kernel_id in self.list_kernel_ids() {
            if let Err(error) = self.release_kernel(&kernel_id).await {
                warn!(%kernel_id, %error, "failed to release kernel");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for KernelConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelConnector")
            .field("connection_dir", &self.inner.connection_dir)
            .field("transport", &self.inner.transport)
            .field("kernels", &self.list_kernel_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::{SystemTime, UNIX_EPOCH};

    use kconnect_provisioning::{LOCAL_PROVISIONER_NAME, StaticDiscovery};

    use super::*;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn connector(root: &Path) -> KernelConnector {
        KernelConnectorBuilder::new(root)
            .default_provisioner(LOCAL_PROVISIONER_NAME)
            .build()
    }

    #[tokio::test]
    async fn tcp_lifecycle() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-tcp");
        let connector = connector(&root);

        let kernel_id = connector
            .prepare_kernel(None, &KernelSpec::new("Python 3"))
            .await?;
        assert!(connector.contains(&kernel_id));
        assert_eq!(connector.list_kernel_ids(), vec![kernel_id.clone()]);

        let path = connector.connection_file(&kernel_id).await?;
        assert_eq!(path, root.join(format!("kernel-{kernel_id}.json")));
        assert!(path.exists());

        let info = connector.get_connection_info(&kernel_id, false).await?;
        assert_eq!(info.transport, Transport::Tcp);
        assert_eq!(info.ip, "127.0.0.1");
        assert!(info.ports.is_complete());
        assert!(info.ports.is_distinct());
        assert_eq!(connector.port_cache().claimed_count(), 5);

        connector.release_kernel(&kernel_id).await?;
        assert!(!path.exists());
        assert!(connector.is_empty());
        assert_eq!(connector.port_cache().claimed_count(), 0);
        assert!(matches!(
            connector.release_kernel(&kernel_id).await,
            Err(ConnectError::KernelNotFound(_))
        ));

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn explicit_ids_must_be_unique() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-dup");
        let connector = connector(&root);
        let kernel_id = KernelId::from("kernel-a");

        connector
            .prepare_kernel(Some(kernel_id.clone()), &KernelSpec::new("Python 3"))
            .await?;
        let before = tokio::fs::read_to_string(connector.connection_file(&kernel_id).await?).await?;

        let err = connector
            .prepare_kernel(Some(kernel_id.clone()), &KernelSpec::new("Python 3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::KernelExists(id) if id == "kernel-a"));
        let after = tokio::fs::read_to_string(connector.connection_file(&kernel_id).await?).await?;
        assert_eq!(before, after);

        connector.release_all().await?;
        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn ids_cannot_leave_the_connection_dir() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-badid");
        let connector = connector(&root);

        for id in ["../escape", "nested/kernel", "back\\slash", ""] {
            let err = connector
                .prepare_kernel(Some(KernelId::from(id)), &KernelSpec::new("Python 3"))
                .await
                .unwrap_err();
            assert!(matches!(err, ConnectError::InvalidKernelId(ref bad) if bad == id));
        }
        assert!(connector.is_empty());
        assert!(!root.exists());

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn ipc_lifecycle() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-ipc");
        let connector = KernelConnectorBuilder::new(&root)
            .transport(Transport::Ipc)
            .build();

        let kernel_id = connector
            .prepare_kernel(Some(KernelId::from("k-ipc")), &KernelSpec::new("Python 3"))
            .await?;
        let info = connector.get_connection_info(&kernel_id, true).await?;
        assert_eq!(info.transport, Transport::Ipc);
        assert_eq!(
            PathBuf::from(&info.ip),
            root.join("kernel-k-ipc-ipc")
        );
        assert!(info.ports.is_complete());
        assert_eq!(connector.port_cache().claimed_count(), 0);

        connector.release_kernel(&kernel_id).await?;
        assert!(!root.join("kernel-k-ipc.json").exists());

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_kernels_get_distinct_ports() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-parallel");
        let connector = connector(&root);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let connector = connector.clone();
            tasks.push(tokio::spawn(async move {
                connector
                    .prepare_kernel(None, &KernelSpec::new("Python 3"))
                    .await
            }));
        }
        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await??);
        }

        let mut seen = HashSet::new();
        for kernel_id in &ids {
            let info = connector.get_connection_info(kernel_id, false).await?;
            for port in info.ports.values() {
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 40);
        assert_eq!(connector.len(), 8);

        connector.release_all().await?;
        assert!(connector.is_empty());
        assert_eq!(connector.port_cache().claimed_count(), 0);

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn restart_keeps_ports() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-restart");
        let connector = connector(&root);
        let kernel_id = connector
            .prepare_kernel(None, &KernelSpec::new("Python 3"))
            .await?;
        let before = connector.get_connection_info(&kernel_id, false).await?;

        connector.restart_kernel(&kernel_id).await?;
        let after = connector.get_connection_info(&kernel_id, false).await?;
        assert_eq!(before.ports, after.ports);
        assert_eq!(connector.port_cache().claimed_count(), 5);

        connector.release_all().await?;
        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_provisioner_leaves_nothing_behind() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-unknown");
        let connector = KernelConnectorBuilder::new(&root)
            .discovery(Arc::new(StaticDiscovery::with_builtins()))
            .build();
        let kernel_id = KernelId::from("k-missing");
        let spec = KernelSpec::new("Remote").with_provisioner("docker-provisioner", None);

        let err = connector
            .prepare_kernel(Some(kernel_id.clone()), &spec)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ProvisionerNotFound(_)));
        assert!(!connector.contains(&kernel_id));

        connector
            .prepare_kernel(Some(kernel_id.clone()), &KernelSpec::new("Python 3"))
            .await?;
        connector.release_all().await?;
        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn remote_ip_is_refused() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-remote");
        let connector = KernelConnectorBuilder::new(&root).ip("192.0.2.33").build();

        let err = connector
            .prepare_kernel(None, &KernelSpec::new("Python 3"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NonLocalAddress(_)));
        assert!(connector.is_empty());

        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn sockets_connect_to_prepared_kernel() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-sockets");
        let connector = connector(&root);
        let kernel_id = connector
            .prepare_kernel(None, &KernelSpec::new("Python 3"))
            .await?;

        let iopub = connector.connect_iopub(&kernel_id, None).await?;
        assert_eq!(iopub.get_socket_type()?, zmq::SUB);
        let hb = connector.connect_hb(&kernel_id, None).await?;
        assert_eq!(hb.get_socket_type()?, zmq::REQ);
        connector.connect_shell(&kernel_id, Some(b"client")).await?;
        connector.connect_stdin(&kernel_id, None).await?;
        connector.connect_control(&kernel_id, None).await?;

        assert!(matches!(
            connector.connect_shell(&KernelId::from("nope"), None).await,
            Err(ConnectError::KernelNotFound(_))
        ));

        connector.release_all().await?;
        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn without_port_cache_ports_are_still_distinct() -> anyhow::Result<()> {
        let root = unique_test_root("kconnect-kernel-nocache");
        let connector = KernelConnectorBuilder::new(&root).cache_ports(false).build();
        let kernel_id = connector
            .prepare_kernel(None, &KernelSpec::new("Python 3"))
            .await?;

        let info = connector.get_connection_info(&kernel_id, false).await?;
        assert!(info.ports.is_distinct());
        assert_eq!(connector.port_cache().claimed_count(), 0);

        connector.release_all().await?;
        let _ = tokio::fs::remove_dir_all(root).await;
        Ok(())
    }
}
