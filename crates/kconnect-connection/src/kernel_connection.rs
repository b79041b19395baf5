use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use kconnect_protocol::{
    Channel, ChannelPorts, ConnectError, ConnectResult, ConnectionInfo, ConnectionInfoPatch,
    LOCALHOST, Session, Transport, UNSET_PORT,
};
use tracing::{debug, instrument};

use crate::file::{read_connection_file, write_connection_file};
use crate::socket::connect_socket;

const IPC_FALLBACK_IP: &str = "kernel-ipc";

/// Channels whose ports were allocated rather than configured. Captured the
/// first time a tcp connection is written or loaded, then fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomPortSet(Vec<Channel>);

impl RandomPortSet {
    fn capture(ports: &ChannelPorts) -> Self {
        Self(
            Channel::ALL
                .into_iter()
                .filter(|channel| ports.get(*channel) == UNSET_PORT)
                .collect(),
        )
    }

    pub fn channels(&self) -> &[Channel] {
        &self.0
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0.contains(&channel)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Authentication half of a [`ConnectionSnapshot`].
#[derive(Debug, Clone)]
pub enum SessionAuth {
    /// A fork of the live session, for handing to another object in this
    /// process. Digest history is not shared.
    Live(Session),
    /// Just the parameters, for handing to another process.
    Exported {
        key: Vec<u8>,
        signature_scheme: String,
    },
}

#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub transport: Transport,
    pub ip: String,
    pub ports: ChannelPorts,
    pub auth: SessionAuth,
}

impl From<&ConnectionSnapshot> for ConnectionInfoPatch {
    fn from(snapshot: &ConnectionSnapshot) -> Self {
        let (key, signature_scheme) = match &snapshot.auth {
            SessionAuth::Live(session) => (
                session.key().to_vec(),
                session.signature_scheme().to_owned(),
            ),
            SessionAuth::Exported {
                key,
                signature_scheme,
            } => (key.clone(), signature_scheme.clone()),
        };
        let mut patch = Self {
            transport: Some(snapshot.transport),
            ip: Some(snapshot.ip.clone()),
            key: Some(key),
            signature_scheme: Some(signature_scheme),
            ..Self::default()
        };
        for channel in Channel::ALL {
            patch.set_port(channel, snapshot.ports.get(channel));
        }
        patch
    }
}

/// Owns the connection credentials of one kernel.
///
/// Explicitly configured ports always win over ports loaded from a file.
/// The connection file is only removed by cleanup if this instance wrote
/// it, so files supplied from elsewhere are left alone.
pub struct KernelConnection {
    connection_file: Option<PathBuf>,
    file_written: bool,
    transport: Transport,
    ip: Option<String>,
    kernel_name: String,
    ports: ChannelPorts,
    random_ports: Option<RandomPortSet>,
    session: Session,
    context: zmq::Context,
}

impl KernelConnection {
    pub fn new() -> Self {
        Self {
            connection_file: None,
            file_written: false,
            transport: Transport::Tcp,
            ip: None,
            kernel_name: String::new(),
            ports: ChannelPorts::default(),
            random_ports: None,
            session: Session::new(),
            context: zmq::Context::new(),
        }
    }

    /// Connection whose credentials are taken from `snapshot`. A live
    /// session is adopted as is; exported parameters are loaded into a new
    /// session.
    pub fn from_snapshot(snapshot: ConnectionSnapshot) -> ConnectResult<Self> {
        let patch = ConnectionInfoPatch::from(&snapshot);
        let mut connection = Self::new();
        connection.load_connection_info(&patch)?;
        if let SessionAuth::Live(session) = snapshot.auth {
            connection.session = session;
        }
        Ok(connection)
    }

    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.set_ip(ip);
        self
    }

    pub fn with_connection_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.connection_file = Some(path.into());
        self
    }

    pub fn with_kernel_name(mut self, kernel_name: impl Into<String>) -> Self {
        self.kernel_name = kernel_name.into();
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = session;
        self
    }

    pub fn with_context(mut self, context: zmq::Context) -> Self {
        self.context = context;
        self
    }

    pub fn with_port(mut self, channel: Channel, port: u16) -> Self {
        self.ports.set(channel, port);
        self
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn set_transport(&mut self, transport: Transport) {
        self.transport = transport;
    }

    /// The configured address, or the transport default: loopback for tcp,
    /// `<connection file without extension>-ipc` for ipc.
    pub fn ip(&self) -> String {
        self.ip.clone().unwrap_or_else(|| self.default_ip())
    }

    /// `"*"` is stored as `"0.0.0.0"`; an empty ip falls back to the
    /// transport default.
    pub fn set_ip(&mut self, ip: impl Into<String>) {
        let ip = ip.into();
        self.ip = if ip.is_empty() {
            None
        } else if ip == "*" {
            Some("0.0.0.0".to_owned())
        } else {
            Some(ip)
        };
    }

    fn default_ip(&self) -> String {
        match (self.transport, &self.connection_file) {
            (Transport::Tcp, _) => LOCALHOST.to_owned(),
            (Transport::Ipc, Some(path)) => {
                format!("{}-ipc", path.with_extension("").display())
            }
            (Transport::Ipc, None) => IPC_FALLBACK_IP.to_owned(),
        }
    }

    pub fn ports(&self) -> &ChannelPorts {
        &self.ports
    }

    pub fn port(&self, channel: Channel) -> u16 {
        self.ports.get(channel)
    }

    pub fn set_port(&mut self, channel: Channel, port: u16) {
        self.ports.set(channel, port);
    }

    pub fn connection_file(&self) -> Option<&Path> {
        self.connection_file.as_deref()
    }

    pub fn set_connection_file(&mut self, path: impl Into<PathBuf>) {
        self.connection_file = Some(path.into());
    }

    pub fn is_file_written(&self) -> bool {
        self.file_written
    }

    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn context(&self) -> &zmq::Context {
        &self.context
    }

    pub fn random_ports(&self) -> Option<&RandomPortSet> {
        self.random_ports.as_ref()
    }

    /// Current credentials in connection-file form.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            ports: self.ports,
            ip: self.ip(),
            key: self.session.key().to_vec(),
            transport: self.transport,
            signature_scheme: self.session.signature_scheme().to_owned(),
            kernel_name: self.kernel_name.clone(),
        }
    }

    /// Credentials plus either a fork of the live session
    /// (`include_session`) or its exported key and scheme.
    pub fn get_connection_info(&self, include_session: bool) -> ConnectionSnapshot {
        let auth = if include_session {
            SessionAuth::Live(self.session.fork())
        } else {
            SessionAuth::Exported {
                key: self.session.key().to_vec(),
                signature_scheme: self.session.signature_scheme().to_owned(),
            }
        };
        ConnectionSnapshot {
            transport: self.transport,
            ip: self.ip(),
            ports: self.ports,
            auth,
        }
    }

    fn record_random_ports(&mut self) {
        if self.transport != Transport::Tcp || self.random_ports.is_some() {
            return;
        }
        self.random_ports = Some(RandomPortSet::capture(&self.ports));
    }

    /// Writes the connection file, allocating unset ports. Does nothing if
    /// this instance already wrote the file and it still exists.
    #[instrument(skip(self), fields(transport = %self.transport))]
    pub fn write_connection_file(&mut self) -> ConnectResult<PathBuf> {
        if self.file_written {
            if let Some(path) = self.connection_file.as_ref().filter(|path| path.exists()) {
                return Ok(path.clone());
            }
        }

        let (path, written) =
            write_connection_file(self.connection_file.as_deref(), self.connection_info())?;
        self.record_random_ports();
        self.ports = written.ports;
        // pinned so a later connection_file change cannot move the ipc paths
        self.ip = Some(written.ip);
        self.connection_file = Some(path.clone());
        self.file_written = true;
        Ok(path)
    }

    /// Loads `path`, or the configured connection file, on top of the
    /// current settings.
    pub fn load_connection_file(&mut self, path: Option<&Path>) -> ConnectResult<()> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.connection_file.clone().ok_or_else(|| {
                ConnectError::InvalidState("no connection file to load".to_owned())
            })?,
        };
        debug!(path = %path.display(), "loading connection file");
        let patch = read_connection_file(&path)?;
        self.load_connection_info(&patch)
    }

    /// Applies `patch`. Ports are only taken where the current value is
    /// unset; transport, key and signature scheme are taken whenever
    /// present. A missing ip resets to the transport default.
    pub fn load_connection_info(&mut self, patch: &ConnectionInfoPatch) -> ConnectResult<()> {
        if let Some(transport) = patch.transport {
            self.transport = transport;
        }
        match &patch.ip {
            Some(ip) => self.set_ip(ip.clone()),
            None => self.ip = None,
        }

        self.record_random_ports();
        for channel in Channel::ALL {
            if self.ports.get(channel) != UNSET_PORT {
                continue;
            }
            if let Some(port) = patch.port(channel) {
                self.ports.set(channel, port);
            }
        }

        if let Some(key) = &patch.key {
            self.session.set_key(key.clone());
        }
        if let Some(scheme) = &patch.signature_scheme {
            self.session.set_signature_scheme(scheme)?;
        }
        Ok(())
    }

    /// Replaces every port with the ones in `patch` and rewrites the file.
    pub fn force_connection_info(&mut self, patch: &ConnectionInfoPatch) -> ConnectResult<PathBuf> {
        debug!("forcing connection info");
        self.file_written = false;
        self.ports = ChannelPorts::default();
        self.load_connection_info(patch)?;
        self.write_connection_file()
    }

    /// Removes the connection file if this instance wrote it. A file that
    /// is already gone is not an error.
    pub fn cleanup_connection_file(&mut self) {
        if !self.file_written {
            return;
        }
        self.file_written = false;
        if let Some(path) = &self.connection_file {
            if let Err(error) = fs::remove_file(path) {
                debug!(%error, path = %path.display(), "connection file already removed");
            }
        }
    }

    /// Removes the socket files of an ipc connection.
    pub fn cleanup_ipc_files(&self) {
        if self.transport != Transport::Ipc {
            return;
        }
        let info = self.connection_info();
        for channel in Channel::ALL {
            let _ = fs::remove_file(info.ipc_path(channel));
        }
    }

    /// Resets the allocated ports to unset and removes the connection file
    /// so the next write allocates afresh.
    pub fn cleanup_random_ports(&mut self) {
        let Some(random) = self.random_ports.as_ref().filter(|random| !random.is_empty()) else {
            return;
        };
        for channel in random.channels() {
            self.ports.set(*channel, UNSET_PORT);
        }
        self.cleanup_connection_file();
    }

    pub fn make_url(&self, channel: Channel) -> String {
        self.connection_info().url(channel)
    }

    pub fn connect_channel(
        &self,
        channel: Channel,
        identity: Option<&[u8]>,
    ) -> ConnectResult<zmq::Socket> {
        connect_socket(&self.context, channel, &self.make_url(channel), identity)
    }

    pub fn connect_shell(&self, identity: Option<&[u8]>) -> ConnectResult<zmq::Socket> {
        self.connect_channel(Channel::Shell, identity)
    }

    /// Subscribed to every topic.
    pub fn connect_iopub(&self, identity: Option<&[u8]>) -> ConnectResult<zmq::Socket> {
        self.connect_channel(Channel::Iopub, identity)
    }

    pub fn connect_stdin(&self, identity: Option<&[u8]>) -> ConnectResult<zmq::Socket> {
        self.connect_channel(Channel::Stdin, identity)
    }

    pub fn connect_hb(&self, identity: Option<&[u8]>) -> ConnectResult<zmq::Socket> {
        self.connect_channel(Channel::Hb, identity)
    }

    pub fn connect_control(&self, identity: Option<&[u8]>) -> ConnectResult<zmq::Socket> {
        self.connect_channel(Channel::Control, identity)
    }
}

impl Default for KernelConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KernelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelConnection")
            .field("connection_file", &self.connection_file)
            .field("file_written", &self.file_written)
            .field("transport", &self.transport)
            .field("ip", &self.ip())
            .field("kernel_name", &self.kernel_name)
            .field("ports", &self.ports)
            .field("random_ports", &self.random_ports)
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}
