//! SSH tunnels to a remote kernel.
//!
//! [`tunnel_to_kernel`] opens one SSH session, picks five free local ports,
//! and forwards each of them to the matching remote channel port on the
//! kernel's own ip. Clients then connect to the local ports instead.

mod prompt;
mod ssh;
mod target;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kconnect_ports::select_random_ports;
use kconnect_protocol::{
    Channel, ChannelPorts, ConnectError, ConnectResult, ConnectionInfo, LOCALHOST,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, instrument, trace, warn};

pub use prompt::{FixedPassword, PasswordPrompt, TerminalPrompt};
pub use target::{DEFAULT_SSH_PORT, SshTarget, default_user};

use ssh::SshSession;

/// Where the remote connection info comes from.
#[derive(Debug, Clone)]
pub enum TunnelSource {
    Info(ConnectionInfo),
    File(PathBuf),
}

impl TunnelSource {
    pub fn load(self) -> ConnectResult<ConnectionInfo> {
        match self {
            Self::Info(info) => Ok(info),
            Self::File(path) => fs::read_to_string(&path)?.parse(),
        }
    }
}

impl From<ConnectionInfo> for TunnelSource {
    fn from(info: ConnectionInfo) -> Self {
        Self::Info(info)
    }
}

impl From<PathBuf> for TunnelSource {
    fn from(path: PathBuf) -> Self {
        Self::File(path)
    }
}

impl From<&Path> for TunnelSource {
    fn from(path: &Path) -> Self {
        Self::File(path.to_path_buf())
    }
}

/// Forwards five local ports to a remote kernel. Forwarding stops when the
/// tunnel is dropped.
pub struct KernelTunnel {
    target: SshTarget,
    remote_ip: String,
    local: ChannelPorts,
    forwards: Vec<JoinHandle<()>>,
    session: Arc<SshSession>,
}

impl KernelTunnel {
    pub fn target(&self) -> &SshTarget {
        &self.target
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    /// Local ports in shell, iopub, stdin, hb, control order.
    pub fn local_ports(&self) -> [u16; 5] {
        Channel::TUNNEL_ORDER.map(|channel| self.local.get(channel))
    }

    pub fn ports(&self) -> ChannelPorts {
        self.local
    }

    /// `info` rewritten to reach the kernel through this tunnel.
    pub fn local_connection_info(&self, info: &ConnectionInfo) -> ConnectionInfo {
        through_tunnel(info, self.local)
    }

    /// Stops forwarding and closes the SSH session.
    pub async fn close(self) -> ConnectResult<()> {
        for forward in &self.forwards {
            forward.abort();
        }
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(|error| ConnectError::Tunnel(error.to_string()))
    }
}

impl Drop for KernelTunnel {
    fn drop(&mut self) {
        for forward in &self.forwards {
            forward.abort();
        }
    }
}

impl fmt::Debug for KernelTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelTunnel")
            .field("target", &self.target)
            .field("remote_ip", &self.remote_ip)
            .field("local", &self.local)
            .finish_non_exhaustive()
    }
}

/// Tunnels every channel of a kernel through `ssh_server`
/// (`[user@]host[:port]`).
///
/// Authentication tries the ssh agent, then `ssh_key`, then the default
/// key files; only if all of them fail is `prompt` asked for a password,
/// once. Failures are returned as is, without retrying.
#[instrument(skip(source, ssh_key, prompt))]
pub async fn tunnel_to_kernel(
    source: impl Into<TunnelSource>,
    ssh_server: &str,
    ssh_key: Option<&Path>,
    prompt: &dyn PasswordPrompt,
) -> ConnectResult<KernelTunnel> {
    let info = source.into().load()?;
    let target: SshTarget = ssh_server.parse()?;
    let local_ports = select_random_ports(LOCALHOST, Channel::TUNNEL_ORDER.len())?;

    let mut session = ssh::connect(&target).await?;
    ssh::authenticate(&mut session, &target, ssh_key, prompt).await?;

    let mut tunnel = KernelTunnel {
        target,
        remote_ip: info.ip.clone(),
        local: ChannelPorts::default(),
        forwards: Vec::with_capacity(local_ports.len()),
        session: Arc::new(session),
    };
    for (channel, local_port, remote_port) in forward_plan(&info, &local_ports) {
        let listener = TcpListener::bind((LOCALHOST, local_port)).await?;
        tunnel.local.set(channel, local_port);
        tunnel.forwards.push(tokio::spawn(forward(
            listener,
            Arc::clone(&tunnel.session),
            channel,
            info.ip.clone(),
            remote_port,
        )));
    }

    debug!(server = %tunnel.target, local_ports = ?tunnel.local_ports(), "tunnel established");
    Ok(tunnel)
}

/// `(channel, local port, remote port)` in tunnel order.
fn forward_plan(info: &ConnectionInfo, local_ports: &[u16]) -> Vec<(Channel, u16, u16)> {
    Channel::TUNNEL_ORDER
        .into_iter()
        .zip(local_ports.iter().copied())
        .map(|(channel, local)| (channel, local, info.ports.get(channel)))
        .collect()
}

fn through_tunnel(info: &ConnectionInfo, local: ChannelPorts) -> ConnectionInfo {
    ConnectionInfo {
        ports: local,
        ip: LOCALHOST.to_owned(),
        ..info.clone()
    }
}

async fn forward(
    listener: TcpListener,
    session: Arc<SshSession>,
    channel: Channel,
    remote_ip: String,
    remote_port: u16,
) {
    let mut connections = JoinSet::new();
    loop {
        while connections.try_join_next().is_some() {}

        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%channel, %error, "tunnel listener failed");
                return;
            }
        };
        trace!(%channel, %peer, "forwarding connection");
        connections.spawn(forward_connection(
            stream,
            peer,
            Arc::clone(&session),
            channel,
            remote_ip.clone(),
            remote_port,
        ));
    }
}

async fn forward_connection(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    session: Arc<SshSession>,
    channel: Channel,
    remote_ip: String,
    remote_port: u16,
) {
    let ssh_channel = match session
        .channel_open_direct_tcpip(
            remote_ip,
            u32::from(remote_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(ssh_channel) => ssh_channel,
        Err(error) => {
            warn!(%channel, remote_port, %error, "could not open forwarded channel");
            return;
        }
    };
    let mut remote = ssh_channel.into_stream();
    if let Err(error) = tokio::io::copy_bidirectional(&mut stream, &mut remote).await {
        trace!(%channel, %error, "forwarded connection closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn remote_info() -> ConnectionInfo {
        ConnectionInfo {
            ports: ChannelPorts {
                shell: 6001,
                iopub: 6002,
                stdin: 6003,
                control: 6004,
                hb: 6005,
            },
            ip: "10.0.0.9".to_owned(),
            key: b"remote-key".to_vec(),
            ..ConnectionInfo::default()
        }
    }

    #[test]
    fn plan_pairs_local_ports_in_tunnel_order() {
        let plan = forward_plan(&remote_info(), &[7001, 7002, 7003, 7004, 7005]);
        assert_eq!(
            plan,
            vec![
                (Channel::Shell, 7001, 6001),
                (Channel::Iopub, 7002, 6002),
                (Channel::Stdin, 7003, 6003),
                (Channel::Hb, 7004, 6005),
                (Channel::Control, 7005, 6004),
            ]
        );
    }

    #[test]
    fn tunneled_info_points_at_loopback() {
        let local = ChannelPorts {
            shell: 7001,
            iopub: 7002,
            stdin: 7003,
            control: 7005,
            hb: 7004,
        };
        let info = through_tunnel(&remote_info(), local);
        assert_eq!(info.ip, LOCALHOST);
        assert_eq!(info.ports, local);
        assert_eq!(info.key, b"remote-key");
    }

    #[test]
    fn source_loads_connection_file() -> anyhow::Result<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!("kconnect-tunnel-source-{nanos}.json"));
        fs::write(&path, remote_info().to_json_pretty()?)?;

        let info = TunnelSource::from(path.as_path()).load()?;
        assert_eq!(info, remote_info());

        fs::remove_file(path)?;
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_server_is_a_tunnel_error() -> anyhow::Result<()> {
        let closed_port = kconnect_ports::allocate_free_port(LOCALHOST)?;
        let server = format!("nobody@127.0.0.1:{closed_port}");

        let err = tunnel_to_kernel(remote_info(), &server, None, &FixedPassword::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Tunnel(_)));
        Ok(())
    }

    #[tokio::test]
    async fn malformed_server_is_rejected_before_connecting() {
        let err = tunnel_to_kernel(remote_info(), "user@", None, &FixedPassword::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::InvalidAddress(_)));
    }
}
