use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kconnect_protocol::{ConnectError, ConnectResult};
use russh::client::{self, Handle, Handler};
use russh::keys::key::PublicKey;
use russh::keys::load_secret_key;
use tracing::{debug, trace, warn};

use crate::prompt::PasswordPrompt;
use crate::target::SshTarget;

const DEFAULT_IDENTITY_FILES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Verifies server keys against `~/.ssh/known_hosts`. Unknown hosts are
/// accepted and recorded; a changed key is refused.
pub(crate) struct TunnelHandler {
    host: String,
    port: u16,
}

#[async_trait]
impl Handler for TunnelHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_key: &PublicKey) -> Result<bool, Self::Error> {
        match russh_keys::check_known_hosts(&self.host, self.port, server_key) {
            Ok(true) => {
                trace!(host = %self.host, "host key matches known_hosts");
                Ok(true)
            }
            Ok(false) => {
                warn!(
                    host = %self.host,
                    port = self.port,
                    fingerprint = %server_key.fingerprint(),
                    "unknown ssh host, adding it to known_hosts"
                );
                if let Err(error) = russh_keys::learn_known_hosts(&self.host, self.port, server_key) {
                    warn!(%error, "could not record host key");
                }
                Ok(true)
            }
            Err(russh_keys::Error::KeyChanged { line }) => {
                warn!(
                    host = %self.host,
                    known_hosts_line = line,
                    "ssh host key does not match known_hosts, refusing to connect"
                );
                Ok(false)
            }
            Err(error) => {
                warn!(host = %self.host, %error, "could not verify ssh host key");
                Ok(false)
            }
        }
    }
}

pub(crate) type SshSession = Handle<TunnelHandler>;

pub(crate) async fn connect(target: &SshTarget) -> ConnectResult<SshSession> {
    let socket = tokio::net::TcpStream::connect((target.host.as_str(), target.port))
        .await
        .map_err(|error| ConnectError::Tunnel(format!("cannot reach {target}: {error}")))?;
    socket.set_nodelay(true)?;

    let handler = TunnelHandler {
        host: target.host.clone(),
        port: target.port,
    };
    client::connect_stream(Arc::new(client::Config::default()), socket, handler)
        .await
        .map_err(|error| ConnectError::Tunnel(format!("ssh handshake with {target} failed: {error}")))
}

/// Authenticates without a password if possible, otherwise asks `prompt`
/// once. A rejected password is an error.
pub(crate) async fn authenticate(
    session: &mut SshSession,
    target: &SshTarget,
    ssh_key: Option<&Path>,
    prompt: &dyn PasswordPrompt,
) -> ConnectResult<()> {
    if try_passwordless(session, &target.user, ssh_key).await {
        return Ok(());
    }

    debug!(server = %target, "passwordless authentication not possible, asking for password");
    let password = prompt.password(target).await?;
    match session.authenticate_password(&target.user, password).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ConnectError::Authentication(format!(
            "password rejected for {target}"
        ))),
        Err(error) => Err(ConnectError::Authentication(format!("{target}: {error}"))),
    }
}

/// Agent identities, then the explicit key, then the default key files.
async fn try_passwordless(session: &mut SshSession, user: &str, ssh_key: Option<&Path>) -> bool {
    #[cfg(unix)]
    {
        if try_agent(session, user).await {
            debug!("authenticated with ssh agent");
            return true;
        }
    }

    let keys = ssh_key
        .map(Path::to_path_buf)
        .into_iter()
        .chain(default_identity_files());
    for key_path in keys {
        if try_key(session, user, &key_path).await {
            debug!(key = %key_path.display(), "authenticated with key");
            return true;
        }
    }
    false
}

#[cfg(unix)]
async fn try_agent(session: &mut SshSession, user: &str) -> bool {
    use russh_keys::agent::client::AgentClient;

    let mut agent = match AgentClient::connect_env().await {
        Ok(agent) => agent,
        Err(error) => {
            trace!(%error, "no ssh agent");
            return false;
        }
    };
    let identities = match agent.request_identities().await {
        Ok(identities) => identities,
        Err(error) => {
            trace!(%error, "ssh agent did not list identities");
            return false;
        }
    };

    for identity in identities {
        let (returned, result) = session.authenticate_future(user, identity, agent).await;
        agent = returned;
        match result {
            Ok(true) => return true,
            Ok(false) => trace!("agent identity rejected"),
            Err(error) => trace!(%error, "agent identity failed"),
        }
    }
    false
}

async fn try_key(session: &mut SshSession, user: &str, key_path: &Path) -> bool {
    if !key_path.is_file() {
        return false;
    }
    let key = match load_secret_key(key_path, None) {
        Ok(key) => key,
        Err(error) => {
            trace!(key = %key_path.display(), %error, "cannot load key");
            return false;
        }
    };
    match session.authenticate_publickey(user, Arc::new(key)).await {
        Ok(accepted) => accepted,
        Err(error) => {
            trace!(key = %key_path.display(), %error, "key authentication failed");
            false
        }
    }
}

fn default_identity_files() -> Vec<PathBuf> {
    let Some(ssh_dir) = dirs::home_dir().map(|home| home.join(".ssh")) else {
        return Vec::new();
    };
    DEFAULT_IDENTITY_FILES
        .iter()
        .map(|name| ssh_dir.join(name))
        .collect()
}
