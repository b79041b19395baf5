//! Connection credential model.
//!
//! A [`ConnectionInfo`] is the authoritative description of how to reach one
//! kernel. Its JSON form is the connection file:
//!
//! ```json
//! {
//!   "shell_port": 53794,
//!   "iopub_port": 53795,
//!   "stdin_port": 53796,
//!   "control_port": 53798,
//!   "hb_port": 53797,
//!   "ip": "127.0.0.1",
//!   "key": "a0436f6c-1916-498b-8eb9-e81ab9368e84",
//!   "transport": "tcp",
//!   "signature_scheme": "hmac-sha256",
//!   "kernel_name": ""
//! }
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, ConnectResult};
use crate::session::DEFAULT_SIGNATURE_SCHEME;

/// Loopback address used whenever a tcp connection has no explicit ip.
pub const LOCALHOST: &str = "127.0.0.1";

/// Sentinel meaning "not configured yet, allocate on write".
pub const UNSET_PORT: u16 = 0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Transport {
    #[default]
    Tcp,
    Ipc,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ipc => "ipc",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "ipc" => Ok(Self::Ipc),
            other => Err(ConnectError::InvalidTransport(other.to_owned())),
        }
    }
}

impl TryFrom<String> for Transport {
    type Error = ConnectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One of the five logical communication paths to a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Shell,
    Iopub,
    Stdin,
    Hb,
    Control,
}

impl Channel {
    /// Every channel, in connection-info order.
    pub const ALL: [Channel; 5] = [
        Channel::Shell,
        Channel::Stdin,
        Channel::Iopub,
        Channel::Hb,
        Channel::Control,
    ];

    /// Order in which freshly allocated ports are handed out.
    pub const ALLOCATION_ORDER: [Channel; 5] = [
        Channel::Shell,
        Channel::Iopub,
        Channel::Stdin,
        Channel::Control,
        Channel::Hb,
    ];

    /// Order in which tunnels report their local ports.
    pub const TUNNEL_ORDER: [Channel; 5] = [
        Channel::Shell,
        Channel::Iopub,
        Channel::Stdin,
        Channel::Hb,
        Channel::Control,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Iopub => "iopub",
            Self::Stdin => "stdin",
            Self::Hb => "hb",
            Self::Control => "control",
        }
    }

    /// Key of this channel's port in the connection file.
    pub fn port_key(self) -> &'static str {
        match self {
            Self::Shell => "shell_port",
            Self::Iopub => "iopub_port",
            Self::Stdin => "stdin_port",
            Self::Hb => "hb_port",
            Self::Control => "control_port",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Self::Shell),
            "iopub" => Ok(Self::Iopub),
            "stdin" => Ok(Self::Stdin),
            "hb" | "heartbeat" => Ok(Self::Hb),
            "control" => Ok(Self::Control),
            other => Err(ConnectError::InvalidState(format!("unknown channel {other}"))),
        }
    }
}

/// Ports of the five channels. For tcp these are network ports, for ipc
/// they are small indexes forming the socket path `{ip}-{index}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPorts {
    #[serde(rename = "shell_port")]
    pub shell: u16,
    #[serde(rename = "iopub_port")]
    pub iopub: u16,
    #[serde(rename = "stdin_port")]
    pub stdin: u16,
    #[serde(rename = "control_port")]
    pub control: u16,
    #[serde(rename = "hb_port")]
    pub hb: u16,
}

impl ChannelPorts {
    pub fn get(&self, channel: Channel) -> u16 {
        match channel {
            Channel::Shell => self.shell,
            Channel::Iopub => self.iopub,
            Channel::Stdin => self.stdin,
            Channel::Hb => self.hb,
            Channel::Control => self.control,
        }
    }

    pub fn set(&mut self, channel: Channel, port: u16) {
        match channel {
            Channel::Shell => self.shell = port,
            Channel::Iopub => self.iopub = port,
            Channel::Stdin => self.stdin = port,
            Channel::Hb => self.hb = port,
            Channel::Control => self.control = port,
        }
    }

    /// Channels still at [`UNSET_PORT`], in allocation order.
    pub fn unset_channels(&self) -> Vec<Channel> {
        Channel::ALLOCATION_ORDER
            .into_iter()
            .filter(|channel| self.get(*channel) == UNSET_PORT)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        Channel::ALL
            .into_iter()
            .all(|channel| self.get(channel) != UNSET_PORT)
    }

    pub fn is_distinct(&self) -> bool {
        let values = self.values();
        values
            .iter()
            .enumerate()
            .all(|(i, port)| !values[i + 1..].contains(port))
    }

    /// Port values in connection-info order.
    pub fn values(&self) -> [u16; 5] {
        Channel::ALL.map(|channel| self.get(channel))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(flatten)]
    pub ports: ChannelPorts,
    pub ip: String,
    #[serde(default, with = "key_text")]
    pub key: Vec<u8>,
    #[serde(default)]
    pub transport: Transport,
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,
    #[serde(default)]
    pub kernel_name: String,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            ports: ChannelPorts::default(),
            ip: LOCALHOST.to_owned(),
            key: Vec::new(),
            transport: Transport::Tcp,
            signature_scheme: DEFAULT_SIGNATURE_SCHEME.to_owned(),
            kernel_name: String::new(),
        }
    }
}

impl ConnectionInfo {
    /// Socket URL for `channel`: `tcp://ip:port` or `{transport}://ip-port`.
    pub fn url(&self, channel: Channel) -> String {
        let port = self.ports.get(channel);
        match self.transport {
            Transport::Tcp => format!("tcp://{}:{}", self.ip, port),
            Transport::Ipc => format!("{}://{}-{}", self.transport, self.ip, port),
        }
    }

    /// Filesystem path backing an ipc channel.
    pub fn ipc_path(&self, channel: Channel) -> String {
        format!("{}-{}", self.ip, self.ports.get(channel))
    }

    /// Checks that every port is assigned and, for tcp, that no two collide.
    pub fn validate(&self) -> ConnectResult<()> {
        if !self.ports.is_complete() {
            return Err(ConnectError::InvalidState(format!(
                "unassigned ports in {:?}",
                self.ports
            )));
        }
        if !self.ports.is_distinct() {
            return Err(ConnectError::InvalidState(format!(
                "colliding ports in {:?}",
                self.ports
            )));
        }
        Ok(())
    }

    pub fn has_key(&self) -> bool {
        !self.key.is_empty()
    }

    pub fn to_json_pretty(&self) -> ConnectResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

impl FromStr for ConnectionInfo {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

/// Connection info where every field is optional, as read from a file or a
/// caller-supplied mapping. Loading applies it on top of existing settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfoPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iopub_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hb_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_port: Option<u16>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_key_text"
    )]
    pub key: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

impl ConnectionInfoPatch {
    pub fn port(&self, channel: Channel) -> Option<u16> {
        match channel {
            Channel::Shell => self.shell_port,
            Channel::Iopub => self.iopub_port,
            Channel::Stdin => self.stdin_port,
            Channel::Hb => self.hb_port,
            Channel::Control => self.control_port,
        }
    }

    pub fn set_port(&mut self, channel: Channel, port: u16) {
        let slot = match channel {
            Channel::Shell => &mut self.shell_port,
            Channel::Iopub => &mut self.iopub_port,
            Channel::Stdin => &mut self.stdin_port,
            Channel::Hb => &mut self.hb_port,
            Channel::Control => &mut self.control_port,
        };
        *slot = Some(port);
    }
}

impl From<&ConnectionInfo> for ConnectionInfoPatch {
    fn from(info: &ConnectionInfo) -> Self {
        let mut patch = Self {
            transport: Some(info.transport),
            ip: Some(info.ip.clone()),
            key: Some(info.key.clone()),
            signature_scheme: Some(info.signature_scheme.clone()),
            kernel_name: Some(info.kernel_name.clone()),
            ..Self::default()
        };
        for channel in Channel::ALL {
            patch.set_port(channel, info.ports.get(channel));
        }
        patch
    }
}

impl From<ConnectionInfo> for ConnectionInfoPatch {
    fn from(info: ConnectionInfo) -> Self {
        Self::from(&info)
    }
}

fn default_signature_scheme() -> String {
    DEFAULT_SIGNATURE_SCHEME.to_owned()
}

/// The key is a byte secret stored as UTF-8 text.
mod key_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        let text = std::str::from_utf8(key).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

mod optional_key_text {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        key: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match key {
            Some(key) => {
                let text = std::str::from_utf8(key).map_err(serde::ser::Error::custom)?;
                serializer.serialize_some(text)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer).map(|key| key.map(String::into_bytes))
    }
}
