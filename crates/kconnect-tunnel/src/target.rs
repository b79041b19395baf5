use std::fmt;
use std::str::FromStr;

use kconnect_protocol::ConnectError;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// An SSH server given as `[user@]host[:port]`. IPv6 hosts with a port are
/// written in brackets: `user@[::1]:2222`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl SshTarget {
    /// Parses `server`, filling a missing user from `default_user`.
    pub fn parse_with_user(server: &str, default_user: Option<String>) -> Result<Self, ConnectError> {
        let invalid = || ConnectError::InvalidAddress(server.to_owned());

        let (user, host_port) = match server.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_owned()), rest),
            Some(_) => return Err(invalid()),
            None => (None, server),
        };

        let (host, port) = if let Some(bracketed) = host_port.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']').ok_or_else(invalid)?;
            let port = match rest.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if rest.is_empty() => DEFAULT_SSH_PORT,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match host_port.split_once(':') {
                Some((host, port)) if !port.contains(':') => {
                    (host, port.parse().map_err(|_| invalid())?)
                }
                // no port, or a bare IPv6 literal
                _ => (host_port, DEFAULT_SSH_PORT),
            }
        };
        if host.is_empty() {
            return Err(invalid());
        }

        let user = user
            .or(default_user)
            .filter(|user| !user.is_empty())
            .ok_or_else(|| ConnectError::Tunnel(format!("no ssh user given for {server}")))?;
        Ok(Self {
            user,
            host: host.to_owned(),
            port,
        })
    }
}

/// `$USER`, then `$USERNAME`.
pub fn default_user() -> Option<String> {
    std::env::var("USER")
        .ok()
        .or_else(|| std::env::var("USERNAME").ok())
}

impl FromStr for SshTarget {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_user(s, default_user())
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}@[{}]:{}", self.user, self.host, self.port)
        } else {
            write!(f, "{}@{}:{}", self.user, self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(server: &str) -> Result<SshTarget, ConnectError> {
        SshTarget::parse_with_user(server, Some("fallback".to_owned()))
    }

    #[test]
    fn full_form() {
        let target = parse("alice@gateway.example.org:2222").unwrap();
        assert_eq!(target.user, "alice");
        assert_eq!(target.host, "gateway.example.org");
        assert_eq!(target.port, 2222);
        assert_eq!(target.to_string(), "alice@gateway.example.org:2222");
    }

    #[test]
    fn user_and_port_default() {
        let target = parse("gateway").unwrap();
        assert_eq!(target.user, "fallback");
        assert_eq!(target.port, DEFAULT_SSH_PORT);
    }

    #[test]
    fn ipv6_hosts() {
        let target = parse("bob@[::1]:2200").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 2200);
        assert_eq!(target.to_string(), "bob@[::1]:2200");

        let target = parse("fe80::1").unwrap();
        assert_eq!(target.host, "fe80::1");
        assert_eq!(target.port, DEFAULT_SSH_PORT);
    }

    #[test]
    fn rejects_malformed_servers() {
        assert!(parse("").is_err());
        assert!(parse("@host").is_err());
        assert!(parse("host:notaport").is_err());
        assert!(parse("[::1").is_err());
        assert!(SshTarget::parse_with_user("host", None).is_err());
    }
}
