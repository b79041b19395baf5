//! Ephemeral port allocation.
//!
//! Ports are obtained by binding a transient socket to port zero, reading
//! back what the OS picked, and closing the socket with lingering disabled.
//! Between that close and the kernel binding the port for real, another
//! allocation could be handed the same number; [`LocalPortCache`] closes
//! that window for allocations made inside this process. Collisions with
//! other processes remain possible.

mod cache;

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use kconnect_protocol::{ConnectError, ConnectResult, LOCALHOST};
use socket2::{Domain, Protocol, Socket, Type};

pub use cache::LocalPortCache;

/// Resolves `ip` (literal or host name, empty meaning loopback) to a
/// port-zero bind address.
pub fn resolve_bind_addr(ip: &str) -> ConnectResult<SocketAddr> {
    let ip = if ip.is_empty() { LOCALHOST } else { ip };
    if let Ok(addr) = ip.parse::<IpAddr>() {
        return Ok(SocketAddr::new(addr, 0));
    }
    (ip, 0)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ConnectError::InvalidAddress(ip.to_owned()))
}

/// Binds a socket to `(ip, 0)` with lingering disabled. The port stays
/// reserved until the socket is dropped.
pub fn bind_transient(ip: &str) -> ConnectResult<Socket> {
    let addr = resolve_bind_addr(ip)?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_linger(Some(Duration::ZERO))?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn bound_port(socket: &Socket) -> ConnectResult<u16> {
    socket
        .local_addr()?
        .as_socket()
        .map(|addr| addr.port())
        .ok_or_else(|| ConnectError::InvalidState("bound socket has no inet address".to_owned()))
}

/// Returns a port the OS considered free at the time of the call.
pub fn allocate_free_port(ip: &str) -> ConnectResult<u16> {
    let socket = bind_transient(ip)?;
    bound_port(&socket)
}

/// Returns `count` pairwise-distinct free ports. All sockets are held open
/// until every port has been read, so the OS cannot repeat itself.
pub fn select_random_ports(ip: &str, count: usize) -> ConnectResult<Vec<u16>> {
    let sockets = (0..count)
        .map(|_| bind_transient(ip))
        .collect::<ConnectResult<Vec<_>>>()?;
    sockets.iter().map(bound_port).collect()
}

/// Loopback and unspecified addresses are local; anything else is local
/// only if a socket can be bound to it.
pub fn is_local_ip(ip: &str) -> bool {
    let Ok(addr) = resolve_bind_addr(ip) else {
        return false;
    };
    let addr = addr.ip();
    if addr.is_loopback() || addr.is_unspecified() {
        return true;
    }
    bind_transient(&addr.to_string()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_positive_port_on_loopback() -> anyhow::Result<()> {
        let port = allocate_free_port(LOCALHOST)?;
        assert!(port > 0);
        Ok(())
    }

    #[test]
    fn empty_ip_means_loopback() -> anyhow::Result<()> {
        let addr = resolve_bind_addr("")?;
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 0);
        Ok(())
    }

    #[test]
    fn random_port_batches_are_distinct() -> anyhow::Result<()> {
        for _ in 0..64 {
            let ports = select_random_ports(LOCALHOST, 10)?;
            assert_eq!(ports.len(), 10);
            for port in &ports {
                assert_eq!(ports.iter().filter(|p| *p == port).count(), 1);
            }
        }
        Ok(())
    }

    #[test]
    fn local_ip_detection() {
        assert!(is_local_ip("127.0.0.1"));
        assert!(is_local_ip("0.0.0.0"));
        assert!(is_local_ip("localhost"));
        // TEST-NET-1, never assigned to a local interface
        assert!(!is_local_ip("192.0.2.1"));
    }
}
