use std::collections::HashSet;

use kconnect_protocol::ConnectResult;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::allocate_free_port;

/// Ports claimed by kernels of this process.
///
/// Construct one per process and share it (`Arc<LocalPortCache>`) with every
/// connection that allocates local ports.
#[derive(Debug, Default)]
pub struct LocalPortCache {
    currently_used: Mutex<HashSet<u16>>,
}

impl LocalPortCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates ports until one not already claimed comes back, then claims it.
    pub fn find_available_port(&self, ip: &str) -> ConnectResult<u16> {
        loop {
            let port = allocate_free_port(ip)?;
            if self.currently_used.lock().insert(port) {
                debug!(port, ip, "claimed local port");
                return Ok(port);
            }
            trace!(port, "port already claimed, retrying");
        }
    }

    /// Releases a claimed port. Ports this cache never handed out are ignored.
    pub fn return_port(&self, port: u16) {
        if self.currently_used.lock().remove(&port) {
            debug!(port, "returned local port");
        }
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.currently_used.lock().contains(&port)
    }

    pub fn claimed_count(&self) -> usize {
        self.currently_used.lock().len()
    }
}
