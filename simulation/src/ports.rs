//! TCP port allocation for node listeners.
//!
//! Each probe binds a short-lived socket to an OS-assigned port with
//! `SO_REUSEADDR` set, reads the port back and closes the socket. Another
//! process may still grab the port before the node binds it; that race is
//! accepted and surfaces through the node's own startup error.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Mutex;

use tokio::net::TcpSocket;
use tracing::trace;

use crate::{SimulationError, SimulationResult};

/// Probes per allocation before giving up on finding an unissued port
const MAX_PROBES: usize = 64;

/// Hands out free ports, never issuing the same port twice
#[derive(Debug, Default)]
pub struct PortAllocator {
    issued: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate one free port not previously issued by this allocator
    pub fn allocate(&self) -> SimulationResult<u16> {
        for _ in 0..MAX_PROBES {
            let port = probe_free_port().map_err(SimulationError::PortAllocation)?;
            let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
            if issued.insert(port) {
                trace!(port, "allocated port");
                return Ok(port);
            }
            trace!(port, "probe returned an already issued port, retrying");
        }

        Err(SimulationError::PortAllocation(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("no unissued port found after {} probes", MAX_PROBES),
        )))
    }

    /// Number of ports handed out so far
    pub fn issued_count(&self) -> usize {
        self.issued.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn probe_free_port() -> io::Result<u16> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
    let port = socket.local_addr()?.port();
    drop(socket);
    Ok(port)
}
