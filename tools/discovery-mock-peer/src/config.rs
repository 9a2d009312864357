//! Configuration of the mock peer.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

/// Static peer configuration (set at construction time).
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub bind_address: SocketAddr,
    pub read_timeout: Duration,
}

impl Default for PeerConfig {
    /// Binds to `127.0.0.1:0` (ephemeral port for testing).
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            read_timeout: Duration::from_millis(50),
        }
    }
}

impl PeerConfig {
    /// Set the bind address.
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the socket read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}
