//! The answering side of the discovery protocol.

use std::io;
use std::marker::PhantomData;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use super::packet::{compose_ack, QueryPacket};
use super::role::Role;
use crate::net_utils;
use crate::types::{DiscoverySettings, LocalIdentity};

/// Advertises role `R` by answering matching queries on the multicast group.
///
/// Queries for the complementary role are this host's own discoverer
/// traffic (or a peer of the same role looking elsewhere) and are dropped.
pub struct Listener<R: Role> {
    settings: DiscoverySettings,
    identity: LocalIdentity,
    running: Arc<AtomicBool>,
    replies_sent: Arc<AtomicUsize>,
    local_addr: Option<SocketAddr>,
    handle: Option<JoinHandle<()>>,
    _role: PhantomData<R>,
}

impl<R: Role> Listener<R> {
    pub fn new(settings: DiscoverySettings, identity: LocalIdentity) -> Self {
        Self {
            settings,
            identity,
            running: Arc::new(AtomicBool::new(false)),
            replies_sent: Arc::new(AtomicUsize::new(0)),
            local_addr: None,
            handle: None,
            _role: PhantomData,
        }
    }

    /// Bind the query socket and start answering.
    ///
    /// Returns the bound address. When the configured target is a multicast
    /// group the socket binds the wildcard address and joins the group on
    /// every interface; otherwise it binds the target address directly.
    pub fn start(&mut self) -> io::Result<SocketAddr> {
        if self.handle.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "listener already started",
            ));
        }

        let socket = if self.settings.is_multicast() {
            let socket = net_utils::bind_reusable(
                Ipv4Addr::UNSPECIFIED,
                self.settings.multicast_port,
                Some(self.settings.receive_timeout),
            )?;
            let joined = net_utils::join_multicast_all(&socket, self.settings.multicast_address)?;
            debug!(
                "listener: joined {} on {} interface(s)",
                self.settings.multicast_address, joined
            );
            socket
        } else {
            net_utils::bind_reusable(
                self.settings.multicast_address,
                self.settings.multicast_port,
                Some(self.settings.receive_timeout),
            )?
        };
        let local_addr = socket.local_addr()?;

        let identity = resolve_identity(&self.identity);
        info!(
            "listener: advertising {} {} on {}",
            R::NAME,
            identity.id,
            local_addr
        );

        self.running.store(true, Ordering::SeqCst);
        let responder = Responder::<R> {
            socket,
            reply_line: compose_ack(R::ACK_KIND, &identity),
            reply_from: (self.settings.local_address, self.settings.local_port),
            log_loopback: self.settings.log_loopback,
            running: Arc::clone(&self.running),
            replies_sent: Arc::clone(&self.replies_sent),
            _role: PhantomData,
        };
        self.handle = Some(
            thread::Builder::new()
                .name(format!("listener-{}", R::NAME))
                .spawn(move || responder.run())?,
        );
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop answering and wait for the worker to exit.
    ///
    /// The worker notices within one receive timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of replies sent so far.
    pub fn replies_sent(&self) -> usize {
        self.replies_sent.load(Ordering::SeqCst)
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }
}

impl<R: Role> Drop for Listener<R> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fill empty endpoints with the host's primary address.
fn resolve_identity(identity: &LocalIdentity) -> LocalIdentity {
    let mut resolved = identity.clone();
    if resolved.data_streamer_endpoint.is_empty() || resolved.control_api_endpoint.is_empty() {
        let host = net_utils::primary_ipv4().to_string();
        if resolved.data_streamer_endpoint.is_empty() {
            resolved.data_streamer_endpoint = host.clone();
        }
        if resolved.control_api_endpoint.is_empty() {
            resolved.control_api_endpoint = host;
        }
    }
    resolved
}

struct Responder<R: Role> {
    socket: UdpSocket,
    reply_line: String,
    reply_from: (Ipv4Addr, u16),
    log_loopback: bool,
    running: Arc<AtomicBool>,
    replies_sent: Arc<AtomicUsize>,
    _role: PhantomData<R>,
}

impl<R: Role> Responder<R> {
    fn run(self) {
        let mut buf = [0u8; 64];

        while self.running.load(Ordering::SeqCst) {
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(result) => result,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!("listener: receive failed: {}", e);
                    continue;
                }
            };

            let query = match QueryPacket::parse(&buf[..len]) {
                Ok(query) => query,
                Err(e) => {
                    if self.log_loopback {
                        debug!("listener: dropping packet from {}: {}", src, e);
                    }
                    continue;
                }
            };

            if query.tag != R::QUERY_TAG {
                if self.log_loopback {
                    debug!("listener: loopback {} query from {}", query.tag, src);
                }
                continue;
            }

            let Some(port) = query.valid_reply_port() else {
                debug!(
                    "listener: query from {} carries unusable reply port {}",
                    src, query.reply_port
                );
                continue;
            };
            let SocketAddr::V4(src) = src else {
                continue;
            };
            let target = SocketAddrV4::new(*src.ip(), port);

            match self.reply(target) {
                Ok(()) => {
                    self.replies_sent.fetch_add(1, Ordering::SeqCst);
                    debug!("listener: answered {} query from {}", R::NAME, target);
                }
                Err(e) => warn!("listener: failed to reply to {}: {}", target, e),
            }
        }

        debug!("listener: {} stopped", R::NAME);
    }

    /// Send the reply line through a socket that lives only for this reply.
    fn reply(&self, target: SocketAddrV4) -> io::Result<()> {
        let (address, port) = self.reply_from;
        let socket = match net_utils::bind_reusable(address, port, None) {
            Ok(socket) => socket,
            Err(e) if port != 0 => {
                debug!(
                    "listener: local port {} unavailable ({}), replying from an ephemeral port",
                    port, e
                );
                net_utils::bind_reusable(address, 0, None)?
            }
            Err(e) => return Err(e),
        };
        socket.send_to(self.reply_line.as_bytes(), target)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::packet::{QueryTag, ReplyPacket};
    use crate::discovery::role::{DataSource, TrackingService};
    use std::time::Duration;

    fn loopback_settings() -> DiscoverySettings {
        DiscoverySettings::default()
            .with_local(Ipv4Addr::LOCALHOST, 0)
            .with_multicast(Ipv4Addr::LOCALHOST, 0)
            .with_receive_timeout(Duration::from_millis(50))
    }

    fn requester() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[test]
    fn test_answers_matching_query_at_embedded_port() {
        let identity = LocalIdentity::new("ts1", 9000, 9001).with_endpoint("10.0.0.5");
        let mut listener = Listener::<TrackingService>::new(loopback_settings(), identity);
        let addr = listener.start().unwrap();

        let (socket, reply_port) = requester();
        let query = QueryPacket::new(QueryTag::LookingForTrackingService, reply_port);
        socket.send_to(&query.to_bytes(), addr).unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..len]).unwrap(),
            "ACK ts1 10.0.0.5 9000 10.0.0.5 9001 N/A"
        );
        assert!(matches!(
            ReplyPacket::parse(&buf[..len]).unwrap(),
            ReplyPacket::Ack { .. }
        ));
        assert_eq!(listener.replies_sent(), 1);
    }

    #[test]
    fn test_ignores_complementary_role() {
        let identity = LocalIdentity::new("ds1", 9100, 9101);
        let settings = loopback_settings().with_log_loopback(true);
        let mut listener = Listener::<DataSource>::new(settings, identity);
        let addr = listener.start().unwrap();

        let (socket, reply_port) = requester();
        let query = QueryPacket::new(QueryTag::LookingForTrackingService, reply_port);
        socket.send_to(&query.to_bytes(), addr).unwrap();
        socket.send_to(b"junk", addr).unwrap();

        let mut buf = [0u8; 256];
        assert!(socket.recv_from(&mut buf).is_err());
        assert_eq!(listener.replies_sent(), 0);
    }

    #[test]
    fn test_empty_endpoint_resolves_to_host_address() {
        let resolved = resolve_identity(&LocalIdentity::new("ds1", 1, 2));
        assert!(!resolved.data_streamer_endpoint.is_empty());
        assert_eq!(resolved.data_streamer_endpoint, resolved.control_api_endpoint);

        let explicit = LocalIdentity::new("ds1", 1, 2).with_endpoint("192.168.0.7");
        assert_eq!(resolve_identity(&explicit), explicit);
    }

    #[test]
    fn test_stop_joins_worker() {
        let mut listener =
            Listener::<DataSource>::new(loopback_settings(), LocalIdentity::new("ds1", 1, 2));
        listener.start().unwrap();
        assert!(listener.is_running());
        listener.stop();
        assert!(!listener.is_running());
    }
}
