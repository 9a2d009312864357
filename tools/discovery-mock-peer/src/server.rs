//! Core mock discovery peer.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::behavior::PeerBehavior;
use crate::config::PeerConfig;
use crate::packet_builder::{build_query, parse_query};

/// A mock discovery peer with pluggable behavior.
pub struct MockDiscoveryPeer<B: PeerBehavior> {
    socket: UdpSocket,
    addr: SocketAddr,
    behavior: B,
    running: Arc<AtomicBool>,
}

impl<B: PeerBehavior> MockDiscoveryPeer<B> {
    /// Create a new mock peer with the given configuration and behavior.
    pub fn new(config: PeerConfig, behavior: B) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind_address)?;
        socket.set_read_timeout(Some(config.read_timeout))?;
        let addr = socket.local_addr()?;

        log::info!("Mock discovery peer listening on {}", addr);

        Ok(Self {
            socket,
            addr,
            behavior,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The address queries should be sent to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the peer in a background thread and return a handle.
    pub fn spawn(self) -> PeerHandle {
        let addr = self.addr;
        let running = Arc::clone(&self.running);

        let handle = thread::spawn(move || {
            self.run();
        });

        PeerHandle {
            addr,
            running,
            handle: Some(handle),
        }
    }

    /// Run the peer loop (blocking).
    pub fn run(mut self) {
        let mut buf = [0u8; 1024];

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
                    log::error!("Socket error: {}", e);
                    break;
                }
            };

            self.behavior.on_packet_received(&buf[..len], src);

            let Some(query) = parse_query(&buf[..len], src) else {
                log::trace!("Ignoring {} byte packet from {}", len, src);
                continue;
            };
            let Some(reply_addr) = query.reply_addr() else {
                log::debug!("Query from {} has reply port {}", src, query.reply_port);
                continue;
            };

            let latency = self.behavior.get_simulated_latency();
            if !latency.is_zero() {
                thread::sleep(latency);
            }

            for line in self.behavior.replies(&query) {
                log::debug!("Answering {} with {:?}", reply_addr, line);
                if let Err(e) = self.socket.send_to(line.as_bytes(), reply_addr) {
                    log::warn!("Reply to {} failed: {}", reply_addr, e);
                }
            }
        }

        log::info!("Mock discovery peer stopped");
    }
}

/// Handle for controlling a spawned peer.
pub struct PeerHandle {
    /// The peer's local address.
    pub addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PeerHandle {
    /// Stop the peer.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

/// Play the querying side: send one query to `target` and collect every
/// reply line that arrives within `wait`.
pub fn send_query(target: SocketAddr, tag: [u8; 3], wait: Duration) -> io::Result<Vec<String>> {
    let socket = UdpSocket::bind("127.0.0.1:0")?;
    let reply_port = socket.local_addr()?.port();
    socket.send_to(&build_query(tag, i32::from(reply_port)), target)?;

    let deadline = Instant::now() + wait;
    let mut lines = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        socket.set_read_timeout(Some(remaining))?;
        match socket.recv_from(&mut buf) {
            Ok((len, _)) => lines.push(String::from_utf8_lossy(&buf[..len]).into_owned()),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                break
            }
            Err(e) => return Err(e),
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::ScriptedBehavior;
    use crate::constants::{TAG_DS, TAG_TS};

    #[test]
    fn test_scripted_answers_by_tag() {
        let behavior = ScriptedBehavior::new()
            .answer(TAG_TS, "ACK ts1 127.0.0.1 1 127.0.0.1 2 N/A")
            .answer(TAG_TS, "NAK");
        let capture = behavior.capture();
        let peer = MockDiscoveryPeer::new(PeerConfig::default(), behavior).unwrap();
        let handle = peer.spawn();

        let lines = send_query(handle.addr, TAG_TS, Duration::from_millis(300)).unwrap();
        assert_eq!(lines, ["ACK ts1 127.0.0.1 1 127.0.0.1 2 N/A", "NAK"]);

        let lines = send_query(handle.addr, TAG_DS, Duration::from_millis(200)).unwrap();
        assert!(lines.is_empty());
        assert_eq!(capture.len(), 2);
    }

    #[test]
    fn test_silent_flag_mutes_answers() {
        let behavior = ScriptedBehavior::new().answer(TAG_DS, "ACKDS ds1 h 1 h 2 N/A");
        let silent = behavior.silent_flag();
        let handle = MockDiscoveryPeer::new(PeerConfig::default(), behavior)
            .unwrap()
            .spawn();

        silent.store(true, Ordering::SeqCst);
        let lines = send_query(handle.addr, TAG_DS, Duration::from_millis(200)).unwrap();
        assert!(lines.is_empty());
    }
}
