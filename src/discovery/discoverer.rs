//! The querying side of the discovery protocol.
//!
//! A [`Discoverer`] binds a unicast reply socket, then periodically sends a
//! role-tagged query to the multicast group until its duration budget is
//! spent or it is stopped. Every distinct qualifying reply is reported once
//! as [`DiscoveryEvent::DeviceFound`]; an uncancelled run ends with exactly
//! one [`DiscoveryEvent::Completed`].

use std::collections::HashSet;
use std::io;
use std::marker::PhantomData;
use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use super::packet::{QueryPacket, ReplyPacket};
use super::role::Role;
use super::{DiscoveryEvent, EventSink};
use crate::net_utils;
use crate::types::DiscoverySettings;

/// Receive buffer size; replies are short text lines.
const RECV_BUFFER_LEN: usize = 1500;

type Subscription = Arc<Mutex<Option<EventSink>>>;

/// Sends queries looking for role `R` and collects its replies.
pub struct Discoverer<R: Role> {
    settings: DiscoverySettings,
    subscription: Subscription,
    running: Arc<AtomicBool>,
    queries_sent: Arc<AtomicUsize>,
    cancel_tx: Option<Sender<()>>,
    reply_port: Option<u16>,
    threads: Vec<JoinHandle<()>>,
    _role: PhantomData<R>,
}

impl<R: Role> Discoverer<R> {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            settings,
            subscription: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            queries_sent: Arc::new(AtomicUsize::new(0)),
            cancel_tx: None,
            reply_port: None,
            threads: Vec::new(),
            _role: PhantomData,
        }
    }

    /// Start the discovery run, delivering events to `on_event`.
    ///
    /// Returns the bound reply port. A discoverer runs once; starting it a
    /// second time is an error.
    pub fn start<F>(&mut self, on_event: F) -> io::Result<u16>
    where
        F: Fn(DiscoveryEvent) + Send + Sync + 'static,
    {
        if self.reply_port.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "discoverer already started",
            ));
        }

        let socket = net_utils::bind_reusable(
            self.settings.local_address,
            self.settings.local_port,
            Some(self.settings.receive_timeout),
        )?;
        let reply_port = socket.local_addr()?.port();

        let sink: EventSink = Arc::new(on_event);
        *lock(&self.subscription) = Some(sink);
        self.running.store(true, Ordering::SeqCst);
        self.reply_port = Some(reply_port);

        let (cancel_tx, cancel_rx) = crossbeam_channel::bounded::<()>(1);
        self.cancel_tx = Some(cancel_tx);

        info!(
            "discovery: looking for {} via {}:{} (replies on port {})",
            R::NAME,
            self.settings.multicast_address,
            self.settings.multicast_port,
            reply_port
        );

        let receiver = ReplyReceiver::<R> {
            socket,
            subscription: Arc::clone(&self.subscription),
            running: Arc::clone(&self.running),
            log_loopback: self.settings.log_loopback,
            _role: PhantomData,
        };
        self.threads.push(
            thread::Builder::new()
                .name(format!("discovery-rx-{}", R::NAME))
                .spawn(move || receiver.run())?,
        );

        let poller = QueryPoller {
            settings: self.settings.clone(),
            query: QueryPacket::new(R::QUERY_TAG, reply_port),
            subscription: Arc::clone(&self.subscription),
            running: Arc::clone(&self.running),
            queries_sent: Arc::clone(&self.queries_sent),
            cancel_rx,
        };
        self.threads.push(
            thread::Builder::new()
                .name(format!("discovery-poll-{}", R::NAME))
                .spawn(move || poller.run())?,
        );

        Ok(reply_port)
    }

    /// Unsubscribe and cancel the run.
    ///
    /// Never blocks, so it may be called from inside an event callback. No
    /// `Completed` event follows a stop. Worker threads exit at their next
    /// suspension point; use [`join`](Self::join) to wait for them.
    pub fn stop(&mut self) {
        *lock(&self.subscription) = None;
        self.running.store(false, Ordering::SeqCst);
        // Dropping the sender wakes the poll loop with a disconnect.
        self.cancel_tx = None;
    }

    /// Wait for the worker threads to exit.
    pub fn join(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }

    /// Whether the run is still in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound reply port, once started.
    pub fn reply_port(&self) -> Option<u16> {
        self.reply_port
    }

    /// Number of query packets sent so far.
    pub fn queries_sent(&self) -> usize {
        self.queries_sent.load(Ordering::SeqCst)
    }

    pub fn settings(&self) -> &DiscoverySettings {
        &self.settings
    }
}

impl<R: Role> Drop for Discoverer<R> {
    fn drop(&mut self) {
        // Threads are detached rather than joined: the last owner may be
        // dropping us from one of those threads.
        self.stop();
    }
}

fn lock(subscription: &Subscription) -> std::sync::MutexGuard<'_, Option<EventSink>> {
    subscription.lock().unwrap_or_else(|e| e.into_inner())
}

fn emit(subscription: &Subscription, event: DiscoveryEvent) -> bool {
    // Clone out of the lock so a callback can stop the discoverer.
    let sink = lock(subscription).clone();
    match sink {
        Some(sink) => {
            sink(event);
            true
        }
        None => false,
    }
}

/// Timed query loop.
struct QueryPoller {
    settings: DiscoverySettings,
    query: QueryPacket,
    subscription: Subscription,
    running: Arc<AtomicBool>,
    queries_sent: Arc<AtomicUsize>,
    cancel_rx: Receiver<()>,
}

impl QueryPoller {
    fn run(self) {
        let deadline = Instant::now() + self.settings.duration;
        let target = SocketAddrV4::new(
            self.settings.multicast_address,
            self.settings.multicast_port,
        );
        let packet = self.query.to_bytes();

        loop {
            match send_query(&packet, target) {
                Ok(()) => {
                    self.queries_sent.fetch_add(1, Ordering::SeqCst);
                    debug!("discovery: sent {} query to {}", self.query.tag, target);
                }
                Err(e) => warn!("discovery: failed to send query to {}: {}", target, e),
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self
                .cancel_rx
                .recv_timeout(self.settings.polling_interval.min(remaining))
            {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    debug!("discovery: cancelled");
                    return;
                }
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        // A stop racing the deadline wins: no completion after cancellation.
        if self.running.swap(false, Ordering::SeqCst) {
            info!("discovery: duration budget spent");
            emit(&self.subscription, DiscoveryEvent::Completed);
        }
    }
}

/// Send one query through a socket that lives only for this send.
fn send_query(packet: &[u8], target: SocketAddrV4) -> io::Result<()> {
    let socket = net_utils::multicast_sender()?;
    socket.send_to(packet, target)?;
    Ok(())
}

/// Reply socket loop.
struct ReplyReceiver<R: Role> {
    socket: UdpSocket,
    subscription: Subscription,
    running: Arc<AtomicBool>,
    log_loopback: bool,
    _role: PhantomData<R>,
}

impl<R: Role> ReplyReceiver<R> {
    fn run(self) {
        let mut buf = [0u8; RECV_BUFFER_LEN];
        let mut seen: HashSet<String> = HashSet::new();

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
                    warn!("discovery: receive failed: {}", e);
                    continue;
                }
            };

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.handle_packet(&buf[..len], src, &mut seen);
        }
    }

    fn handle_packet(&self, data: &[u8], src: SocketAddr, seen: &mut HashSet<String>) {
        match ReplyPacket::parse(data) {
            Ok(ReplyPacket::Ack { kind, device }) if kind == R::ACK_KIND => {
                if !seen.insert(device.id.clone()) {
                    return;
                }
                info!("discovery: found {} {} from {}", R::NAME, device, src);
                emit(&self.subscription, DiscoveryEvent::DeviceFound(device));
            }
            Ok(ReplyPacket::Ack { kind, device }) => {
                if self.log_loopback {
                    debug!(
                        "discovery: dropping {} reply for {} from {}",
                        kind.token(),
                        device.id,
                        src
                    );
                }
            }
            Ok(ReplyPacket::Nak) => info!("discovery: NAK from {}", src),
            Err(e) => {
                if self.log_loopback {
                    debug!("discovery: dropping packet from {}: {}", src, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::role::{DataSource, TrackingService};
    use std::net::Ipv4Addr;
    use std::sync::mpsc;
    use std::time::Duration;

    fn loopback_settings(target_port: u16) -> DiscoverySettings {
        DiscoverySettings::default()
            .with_local(Ipv4Addr::LOCALHOST, 0)
            .with_multicast(Ipv4Addr::LOCALHOST, target_port)
            .with_polling_interval(Duration::from_millis(100))
            .with_duration(Duration::from_millis(350))
            .with_receive_timeout(Duration::from_millis(50))
    }

    #[test]
    fn test_completes_once_without_replies() {
        let sink_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sink_socket.local_addr().unwrap().port();

        let (tx, rx) = mpsc::channel();
        let mut discoverer = Discoverer::<TrackingService>::new(loopback_settings(port));
        let started = Instant::now();
        discoverer
            .start(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();

        let event = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, DiscoveryEvent::Completed);
        assert!(started.elapsed() >= Duration::from_millis(350));
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        // ceil(350 / 100) queries, +-1 for scheduling
        let sent = discoverer.queries_sent();
        assert!((3..=5).contains(&sent), "sent {} queries", sent);
        assert!(!discoverer.is_running());
        discoverer.join();
    }

    #[test]
    fn test_query_carries_reply_port() {
        let sink_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        sink_socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let port = sink_socket.local_addr().unwrap().port();

        let mut discoverer = Discoverer::<DataSource>::new(loopback_settings(port));
        let reply_port = discoverer.start(|_| {}).unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = sink_socket.recv_from(&mut buf).unwrap();
        let query = QueryPacket::parse(&buf[..len]).unwrap();
        assert_eq!(query.tag, DataSource::QUERY_TAG);
        assert_eq!(query.valid_reply_port(), Some(reply_port));
        discoverer.stop();
    }

    #[test]
    fn test_stop_suppresses_completion() {
        let sink_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sink_socket.local_addr().unwrap().port();

        let (tx, rx) = mpsc::channel();
        let mut discoverer = Discoverer::<TrackingService>::new(loopback_settings(port));
        discoverer
            .start(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();
        discoverer.stop();
        discoverer.join();

        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut discoverer = Discoverer::<TrackingService>::new(loopback_settings(9));
        discoverer.start(|_| {}).unwrap();
        let err = discoverer.start(|_| {}).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_replies_filtered_by_role_and_deduplicated() {
        let sink_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = sink_socket.local_addr().unwrap().port();

        let (tx, rx) = mpsc::channel();
        let settings = loopback_settings(port).with_duration(Duration::from_millis(600));
        let mut discoverer = Discoverer::<TrackingService>::new(settings);
        let reply_port = discoverer
            .start(move |event| {
                let _ = tx.send(event);
            })
            .unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, reply_port));
        for line in [
            "ACKDS ds1 127.0.0.1 1 127.0.0.1 2 N/A",
            "NAK",
            "ACK ts1 10.0.0.5 9000 10.0.0.5 9001 N/A",
            "ACK ts1 10.0.0.5 9000 10.0.0.5 9001 N/A",
        ] {
            peer.send_to(line.as_bytes(), target).unwrap();
        }

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let DiscoveryEvent::DeviceFound(device) = first else {
            panic!("expected DeviceFound, got {:?}", first);
        };
        assert_eq!(device.id, "ts1");

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            DiscoveryEvent::Completed
        );
        discoverer.join();
    }
}
