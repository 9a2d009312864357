//! Behavior trait for customizing mock peer replies.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::packet_builder::Query;

/// Behavior hooks for customizing mock peer replies.
pub trait PeerBehavior: Send + 'static {
    /// Called for every datagram, well-formed or not.
    fn on_packet_received(&mut self, _raw_data: &[u8], _src: SocketAddr) {}

    /// Reply lines for a well-formed query, each sent as its own datagram.
    ///
    /// Return an empty list to stay silent.
    fn replies(&mut self, query: &Query) -> Vec<String>;

    /// Delay applied before a query is answered.
    fn get_simulated_latency(&self) -> Duration {
        Duration::ZERO
    }
}

/// Packets recorded by a [`ScriptedBehavior`], shared with the test.
#[derive(Clone, Default)]
pub struct Capture {
    packets: Arc<Mutex<Vec<(Vec<u8>, SocketAddr)>>>,
}

impl Capture {
    fn push(&self, raw: &[u8], src: SocketAddr) {
        self.packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((raw.to_vec(), src));
    }

    /// Every packet received so far.
    pub fn packets(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.packets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers each query tag with a fixed list of lines.
///
/// - Unscripted tags get no answer
/// - Every packet is recorded in [`ScriptedBehavior::capture`]
/// - The shared `silent` flag mutes all answers while set
#[derive(Default)]
pub struct ScriptedBehavior {
    answers: HashMap<[u8; 3], Vec<String>>,
    capture: Capture,
    silent: Arc<AtomicBool>,
    latency: Duration,
}

impl ScriptedBehavior {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reply line for `tag`.
    pub fn answer(mut self, tag: [u8; 3], line: impl Into<String>) -> Self {
        self.answers.entry(tag).or_default().push(line.into());
        self
    }

    /// Set the delay before each answer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Handle on the recorded packets.
    pub fn capture(&self) -> Capture {
        self.capture.clone()
    }

    /// Flag muting every answer while set.
    pub fn silent_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.silent)
    }
}

impl PeerBehavior for ScriptedBehavior {
    fn on_packet_received(&mut self, raw_data: &[u8], src: SocketAddr) {
        self.capture.push(raw_data, src);
    }

    fn replies(&mut self, query: &Query) -> Vec<String> {
        if self.silent.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.answers.get(&query.tag).cloned().unwrap_or_default()
    }

    fn get_simulated_latency(&self) -> Duration {
        self.latency
    }
}
