//! Mock discovery peer for testing.
//!
//! Answers role-tagged discovery queries with scripted reply lines, records
//! every packet it sees, and can play the querying side against a real
//! listener. Customized via the [`PeerBehavior`] trait.
//!
//! The crate speaks the wire format on its own, without depending on the
//! library under test, so the end-to-end tests check the format rather than
//! round-trip it.
//!
//! # Example
//!
//! ```ignore
//! use discovery_mock_peer::{MockDiscoveryPeer, PeerConfig, ScriptedBehavior, TAG_TS};
//!
//! let behavior = ScriptedBehavior::new()
//!     .answer(TAG_TS, "ACK ts1 127.0.0.1 9000 127.0.0.1 9001 N/A");
//! let peer = MockDiscoveryPeer::new(PeerConfig::default(), behavior)?;
//! let handle = peer.spawn();
//! ```

mod behavior;
mod config;
mod constants;
mod packet_builder;
mod server;

pub use behavior::{Capture, PeerBehavior, ScriptedBehavior};
pub use config::PeerConfig;
pub use constants::*;
pub use packet_builder::*;
pub use server::{send_query, MockDiscoveryPeer, PeerHandle};
