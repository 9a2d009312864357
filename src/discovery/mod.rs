//! Zero-configuration discovery between Data Sources and Tracking Services.
//!
//! Every participant listens on a shared multicast group for queries looking
//! for its own role, and sends role-tagged queries when it looks for the
//! other one. Replies travel back by unicast to the port embedded in the
//! query.
//!
//! - [`packet`]: query and reply wire formats
//! - [`Discoverer`]: sends queries and collects replies for one role
//! - [`Listener`]: answers queries for one role
//! - [`TrackingServiceSeeker`] / [`DataSourceSeeker`]: drive one run to a result

mod coordinator;
mod discoverer;
mod listener;
pub mod packet;
mod role;

use std::sync::Arc;

use crate::types::DeviceInfo;

pub use coordinator::{
    find_data_sources, find_tracking_service, CoordinatorEvent, CoordinatorSink,
    DataSourceSeeker, DiscoveryCoordinator, TrackingServiceSeeker,
};
pub use discoverer::Discoverer;
pub use listener::Listener;
pub use packet::{AckKind, PacketError, QueryPacket, QueryTag, ReplyPacket};
pub use role::{DataSource, Role, TrackingService};

/// Event raised by a [`Discoverer`].
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A distinct device of the sought role answered.
    DeviceFound(DeviceInfo),
    /// The duration budget was spent without cancellation.
    Completed,
}

/// Callback receiving discoverer events.
pub type EventSink = Arc<dyn Fn(DiscoveryEvent) + Send + Sync>;

/// Listener run by a Tracking Service process.
pub type TrackingServiceListener = Listener<TrackingService>;

/// Listener run by a Data Source process.
pub type DataSourceListener = Listener<DataSource>;
