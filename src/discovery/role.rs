//! The two discovery roles.
//!
//! Discoverers and listeners are generic over the role they look for or
//! advertise, so the tag and reply token each side uses are fixed at
//! construction instead of branched on at runtime.

use super::packet::{AckKind, QueryTag};

/// A role a process can advertise or look for on the discovery network.
pub trait Role: Send + Sync + 'static {
    /// Human-readable role name used in logs.
    const NAME: &'static str;

    /// Tag of queries looking for this role.
    const QUERY_TAG: QueryTag;

    /// Reply token this role answers with.
    const ACK_KIND: AckKind;
}

/// The central aggregation process.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrackingService;

/// A sensor-capture process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataSource;

impl Role for TrackingService {
    const NAME: &'static str = "tracking-service";
    const QUERY_TAG: QueryTag = QueryTag::LookingForTrackingService;
    const ACK_KIND: AckKind = AckKind::TrackingService;
}

impl Role for DataSource {
    const NAME: &'static str = "data-source";
    const QUERY_TAG: QueryTag = QueryTag::LookingForDataSource;
    const ACK_KIND: AckKind = AckKind::DataSource;
}
