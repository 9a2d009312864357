//! Shared value types for discovery and service coordination.
//!
//! Provides the device record produced by discovery, the settings a
//! discovery session is started with, and the identity a listener advertises.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};

/// Default multicast group shared by every discovery participant.
pub const DEFAULT_MULTICAST_ADDRESS: Ipv4Addr = Ipv4Addr::new(224, 242, 42, 0);

/// Default multicast port.
pub const DEFAULT_MULTICAST_PORT: u16 = 18500;

/// Default local port of a Tracking Service (reply listener and reply sender).
pub const TRACKING_SERVICE_LOCAL_PORT: u16 = 18501;

/// Default local port of a Data Source (reply listener and reply sender).
pub const DATA_SOURCE_LOCAL_PORT: u16 = 18502;

/// A peer found by discovery.
///
/// Created when a valid reply packet is parsed. The `id` is unique within the
/// result set of one discovery session (first occurrence wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Peer identifier advertised in the reply.
    pub id: String,
    /// License identifier advertised in the reply (`N/A` when unlicensed).
    pub license_id: String,
    /// Host of the data-plane streamer.
    pub data_streamer_endpoint: String,
    /// Port of the data-plane streamer.
    pub data_streamer_port: u16,
    /// Host of the control API.
    pub control_api_endpoint: String,
    /// Port of the control API.
    pub control_api_port: u16,
    /// When the reply was first parsed.
    pub first_seen: SystemTime,
    /// Last successful reachability probe.
    #[serde(default)]
    pub last_seen: Option<SystemTime>,
    /// Result of the last reachability probe.
    #[serde(default)]
    pub is_reachable: bool,
}

impl DeviceInfo {
    /// Creates a device record first seen now.
    pub fn new(
        id: impl Into<String>,
        license_id: impl Into<String>,
        data_streamer: (impl Into<String>, u16),
        control_api: (impl Into<String>, u16),
    ) -> Self {
        Self {
            id: id.into(),
            license_id: license_id.into(),
            data_streamer_endpoint: data_streamer.0.into(),
            data_streamer_port: data_streamer.1,
            control_api_endpoint: control_api.0.into(),
            control_api_port: control_api.1,
            first_seen: SystemTime::now(),
            last_seen: None,
            is_reachable: false,
        }
    }

    /// Base URL of the control API (`http://host:port`).
    pub fn control_api_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.control_api_endpoint, self.control_api_port
        )
    }

    /// Records the outcome of a reachability probe.
    pub fn mark_probe(&mut self, reachable: bool) {
        self.is_reachable = reachable;
        if reachable {
            self.last_seen = Some(SystemTime::now());
        }
    }

    /// Compares the advertised fields, ignoring timestamps and reachability.
    pub fn same_peer(&self, other: &DeviceInfo) -> bool {
        self.id == other.id
            && self.license_id == other.license_id
            && self.data_streamer_endpoint == other.data_streamer_endpoint
            && self.data_streamer_port == other.data_streamer_port
            && self.control_api_endpoint == other.control_api_endpoint
            && self.control_api_port == other.control_api_port
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (data {}:{}, control {}:{})",
            self.id,
            self.data_streamer_endpoint,
            self.data_streamer_port,
            self.control_api_endpoint,
            self.control_api_port
        )
    }
}

/// Identity a listener advertises in its replies.
///
/// Empty endpoints are replaced with the first non-loopback IPv4 address of
/// the host when the reply is composed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub id: String,
    #[serde(default = "default_license_id")]
    pub license_id: String,
    #[serde(default)]
    pub data_streamer_endpoint: String,
    pub data_streamer_port: u16,
    #[serde(default)]
    pub control_api_endpoint: String,
    pub control_api_port: u16,
}

fn default_license_id() -> String {
    "N/A".to_string()
}

impl LocalIdentity {
    /// Creates an identity advertising the host's own address.
    pub fn new(id: impl Into<String>, data_streamer_port: u16, control_api_port: u16) -> Self {
        Self {
            id: id.into(),
            license_id: default_license_id(),
            data_streamer_endpoint: String::new(),
            data_streamer_port,
            control_api_endpoint: String::new(),
            control_api_port,
        }
    }

    /// Set the license identifier (builder pattern).
    pub fn with_license_id(mut self, license_id: impl Into<String>) -> Self {
        self.license_id = license_id.into();
        self
    }

    /// Set an explicit host for both advertised endpoints (builder pattern).
    pub fn with_endpoint(mut self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.data_streamer_endpoint = host.clone();
        self.control_api_endpoint = host;
        self
    }
}

/// Settings for one discovery transport or coordinator run.
///
/// Immutable once a session starts. `multicast_address` may be any IPv4
/// address; the group is only joined when it is a multicast address, which
/// lets tests aim a discoverer at a listener on loopback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverySettings {
    /// Local address sockets bind to.
    pub local_address: Ipv4Addr,
    /// Local port: reply-listener port of a discoverer, reply-sender port of a listener.
    pub local_port: u16,
    /// Multicast group queries are sent to.
    pub multicast_address: Ipv4Addr,
    /// Multicast port queries are sent to and listeners bind.
    pub multicast_port: u16,
    /// Interval between two query packets.
    #[serde(with = "duration_millis")]
    pub polling_interval: Duration,
    /// Overall duration budget of one discovery run.
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    /// Receive idle-timeout of each socket.
    #[serde(with = "duration_millis")]
    pub receive_timeout: Duration,
    /// Log loopback and foreign packets at debug level before dropping them.
    #[serde(default)]
    pub log_loopback: bool,
    /// Wait before a fruitless discovery is retried.
    #[serde(with = "duration_millis")]
    pub repeat_interval: Duration,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            local_address: Ipv4Addr::UNSPECIFIED,
            local_port: DATA_SOURCE_LOCAL_PORT,
            multicast_address: DEFAULT_MULTICAST_ADDRESS,
            multicast_port: DEFAULT_MULTICAST_PORT,
            polling_interval: Duration::from_secs(5),
            duration: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(6),
            log_loopback: false,
            repeat_interval: Duration::from_secs(30),
        }
    }
}

impl DiscoverySettings {
    /// Defaults for a Data Source process.
    pub fn for_data_source() -> Self {
        Self::default()
    }

    /// Defaults for a Tracking Service process.
    pub fn for_tracking_service() -> Self {
        Self {
            local_port: TRACKING_SERVICE_LOCAL_PORT,
            ..Self::default()
        }
    }

    /// Set the local bind address and port (builder pattern).
    pub fn with_local(mut self, address: Ipv4Addr, port: u16) -> Self {
        self.local_address = address;
        self.local_port = port;
        self
    }

    /// Set the query target (builder pattern).
    pub fn with_multicast(mut self, address: Ipv4Addr, port: u16) -> Self {
        self.multicast_address = address;
        self.multicast_port = port;
        self
    }

    /// Set the query polling interval (builder pattern).
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the overall duration budget (builder pattern).
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set the per-socket receive timeout (builder pattern).
    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Enable debug logging of loopback traffic (builder pattern).
    pub fn with_log_loopback(mut self, enabled: bool) -> Self {
        self.log_loopback = enabled;
        self
    }

    /// Set the retry interval after a fruitless run (builder pattern).
    pub fn with_repeat_interval(mut self, interval: Duration) -> Self {
        self.repeat_interval = interval;
        self
    }

    /// Whether the query target is a multicast group that must be joined.
    pub fn is_multicast(&self) -> bool {
        self.multicast_address.is_multicast()
    }
}

/// Serializes a `Duration` as integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis().min(u64::MAX as u128) as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_defaults() {
        let settings = DiscoverySettings::default();
        assert_eq!(settings.multicast_address, Ipv4Addr::new(224, 242, 42, 0));
        assert_eq!(settings.multicast_port, 18500);
        assert_eq!(settings.local_port, DATA_SOURCE_LOCAL_PORT);
        assert_eq!(settings.polling_interval, Duration::from_secs(5));
        assert_eq!(settings.duration, Duration::from_secs(10));
        assert_eq!(settings.receive_timeout, Duration::from_secs(6));
        assert!(settings.is_multicast());

        let ts = DiscoverySettings::for_tracking_service();
        assert_eq!(ts.local_port, TRACKING_SERVICE_LOCAL_PORT);
    }

    #[test]
    fn test_loopback_target_is_not_multicast() {
        let settings = DiscoverySettings::default().with_multicast(Ipv4Addr::LOCALHOST, 40000);
        assert!(!settings.is_multicast());
    }

    #[test]
    fn test_discovery_settings_serde_roundtrip() {
        let settings = DiscoverySettings::for_tracking_service()
            .with_polling_interval(Duration::from_millis(250))
            .with_duration(Duration::from_millis(1500))
            .with_log_loopback(true);

        let json = serde_json::to_string(&settings).expect("serialize");
        assert!(json.contains("\"polling_interval\":250"));
        let restored: DiscoverySettings = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(restored, settings);
    }

    #[test]
    fn test_mark_probe_updates_last_seen_only_on_success() {
        let mut device = DeviceInfo::new("ts1", "N/A", ("10.0.0.5", 9000), ("10.0.0.5", 9001));
        device.mark_probe(false);
        assert!(!device.is_reachable);
        assert!(device.last_seen.is_none());

        device.mark_probe(true);
        assert!(device.is_reachable);
        assert!(device.last_seen.is_some());
        assert_eq!(device.control_api_url(), "http://10.0.0.5:9001");
    }
}
