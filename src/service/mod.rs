//! Lifecycle of a Data Source process.
//!
//! [`state::transition`] is the whole policy: a pure function from the
//! current state and an event to a target state plus side effects.
//! [`ServiceHandle`] drives it on one thread, applying effects against the
//! collaborators below and feeding their outcomes back in as events.

mod handler;
mod machine;
mod monitor;
pub mod state;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{duration_millis, DeviceInfo, DiscoverySettings};

pub use handler::ServiceCommandHandler;
pub use machine::ServiceHandle;
pub use monitor::{ReachabilityMonitor, ReachabilityProbe, STATUS_PATH};
#[cfg(feature = "http-probe")]
pub use monitor::HttpStatusProbe;
pub use state::{Effect, Event, Outcome};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServiceState {
    #[default]
    NotStarted,
    Starting,
    AutoDiscovery,
    Idle,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot published on every state change and returned by `get-status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub tracking_service: Option<DeviceInfo>,
    pub last_error: Option<String>,
    pub timestamp: SystemTime,
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self {
            state: ServiceState::NotStarted,
            tracking_service: None,
            last_error: None,
            timestamp: SystemTime::now(),
        }
    }
}

/// Payload of `start-tracking`, handed to the streaming subsystem untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingSessionConfig {
    #[serde(alias = "SessionId", alias = "sessionId")]
    pub session_id: String,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl TrackingSessionConfig {
    /// Key of the configuration in the command payload.
    pub const DATA_KEY: &'static str = "TrackingSessionConfig";

    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            parameters: Map::new(),
        }
    }
}

/// The data-plane streamer.
pub trait StreamingSubsystem: Send + Sync {
    /// Start streaming; `false` when the subsystem could not start.
    fn start(&self, config: &TrackingSessionConfig) -> bool;
    fn stop(&self);
}

/// Where the discovered Tracking Service is persisted.
pub trait TrackingServiceStore: Send + Sync {
    fn load(&self) -> Option<DeviceInfo>;
    fn save(&self, device: &DeviceInfo) -> Result<()>;
}

/// Host-level actions.
pub trait SystemControl: Send + Sync {
    fn reboot(&self);
}

/// Receives every published status.
pub type StatusSink = Arc<dyn Fn(&ServiceStatus) + Send + Sync>;

/// External collaborators of the state machine.
#[derive(Clone)]
pub struct Collaborators {
    pub streaming: Arc<dyn StreamingSubsystem>,
    pub store: Arc<dyn TrackingServiceStore>,
    pub system: Arc<dyn SystemControl>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub status_sink: Option<StatusSink>,
}

impl Collaborators {
    pub fn new(
        streaming: Arc<dyn StreamingSubsystem>,
        store: Arc<dyn TrackingServiceStore>,
        system: Arc<dyn SystemControl>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        Self {
            streaming,
            store,
            system,
            probe,
            status_sink: None,
        }
    }

    /// Register a status sink (builder pattern).
    pub fn with_status_sink(mut self, sink: StatusSink) -> Self {
        self.status_sink = Some(sink);
        self
    }
}

/// Timing of the service lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSettings {
    /// Wait after a Tracking Service is found before restarting.
    #[serde(with = "duration_millis")]
    pub settle_delay: Duration,
    /// Wait between the `reboot` command and the host reboot.
    #[serde(with = "duration_millis")]
    pub reboot_delay: Duration,
    /// Interval of the Tracking Service reachability probe.
    #[serde(with = "duration_millis")]
    pub monitor_interval: Duration,
    /// Settings of each automatic Tracking Service search.
    pub discovery: DiscoverySettings,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(2),
            reboot_delay: Duration::from_secs(5),
            monitor_interval: Duration::from_secs(10),
            discovery: DiscoverySettings::for_data_source(),
        }
    }
}

impl ServiceSettings {
    pub fn with_discovery(mut self, discovery: DiscoverySettings) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_reboot_delay(mut self, delay: Duration) -> Self {
        self.reboot_delay = delay;
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }
}
