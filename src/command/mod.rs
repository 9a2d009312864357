//! Inbound commands and their correlated results.
//!
//! Commands arrive from an external control surface, are buffered by the
//! [`CommandQueue`], and are dispatched to a [`CommandHandler`]. Each handled
//! command publishes exactly one [`CommandResult`] under its request id;
//! callers poll for it with [`CommandQueue::take_result`].

mod queue;
mod results;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::duration_millis;

pub use queue::CommandQueue;
pub use results::ResultStore;

/// Kind of a command. `Undefined` is a no-op and is never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    #[default]
    Undefined,
    EnableAutoDiscovery,
    GetStatus,
    StartTracking,
    StopTracking,
    Reboot,
}

impl CommandType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::Undefined => "undefined",
            CommandType::EnableAutoDiscovery => "enable-auto-discovery",
            CommandType::GetStatus => "get-status",
            CommandType::StartTracking => "start-tracking",
            CommandType::StopTracking => "stop-tracking",
            CommandType::Reboot => "reboot",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandType {
    type Err = std::convert::Infallible;

    /// Unknown names parse to `Undefined`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "enable-auto-discovery" => CommandType::EnableAutoDiscovery,
            "get-status" => CommandType::GetStatus,
            "start-tracking" => CommandType::StartTracking,
            "stop-tracking" => CommandType::StopTracking,
            "reboot" => CommandType::Reboot,
            _ => CommandType::Undefined,
        })
    }
}

/// Command payload: a string-keyed map whose keys compare case-insensitively.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Value>")]
pub struct CommandData(BTreeMap<String, Value>);

impl From<BTreeMap<String, Value>> for CommandData {
    fn from(map: BTreeMap<String, Value>) -> Self {
        map.into_iter().collect()
    }
}

impl FromIterator<(String, Value)> for CommandData {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut data = CommandData::default();
        for (key, value) in iter {
            data.insert(key, value);
        }
        data
    }
}

impl CommandData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl AsRef<str>, value: Value) -> Option<Value> {
        self.0.insert(key.as_ref().to_lowercase(), value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(&key.to_lowercase())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Deserialize the value under `key`. `Ok(None)` when the key is absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, serde_json::Error> {
        self.get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A request from the control surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub request_id: String,
    /// Set when the command is enqueued.
    pub timestamp: SystemTime,
    pub command_type: CommandType,
    #[serde(default)]
    pub data: CommandData,
}

impl Command {
    pub fn new(request_id: impl Into<String>, command_type: CommandType) -> Self {
        Self {
            request_id: request_id.into(),
            timestamp: SystemTime::now(),
            command_type,
            data: CommandData::default(),
        }
    }

    /// Add a payload entry (builder pattern).
    pub fn with_data(mut self, key: impl AsRef<str>, value: Value) -> Self {
        self.data.insert(key, value);
        self
    }
}

/// Failure of a handled command, carried into its result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{description} (code {code})")]
pub struct CommandError {
    pub code: u16,
    pub description: String,
}

impl CommandError {
    pub const BAD_REQUEST: u16 = 400;
    pub const CONFLICT: u16 = 409;
    pub const INTERNAL: u16 = 500;

    pub fn new(code: u16, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// The command payload is missing or malformed.
    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::new(Self::BAD_REQUEST, description)
    }

    /// The service cannot perform the command in its current state.
    pub fn conflict(description: impl Into<String>) -> Self {
        Self::new(Self::CONFLICT, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL, description)
    }
}

/// Outcome of a handled command, correlated by request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub request_id: String,
    /// Payload, `None` on error or when the command produces nothing.
    pub data: Option<Value>,
    pub is_error: bool,
    pub error_description: Option<String>,
    pub error_code: Option<u16>,
    /// Whether a caller already retrieved this result.
    pub read: bool,
    pub timestamp: SystemTime,
}

impl CommandResult {
    pub fn success(request_id: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            request_id: request_id.into(),
            data,
            is_error: false,
            error_description: None,
            error_code: None,
            read: false,
            timestamp: SystemTime::now(),
        }
    }

    pub fn failure(request_id: impl Into<String>, error: &CommandError) -> Self {
        Self {
            request_id: request_id.into(),
            data: None,
            is_error: true,
            error_description: Some(error.description.clone()),
            error_code: Some(error.code),
            read: false,
            timestamp: SystemTime::now(),
        }
    }

    /// Time since the result was published.
    pub fn age(&self, now: SystemTime) -> Duration {
        now.duration_since(self.timestamp).unwrap_or_default()
    }
}

/// Executes dispatched commands. Called concurrently, one thread per command.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(&self, command: &Command) -> Result<Option<Value>, CommandError>;
}

impl<F> CommandHandler for F
where
    F: Fn(&Command) -> Result<Option<Value>, CommandError> + Send + Sync + 'static,
{
    fn handle(&self, command: &Command) -> Result<Option<Value>, CommandError> {
        self(command)
    }
}

/// Command queue timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Results are swept every half period.
    #[serde(with = "duration_millis")]
    pub cleanup_period: Duration,
    /// Unread results older than this are evicted.
    #[serde(with = "duration_millis")]
    pub max_alive: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            cleanup_period: Duration::from_secs(60),
            max_alive: Duration::from_secs(300),
        }
    }
}

impl QueueSettings {
    pub fn with_cleanup_period(mut self, period: Duration) -> Self {
        self.cleanup_period = period;
        self
    }

    pub fn with_max_alive(mut self, max_alive: Duration) -> Self {
        self.max_alive = max_alive;
        self
    }

    /// Interval between two sweeps.
    pub fn sweep_interval(&self) -> Duration {
        (self.cleanup_period / 2).max(Duration::from_millis(1))
    }
}
