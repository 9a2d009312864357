//! TOML configuration of a Data Source process.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::command::QueueSettings;
use crate::error::{Error, Result};
use crate::service::{ServiceSettings, TrackingServiceStore};
use crate::types::{DeviceInfo, DiscoverySettings, LocalIdentity};

/// Everything a Data Source process is started with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceConfig {
    /// What the listener advertises.
    pub identity: LocalIdentity,
    /// Listener answering `?DS` queries.
    pub discovery: DiscoverySettings,
    pub queue: QueueSettings,
    pub service: ServiceSettings,
    /// Tracking Service adopted by a previous auto-discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_service: Option<DeviceInfo>,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            identity: LocalIdentity::new("data-source", 9000, 9001),
            discovery: DiscoverySettings::for_data_source(),
            queue: QueueSettings::default(),
            service: ServiceSettings::default(),
            tracking_service: None,
        }
    }
}

impl DataSourceConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| Error::context(format!("reading {}", path.display()), e))?;
        let config: DataSourceConfig = toml::from_str(&content)?;
        debug!("config: loaded {}", path.display());
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .map_err(|e| Error::context(format!("writing {}", path.display()), e))?;
        Ok(())
    }
}

/// Persists the adopted Tracking Service by rewriting the config file.
pub struct FileConfigStore {
    path: PathBuf,
    config: Mutex<DataSourceConfig>,
}

impl FileConfigStore {
    /// Wrap an already loaded configuration.
    pub fn new(path: impl Into<PathBuf>, config: DataSourceConfig) -> Self {
        Self {
            path: path.into(),
            config: Mutex::new(config),
        }
    }

    /// Load `path`, or start from defaults when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            DataSourceConfig::from_file(&path)?
        } else {
            info!("config: {} not found, using defaults", path.display());
            DataSourceConfig::default()
        };
        Ok(Self::new(path, config))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> DataSourceConfig {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl TrackingServiceStore for FileConfigStore {
    fn load(&self) -> Option<DeviceInfo> {
        self.config
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tracking_service
            .clone()
    }

    fn save(&self, device: &DeviceInfo) -> Result<()> {
        let mut config = self.config.lock().unwrap_or_else(|e| e.into_inner());
        config.tracking_service = Some(device.clone());
        config.to_file(&self.path)?;
        info!(
            "config: saved tracking service {} to {}",
            device.id,
            self.path.display()
        );
        Ok(())
    }
}

/// In-process store; nothing survives a restart.
#[derive(Default)]
pub struct MemoryConfigStore {
    device: Mutex<Option<DeviceInfo>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: DeviceInfo) -> Self {
        Self {
            device: Mutex::new(Some(device)),
        }
    }
}

impl TrackingServiceStore for MemoryConfigStore {
    fn load(&self) -> Option<DeviceInfo> {
        self.device.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn save(&self, device: &DeviceInfo) -> Result<()> {
        *self.device.lock().unwrap_or_else(|e| e.into_inner()) = Some(device.clone());
        Ok(())
    }
}
