//! Coordination plumbing between body-tracking Data Sources and a Tracking
//! Service.
//!
//! This crate provides the pieces a Data Source process and a Tracking
//! Service need to find each other on a LAN, accept remote commands, and
//! exchange skeleton frames:
//!
//! - **Discovery**: role-tagged UDP multicast queries answered by unicast
//!   replies, with coordinators that stop at the first Tracking Service or
//!   collect every Data Source within a window.
//! - **Commands**: a non-blocking command queue whose results are polled by
//!   request id and swept when nobody reads them.
//! - **Service**: the Data Source lifecycle as a pure transition function,
//!   driven on a single thread.
//! - **Frames**: the versioned binary scene-frame codec.
//!
//! # Getting Started
//!
//! ## Finding a Tracking Service
//!
//! ```no_run
//! use body_link::{find_tracking_service, DiscoverySettings};
//!
//! match find_tracking_service(DiscoverySettings::for_data_source()).unwrap() {
//!     Some(device) => println!("Tracking Service at {}", device.control_api_url()),
//!     None => println!("No Tracking Service answered"),
//! }
//! ```
//!
//! ## Advertising a Data Source
//!
//! ```no_run
//! use body_link::{DataSourceListener, DiscoverySettings, LocalIdentity};
//!
//! let identity = LocalIdentity::new("kinect-1", 9000, 9001);
//! let mut listener = DataSourceListener::new(DiscoverySettings::for_data_source(), identity);
//! let addr = listener.start().unwrap();
//! println!("answering ?DS queries on {}", addr);
//! ```
//!
//! ## Encoding a frame
//!
//! ```
//! use body_link::frame::{self, FrameFeatures, FrameVersion, SceneFrame};
//!
//! let scene = SceneFrame::new(FrameVersion::V2, 1, 0).with_features(FrameFeatures::all());
//! let bytes = frame::encode(&scene).unwrap();
//! assert_eq!(frame::decode(&bytes).unwrap(), scene.normalized());
//! ```
//!
//! # Features
//!
//! - `http-probe` (default): reachability probe of the Tracking Service
//!   control API over HTTP (`reqwest`).

pub mod command;
pub mod config;
pub mod discovery;
mod error;
pub mod frame;
pub mod net_utils;
pub mod service;
pub mod types;

// Crate-level error types
pub use error::{Error, Result};

// Core types
pub use types::{
    DeviceInfo, DiscoverySettings, LocalIdentity, DATA_SOURCE_LOCAL_PORT,
    DEFAULT_MULTICAST_ADDRESS, DEFAULT_MULTICAST_PORT, TRACKING_SERVICE_LOCAL_PORT,
};

// Discovery
pub use discovery::{
    find_data_sources, find_tracking_service, CoordinatorEvent, DataSourceListener,
    DataSourceSeeker, DiscoveryCoordinator, DiscoveryEvent, TrackingServiceListener,
    TrackingServiceSeeker,
};

// Commands
pub use command::{
    Command, CommandData, CommandError, CommandHandler, CommandQueue, CommandResult,
    CommandType, QueueSettings,
};

// Service
pub use service::{
    Collaborators, ServiceCommandHandler, ServiceHandle, ServiceSettings, ServiceState,
    ServiceStatus, TrackingSessionConfig,
};

// Configuration
pub use config::{DataSourceConfig, FileConfigStore, MemoryConfigStore};

// Frames
pub use frame::{FrameError, SceneFrame};
