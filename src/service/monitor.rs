//! Periodic reachability probe of the configured Tracking Service.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};

use crate::error::Result;
use crate::types::DeviceInfo;

/// Path of the status endpoint on a Tracking Service control API.
pub const STATUS_PATH: &str = "/internal/v1/Service/Status";

/// Checks whether a peer's control API answers.
pub trait ReachabilityProbe: Send + Sync {
    fn probe(&self, device: &DeviceInfo) -> Result<()>;
}

/// Probes `GET http://<control>:<port>/internal/v1/Service/Status`.
#[cfg(feature = "http-probe")]
pub struct HttpStatusProbe {
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http-probe")]
impl HttpStatusProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::Error::context("building HTTP client", e))?;
        Ok(Self { client })
    }

    pub fn status_url(device: &DeviceInfo) -> String {
        format!("{}{}", device.control_api_url(), STATUS_PATH)
    }
}

#[cfg(feature = "http-probe")]
impl ReachabilityProbe for HttpStatusProbe {
    fn probe(&self, device: &DeviceInfo) -> Result<()> {
        let url = Self::status_url(device);
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| crate::error::Error::context(format!("GET {}", url), e))?;
        if !response.status().is_success() {
            return Err(crate::error::Error::msg(format!(
                "GET {}: HTTP {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Background loop probing one device at a fixed interval.
///
/// A failed probe is never fatal: it only reports `false` to the callback.
pub struct ReachabilityMonitor {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ReachabilityMonitor {
    pub fn start<F>(
        probe: Arc<dyn ReachabilityProbe>,
        device: DeviceInfo,
        interval: Duration,
        on_result: F,
    ) -> io::Result<Self>
    where
        F: Fn(bool) + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        info!(
            "monitor: probing {} every {:?}",
            device.control_api_url(),
            interval
        );

        let handle = thread::Builder::new()
            .name("reachability-monitor".into())
            .spawn(move || {
                let mut reachable = None;
                loop {
                    let ok = match probe.probe(&device) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!("monitor: {} unreachable: {}", device.id, e);
                            false
                        }
                    };
                    if reachable != Some(ok) {
                        debug!("monitor: {} reachable={}", device.id, ok);
                        reachable = Some(ok);
                    }
                    on_result(ok);

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop probing and wait for an in-flight probe to finish.
    pub fn stop(&mut self) {
        self.stop_tx = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for ReachabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
