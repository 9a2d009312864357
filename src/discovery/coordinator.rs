//! Discovery sessions with a termination policy.
//!
//! A coordinator owns one [`Discoverer`] for the length of a run and turns
//! its raw events into a single result. [`TrackingServiceSeeker`] stops at
//! the first Tracking Service that answers; [`DataSourceSeeker`] collects
//! every Data Source that answers within the duration window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crossbeam_channel::bounded;
use log::{debug, info};

use super::discoverer::Discoverer;
use super::role::{DataSource, Role, TrackingService};
use super::DiscoveryEvent;
use crate::error::{Error, Result};
use crate::types::{DeviceInfo, DiscoverySettings};

/// Event raised by a coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// A distinct device answered.
    DeviceFound(DeviceInfo),
    /// The run is over. Raised exactly once unless the run was stopped.
    Completed(Vec<DeviceInfo>),
}

/// Callback receiving coordinator events.
pub type CoordinatorSink = Arc<dyn Fn(CoordinatorEvent) + Send + Sync>;

/// One discovery run driven to a result.
pub trait DiscoveryCoordinator: Send {
    /// Start a run. Events arrive on the transport's threads.
    fn start(&mut self, sink: CoordinatorSink) -> Result<()>;

    /// Abandon the run. No `Completed` event follows.
    fn stop(&mut self);

    /// Whether a run is in progress.
    fn is_active(&self) -> bool;
}

/// State shared between a coordinator and its transport callback.
struct Session<R: Role> {
    transport: Mutex<Option<Discoverer<R>>>,
    finished: AtomicBool,
    found: Mutex<Vec<DeviceInfo>>,
    sink: CoordinatorSink,
}

impl<R: Role> Session<R> {
    fn new(sink: CoordinatorSink) -> Arc<Self> {
        Arc::new(Self {
            transport: Mutex::new(None),
            finished: AtomicBool::new(false),
            found: Mutex::new(Vec::new()),
            sink,
        })
    }

    /// Start the transport with a callback that only holds a weak reference,
    /// so a dropped coordinator is never kept alive by its own transport.
    fn launch<F>(self: &Arc<Self>, settings: DiscoverySettings, on_event: F) -> Result<()>
    where
        F: Fn(&Session<R>, DiscoveryEvent) + Send + Sync + 'static,
    {
        let weak: Weak<Session<R>> = Arc::downgrade(self);
        let mut transport = lock(&self.transport);
        let mut discoverer = Discoverer::<R>::new(settings);
        discoverer
            .start(move |event| {
                if let Some(session) = weak.upgrade() {
                    on_event(&session, event);
                }
            })
            .map_err(|e| Error::context(format!("starting {} discovery", R::NAME), e))?;
        *transport = Some(discoverer);
        Ok(())
    }

    /// Record a device, returning false when its id was already seen.
    fn record(&self, device: &DeviceInfo) -> bool {
        let mut found = lock(&self.found);
        if found.iter().any(|d| d.id == device.id) {
            return false;
        }
        found.push(device.clone());
        true
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Close the transport and raise `Completed`, once.
    fn finish(&self, devices: Vec<DeviceInfo>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_transport();
        info!(
            "discovery: {} run completed with {} device(s)",
            R::NAME,
            devices.len()
        );
        (self.sink)(CoordinatorEvent::Completed(devices));
    }

    /// Close the transport without raising anything.
    fn cancel(&self) {
        if !self.finished.swap(true, Ordering::SeqCst) {
            debug!("discovery: {} run cancelled", R::NAME);
        }
        self.close_transport();
    }

    fn close_transport(&self) {
        let transport = lock(&self.transport).take();
        if let Some(mut transport) = transport {
            transport.stop();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Looks for a Tracking Service and stops at the first answer.
pub struct TrackingServiceSeeker {
    settings: DiscoverySettings,
    session: Option<Arc<Session<TrackingService>>>,
}

impl TrackingServiceSeeker {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }
}

impl DiscoveryCoordinator for TrackingServiceSeeker {
    fn start(&mut self, sink: CoordinatorSink) -> Result<()> {
        self.stop();
        let session = Session::new(sink);
        session.launch(self.settings.clone(), |session, event| match event {
            DiscoveryEvent::DeviceFound(device) => {
                if session.is_finished() || !session.record(&device) {
                    return;
                }
                (session.sink)(CoordinatorEvent::DeviceFound(device.clone()));
                session.finish(vec![device]);
            }
            DiscoveryEvent::Completed => session.finish(Vec::new()),
        })?;
        self.session = Some(session);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel();
        }
    }

    fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_finished())
    }
}

impl Drop for TrackingServiceSeeker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collects every Data Source that answers within the duration window.
pub struct DataSourceSeeker {
    settings: DiscoverySettings,
    session: Option<Arc<Session<DataSource>>>,
}

impl DataSourceSeeker {
    pub fn new(settings: DiscoverySettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    /// Devices found so far in the current run.
    pub fn found(&self) -> Vec<DeviceInfo> {
        self.session
            .as_ref()
            .map(|s| lock(&s.found).clone())
            .unwrap_or_default()
    }
}

impl DiscoveryCoordinator for DataSourceSeeker {
    fn start(&mut self, sink: CoordinatorSink) -> Result<()> {
        self.stop();
        let session = Session::new(sink);
        session.launch(self.settings.clone(), |session, event| match event {
            DiscoveryEvent::DeviceFound(device) => {
                if !session.is_finished() && session.record(&device) {
                    (session.sink)(CoordinatorEvent::DeviceFound(device));
                }
            }
            DiscoveryEvent::Completed => {
                let devices = lock(&session.found).clone();
                session.finish(devices);
            }
        })?;
        self.session = Some(session);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel();
        }
    }

    fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_finished())
    }
}

impl Drop for DataSourceSeeker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run a coordinator to completion, blocking the caller.
fn run_blocking<C: DiscoveryCoordinator>(
    mut coordinator: C,
    settings: &DiscoverySettings,
) -> Result<Vec<DeviceInfo>> {
    let (tx, rx) = bounded(1);
    coordinator.start(Arc::new(move |event| {
        if let CoordinatorEvent::Completed(devices) = event {
            let _ = tx.try_send(devices);
        }
    }))?;

    // The transport completes on its own after `duration`; the slack covers
    // the final receive timeout and thread scheduling.
    let limit = settings.duration + settings.receive_timeout + settings.polling_interval;
    rx.recv_timeout(limit)
        .map_err(|_| Error::discovery("discovery run did not complete"))
}

/// Look for a Tracking Service, blocking until one answers or the run ends.
pub fn find_tracking_service(settings: DiscoverySettings) -> Result<Option<DeviceInfo>> {
    let devices = run_blocking(TrackingServiceSeeker::new(settings.clone()), &settings)?;
    Ok(devices.into_iter().next())
}

/// Collect every Data Source that answers within the duration window.
pub fn find_data_sources(settings: DiscoverySettings) -> Result<Vec<DeviceInfo>> {
    run_blocking(DataSourceSeeker::new(settings.clone()), &settings)
}
