//! Driver applying the transition function.
//!
//! One pump thread owns the machine. Requests, discovery results and timers
//! all arrive on its inbox, so transitions are strictly serialized. Effects
//! of a transition are applied after the state is updated; events they
//! produce are queued and processed before the next inbox message.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crossbeam_channel::{at, bounded, never, select, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use super::monitor::ReachabilityMonitor;
use super::state::{transition, Context, Effect, Event, Outcome};
use super::{Collaborators, ServiceSettings, ServiceState, ServiceStatus, TrackingSessionConfig};
use crate::discovery::{CoordinatorEvent, DiscoveryCoordinator, TrackingServiceSeeker};
use crate::error::{Error, Result};
use crate::types::DeviceInfo;

enum Message {
    Event {
        event: Event,
        reply: Option<Sender<Result<ServiceStatus>>>,
    },
    Shutdown,
}

type SharedStatus = Arc<Mutex<ServiceStatus>>;

fn lock(status: &SharedStatus) -> MutexGuard<'_, ServiceStatus> {
    status.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle to a running Data Source service.
///
/// Dropping the handle shuts the service down.
pub struct ServiceHandle {
    inbox: Sender<Message>,
    status: SharedStatus,
    pump: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Start the pump thread and boot the machine.
    pub fn start(settings: ServiceSettings, collaborators: Collaborators) -> Result<Self> {
        let (inbox_tx, inbox_rx) = unbounded();
        let tracking_service = collaborators.store.load();
        let status = Arc::new(Mutex::new(ServiceStatus {
            tracking_service: tracking_service.clone(),
            ..ServiceStatus::default()
        }));

        let pump = Pump {
            state: ServiceState::NotStarted,
            settings,
            collaborators,
            tracking_service,
            status: Arc::clone(&status),
            inbox: inbox_tx.clone(),
            timers: Vec::new(),
            discovery: None,
            monitor: None,
        };
        let handle = thread::Builder::new()
            .name("service".into())
            .spawn(move || pump.run(inbox_rx))
            .map_err(|e| Error::context("spawning service thread", e))?;

        let service = Self {
            inbox: inbox_tx,
            status,
            pump: Some(handle),
        };
        service.post(Event::Boot);
        Ok(service)
    }

    /// Latest status snapshot. Never blocks on a transition.
    pub fn status(&self) -> ServiceStatus {
        lock(&self.status).clone()
    }

    pub fn state(&self) -> ServiceState {
        lock(&self.status).state
    }

    /// Deliver an event without waiting for it.
    pub fn post(&self, event: Event) {
        if self
            .inbox
            .send(Message::Event { event, reply: None })
            .is_err()
        {
            debug!("service: dropping event, service is stopped");
        }
    }

    /// Deliver an event and wait until it and every event it cascades into
    /// are processed. Returns the resulting status, or `Error::Rejected`.
    pub fn request(&self, event: Event) -> Result<ServiceStatus> {
        let (reply_tx, reply_rx) = bounded(1);
        self.inbox
            .send(Message::Event {
                event,
                reply: Some(reply_tx),
            })
            .map_err(|_| Error::msg("service is stopped"))?;
        reply_rx
            .recv()
            .map_err(|_| Error::msg("service stopped before answering"))?
    }

    pub fn enable_auto_discovery(&self) -> Result<ServiceStatus> {
        self.request(Event::EnableAutoDiscovery)
    }

    pub fn start_tracking(&self, config: TrackingSessionConfig) -> Result<ServiceStatus> {
        self.request(Event::StartTracking(config))
    }

    pub fn stop_tracking(&self) -> Result<ServiceStatus> {
        self.request(Event::StopTracking)
    }

    pub fn reboot(&self) -> Result<ServiceStatus> {
        self.request(Event::Reboot)
    }

    /// Re-enter `Starting` from `Error`.
    pub fn recover(&self) -> Result<ServiceStatus> {
        self.request(Event::Recover)
    }

    /// Poll the status until `predicate` holds or `timeout` elapses.
    pub fn wait_for<F>(&self, timeout: Duration, predicate: F) -> bool
    where
        F: Fn(&ServiceStatus) -> bool,
    {
        let deadline = crossbeam_channel::after(timeout);
        loop {
            if predicate(&self.status()) {
                return true;
            }
            select! {
                recv(deadline) -> _ => return predicate(&self.status()),
                default(Duration::from_millis(5)) => {}
            }
        }
    }

    /// Stop discovery, monitoring and streaming, and join the pump.
    pub fn shutdown(&mut self) {
        let _ = self.inbox.send(Message::Shutdown);
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Pump {
    state: ServiceState,
    settings: ServiceSettings,
    collaborators: Collaborators,
    tracking_service: Option<DeviceInfo>,
    status: SharedStatus,
    /// Loops discovery results back in as events.
    inbox: Sender<Message>,
    timers: Vec<(Instant, Event)>,
    discovery: Option<TrackingServiceSeeker>,
    monitor: Option<ReachabilityMonitor>,
}

impl Pump {
    fn run(mut self, inbox: Receiver<Message>) {
        loop {
            let timer = match self.next_deadline() {
                Some(deadline) => at(deadline),
                None => never(),
            };

            select! {
                recv(inbox) -> message => match message {
                    Ok(Message::Event { event, reply }) => {
                        let result = self.process(event);
                        if let Some(reply) = reply {
                            let _ = reply.send(result);
                        }
                    }
                    Ok(Message::Shutdown) | Err(_) => break,
                },
                recv(timer) -> _ => self.fire_due_timers(),
            }
        }

        self.wind_down();
        info!("service: stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|(deadline, _)| *deadline).min()
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = self
            .timers
            .drain(..)
            .partition(|(deadline, _)| *deadline <= now);
        self.timers = pending;
        for (_, event) in due {
            if let Err(e) = self.process(event) {
                debug!("service: timer event rejected: {}", e);
            }
        }
    }

    fn context(&self) -> Context {
        Context {
            tracking_service_configured: self.tracking_service.is_some(),
            settle_delay: self.settings.settle_delay,
            repeat_interval: self.settings.discovery.repeat_interval,
            reboot_delay: self.settings.reboot_delay,
        }
    }

    /// Run `event` and its cascade to quiescence.
    ///
    /// The result reflects the first event: a rejection is reported to the
    /// requester, everything else yields the final status.
    fn process(&mut self, event: Event) -> Result<ServiceStatus> {
        let mut cascade = VecDeque::from([event]);
        let mut first = true;
        let mut rejection = None;

        while let Some(event) = cascade.pop_front() {
            let name = event.name();
            match transition(self.state, &self.context(), event) {
                Outcome::Transition { target, effects } => {
                    info!("service: {} -> {} on {}", self.state, target, name);
                    self.state = target;
                    lock(&self.status).state = target;
                    self.apply(effects, &mut cascade);
                }
                Outcome::Stay { effects } => self.apply(effects, &mut cascade),
                Outcome::Ignored => debug!("service: {} ignored in {}", name, self.state),
                Outcome::Rejected(reason) => {
                    warn!("service: {}", reason);
                    if first {
                        rejection = Some(reason);
                    }
                }
            }
            first = false;
        }

        match rejection {
            Some(reason) => Err(Error::rejected(reason)),
            None => Ok(lock(&self.status).clone()),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>, cascade: &mut VecDeque<Event>) {
        for effect in effects {
            match effect {
                Effect::EmitStatus => self.emit_status(),
                Effect::StartMonitor => self.start_monitor(),
                Effect::StopMonitor => self.stop_monitor(),
                Effect::StartDiscovery => {
                    if let Err(e) = self.start_discovery() {
                        cascade.push_back(Event::Fault(e.to_string()));
                    }
                }
                Effect::StopDiscovery => self.stop_discovery(),
                Effect::PersistTrackingService(device) => self.persist(device),
                Effect::Schedule { after, event } => {
                    debug!("service: {} in {:?}", event.name(), after);
                    self.timers.push((Instant::now() + after, event));
                }
                Effect::StartStreaming(config) => {
                    if self.collaborators.streaming.start(&config) {
                        cascade.push_back(Event::StreamingStarted);
                    } else {
                        cascade.push_back(Event::StreamingFailed(format!(
                            "session {}",
                            config.session_id
                        )));
                    }
                }
                Effect::StopStreaming => self.collaborators.streaming.stop(),
                Effect::Follow(event) => cascade.push_back(event),
                Effect::ReportError(reason) => {
                    error!("service: {}", reason);
                    lock(&self.status).last_error = Some(reason);
                }
                Effect::RebootSystem => {
                    info!("service: rebooting host");
                    self.collaborators.system.reboot();
                }
            }
        }
    }

    fn emit_status(&self) {
        let snapshot = {
            let mut status = lock(&self.status);
            status.state = self.state;
            status.timestamp = SystemTime::now();
            status.clone()
        };
        if let Some(sink) = &self.collaborators.status_sink {
            sink(&snapshot);
        }
    }

    fn start_monitor(&mut self) {
        self.stop_monitor();
        let Some(device) = self.tracking_service.clone() else {
            return;
        };
        let status = Arc::clone(&self.status);
        let started = ReachabilityMonitor::start(
            Arc::clone(&self.collaborators.probe),
            device,
            self.settings.monitor_interval,
            move |reachable| {
                if let Some(device) = lock(&status).tracking_service.as_mut() {
                    device.mark_probe(reachable);
                }
            },
        );
        match started {
            Ok(monitor) => self.monitor = Some(monitor),
            Err(e) => warn!("service: reachability monitor not started: {}", e),
        }
    }

    fn stop_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }
    }

    fn start_discovery(&mut self) -> Result<()> {
        self.stop_discovery();
        let inbox = self.inbox.clone();
        let mut seeker = TrackingServiceSeeker::new(self.settings.discovery.clone());
        seeker.start(Arc::new(move |event| {
            if let CoordinatorEvent::Completed(devices) = event {
                let event = match devices.into_iter().next() {
                    Some(device) => Event::DeviceDiscovered(device),
                    None => Event::DiscoveryExhausted,
                };
                let _ = inbox.send(Message::Event { event, reply: None });
            }
        }))?;
        self.discovery = Some(seeker);
        Ok(())
    }

    fn stop_discovery(&mut self) {
        if let Some(mut seeker) = self.discovery.take() {
            seeker.stop();
        }
    }

    fn persist(&mut self, device: DeviceInfo) {
        info!("service: using tracking service {}", device);
        if let Err(e) = self.collaborators.store.save(&device) {
            warn!("service: failed to persist tracking service: {}", e);
        }
        lock(&self.status).tracking_service = Some(device.clone());
        self.tracking_service = Some(device);
    }

    fn wind_down(&mut self) {
        self.stop_discovery();
        self.stop_monitor();
        if self.state == ServiceState::Running {
            self.collaborators.streaming.stop();
        }
        self.timers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{ReachabilityProbe, StreamingSubsystem, SystemControl, TrackingServiceStore};
    use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use crate::discovery::QueryPacket;
    use crate::types::DiscoverySettings;

    #[derive(Default)]
    struct FakeStreaming {
        accept: AtomicBool,
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl StreamingSubsystem for FakeStreaming {
        fn start(&self, _config: &TrackingSessionConfig) -> bool {
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.accept.load(Ordering::SeqCst)
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeStore {
        device: Mutex<Option<DeviceInfo>>,
    }

    impl TrackingServiceStore for FakeStore {
        fn load(&self) -> Option<DeviceInfo> {
            self.device.lock().unwrap().clone()
        }

        fn save(&self, device: &DeviceInfo) -> Result<()> {
            *self.device.lock().unwrap() = Some(device.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSystem {
        reboots: AtomicUsize,
    }

    impl SystemControl for FakeSystem {
        fn reboot(&self) {
            self.reboots.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct AlwaysUp;

    impl ReachabilityProbe for AlwaysUp {
        fn probe(&self, _device: &DeviceInfo) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        streaming: Arc<FakeStreaming>,
        store: Arc<FakeStore>,
        system: Arc<FakeSystem>,
    }

    impl Fixture {
        fn new(configured: bool) -> Self {
            let store = FakeStore::default();
            if configured {
                *store.device.lock().unwrap() = Some(DeviceInfo::new(
                    "ts1",
                    "N/A",
                    ("127.0.0.1", 9000),
                    ("127.0.0.1", 9001),
                ));
            }
            Self {
                streaming: Arc::new(FakeStreaming::default()),
                store: Arc::new(store),
                system: Arc::new(FakeSystem::default()),
            }
        }

        fn collaborators(&self) -> Collaborators {
            Collaborators::new(
                self.streaming.clone(),
                self.store.clone(),
                self.system.clone(),
                Arc::new(AlwaysUp),
            )
        }
    }

    fn settings_towards(port: u16) -> ServiceSettings {
        ServiceSettings::default()
            .with_discovery(
                DiscoverySettings::for_data_source()
                    .with_local(Ipv4Addr::LOCALHOST, 0)
                    .with_multicast(Ipv4Addr::LOCALHOST, port)
                    .with_polling_interval(Duration::from_millis(50))
                    .with_duration(Duration::from_millis(150))
                    .with_receive_timeout(Duration::from_millis(50))
                    .with_repeat_interval(Duration::from_millis(100)),
            )
            .with_settle_delay(Duration::from_millis(50))
            .with_reboot_delay(Duration::from_millis(50))
            .with_monitor_interval(Duration::from_millis(20))
    }

    fn in_state(service: &ServiceHandle, state: ServiceState) -> bool {
        service.wait_for(Duration::from_secs(3), |s| s.state == state)
    }

    #[test]
    fn test_configured_service_boots_to_idle_and_monitors() {
        let fixture = Fixture::new(true);
        let service = ServiceHandle::start(settings_towards(9), fixture.collaborators()).unwrap();
        assert!(in_state(&service, ServiceState::Idle));
        assert!(service.wait_for(Duration::from_secs(1), |s| {
            s.tracking_service.as_ref().is_some_and(|d| d.is_reachable)
        }));
    }

    #[test]
    fn test_streaming_failure_returns_to_idle() {
        let fixture = Fixture::new(true);
        let service = ServiceHandle::start(settings_towards(9), fixture.collaborators()).unwrap();
        assert!(in_state(&service, ServiceState::Idle));

        let status = service.start_tracking(TrackingSessionConfig::new("s1")).unwrap();
        assert_eq!(status.state, ServiceState::Idle);
        assert!(status.last_error.is_some());
        assert_eq!(fixture.streaming.starts.load(Ordering::SeqCst), 1);

        fixture.streaming.accept.store(true, Ordering::SeqCst);
        let status = service.start_tracking(TrackingSessionConfig::new("s2")).unwrap();
        assert_eq!(status.state, ServiceState::Running);

        let status = service.stop_tracking().unwrap();
        assert_eq!(status.state, ServiceState::Idle);
        assert_eq!(fixture.streaming.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rejected_request_reports_error() {
        let fixture = Fixture::new(true);
        let service = ServiceHandle::start(settings_towards(9), fixture.collaborators()).unwrap();
        assert!(in_state(&service, ServiceState::Idle));

        // Recover outside Error is a no-op.
        assert_eq!(service.recover().unwrap().state, ServiceState::Idle);

        service.post(Event::Fault("disk full".into()));
        assert!(in_state(&service, ServiceState::Error));
        assert!(matches!(service.stop_tracking(), Err(Error::Rejected(_))));

        let status = service.recover().unwrap();
        assert_eq!(status.state, ServiceState::Idle);
    }

    #[test]
    fn test_reboot_invokes_system_after_delay() {
        let fixture = Fixture::new(true);
        let service = ServiceHandle::start(settings_towards(9), fixture.collaborators()).unwrap();
        assert!(in_state(&service, ServiceState::Idle));

        let status = service.reboot().unwrap();
        assert_eq!(status.state, ServiceState::Idle);
        assert_eq!(fixture.system.reboots.load(Ordering::SeqCst), 0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while fixture.system.reboots.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(fixture.system.reboots.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_auto_discovery_adopts_tracking_service() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = peer.local_addr().unwrap().port();

        let fixture = Fixture::new(false);
        let service = ServiceHandle::start(settings_towards(port), fixture.collaborators()).unwrap();

        let mut buf = [0u8; 16];
        let (len, src) = peer.recv_from(&mut buf).unwrap();
        let query = QueryPacket::parse(&buf[..len]).unwrap();
        assert_eq!(service.state(), ServiceState::AutoDiscovery);

        let reply_to = SocketAddr::new(src.ip(), query.valid_reply_port().unwrap());
        peer.send_to(b"ACK ts1 10.0.0.5 9000 10.0.0.5 9001 N/A", reply_to)
            .unwrap();

        assert!(in_state(&service, ServiceState::Idle));
        let stored = fixture.store.load().unwrap();
        assert_eq!(stored.id, "ts1");
        assert_eq!(stored.control_api_port, 9001);
        assert_eq!(service.status().tracking_service.unwrap().id, "ts1");
    }
}
