//! End-to-end discovery tests against a mock peer.
//!
//! Every test runs on loopback: the "multicast" target is the mock peer's
//! (or a listener's) unicast address, so no group is joined.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use discovery_mock_peer::{
    build_ack, parse_query, send_query, Capture, MockDiscoveryPeer, PeerConfig, PeerHandle,
    ScriptedBehavior, ACK_DS, ACK_TS, NAK, TAG_DS, TAG_TS,
};

use body_link::discovery::{CoordinatorEvent, DiscoveryCoordinator};
use body_link::{
    find_data_sources, find_tracking_service, DataSourceListener, DataSourceSeeker,
    DiscoverySettings, LocalIdentity, TrackingServiceListener,
};

// =============================================================================
// Helpers
// =============================================================================

fn settings_towards(target: SocketAddr, duration: Duration) -> DiscoverySettings {
    DiscoverySettings::default()
        .with_local(Ipv4Addr::LOCALHOST, 0)
        .with_multicast(Ipv4Addr::LOCALHOST, target.port())
        .with_polling_interval(Duration::from_millis(100))
        .with_duration(duration)
        .with_receive_timeout(Duration::from_millis(50))
}

fn listener_settings() -> DiscoverySettings {
    DiscoverySettings::default()
        .with_local(Ipv4Addr::LOCALHOST, 0)
        .with_multicast(Ipv4Addr::LOCALHOST, 0)
        .with_receive_timeout(Duration::from_millis(50))
}

fn spawn_peer(behavior: ScriptedBehavior) -> (PeerHandle, Capture) {
    let capture = behavior.capture();
    let peer = MockDiscoveryPeer::new(PeerConfig::default(), behavior).unwrap();
    (peer.spawn(), capture)
}

fn ts_ack(id: &str) -> String {
    build_ack(ACK_TS, id, ("127.0.0.1", 9000), ("127.0.0.1", 9001), "N/A")
}

fn ds_ack(id: &str, data_port: u16) -> String {
    build_ack(ACK_DS, id, ("127.0.0.1", data_port), ("127.0.0.1", data_port + 1), "N/A")
}

// =============================================================================
// Tracking Service lookup
// =============================================================================

#[test]
fn test_first_tracking_service_ends_the_run() {
    let (peer, capture) = spawn_peer(ScriptedBehavior::new().answer(TAG_TS, ts_ack("ts1")));

    let started = Instant::now();
    let found = find_tracking_service(settings_towards(peer.addr, Duration::from_secs(5)))
        .unwrap()
        .expect("tracking service should answer");

    assert_eq!(found.id, "ts1");
    assert_eq!(found.license_id, "N/A");
    assert_eq!(found.control_api_url(), "http://127.0.0.1:9001");
    assert!(started.elapsed() < Duration::from_secs(2));

    // The query the peer saw carries the role tag and a usable reply port
    let (raw, src) = capture.packets()[0].clone();
    let query = parse_query(&raw, src).unwrap();
    assert_eq!(query.tag, TAG_TS);
    assert!(query.reply_addr().is_some());
}

#[test]
fn test_tracking_service_lookup_ignores_nak_and_other_role() {
    let behavior = ScriptedBehavior::new()
        .answer(TAG_TS, NAK)
        .answer(TAG_TS, ds_ack("ds1", 9100))
        .answer(TAG_TS, "ACK truncated");
    let (peer, capture) = spawn_peer(behavior);

    let found =
        find_tracking_service(settings_towards(peer.addr, Duration::from_millis(400))).unwrap();
    assert!(found.is_none());
    assert!(capture.len() >= 3, "peer saw {} queries", capture.len());
}

#[test]
fn test_silent_peer_completes_empty() {
    let behavior = ScriptedBehavior::new().answer(TAG_TS, ts_ack("ts1"));
    let silent = behavior.silent_flag();
    silent.store(true, Ordering::SeqCst);
    let (peer, _capture) = spawn_peer(behavior);

    let started = Instant::now();
    let found =
        find_tracking_service(settings_towards(peer.addr, Duration::from_millis(300))).unwrap();
    assert!(found.is_none());
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[test]
fn test_slow_peer_is_still_found() {
    let behavior = ScriptedBehavior::new()
        .answer(TAG_TS, ts_ack("ts-slow"))
        .with_latency(Duration::from_millis(150));
    let (peer, _capture) = spawn_peer(behavior);

    let found = find_tracking_service(settings_towards(peer.addr, Duration::from_secs(2)))
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "ts-slow");
}

// =============================================================================
// Data Source collection
// =============================================================================

#[test]
fn test_data_sources_collected_once_each() {
    let behavior = ScriptedBehavior::new()
        .answer(TAG_DS, ds_ack("ds1", 9100))
        .answer(TAG_DS, ds_ack("ds2", 9200))
        .answer(TAG_DS, ds_ack("ds1", 9300))
        .answer(TAG_DS, ts_ack("ts1"));
    let (peer, _capture) = spawn_peer(behavior);

    let started = Instant::now();
    let devices =
        find_data_sources(settings_towards(peer.addr, Duration::from_millis(500))).unwrap();

    // The whole window is spent even though replies arrive early
    assert!(started.elapsed() >= Duration::from_millis(500));
    let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["ds1", "ds2"]);
    // First occurrence wins
    assert_eq!(devices[0].data_streamer_port, 9100);
}

#[test]
fn test_seeker_reports_each_device_then_completes() {
    let behavior = ScriptedBehavior::new()
        .answer(TAG_DS, ds_ack("ds1", 9100))
        .answer(TAG_DS, ds_ack("ds2", 9200));
    let (peer, _capture) = spawn_peer(behavior);

    let (tx, rx) = mpsc::channel();
    let mut seeker =
        DataSourceSeeker::new(settings_towards(peer.addr, Duration::from_millis(400)));
    seeker
        .start(std::sync::Arc::new(move |event: CoordinatorEvent| {
            let _ = tx.send(event);
        }))
        .unwrap();

    let mut found = Vec::new();
    let completed = loop {
        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            CoordinatorEvent::DeviceFound(device) => found.push(device.id),
            CoordinatorEvent::Completed(devices) => break devices,
        }
    };
    assert_eq!(found, ["ds1", "ds2"]);
    assert_eq!(completed.len(), 2);
    assert!(!seeker.is_active());
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

// =============================================================================
// Listeners
// =============================================================================

#[test]
fn test_data_source_listener_answers_mock_query() {
    let identity = LocalIdentity::new("ds-7", 9100, 9101)
        .with_endpoint("127.0.0.1")
        .with_license_id("LIC-42");
    let mut listener = DataSourceListener::new(listener_settings(), identity);
    let addr = listener.start().unwrap();

    let lines = send_query(addr, TAG_DS, Duration::from_millis(300)).unwrap();
    assert_eq!(lines, ["ACKDS ds-7 127.0.0.1 9100 127.0.0.1 9101 LIC-42"]);

    let lines = send_query(addr, TAG_TS, Duration::from_millis(200)).unwrap();
    assert!(lines.is_empty());
    assert_eq!(listener.replies_sent(), 1);
}

#[test]
fn test_listener_and_coordinator_find_each_other() {
    let identity = LocalIdentity::new("ts-main", 9000, 9001).with_endpoint("127.0.0.1");
    let mut listener = TrackingServiceListener::new(listener_settings(), identity);
    let addr = listener.start().unwrap();

    let found = find_tracking_service(settings_towards(addr, Duration::from_secs(3)))
        .unwrap()
        .unwrap();
    assert_eq!(found.id, "ts-main");
    assert_eq!(found.data_streamer_port, 9000);
    assert_eq!(found.control_api_port, 9001);

    listener.stop();
    assert!(!listener.is_running());
}
