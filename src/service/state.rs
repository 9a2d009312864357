//! The lifecycle transition function.
//!
//! ```text
//! NotStarted --Boot--> Starting --Resolve--> Idle            (Tracking Service known)
//!                                        \-> AutoDiscovery   (none known)
//! AutoDiscovery --DeviceDiscovered/DiscoveryExhausted--> (wait) --Restart--> Starting
//! Idle --StartTracking--> Running --StreamingFailed--> Idle
//! Idle|Running --StopTracking--> Stopped --Settle--> Idle
//! any --Reboot--> Stopped (+ host reboot after a delay)
//! any --Fault--> Error --Recover--> Starting
//! ```

use std::time::Duration;

use super::{ServiceState, TrackingSessionConfig};
use crate::types::DeviceInfo;

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Leave `NotStarted`.
    Boot,
    /// Decide where `Starting` leads.
    Resolve,
    EnableAutoDiscovery,
    StartTracking(TrackingSessionConfig),
    StopTracking,
    Reboot,
    /// The Tracking Service search found a device.
    DeviceDiscovered(DeviceInfo),
    /// The Tracking Service search ended empty.
    DiscoveryExhausted,
    /// A settle or retry wait in `AutoDiscovery` elapsed.
    Restart,
    StreamingStarted,
    StreamingFailed(String),
    /// Leave `Stopped`.
    Settle,
    /// Unrecoverable lifecycle fault.
    Fault(String),
    /// Operator re-drive out of `Error`.
    Recover,
    RebootElapsed,
}

impl Event {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Boot => "boot",
            Event::Resolve => "resolve",
            Event::EnableAutoDiscovery => "enable-auto-discovery",
            Event::StartTracking(_) => "start-tracking",
            Event::StopTracking => "stop-tracking",
            Event::Reboot => "reboot",
            Event::DeviceDiscovered(_) => "device-discovered",
            Event::DiscoveryExhausted => "discovery-exhausted",
            Event::Restart => "restart",
            Event::StreamingStarted => "streaming-started",
            Event::StreamingFailed(_) => "streaming-failed",
            Event::Settle => "settle",
            Event::Fault(_) => "fault",
            Event::Recover => "recover",
            Event::RebootElapsed => "reboot-elapsed",
        }
    }
}

/// Side effects, applied in order after the state is updated.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Publish the status snapshot.
    EmitStatus,
    StartMonitor,
    StopMonitor,
    StartDiscovery,
    StopDiscovery,
    PersistTrackingService(DeviceInfo),
    /// Deliver `event` after `after`.
    Schedule { after: Duration, event: Event },
    /// Start streaming; the driver answers with `StreamingStarted` or
    /// `StreamingFailed`.
    StartStreaming(TrackingSessionConfig),
    StopStreaming,
    /// Deliver `event` right after this transition.
    Follow(Event),
    /// Log and record a lifecycle fault in the status.
    ReportError(String),
    RebootSystem,
}

/// Result of feeding one event to the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Enter `target`, then apply `effects`.
    Transition {
        target: ServiceState,
        effects: Vec<Effect>,
    },
    /// Keep the state, apply `effects`.
    Stay { effects: Vec<Effect> },
    /// Nothing to do: the request is already satisfied or the event is stale.
    Ignored,
    /// The event is not allowed in this state.
    Rejected(String),
}

impl Outcome {
    fn to(target: ServiceState, effects: Vec<Effect>) -> Self {
        Outcome::Transition { target, effects }
    }

    fn reject(state: ServiceState, event: &Event) -> Self {
        Outcome::Rejected(format!("{} is not allowed in state {}", event.name(), state))
    }

    pub fn effects(&self) -> &[Effect] {
        match self {
            Outcome::Transition { effects, .. } | Outcome::Stay { effects } => effects,
            Outcome::Ignored | Outcome::Rejected(_) => &[],
        }
    }
}

/// What the transition function may know beyond the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct Context {
    pub tracking_service_configured: bool,
    pub settle_delay: Duration,
    pub repeat_interval: Duration,
    pub reboot_delay: Duration,
}

/// Effects that wind down whatever `state` has running.
fn leave(state: ServiceState) -> Vec<Effect> {
    match state {
        ServiceState::Running => vec![Effect::StopStreaming],
        ServiceState::AutoDiscovery => vec![Effect::StopDiscovery],
        _ => Vec::new(),
    }
}

/// The lifecycle policy.
pub fn transition(state: ServiceState, ctx: &Context, event: Event) -> Outcome {
    use Effect::*;
    use ServiceState as S;

    match (state, event) {
        (S::NotStarted, Event::Boot) => Outcome::to(S::Starting, vec![EmitStatus, Follow(Event::Resolve)]),
        (_, Event::Boot) => Outcome::Ignored,

        (S::Starting, Event::Resolve) => {
            if ctx.tracking_service_configured {
                Outcome::to(S::Idle, vec![StartMonitor, EmitStatus])
            } else {
                Outcome::to(S::AutoDiscovery, vec![StopMonitor, EmitStatus, StartDiscovery])
            }
        }
        (_, Event::Resolve) => Outcome::Ignored,

        (S::AutoDiscovery, Event::EnableAutoDiscovery) => Outcome::Ignored,
        (S::Idle | S::Running | S::Stopped, Event::EnableAutoDiscovery) => {
            let mut effects = leave(state);
            effects.extend([StopMonitor, EmitStatus, StartDiscovery]);
            Outcome::to(S::AutoDiscovery, effects)
        }
        (_, event @ Event::EnableAutoDiscovery) => Outcome::reject(state, &event),

        (S::AutoDiscovery, Event::DeviceDiscovered(device)) => Outcome::Stay {
            effects: vec![
                StopDiscovery,
                PersistTrackingService(device),
                Schedule {
                    after: ctx.settle_delay,
                    event: Event::Restart,
                },
            ],
        },
        (S::AutoDiscovery, Event::DiscoveryExhausted) => Outcome::Stay {
            effects: vec![
                StopDiscovery,
                Schedule {
                    after: ctx.repeat_interval,
                    event: Event::Restart,
                },
            ],
        },
        (_, Event::DeviceDiscovered(_) | Event::DiscoveryExhausted) => Outcome::Ignored,

        (S::AutoDiscovery, Event::Restart) => {
            Outcome::to(S::Starting, vec![EmitStatus, Follow(Event::Resolve)])
        }
        (_, Event::Restart) => Outcome::Ignored,

        (S::Idle, Event::StartTracking(config)) => {
            Outcome::to(S::Running, vec![StartStreaming(config)])
        }
        (S::Running, Event::StartTracking(_)) => Outcome::Ignored,
        (_, event @ Event::StartTracking(_)) => Outcome::reject(state, &event),

        (S::Running, Event::StreamingStarted) => Outcome::Stay {
            effects: vec![EmitStatus],
        },
        (S::Running, Event::StreamingFailed(reason)) => Outcome::to(
            S::Idle,
            vec![
                ReportError(format!("streaming subsystem failed to start: {}", reason)),
                EmitStatus,
            ],
        ),
        (_, Event::StreamingStarted | Event::StreamingFailed(_)) => Outcome::Ignored,

        (S::Idle | S::Running, Event::StopTracking) => {
            let mut effects = leave(state);
            effects.extend([EmitStatus, Follow(Event::Settle)]);
            Outcome::to(S::Stopped, effects)
        }
        (S::Stopped, Event::StopTracking) => Outcome::Ignored,
        (_, event @ Event::StopTracking) => Outcome::reject(state, &event),

        (S::Stopped, Event::Settle) => Outcome::to(S::Idle, vec![EmitStatus]),
        (_, Event::Settle) => Outcome::Ignored,

        (_, Event::Reboot) => {
            let mut effects = leave(state);
            effects.push(Schedule {
                after: ctx.reboot_delay,
                event: Event::RebootElapsed,
            });
            if state == S::Stopped {
                Outcome::Stay { effects }
            } else {
                effects.extend([EmitStatus, Follow(Event::Settle)]);
                Outcome::to(S::Stopped, effects)
            }
        }
        (_, Event::RebootElapsed) => Outcome::Stay {
            effects: vec![RebootSystem],
        },

        (S::Error, Event::Fault(_)) => Outcome::Ignored,
        (_, Event::Fault(reason)) => {
            let mut effects = leave(state);
            effects.extend([StopMonitor, ReportError(reason), EmitStatus]);
            Outcome::to(S::Error, effects)
        }

        (S::Error, Event::Recover) => {
            Outcome::to(S::Starting, vec![EmitStatus, Follow(Event::Resolve)])
        }
        (_, Event::Recover) => Outcome::Ignored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServiceState as S;

    fn ctx(configured: bool) -> Context {
        Context {
            tracking_service_configured: configured,
            settle_delay: Duration::from_secs(2),
            repeat_interval: Duration::from_secs(30),
            reboot_delay: Duration::from_secs(5),
        }
    }

    fn target(outcome: &Outcome) -> Option<ServiceState> {
        match outcome {
            Outcome::Transition { target, .. } => Some(*target),
            _ => None,
        }
    }

    fn ts1() -> DeviceInfo {
        DeviceInfo::new("ts1", "N/A", ("10.0.0.5", 9000), ("10.0.0.5", 9001))
    }

    #[test]
    fn test_boot_resolves_by_configuration() {
        let boot = transition(S::NotStarted, &ctx(false), Event::Boot);
        assert_eq!(target(&boot), Some(S::Starting));
        assert!(boot.effects().contains(&Effect::Follow(Event::Resolve)));

        let unconfigured = transition(S::Starting, &ctx(false), Event::Resolve);
        assert_eq!(target(&unconfigured), Some(S::AutoDiscovery));
        assert!(unconfigured.effects().contains(&Effect::StartDiscovery));

        let configured = transition(S::Starting, &ctx(true), Event::Resolve);
        assert_eq!(target(&configured), Some(S::Idle));
        assert_eq!(configured.effects()[0], Effect::StartMonitor);
    }

    #[test]
    fn test_found_device_settles_then_restarts() {
        let found = transition(S::AutoDiscovery, &ctx(false), Event::DeviceDiscovered(ts1()));
        assert_eq!(
            found.effects(),
            [
                Effect::StopDiscovery,
                Effect::PersistTrackingService(ts1()),
                Effect::Schedule {
                    after: Duration::from_secs(2),
                    event: Event::Restart
                },
            ]
        );

        let restart = transition(S::AutoDiscovery, &ctx(true), Event::Restart);
        assert_eq!(target(&restart), Some(S::Starting));
        let resolved = transition(S::Starting, &ctx(true), Event::Resolve);
        assert_eq!(target(&resolved), Some(S::Idle));
    }

    #[test]
    fn test_exhausted_discovery_retries_after_repeat_interval() {
        let exhausted = transition(S::AutoDiscovery, &ctx(false), Event::DiscoveryExhausted);
        assert!(matches!(exhausted, Outcome::Stay { .. }));
        assert!(exhausted.effects().contains(&Effect::Schedule {
            after: Duration::from_secs(30),
            event: Event::Restart
        }));
    }

    #[test]
    fn test_stale_discovery_events_are_ignored() {
        for state in [S::Idle, S::Running, S::Starting, S::Error] {
            assert_eq!(
                transition(state, &ctx(true), Event::DeviceDiscovered(ts1())),
                Outcome::Ignored
            );
            assert_eq!(transition(state, &ctx(true), Event::Restart), Outcome::Ignored);
        }
    }

    #[test]
    fn test_start_tracking_only_from_idle() {
        let config = TrackingSessionConfig::new("s1");
        let start = transition(S::Idle, &ctx(true), Event::StartTracking(config.clone()));
        assert_eq!(target(&start), Some(S::Running));
        assert_eq!(start.effects(), [Effect::StartStreaming(config.clone())]);

        assert_eq!(
            transition(S::Running, &ctx(true), Event::StartTracking(config.clone())),
            Outcome::Ignored
        );
        for state in [S::NotStarted, S::AutoDiscovery, S::Stopped, S::Error] {
            assert!(matches!(
                transition(state, &ctx(true), Event::StartTracking(config.clone())),
                Outcome::Rejected(_)
            ));
        }
    }

    #[test]
    fn test_streaming_failure_falls_back_to_idle() {
        let failed = transition(S::Running, &ctx(true), Event::StreamingFailed("no sensor".into()));
        assert_eq!(target(&failed), Some(S::Idle));
        assert!(matches!(failed.effects()[0], Effect::ReportError(_)));
    }

    #[test]
    fn test_stop_tracking_cascades_to_idle() {
        let from_running = transition(S::Running, &ctx(true), Event::StopTracking);
        assert_eq!(target(&from_running), Some(S::Stopped));
        assert_eq!(from_running.effects()[0], Effect::StopStreaming);
        assert!(from_running.effects().contains(&Effect::Follow(Event::Settle)));

        let from_idle = transition(S::Idle, &ctx(true), Event::StopTracking);
        assert!(!from_idle.effects().contains(&Effect::StopStreaming));

        let settled = transition(S::Stopped, &ctx(true), Event::Settle);
        assert_eq!(target(&settled), Some(S::Idle));
    }

    #[test]
    fn test_reboot_from_any_state_schedules_host_reboot() {
        for state in [S::Idle, S::Running, S::AutoDiscovery, S::Error] {
            let outcome = transition(state, &ctx(true), Event::Reboot);
            assert_eq!(target(&outcome), Some(S::Stopped));
            assert!(outcome.effects().contains(&Effect::Schedule {
                after: Duration::from_secs(5),
                event: Event::RebootElapsed
            }));
        }
        let elapsed = transition(S::Idle, &ctx(true), Event::RebootElapsed);
        assert_eq!(elapsed.effects(), [Effect::RebootSystem]);
    }

    #[test]
    fn test_fault_and_recover() {
        let fault = transition(S::AutoDiscovery, &ctx(false), Event::Fault("bind".into()));
        assert_eq!(target(&fault), Some(S::Error));
        assert_eq!(fault.effects()[0], Effect::StopDiscovery);

        assert_eq!(
            transition(S::Error, &ctx(false), Event::Fault("again".into())),
            Outcome::Ignored
        );
        assert!(matches!(
            transition(S::Error, &ctx(false), Event::EnableAutoDiscovery),
            Outcome::Rejected(_)
        ));
        let recover = transition(S::Error, &ctx(false), Event::Recover);
        assert_eq!(target(&recover), Some(S::Starting));
        assert_eq!(transition(S::Idle, &ctx(false), Event::Recover), Outcome::Ignored);
    }

    #[test]
    fn test_enable_auto_discovery_winds_down_current_work() {
        let outcome = transition(S::Running, &ctx(true), Event::EnableAutoDiscovery);
        assert_eq!(target(&outcome), Some(S::AutoDiscovery));
        assert_eq!(outcome.effects()[0], Effect::StopStreaming);
        assert_eq!(
            transition(S::AutoDiscovery, &ctx(true), Event::EnableAutoDiscovery),
            Outcome::Ignored
        );
    }
}
