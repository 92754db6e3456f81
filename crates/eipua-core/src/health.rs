use crate::session::{SessionSnapshot, SessionState, SessionView};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    #[default]
    Init,
    Connecting,
    Running,
    Degraded,
    Reconnecting,
    ShuttingDown,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Init => "INIT",
            EngineState::Connecting => "CONNECTING",
            EngineState::Running => "RUNNING",
            EngineState::Degraded => "DEGRADED",
            EngineState::Reconnecting => "RECONNECTING",
            EngineState::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            EngineState::Init => 0,
            EngineState::Connecting => 1,
            EngineState::Running => 2,
            EngineState::Degraded => 3,
            EngineState::Reconnecting => 4,
            EngineState::ShuttingDown => 5,
        }
    }

    /// Next state given both sessions. Depends on connectivity only.
    ///
    /// INIT and SHUTTING_DOWN are left by the orchestrator itself; this only
    /// moves between the connectivity-driven states.
    pub fn next(self, device: SessionState, server: SessionState) -> EngineState {
        use SessionState::*;
        match self {
            EngineState::Init | EngineState::ShuttingDown => self,
            _ => match (device, server) {
                (Connected, Connected) => EngineState::Running,
                (Connected, _) | (_, Connected) => EngineState::Degraded,
                (d, s) if self == EngineState::Connecting && d != Faulted && s != Faulted => {
                    EngineState::Connecting
                }
                _ => EngineState::Reconnecting,
            },
        }
    }
}

/// Running totals reported alongside the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EngineCounters {
    pub cycles_polled: u64,
    pub cycles_skipped: u64,
    pub cycles_dropped: u64,
    pub points_published: u64,
    pub points_failed: u64,
    pub points_skipped: u64,
}

/// Process-wide health snapshot, replaced wholesale once per cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthStatus {
    pub state: EngineState,
    pub device: SessionSnapshot,
    pub server: SessionSnapshot,
    pub counters: EngineCounters,
    pub updated_at: Instant,
}

impl HealthStatus {
    pub fn initial(now: Instant) -> Self {
        Self {
            state: EngineState::Init,
            device: SessionSnapshot::default(),
            server: SessionSnapshot::default(),
            counters: EngineCounters::default(),
            updated_at: now,
        }
    }

    /// Healthy when RUNNING, or DEGRADED with at least one side connected and
    /// proven alive within `window`. A snapshot that has not been refreshed
    /// within `window` is unhealthy regardless of its state.
    pub fn is_healthy(&self, now: Instant, window: Duration) -> bool {
        if now.saturating_duration_since(self.updated_at) > window {
            return false;
        }
        match self.state {
            EngineState::Running => true,
            EngineState::Degraded => [self.device, self.server]
                .iter()
                .any(|s| s.is_connected() && s.succeeded_within(now, window)),
            _ => false,
        }
    }

    pub fn view(&self, now: Instant, window: Duration) -> HealthView {
        HealthView {
            state: self.state,
            healthy: self.is_healthy(now, window),
            device: self.device.view(now),
            server: self.server.view(now),
            counters: self.counters,
            age_ms: now.saturating_duration_since(self.updated_at).as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthView {
    pub state: EngineState,
    pub healthy: bool,
    pub device: SessionView,
    pub server: SessionView,
    pub counters: EngineCounters,
    pub age_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn connecting_resolves_by_outcome() {
        let s = EngineState::Connecting;
        assert_eq!(s.next(Connected, Connected), EngineState::Running);
        assert_eq!(s.next(Connected, Faulted), EngineState::Degraded);
        assert_eq!(s.next(Connecting, Connecting), EngineState::Connecting);
        assert_eq!(s.next(Faulted, Faulted), EngineState::Reconnecting);
    }

    #[test]
    fn running_degrades_then_reconnects() {
        let s = EngineState::Running.next(Faulted, Connected);
        assert_eq!(s, EngineState::Degraded);
        let s = s.next(Faulted, Faulted);
        assert_eq!(s, EngineState::Reconnecting);
        assert_eq!(s.next(Connecting, Faulted), EngineState::Reconnecting);
        assert_eq!(s.next(Connected, Faulted), EngineState::Degraded);
        assert_eq!(
            EngineState::Degraded.next(Connected, Connected),
            EngineState::Running
        );
    }

    #[test]
    fn shutting_down_is_terminal() {
        assert_eq!(
            EngineState::ShuttingDown.next(Connected, Connected),
            EngineState::ShuttingDown
        );
    }

    fn connected_at(at: Instant) -> SessionSnapshot {
        SessionSnapshot {
            state: Connected,
            last_success_at: Some(at),
            ..Default::default()
        }
    }

    #[test]
    fn degraded_is_healthy_only_with_recent_side() {
        let now = Instant::now();
        let window = Duration::from_secs(15);
        let mut status = HealthStatus::initial(now);
        status.state = EngineState::Degraded;
        assert!(!status.is_healthy(now, window));

        status.server = connected_at(now);
        assert!(status.is_healthy(now, window));
        assert!(!status.is_healthy(now + Duration::from_secs(16), window));
    }

    #[test]
    fn reconnecting_and_init_are_unhealthy() {
        let now = Instant::now();
        let mut status = HealthStatus::initial(now);
        assert!(!status.is_healthy(now, Duration::from_secs(1)));
        status.state = EngineState::Reconnecting;
        status.device = connected_at(now);
        assert!(!status.is_healthy(now, Duration::from_secs(1)));
        status.state = EngineState::Running;
        assert!(status.is_healthy(now, Duration::from_secs(1)));
    }
}
