use crate::backoff::BackoffPolicy;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "DISCONNECTED",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Faulted => "FAULTED",
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Faulted => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSide {
    Device,
    Server,
}

impl SessionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSide::Device => "device",
            SessionSide::Server => "server",
        }
    }
}

/// Point-in-time copy of a session, handed to readers that must not mutate it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub last_success_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub backoff_until: Option<Instant>,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// True when the last success happened no earlier than `window` before `now`.
    pub fn succeeded_within(&self, now: Instant, window: Duration) -> bool {
        self.last_success_at
            .is_some_and(|at| now.saturating_duration_since(at) <= window)
    }

    pub fn view(&self, now: Instant) -> SessionView {
        SessionView {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_success_age_ms: self
                .last_success_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            backoff_remaining_ms: self
                .backoff_until
                .map(|until| until.saturating_duration_since(now).as_millis() as u64)
                .filter(|ms| *ms > 0),
        }
    }
}

/// Serializable rendering of a [`SessionSnapshot`] relative to a clock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub state: SessionState,
    pub consecutive_failures: u32,
    pub last_success_age_ms: Option<u64>,
    pub backoff_remaining_ms: Option<u64>,
}

/// Session bookkeeping for one side of the bridge. Owned and mutated only by
/// the manager of that side; everybody else reads [`Session::snapshot`].
#[derive(Debug, Clone)]
pub struct Session {
    side: SessionSide,
    state: SessionState,
    last_success_at: Option<Instant>,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    policy: BackoffPolicy,
}

impl Session {
    pub fn new(side: SessionSide, policy: BackoffPolicy) -> Self {
        Self {
            side,
            state: SessionState::Disconnected,
            last_success_at: None,
            consecutive_failures: 0,
            backoff_until: None,
            policy,
        }
    }

    pub fn side(&self) -> SessionSide {
        self.side
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            last_success_at: self.last_success_at,
            consecutive_failures: self.consecutive_failures,
            backoff_until: self.backoff_until,
        }
    }

    /// Whether the backoff gate allows a connect attempt at `now`.
    pub fn may_attempt(&self, now: Instant) -> bool {
        self.backoff_until.map_or(true, |until| now >= until)
    }

    pub fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
    }

    pub fn mark_connected(&mut self, now: Instant) {
        self.state = SessionState::Connected;
        self.record_success(now);
    }

    /// Any successful exchange resets the failure count and the backoff gate.
    pub fn record_success(&mut self, now: Instant) {
        self.last_success_at = Some(now);
        self.consecutive_failures = 0;
        self.backoff_until = None;
    }

    /// Transition to FAULTED and arm the backoff gate. Returns the instant
    /// before which no reconnect may start.
    pub fn record_failure(&mut self, now: Instant, jitter_sample: f64) -> Instant {
        self.state = SessionState::Faulted;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let until = self
            .policy
            .backoff_until(self.consecutive_failures, now, jitter_sample);
        self.backoff_until = Some(until);
        until
    }

    pub fn mark_disconnected(&mut self) {
        if self.state != SessionState::Faulted {
            self.state = SessionState::Disconnected;
        }
    }
}
