//! Session bookkeeping shared by the device- and server-side managers.

use crate::events::{EngineEvent, EventSink};
use crate::metrics;
use crate::transport::now;
use eipua_core::{BackoffPolicy, Session, SessionSide, SessionSnapshot, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Timing knobs common to both sides.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub endpoint: String,
    pub io_timeout: Duration,
    pub health_interval: Duration,
    pub health_failure_threshold: u32,
    pub backoff: BackoffPolicy,
    pub shutdown_timeout: Duration,
}

impl LinkConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            io_timeout: Duration::from_secs(2),
            health_interval: Duration::from_secs(5),
            health_failure_threshold: 3,
            backoff: BackoffPolicy::default(),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Owns one [`Session`] and broadcasts a snapshot after every mutation.
pub(crate) struct Link {
    session: Session,
    health_failures: u32,
    state_tx: watch::Sender<SessionSnapshot>,
    events: Arc<dyn EventSink>,
}

impl Link {
    pub fn new(side: SessionSide, backoff: BackoffPolicy, events: Arc<dyn EventSink>) -> Self {
        let session = Session::new(side, backoff);
        let (state_tx, _) = watch::channel(session.snapshot());
        Self {
            session,
            health_failures: 0,
            state_tx,
            events,
        }
    }

    pub fn side(&self) -> SessionSide {
        self.session.side()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.session.state() == SessionState::Connected
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// When the next connect attempt may run, or `None` while connected.
    pub fn reconnect_at(&self) -> Option<std::time::Instant> {
        if self.is_connected() {
            return None;
        }
        Some(self.session.snapshot().backoff_until.unwrap_or_else(now))
    }

    /// Remaining backoff, if the gate is still closed.
    pub fn gated_for(&self) -> Option<Duration> {
        let now = now();
        if self.session.may_attempt(now) {
            None
        } else {
            self.session
                .snapshot()
                .backoff_until
                .map(|until| until.saturating_duration_since(now))
        }
    }

    pub fn begin_connect(&mut self) {
        metrics::RECONNECT_ATTEMPTS
            .with_label_values(&[self.side().as_str()])
            .inc();
        self.session.begin_connect();
        self.broadcast();
    }

    pub fn connected(&mut self) {
        self.session.mark_connected(now());
        self.health_failures = 0;
        info!(side = self.side().as_str(), "Session connected");
        self.events.record(&EngineEvent::SessionConnected { side: self.side() });
        self.broadcast();
    }

    pub fn success(&mut self) {
        self.session.record_success(now());
        self.broadcast();
    }

    /// A passed health check also clears the health failure streak, which
    /// ordinary traffic does not.
    pub fn health_passed(&mut self) {
        self.health_failures = 0;
        self.success();
    }

    pub fn fault(&mut self, error: &str) {
        let now = now();
        let until = self.session.record_failure(now, rand::random::<f64>());
        let backoff_ms = until.saturating_duration_since(now).as_millis() as u64;
        let consecutive_failures = self.session.consecutive_failures();
        warn!(
            side = self.side().as_str(),
            error = %error,
            consecutive_failures,
            backoff_ms,
            "Session faulted"
        );
        self.events.record(&EngineEvent::SessionFaulted {
            side: self.side(),
            error: error.to_string(),
            consecutive_failures,
            backoff_ms,
        });
        self.broadcast();
    }

    /// Count one failed health check. Returns true when the threshold is hit.
    pub fn health_failed(&mut self, threshold: u32, error: &str) -> bool {
        self.health_failures += 1;
        warn!(
            side = self.side().as_str(),
            error = %error,
            health_failures = self.health_failures,
            threshold,
            "Health check failed"
        );
        self.health_failures >= threshold
    }

    pub fn disconnected(&mut self, clean: bool) {
        self.session.mark_disconnected();
        self.health_failures = 0;
        info!(side = self.side().as_str(), clean, "Session disconnected");
        self.events.record(&EngineEvent::SessionDisconnected {
            side: self.side(),
            clean,
        });
        self.broadcast();
    }

    fn broadcast(&self) {
        let snapshot = self.session.snapshot();
        metrics::set_session_state(self.side(), snapshot.state);
        self.state_tx.send_replace(snapshot);
    }
}
