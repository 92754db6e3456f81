//! Tag Poller: one bounded batch read of the whole profile per tick.

use crate::connection::ConnectionManager;
use crate::metrics;
use crate::transport::DeviceTransport;
use eipua_core::{DeviceProfile, PollCycle, SessionState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::debug;

pub struct TagPoller {
    profile: Arc<DeviceProfile>,
    sequence: u64,
}

impl TagPoller {
    pub fn new(profile: Arc<DeviceProfile>) -> Self {
        Self {
            profile,
            sequence: 0,
        }
    }

    pub fn profile(&self) -> &Arc<DeviceProfile> {
        &self.profile
    }

    /// Poll cadence. Ticks missed while a cycle overran are dropped, not
    /// replayed in a burst.
    pub fn interval(&self) -> Interval {
        let period = self.profile.poll_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    /// Deadline for one cycle: never longer than the cadence itself.
    pub fn deadline<T: DeviceTransport>(&self, conn: &ConnectionManager<T>) -> Duration {
        conn.config().io_timeout.min(self.profile.poll_interval())
    }

    /// Read every tag once. Returns `None` without touching the device when
    /// the session is not CONNECTED; the cycle is omitted, not failed.
    ///
    /// The returned cycle records the session state observed after the read,
    /// so a cycle during which the device dropped is recognisable downstream.
    pub async fn poll<T: DeviceTransport>(&mut self, conn: &mut ConnectionManager<T>) -> Option<PollCycle> {
        if !conn.is_connected() {
            return None;
        }

        let deadline = self.deadline(conn);
        let timer = metrics::POLL_DURATION.start_timer();
        let results = conn.read_tags(self.profile.tags(), deadline).await;
        timer.observe_duration();

        self.sequence += 1;
        let cycle = PollCycle {
            sequence: self.sequence,
            session_state: conn.session().state,
            results,
        };

        let failed = cycle.failed_count();
        metrics::POLL_CYCLES.inc();
        metrics::TAG_READ_FAILURES.inc_by(failed as u64);
        debug!(
            sequence = cycle.sequence,
            tags = cycle.results.len(),
            failed,
            session = cycle.session_state.as_str(),
            "Poll cycle complete"
        );
        Some(cycle)
    }

    pub fn is_publishable(cycle: &PollCycle) -> bool {
        cycle.session_state == SessionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::link::LinkConfig;
    use crate::sim::SimDevice;
    use crate::transport::now;
    use eipua_core::{DataKind, TagDescriptor, TimeBase};
    use tokio_util::sync::CancellationToken;

    fn profile() -> Arc<DeviceProfile> {
        Arc::new(
            DeviceProfile::new(
                "10.0.0.5",
                44818,
                vec![
                    TagDescriptor::new("a", "A", DataKind::Int, "ns=2;s=A"),
                    TagDescriptor::new("b", "B", DataKind::Int, "ns=2;s=B"),
                    TagDescriptor::new("c", "C", DataKind::Int, "ns=2;s=C"),
                ],
                500,
            )
            .unwrap(),
        )
    }

    fn manager(device: SimDevice) -> ConnectionManager<SimDevice> {
        ConnectionManager::new(
            device,
            LinkConfig::new("10.0.0.5:44818"),
            TimeBase::anchored(now()),
            Arc::new(NullSink),
            CancellationToken::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn skips_while_disconnected() {
        let device = SimDevice::new();
        let mut conn = manager(device.clone());
        let mut poller = TagPoller::new(profile());

        assert!(poller.poll(&mut conn).await.is_none());
        assert_eq!(device.reads(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn preserves_profile_order_and_numbers_cycles() {
        let device = SimDevice::new();
        let mut conn = manager(device);
        conn.connect().await.unwrap();
        let mut poller = TagPoller::new(profile());

        let first = poller.poll(&mut conn).await.unwrap();
        let second = poller.poll(&mut conn).await.unwrap();
        let names: Vec<&str> = first.results.iter().map(|r| r.tag_name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert!(TagPoller::is_publishable(&first));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_capped_by_cadence() {
        let device = SimDevice::new();
        device.set_max_batch(1);
        device.set_read_delay(Duration::from_millis(200));
        let mut conn = manager(device);
        conn.connect().await.unwrap();
        let mut poller = TagPoller::new(profile());
        assert_eq!(poller.deadline(&conn), Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        let cycle = poller.poll(&mut conn).await.unwrap();
        assert!(started.elapsed() <= Duration::from_millis(500) + conn.config().io_timeout);
        assert_eq!(cycle.failed_count(), 1);
        assert!(!conn.is_connected());
        assert!(!TagPoller::is_publishable(&cycle));
    }

    #[tokio::test(start_paused = true)]
    async fn device_loss_mid_cycle_is_not_publishable() {
        let device = SimDevice::new();
        let mut conn = manager(device.clone());
        conn.connect().await.unwrap();
        device.set_reachable(false);
        let mut poller = TagPoller::new(profile());

        let cycle = poller.poll(&mut conn).await.unwrap();
        assert_eq!(cycle.session_state, SessionState::Faulted);
        assert!(!TagPoller::is_publishable(&cycle));
    }
}
