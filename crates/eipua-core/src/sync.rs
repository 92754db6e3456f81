use crate::health::{HealthStatus, HealthView};
use crate::point::DataPoint;
use arc_swap::ArcSwap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type PointTable = BTreeMap<String, DataPoint>;

/// Single-writer, many-reader exchange between the orchestrator and the
/// read-only consumers (status frontend, health probe).
///
/// Both slots are replaced by pointer swap, so a reader always sees one whole
/// snapshot and never a half-written one.
pub struct StatusExchange {
    health: ArcSwap<HealthStatus>,
    points: ArcSwap<PointTable>,
    health_window: Duration,
}

impl StatusExchange {
    pub fn new(health_window: Duration, now: Instant) -> Self {
        Self {
            health: ArcSwap::from_pointee(HealthStatus::initial(now)),
            points: ArcSwap::from_pointee(PointTable::new()),
            health_window,
        }
    }

    /// Called by the orchestrator once per cycle.
    pub fn publish_state(&self, status: HealthStatus) {
        self.health.store(Arc::new(status));
    }

    pub fn read_state(&self) -> HealthStatus {
        **self.health.load()
    }

    /// Merge the latest points of a cycle into the per-tag table.
    pub fn publish_points(&self, points: &[DataPoint]) {
        if points.is_empty() {
            return;
        }
        self.points.rcu(|current| {
            let mut next = PointTable::clone(current);
            for point in points {
                next.insert(point.tag_name.clone(), point.clone());
            }
            next
        });
    }

    pub fn read_points(&self) -> Arc<PointTable> {
        self.points.load_full()
    }

    pub fn health_window(&self) -> Duration {
        self.health_window
    }

    pub fn is_healthy(&self, now: Instant) -> bool {
        self.read_state().is_healthy(now, self.health_window)
    }

    pub fn view(&self, now: Instant) -> HealthView {
        self.read_state().view(now, self.health_window)
    }
}
