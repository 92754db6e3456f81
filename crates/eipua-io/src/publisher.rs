//! OPC UA Publisher: owns the server session and the tag-to-node mapping.

use crate::events::{EngineEvent, EventSink};
use crate::link::{Link, LinkConfig};
use crate::metrics;
use crate::transport::{bounded, now, EnsureOutcome, NodeSpec, NodeWrite, ServerTransport};
use eipua_core::{
    DataKind, DataPoint, DeviceProfile, GatewayError, ProtocolError, Quality, SessionSide,
    SessionSnapshot, TimeBase, TransportError, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What to do with BAD points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadQualityPolicy {
    /// Leave the node untouched.
    Skip,
    /// Write a status-only value carrying bad quality.
    #[default]
    Flag,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub link: LinkConfig,
    pub bad_quality: BadQualityPolicy,
    /// Boolean node toggled after every publish batch.
    pub watchdog_node: Option<String>,
}

impl PublisherConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            link: LinkConfig::new(endpoint),
            bad_quality: BadQualityPolicy::default(),
            watchdog_node: None,
        }
    }
}

/// Per-batch result. Node-level failures are listed, not raised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOutcome {
    pub written: usize,
    pub failed: usize,
    pub skipped: usize,
    pub node_errors: Vec<ProtocolError>,
    /// Whether the watchdog toggle landed; `None` when no watchdog is configured.
    pub watchdog: Option<bool>,
}

impl PublishOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }
}

pub struct OpcUaPublisher<S: ServerTransport> {
    transport: S,
    config: PublisherConfig,
    link: Link,
    timebase: TimeBase,
    cancel: CancellationToken,
    nodes: Vec<NodeSpec>,
    node_for_tag: HashMap<String, String>,
    validated: HashSet<String>,
    watchdog_level: bool,
}

impl<S: ServerTransport> OpcUaPublisher<S> {
    pub fn new(
        transport: S,
        config: PublisherConfig,
        profile: &DeviceProfile,
        timebase: TimeBase,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let mut nodes: Vec<NodeSpec> = profile
            .tags()
            .iter()
            .map(|tag| NodeSpec {
                node_id: tag.opc_node_id.clone(),
                browse_name: tag.name.clone(),
                kind: tag.published_kind(),
            })
            .collect();
        let node_for_tag = profile
            .tags()
            .iter()
            .map(|tag| (tag.name.clone(), tag.opc_node_id.clone()))
            .collect();
        if let Some(watchdog) = &config.watchdog_node {
            nodes.push(NodeSpec {
                node_id: watchdog.clone(),
                browse_name: "WATCHDOG".to_string(),
                kind: DataKind::Bool,
            });
        }

        let link = Link::new(SessionSide::Server, config.link.backoff, events);
        Self {
            transport,
            config,
            link,
            timebase,
            cancel,
            nodes,
            node_for_tag,
            validated: HashSet::new(),
            watchdog_level: false,
        }
    }

    pub fn session(&self) -> SessionSnapshot {
        self.link.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.link.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn reconnect_at(&self) -> Option<std::time::Instant> {
        self.link.reconnect_at()
    }

    pub fn node_specs(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn is_validated(&self, node_id: &str) -> bool {
        self.validated.contains(node_id)
    }

    /// Connect and re-validate every node before the first publish.
    pub async fn connect(&mut self) -> Result<SessionSnapshot, GatewayError> {
        if self.link.is_connected() {
            return Ok(self.link.snapshot());
        }
        if let Some(remaining) = self.link.gated_for() {
            return Err(TransportError::BackingOff { remaining }.into());
        }

        self.link.begin_connect();
        info!(endpoint = %self.config.link.endpoint, "Connecting to OPC UA server");
        let result = bounded(
            &self.cancel,
            "server connect",
            self.config.link.io_timeout,
            self.transport.connect(&self.config.link.endpoint),
        )
        .await;

        match result {
            Ok(()) => {
                self.validated.clear();
                self.link.connected();
            }
            Err(GatewayError::Cancelled) => {
                self.link.disconnected(false);
                return Err(GatewayError::Cancelled);
            }
            Err(e) => {
                self.link.fault(&e.to_string());
                return Err(e);
            }
        }

        self.validate_nodes().await?;
        Ok(self.link.snapshot())
    }

    /// Ensure every node not yet validated in this session exists on the
    /// server, creating the missing ones. Idempotent per node id.
    pub async fn validate_nodes(&mut self) -> Result<(), GatewayError> {
        let pending: Vec<NodeSpec> = self
            .nodes
            .iter()
            .filter(|n| !self.validated.contains(&n.node_id))
            .cloned()
            .collect();
        if pending.is_empty() {
            return Ok(());
        }

        let result = bounded(
            &self.cancel,
            "node validation",
            self.config.link.io_timeout,
            self.transport.ensure_nodes(&pending),
        )
        .await;
        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => return Err(self.session_failed(e).await),
        };

        let (mut existing, mut created, mut failed) = (0, 0, 0);
        for (node, outcome) in pending.iter().zip(outcomes.into_iter()) {
            match outcome {
                Ok(EnsureOutcome::Existing) => existing += 1,
                Ok(EnsureOutcome::Created) => created += 1,
                Err(e) => {
                    warn!(node_id = %node.node_id, error = %e, "Node validation failed");
                    failed += 1;
                    continue;
                }
            }
            self.validated.insert(node.node_id.clone());
        }
        info!(existing, created, failed, "Nodes validated");
        self.link.events().record(&EngineEvent::NodesValidated {
            existing,
            created,
            failed,
        });
        self.link.success();
        Ok(())
    }

    /// Write one cycle's points with their own timestamps, then toggle the
    /// watchdog. Node-level errors are reported in the outcome; only a lost
    /// session is an `Err`.
    pub async fn publish(&mut self, points: &[DataPoint]) -> Result<PublishOutcome, GatewayError> {
        if !self.link.is_connected() {
            return Err(TransportError::NotConnected.into());
        }
        if self.validated.len() < self.nodes.len() {
            self.validate_nodes().await?;
        }

        let mut outcome = PublishOutcome::default();
        let mut writes = Vec::with_capacity(points.len() + 1);
        for point in points {
            let Some(node_id) = self.node_for_tag.get(&point.tag_name) else {
                warn!(tag = %point.tag_name, "No node mapped for tag");
                outcome.failed += 1;
                outcome
                    .node_errors
                    .push(ProtocolError::new(&point.tag_name, "no node mapped for tag"));
                continue;
            };
            if !self.validated.contains(node_id) {
                outcome.failed += 1;
                outcome
                    .node_errors
                    .push(ProtocolError::new(node_id, "node not validated"));
                continue;
            }
            match (point.quality, &point.value) {
                (Quality::Bad, _) if self.config.bad_quality == BadQualityPolicy::Skip => {
                    outcome.skipped += 1;
                }
                (Quality::Bad, _) => writes.push(NodeWrite {
                    node_id: node_id.clone(),
                    value: None,
                    quality: Quality::Bad,
                    source_timestamp_us: point.timestamp_us,
                }),
                (quality, Some(value)) => writes.push(NodeWrite {
                    node_id: node_id.clone(),
                    value: Some(value.clone()),
                    quality,
                    source_timestamp_us: point.timestamp_us,
                }),
                (quality, None) => {
                    warn!(tag = %point.tag_name, quality = quality.as_str(), "Point without value dropped");
                    outcome.skipped += 1;
                }
            }
        }

        let watchdog = self
            .config
            .watchdog_node
            .clone()
            .filter(|node_id| self.validated.contains(node_id));
        if let Some(node_id) = &watchdog {
            writes.push(NodeWrite {
                node_id: node_id.clone(),
                value: Some(Value::Bool(!self.watchdog_level)),
                quality: Quality::Good,
                source_timestamp_us: self.timebase.unix_us_at(now()),
            });
        }
        if writes.is_empty() {
            return Ok(outcome);
        }

        let result = bounded(
            &self.cancel,
            "node write",
            self.config.link.io_timeout,
            self.transport.write(&writes),
        )
        .await;
        let statuses = match result {
            Ok(statuses) => statuses,
            Err(e) => return Err(self.session_failed(e).await),
        };

        for (write, status) in writes.iter().zip(statuses.into_iter()) {
            let is_watchdog = watchdog.as_deref() == Some(write.node_id.as_str());
            match status {
                Ok(()) if is_watchdog => {
                    self.watchdog_level = !self.watchdog_level;
                    outcome.watchdog = Some(true);
                }
                Ok(()) => outcome.written += 1,
                Err(e) => {
                    warn!(node_id = %write.node_id, error = %e, "Node write failed");
                    // Re-check the node before the next publish in case the
                    // server dropped it.
                    self.validated.remove(&write.node_id);
                    if is_watchdog {
                        outcome.watchdog = Some(false);
                    }
                    outcome.failed += 1;
                    outcome.node_errors.push(e);
                }
            }
        }
        self.link.success();

        metrics::POINTS_PUBLISHED.inc_by(outcome.written as u64);
        metrics::POINTS_FAILED.inc_by(outcome.failed as u64);
        metrics::POINTS_SKIPPED.inc_by(outcome.skipped as u64);
        debug!(
            written = outcome.written,
            failed = outcome.failed,
            skipped = outcome.skipped,
            "Publish batch complete"
        );
        Ok(outcome)
    }

    pub async fn health_check(&mut self) -> bool {
        if !self.link.is_connected() {
            return false;
        }
        let result = bounded(
            &self.cancel,
            "server ping",
            self.config.link.io_timeout,
            self.transport.ping(),
        )
        .await;
        match result {
            Ok(()) => {
                self.link.health_passed();
                true
            }
            Err(GatewayError::Cancelled) => false,
            Err(e) => {
                let error = e.to_string();
                if self
                    .link
                    .health_failed(self.config.link.health_failure_threshold, &error)
                {
                    self.link.fault(&error);
                    self.release().await;
                }
                false
            }
        }
    }

    /// Close the session, bounded by the shutdown timeout.
    pub async fn disconnect(&mut self) {
        let timeout = self.config.link.shutdown_timeout;
        let clean = matches!(
            tokio::time::timeout(timeout, self.transport.disconnect()).await,
            Ok(Ok(()))
        );
        if !clean {
            warn!(timeout_ms = timeout.as_millis() as u64, "Server disconnect did not complete; releasing");
        }
        self.validated.clear();
        self.link.disconnected(clean);
    }

    async fn session_failed(&mut self, error: GatewayError) -> GatewayError {
        if !matches!(error, GatewayError::Cancelled) {
            self.link.fault(&error.to_string());
            self.release().await;
        }
        error
    }

    async fn release(&mut self) {
        let _ = tokio::time::timeout(self.config.link.io_timeout, self.transport.disconnect()).await;
        self.validated.clear();
        self.link.disconnected(false);
    }
}
