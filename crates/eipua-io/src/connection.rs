//! Device-side Connection Manager: owns the CIP session.

use crate::events::EventSink;
use crate::link::{Link, LinkConfig};
use crate::transport::{bounded, now, DeviceTransport};
use eipua_core::{
    GatewayError, ReadErrorKind, ReadResult, SessionSide, SessionSnapshot, TagDescriptor, TimeBase,
    TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ConnectionManager<T: DeviceTransport> {
    transport: T,
    config: LinkConfig,
    link: Link,
    timebase: TimeBase,
    cancel: CancellationToken,
}

impl<T: DeviceTransport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        config: LinkConfig,
        timebase: TimeBase,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let link = Link::new(SessionSide::Device, config.backoff, events);
        Self {
            transport,
            config,
            link,
            timebase,
            cancel,
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

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn reconnect_at(&self) -> Option<std::time::Instant> {
        self.link.reconnect_at()
    }

    /// Establish the session. A no-op while already connected; refused while
    /// the backoff gate is closed.
    pub async fn connect(&mut self) -> Result<SessionSnapshot, GatewayError> {
        if self.link.is_connected() {
            return Ok(self.link.snapshot());
        }
        if let Some(remaining) = self.link.gated_for() {
            return Err(TransportError::BackingOff { remaining }.into());
        }

        self.link.begin_connect();
        info!(endpoint = %self.config.endpoint, "Connecting to device");
        let result = bounded(
            &self.cancel,
            "device connect",
            self.config.io_timeout,
            self.transport.connect(&self.config.endpoint),
        )
        .await;

        match result {
            Ok(()) => {
                self.link.connected();
                Ok(self.link.snapshot())
            }
            Err(GatewayError::Cancelled) => {
                self.link.disconnected(false);
                Err(GatewayError::Cancelled)
            }
            Err(e) => {
                self.link.fault(&e.to_string());
                Err(e)
            }
        }
    }

    /// Read `tags` in transport-sized batches within `budget`. Tags not read
    /// before the budget runs out come back as timeouts. A transport failure,
    /// or a batch cut off mid-request by the deadline, faults and drops the
    /// session; per-tag protocol errors never do.
    pub async fn read_tags(&mut self, tags: &[TagDescriptor], budget: Duration) -> Vec<ReadResult> {
        let started = now();
        let stamp = |tb: &TimeBase| tb.unix_us_at(now());

        if !self.link.is_connected() {
            let ts = stamp(&self.timebase);
            return tags
                .iter()
                .map(|t| ReadResult::failure(&t.name, ReadErrorKind::NotConnected, ts))
                .collect();
        }

        let batch = self.transport.max_batch().max(1);
        let mut results = Vec::with_capacity(tags.len());

        for chunk in tags.chunks(batch) {
            let remaining = budget.saturating_sub(now().saturating_duration_since(started));
            let paths: Vec<String> = chunk.iter().map(|t| t.device_address_path.clone()).collect();
            let in_flight = !remaining.is_zero();
            let outcome = if !in_flight {
                Err(GatewayError::Transport(TransportError::Timeout {
                    op: "device read",
                    after: budget,
                }))
            } else {
                bounded(
                    &self.cancel,
                    "device read",
                    remaining,
                    self.transport.read_batch(&paths),
                )
                .await
            };
            let ts = stamp(&self.timebase);

            match outcome {
                Ok(values) => {
                    let mut values = values.into_iter();
                    for tag in chunk {
                        match values.next() {
                            Some(Ok(value)) => results.push(ReadResult::success(&tag.name, value, ts)),
                            Some(Err(e)) => {
                                debug!(tag = %tag.name, path = %tag.device_address_path, error = %e, "Tag read failed");
                                let kind = if e.unsupported {
                                    ReadErrorKind::Unsupported
                                } else {
                                    ReadErrorKind::Protocol
                                };
                                results.push(ReadResult::failure(&tag.name, kind, ts));
                            }
                            None => {
                                results.push(ReadResult::failure(&tag.name, ReadErrorKind::Protocol, ts))
                            }
                        }
                    }
                    self.link.success();
                }
                Err(e @ GatewayError::Transport(TransportError::Timeout { .. })) => {
                    warn!(
                        pending = tags.len() - results.len(),
                        budget_ms = budget.as_millis() as u64,
                        in_flight,
                        "Poll deadline exceeded"
                    );
                    // An abandoned request leaves its reply on the wire; the
                    // stream cannot be reused.
                    if in_flight {
                        self.link.fault(&e.to_string());
                        self.release().await;
                    }
                    fail_rest(&mut results, tags, ReadErrorKind::Timeout, ts);
                    break;
                }
                Err(GatewayError::Cancelled) => {
                    fail_rest(&mut results, tags, ReadErrorKind::NotConnected, ts);
                    break;
                }
                Err(e) => {
                    self.link.fault(&e.to_string());
                    self.release().await;
                    fail_rest(&mut results, tags, ReadErrorKind::Transport, ts);
                    break;
                }
            }
        }
        results
    }

    /// One lightweight liveness read. The third consecutive failure faults
    /// the session and drops it; reconnect then waits for the backoff gate.
    pub async fn health_check(&mut self) -> bool {
        if !self.link.is_connected() {
            return false;
        }
        let result = bounded(
            &self.cancel,
            "device heartbeat",
            self.config.io_timeout,
            self.transport.heartbeat(),
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
                    .health_failed(self.config.health_failure_threshold, &error)
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
        let timeout = self.config.shutdown_timeout;
        let clean = matches!(
            tokio::time::timeout(timeout, self.transport.disconnect()).await,
            Ok(Ok(()))
        );
        if !clean {
            warn!(timeout_ms = timeout.as_millis() as u64, "Device disconnect did not complete; releasing");
        }
        self.link.disconnected(clean);
    }

    async fn release(&mut self) {
        let _ = tokio::time::timeout(self.config.io_timeout, self.transport.disconnect()).await;
        self.link.disconnected(false);
    }
}

fn fail_rest(results: &mut Vec<ReadResult>, tags: &[TagDescriptor], kind: ReadErrorKind, ts: u64) {
    for tag in &tags[results.len()..] {
        results.push(ReadResult::failure(&tag.name, kind, ts));
    }
}
