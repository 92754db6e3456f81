//! The engine state machine and its task wiring.
//!
//! Three tasks run per device:
//! - the device task owns the [`ConnectionManager`], the [`TagPoller`] and the
//!   [`Translator`]; it reconnects, health-checks and polls;
//! - the server task owns the [`OpcUaPublisher`]; it reconnects,
//!   health-checks and publishes what the device task hands it;
//! - the supervisor (the caller of [`Orchestrator::run`]) only reads session
//!   snapshots from both, derives the [`EngineState`] and publishes the
//!   [`HealthStatus`].
//!
//! A single permit travels with each cycle from read to publish. A poll tick
//! that finds it taken is skipped, so cycles never queue behind a slow server.

use crate::connection::ConnectionManager;
use crate::events::{EngineEvent, EventSink};
use crate::link::LinkConfig;
use crate::metrics;
use crate::poller::TagPoller;
use crate::publisher::{OpcUaPublisher, PublishOutcome, PublisherConfig};
use crate::transport::{now, DeviceTransport, ServerTransport};
use eipua_core::{
    ConfigError, DataPoint, DeviceProfile, EngineCounters, EngineState, GatewayError,
    HealthStatus, SessionSnapshot, StaleMode, StalenessPolicy, StatusExchange, TimeBase,
    Translator,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Device-side timing; the endpoint is taken from the profile.
    pub device: LinkConfig,
    pub publisher: PublisherConfig,
    pub stale_mode: StaleMode,
    /// Defaults to three poll intervals.
    pub stale_threshold: Option<Duration>,
    /// Defaults to three health intervals.
    pub health_window: Option<Duration>,
}

impl EngineConfig {
    pub fn new(opcua_endpoint: impl Into<String>) -> Self {
        Self {
            device: LinkConfig::default(),
            publisher: PublisherConfig::new(opcua_endpoint),
            stale_mode: StaleMode::default(),
            stale_threshold: None,
            health_window: None,
        }
    }

    pub fn health_window(&self) -> Duration {
        self.health_window
            .unwrap_or(self.device.health_interval * 3)
    }

    fn staleness(&self, profile: &DeviceProfile) -> StalenessPolicy {
        match self.stale_threshold {
            Some(threshold) => StalenessPolicy {
                mode: self.stale_mode,
                threshold,
            },
            None => StalenessPolicy::for_poll_interval(self.stale_mode, profile.poll_interval()),
        }
    }
}

/// Accepts `opc.tcp://host[:port][/path]`.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    let invalid = || ConfigError::Endpoint(endpoint.to_string());
    let rest = endpoint.strip_prefix("opc.tcp://").ok_or_else(invalid)?;
    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (authority, None),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    if let Some(port) = port {
        port.parse::<u16>().map_err(|_| invalid())?;
    }
    Ok(())
}

/// INIT: load the device profile. Any failure here is a configuration error
/// and is never retried.
pub fn load_profile(path: &std::path::Path) -> Result<DeviceProfile, GatewayError> {
    match DeviceProfile::load(path) {
        Ok(profile) => Ok(profile),
        Err(e) => {
            error!(path = %path.display(), error = %e, "Device profile rejected");
            Err(e.into())
        }
    }
}

struct PublishJob {
    sequence: u64,
    points: Vec<DataPoint>,
    _permit: OwnedSemaphorePermit,
}

enum Report {
    Polled,
    Skipped { sequence: u64 },
    Dropped { sequence: u64, reason: &'static str },
    Published { sequence: u64, outcome: PublishOutcome },
}

pub struct Orchestrator<D, S>
where
    D: DeviceTransport + 'static,
    S: ServerTransport + 'static,
{
    profile: Arc<DeviceProfile>,
    config: EngineConfig,
    device: D,
    server: S,
    exchange: Arc<StatusExchange>,
    events: Arc<dyn EventSink>,
    cancel: CancellationToken,
}

impl<D, S> Orchestrator<D, S>
where
    D: DeviceTransport + 'static,
    S: ServerTransport + 'static,
{
    /// Build an engine for a loaded profile. Rejects a bad OPC UA endpoint.
    pub fn new(
        profile: DeviceProfile,
        mut config: EngineConfig,
        device: D,
        server: S,
        events: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<Self, GatewayError> {
        validate_endpoint(&config.publisher.link.endpoint)?;
        config.device.endpoint = profile.endpoint();
        let exchange = Arc::new(StatusExchange::new(config.health_window(), now()));
        Ok(Self {
            profile: Arc::new(profile),
            config,
            device,
            server,
            exchange,
            events,
            cancel,
        })
    }

    /// Read side for the status frontend and health probe.
    pub fn exchange(&self) -> Arc<StatusExchange> {
        Arc::clone(&self.exchange)
    }

    pub fn profile(&self) -> &Arc<DeviceProfile> {
        &self.profile
    }

    /// Run until the cancellation token fires, then shut both sides down
    /// within the configured timeout. Returns the final counters.
    pub async fn run(self) -> Result<EngineCounters, GatewayError> {
        let Self {
            profile,
            config,
            device,
            server,
            exchange,
            events,
            cancel,
        } = self;
        let timebase = TimeBase::anchored(now());
        let shutdown_timeout = config
            .device
            .shutdown_timeout
            .max(config.publisher.link.shutdown_timeout);

        let conn = ConnectionManager::new(
            device,
            config.device.clone(),
            timebase,
            Arc::clone(&events),
            cancel.clone(),
        );
        let publisher = OpcUaPublisher::new(
            server,
            config.publisher.clone(),
            &profile,
            timebase,
            Arc::clone(&events),
            cancel.clone(),
        );
        let mut device_rx = conn.subscribe();
        let mut server_rx = publisher.subscribe();

        let (job_tx, job_rx) = mpsc::channel::<PublishJob>(1);
        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<Report>();
        let gate = Arc::new(Semaphore::new(1));

        info!(
            device = %profile.endpoint(),
            server = %config.publisher.link.endpoint,
            tags = profile.tags().len(),
            poll_ms = profile.poll_interval().as_millis() as u64,
            "Engine starting"
        );

        let device_task = tokio::spawn(device_loop(
            conn,
            TagPoller::new(Arc::clone(&profile)),
            Translator::new(config.staleness(&profile)),
            gate,
            job_tx,
            report_tx.clone(),
            Arc::clone(&exchange),
            cancel.clone(),
        ));
        let server_task = tokio::spawn(server_loop(publisher, job_rx, report_tx, cancel.clone()));

        let mut supervisor = Supervisor {
            state: EngineState::Init,
            counters: EngineCounters::default(),
            events,
            exchange,
        };
        supervisor.transition(EngineState::Connecting);

        let mut status_tick = tokio::time::interval(config.device.health_interval);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let (mut device_alive, mut server_alive) = (true, true);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                changed = device_rx.changed(), if device_alive => {
                    if changed.is_err() {
                        error!("Device task ended unexpectedly");
                        device_alive = false;
                    }
                }
                changed = server_rx.changed(), if server_alive => {
                    if changed.is_err() {
                        error!("Server task ended unexpectedly");
                        server_alive = false;
                    }
                }
                Some(report) = report_rx.recv() => supervisor.apply(report),
                _ = status_tick.tick() => {}
            }
            if !device_alive && !server_alive {
                break;
            }
            let device = *device_rx.borrow();
            let server = *server_rx.borrow();
            supervisor.observe(device, server);
        }

        supervisor.transition(EngineState::ShuttingDown);
        cancel.cancel();
        supervisor.observe(*device_rx.borrow(), *server_rx.borrow());

        let grace = shutdown_timeout + Duration::from_millis(500);
        let (device_clean, server_clean) = tokio::join!(
            join_bounded("device", device_task, grace),
            join_bounded("server", server_task, grace),
        );
        let clean = device_clean && server_clean;
        while let Ok(report) = report_rx.try_recv() {
            supervisor.apply(report);
        }
        supervisor.observe(*device_rx.borrow(), *server_rx.borrow());
        supervisor.events.record(&EngineEvent::Shutdown { clean });
        info!(clean, counters = ?supervisor.counters, "Engine stopped");
        Ok(supervisor.counters)
    }
}

async fn join_bounded(name: &str, mut task: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, &mut task).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!(task = name, error = %e, "Task failed");
            false
        }
        Err(_) => {
            warn!(task = name, "Task did not stop in time; aborting");
            task.abort();
            false
        }
    }
}

struct Supervisor {
    state: EngineState,
    counters: EngineCounters,
    events: Arc<dyn EventSink>,
    exchange: Arc<StatusExchange>,
}

impl Supervisor {
    fn transition(&mut self, to: EngineState) {
        if to == self.state {
            return;
        }
        let from = self.state;
        self.state = to;
        info!(from = from.as_str(), to = to.as_str(), "Engine state transition");
        metrics::STATE_TRANSITIONS.inc();
        metrics::set_engine_state(to);
        self.events.record(&EngineEvent::StateTransition { from, to });
    }

    /// Derive the state from both sessions and publish the snapshot.
    fn observe(&mut self, device: SessionSnapshot, server: SessionSnapshot) {
        let next = self.state.next(device.state, server.state);
        self.transition(next);
        self.exchange.publish_state(HealthStatus {
            state: self.state,
            device,
            server,
            counters: self.counters,
            updated_at: now(),
        });
    }

    fn apply(&mut self, report: Report) {
        match report {
            Report::Polled => self.counters.cycles_polled += 1,
            Report::Skipped { sequence } => {
                self.counters.cycles_skipped += 1;
                self.events.record(&EngineEvent::CycleSkipped {
                    sequence,
                    reason: "previous cycle still in flight".to_string(),
                });
            }
            Report::Dropped { sequence, reason } => {
                self.counters.cycles_dropped += 1;
                debug!(sequence, reason, "Cycle dropped");
                self.events.record(&EngineEvent::CycleSkipped {
                    sequence,
                    reason: reason.to_string(),
                });
            }
            Report::Published { sequence, outcome } => {
                self.counters.points_published += outcome.written as u64;
                self.counters.points_failed += outcome.failed as u64;
                self.counters.points_skipped += outcome.skipped as u64;
                info!(
                    cycle = sequence,
                    written = outcome.written,
                    failed = outcome.failed,
                    skipped = outcome.skipped,
                    "Publish batch"
                );
                self.events.record(&EngineEvent::PublishBatch {
                    cycle: sequence,
                    written: outcome.written,
                    failed: outcome.failed,
                    skipped: outcome.skipped,
                });
            }
        }
    }
}

fn health_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

/// Wake-up for the next connect attempt, or never while connected.
async fn reconnect_due(at: Option<std::time::Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn device_loop<D: DeviceTransport>(
    mut conn: ConnectionManager<D>,
    mut poller: TagPoller,
    mut translator: Translator,
    gate: Arc<Semaphore>,
    jobs: mpsc::Sender<PublishJob>,
    reports: mpsc::UnboundedSender<Report>,
    exchange: Arc<StatusExchange>,
    cancel: CancellationToken,
) {
    let mut health = health_interval(conn.config().health_interval);
    let mut ticks = poller.interval();
    let mut tick_no: u64 = 0;

    loop {
        let reconnect_at = conn.reconnect_at();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = reconnect_due(reconnect_at) => {
                if let Err(e) = conn.connect().await {
                    debug!(error = %e, "Device connect attempt failed");
                }
            }
            _ = health.tick() => {
                conn.health_check().await;
            }
            _ = ticks.tick() => {
                tick_no += 1;
                if !conn.is_connected() {
                    continue;
                }
                let permit = match Arc::clone(&gate).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        metrics::POLL_CYCLES_SKIPPED.inc();
                        warn!(tick = tick_no, "Previous cycle still publishing; tick skipped");
                        let _ = reports.send(Report::Skipped { sequence: tick_no });
                        continue;
                    }
                };
                let Some(cycle) = poller.poll(&mut conn).await else {
                    continue;
                };
                let _ = reports.send(Report::Polled);

                // Reads interrupted by shutdown are never handed on.
                if cancel.is_cancelled() {
                    let _ = reports.send(Report::Dropped {
                        sequence: cycle.sequence,
                        reason: "shutdown during read",
                    });
                    break;
                }

                if !TagPoller::is_publishable(&cycle) {
                    metrics::POLL_CYCLES_DROPPED.inc();
                    let _ = reports.send(Report::Dropped {
                        sequence: cycle.sequence,
                        reason: "device session lost during read",
                    });
                    continue;
                }

                let points = translator.translate_cycle(&cycle, poller.profile());
                exchange.publish_points(&points);
                let job = PublishJob {
                    sequence: cycle.sequence,
                    points,
                    _permit: permit,
                };
                // The permit guarantees the slot is free.
                if jobs.try_send(job).is_err() {
                    metrics::POLL_CYCLES_DROPPED.inc();
                    let _ = reports.send(Report::Dropped {
                        sequence: cycle.sequence,
                        reason: "publisher unavailable",
                    });
                }
            }
        }
    }

    conn.disconnect().await;
}

async fn server_loop<S: ServerTransport>(
    mut publisher: OpcUaPublisher<S>,
    mut jobs: mpsc::Receiver<PublishJob>,
    reports: mpsc::UnboundedSender<Report>,
    cancel: CancellationToken,
) {
    let mut health = health_interval(publisher.config().link.health_interval);

    loop {
        let reconnect_at = publisher.reconnect_at();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = reconnect_due(reconnect_at) => {
                if let Err(e) = publisher.connect().await {
                    debug!(error = %e, "Server connect attempt failed");
                }
            }
            _ = health.tick() => {
                publisher.health_check().await;
            }
            job = jobs.recv() => {
                let Some(job) = job else { break };
                if !publisher.is_connected() {
                    metrics::POLL_CYCLES_DROPPED.inc();
                    let _ = reports.send(Report::Dropped {
                        sequence: job.sequence,
                        reason: "server session not connected",
                    });
                    continue;
                }
                match publisher.publish(&job.points).await {
                    Ok(outcome) => {
                        let _ = reports.send(Report::Published {
                            sequence: job.sequence,
                            outcome,
                        });
                    }
                    Err(e) => {
                        metrics::POLL_CYCLES_DROPPED.inc();
                        warn!(cycle = job.sequence, error = %e, "Publish failed");
                        let _ = reports.send(Report::Dropped {
                            sequence: job.sequence,
                            reason: "publish failed",
                        });
                    }
                }
            }
        }
    }

    publisher.disconnect().await;
}
