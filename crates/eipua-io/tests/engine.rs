use eipua_core::{
    DataKind, DeviceProfile, EngineState, Quality, SessionState, StaleMode, TagDescriptor, Value,
};
use eipua_io::{
    EngineConfig, EngineEvent, EventSink, Orchestrator, SimDevice, SimServer,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<EngineEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for Recorder {
    fn record(&self, event: &EngineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn conductivity_profile() -> DeviceProfile {
    DeviceProfile::new(
        "192.168.1.50",
        44818,
        vec![
            TagDescriptor::new("conductivity_1", "AI1", DataKind::Float, "ns=2;s=Conductivity1")
                .with_scaling(0.1, 0.0),
            TagDescriptor::new("conductivity_2", "AI5", DataKind::Float, "ns=2;s=Conductivity2")
                .with_scaling(0.1, 0.0),
            TagDescriptor::new("status", "ST1", DataKind::String, "ns=2;s=Status"),
        ],
        1000,
    )
    .unwrap()
}

struct Harness {
    device: SimDevice,
    server: SimServer,
    recorder: Arc<Recorder>,
    cancel: CancellationToken,
    exchange: Arc<eipua_core::StatusExchange>,
    handle: tokio::task::JoinHandle<Result<eipua_core::EngineCounters, eipua_core::GatewayError>>,
}

fn start(config: EngineConfig, device: SimDevice, server: SimServer) -> Harness {
    let recorder = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();
    let engine = Orchestrator::new(
        conductivity_profile(),
        config,
        device.clone(),
        server.clone(),
        recorder.clone(),
        cancel.clone(),
    )
    .unwrap();
    let exchange = engine.exchange();
    let handle = tokio::spawn(engine.run());
    Harness {
        device,
        server,
        recorder,
        cancel,
        exchange,
        handle,
    }
}

fn config() -> EngineConfig {
    EngineConfig::new("opc.tcp://127.0.0.1:4840/freeopcua/server/")
}

#[tokio::test(start_paused = true)]
async fn scaled_reading_reaches_the_server_with_read_timestamp() {
    let device = SimDevice::new();
    device.set_value("AI1", Value::Int(250));
    let h = start(config(), device, SimServer::new());

    sleep(Duration::from_millis(1100)).await;
    let written = h.server.value("ns=2;s=Conductivity1").unwrap();
    assert_eq!(written.value, Some(Value::Float(25.0)));
    assert_eq!(written.quality, Quality::Good);

    let point = h.exchange.read_points()["conductivity_1"].clone();
    assert_eq!(point.quality, Quality::Good);
    assert_eq!(written.source_timestamp_us, point.timestamp_us);

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn three_failed_health_checks_degrade_within_fifteen_seconds() {
    let h = start(config(), SimDevice::new(), SimServer::new());
    sleep(Duration::from_millis(500)).await;
    assert_eq!(h.exchange.read_state().state, EngineState::Running);

    h.device.set_heartbeat_ok(false);
    sleep(Duration::from_secs(14)).await;
    assert_eq!(h.exchange.read_state().state, EngineState::Running);

    sleep(Duration::from_secs(1)).await;
    let status = h.exchange.read_state();
    assert_eq!(status.state, EngineState::Degraded);
    assert_eq!(status.device.state, SessionState::Faulted);
    assert!(status.device.backoff_until.is_some());
    assert!(h.recorder.events().contains(&EngineEvent::StateTransition {
        from: EngineState::Running,
        to: EngineState::Degraded,
    }));

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn device_loss_degrades_within_one_poll_interval_without_fabricated_publish() {
    let h = start(config(), SimDevice::new(), SimServer::new());
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.exchange.read_state().state, EngineState::Running);
    let writes_before = h.server.accepted_writes();

    h.device.set_reachable(false);
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(h.exchange.read_state().state, EngineState::Degraded);

    // Nothing from the failed cycle reached the server, not even BAD flags.
    assert_eq!(h.server.accepted_writes(), writes_before);
    assert!(h.server.is_connected());

    h.cancel.cancel();
    let counters = h.handle.await.unwrap().unwrap();
    assert!(counters.cycles_dropped >= 1);
}

#[tokio::test(start_paused = true)]
async fn device_recovers_after_backoff() {
    let h = start(config(), SimDevice::new(), SimServer::new());
    sleep(Duration::from_millis(1500)).await;
    h.device.set_reachable(false);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.exchange.read_state().state, EngineState::Degraded);

    h.device.set_reachable(true);
    sleep(Duration::from_secs(4)).await;
    let status = h.exchange.read_state();
    assert_eq!(status.state, EngineState::Running);
    assert_eq!(status.device.consecutive_failures, 0);

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn server_restart_does_not_duplicate_nodes() {
    let h = start(config(), SimDevice::new(), SimServer::new());
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.server.creations("ns=2;s=Conductivity1"), 1);

    // Drop the session without losing the address space.
    h.server.set_reachable(false);
    sleep(Duration::from_secs(1)).await;
    h.server.set_reachable(true);
    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.exchange.read_state().state, EngineState::Running);
    assert!(h.server.connects() >= 2);
    assert_eq!(h.server.creations("ns=2;s=Conductivity1"), 1);
    assert_eq!(h.server.node_count(), 3);

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn hold_policy_republishes_last_value_as_stale() {
    let device = SimDevice::new();
    device.set_value("AI1", Value::Int(250));
    let mut cfg = config();
    cfg.stale_mode = StaleMode::HoldLastValue;
    let h = start(cfg, device, SimServer::new());

    sleep(Duration::from_millis(1500)).await;
    let good = h.server.value("ns=2;s=Conductivity1").unwrap();
    h.device.set_unsupported("AI1");
    sleep(Duration::from_secs(1)).await;

    let held = h.server.value("ns=2;s=Conductivity1").unwrap();
    assert_eq!(held.quality, Quality::Stale);
    assert_eq!(held.value, Some(Value::Float(25.0)));
    assert_eq!(held.source_timestamp_us, good.source_timestamp_us);

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_with_hung_disconnect_is_bounded() {
    let h = start(config(), SimDevice::new(), SimServer::new());
    sleep(Duration::from_millis(1500)).await;
    h.device.set_hang_disconnect(true);

    let started = Instant::now();
    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
    assert!(started.elapsed() <= Duration::from_secs(6));
    assert!(!h.server.is_connected());

    let status = h.exchange.read_state();
    assert_eq!(status.state, EngineState::ShuttingDown);
    assert_ne!(status.device.state, SessionState::Connected);
    assert_ne!(status.server.state, SessionState::Connected);
    assert!(h
        .recorder
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::Shutdown { .. })));
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_in_flight_read_publishes_nothing_from_it() {
    let h = start(config(), SimDevice::new(), SimServer::new());
    sleep(Duration::from_millis(1500)).await;
    let writes_before = h.server.accepted_writes();
    let reads_before = h.device.reads();
    assert!(writes_before > 0);

    // The 2 s cycle stays on the wire until 2.8 s.
    h.device.set_read_delay(Duration::from_millis(800));
    sleep(Duration::from_millis(900)).await;
    assert_eq!(h.device.reads(), reads_before);

    let started = Instant::now();
    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
    assert!(started.elapsed() <= Duration::from_secs(5));

    assert_eq!(h.server.accepted_writes(), writes_before);
    let status = h.exchange.read_state();
    assert_eq!(status.state, EngineState::ShuttingDown);
    assert_eq!(status.device.state, SessionState::Disconnected);
    assert_eq!(status.server.state, SessionState::Disconnected);
    assert!(h
        .recorder
        .events()
        .contains(&EngineEvent::Shutdown { clean: true }));
}

#[tokio::test(start_paused = true)]
async fn slow_reads_do_not_hold_back_health_faults() {
    let h = start(config(), SimDevice::new(), SimServer::new());
    h.device.set_read_delay(Duration::from_millis(400));
    sleep(Duration::from_millis(500)).await;
    h.device.set_heartbeat_ok(false);

    sleep(Duration::from_millis(14_600)).await;
    let status = h.exchange.read_state();
    assert_eq!(status.state, EngineState::Degraded);
    assert_eq!(status.device.state, SessionState::Faulted);
    assert!(status.counters.cycles_polled >= 10);

    h.cancel.cancel();
    h.handle.await.unwrap().unwrap();
}
