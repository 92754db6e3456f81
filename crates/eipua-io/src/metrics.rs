//! Prometheus metrics and the read-only status frontend.
//!
//! The HTTP side never writes into engine state: it only renders the
//! [`StatusExchange`] snapshots and the metrics registry.

use eipua_core::{EngineState, SessionSide, SessionState, StatusExchange};
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::sync::{Arc, LazyLock};
use std::thread;
use tiny_http::{Header, Method, Request, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// ============================================================================
// Poll Metrics
// ============================================================================

pub static POLL_CYCLES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new("eipua_poll_cycles_total", "Device poll cycles executed").unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Ticks skipped because the previous cycle was still in flight
pub static POLL_CYCLES_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "eipua_poll_cycles_skipped_total",
        "Poll ticks skipped because the previous cycle had not finished publishing",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Cycles read but not published (device lost mid-read, server down)
pub static POLL_CYCLES_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "eipua_poll_cycles_dropped_total",
        "Poll cycles discarded without publishing",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static TAG_READ_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "eipua_tag_read_failures_total",
        "Individual tag reads that failed",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POLL_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new("eipua_poll_duration_seconds", "Duration of one device poll")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(histogram.clone())).unwrap();
    histogram
});

// ============================================================================
// Publish Metrics
// ============================================================================

pub static POINTS_PUBLISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "eipua_points_published_total",
        "Data points written to the OPC UA server",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POINTS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "eipua_points_failed_total",
        "Data point writes rejected by the OPC UA server",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub static POINTS_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "eipua_points_skipped_total",
        "BAD quality points not written",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

// ============================================================================
// Session Metrics
// ============================================================================

pub static RECONNECT_ATTEMPTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("eipua_reconnect_attempts_total", "Connect attempts per side"),
        &["side"],
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

/// Session state (0=disconnected,1=connecting,2=connected,3=faulted)
pub static SESSION_STATE: LazyLock<GaugeVec> = LazyLock::new(|| {
    let gauge = GaugeVec::new(
        Opts::new(
            "eipua_session_state",
            "Session state (0=disconnected,1=connecting,2=connected,3=faulted)",
        ),
        &["side"],
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

/// Engine state (0=init,1=connecting,2=running,3=degraded,4=reconnecting,5=shutting_down)
pub static ENGINE_STATE: LazyLock<Gauge> = LazyLock::new(|| {
    let gauge = Gauge::new(
        "eipua_engine_state",
        "Engine state (0=init,1=connecting,2=running,3=degraded,4=reconnecting,5=shutting_down)",
    )
    .unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
});

pub static STATE_TRANSITIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "eipua_state_transitions_total",
        "Orchestrator state transitions",
    )
    .unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
});

pub fn set_session_state(side: SessionSide, state: SessionState) {
    SESSION_STATE
        .with_label_values(&[side.as_str()])
        .set(state.as_u8() as f64);
}

pub fn set_engine_state(state: EngineState) {
    ENGINE_STATE.set(state.as_u8() as f64);
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = POLL_CYCLES.get();
    let _ = POLL_CYCLES_SKIPPED.get();
    let _ = POLL_CYCLES_DROPPED.get();
    let _ = TAG_READ_FAILURES.get();
    let _ = POLL_DURATION.get_sample_count();
    let _ = POINTS_PUBLISHED.get();
    let _ = POINTS_FAILED.get();
    let _ = POINTS_SKIPPED.get();
    let _ = STATE_TRANSITIONS.get();
    for side in [SessionSide::Device, SessionSide::Server] {
        let _ = RECONNECT_ATTEMPTS.with_label_values(&[side.as_str()]).get();
        set_session_state(side, SessionState::Disconnected);
    }
    set_engine_state(EngineState::Init);
}

pub fn render_metrics() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}

// ============================================================================
// Status HTTP Server
// ============================================================================

/// Handle to the status server thread.
pub struct StatusServer {
    server: Arc<Server>,
    handle: thread::JoinHandle<()>,
}

impl StatusServer {
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Stop accepting requests and join the server thread.
    pub fn shutdown(self) {
        self.server.unblock();
        let _ = self.handle.join();
    }
}

/// Start the status server on the given address.
pub fn serve_status(
    bind_addr: &str,
    exchange: Arc<StatusExchange>,
) -> Result<StatusServer, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let server = Arc::new(Server::http(bind_addr)?);
    tracing::info!("Status server listening on http://{}", bind_addr);

    let server_for_thread = Arc::clone(&server);
    let handle = thread::spawn(move || {
        for request in server_for_thread.incoming_requests() {
            respond(request, &exchange);
        }
    });

    Ok(StatusServer { server, handle })
}

fn respond(request: Request, exchange: &StatusExchange) {
    if *request.method() != Method::Get {
        let _ = request.respond(Response::from_string("Method Not Allowed").with_status_code(405));
        return;
    }

    let now = crate::transport::now();
    let path = request.url().split('?').next().unwrap_or("").to_string();
    let result = match path.as_str() {
        "/health" => {
            if exchange.is_healthy(now) {
                request.respond(Response::from_string("OK"))
            } else {
                let state = exchange.read_state().state;
                request.respond(
                    Response::from_string(format!("Unhealthy ({})", state.as_str()))
                        .with_status_code(503),
                )
            }
        }
        "/status" => respond_json(request, &exchange.view(now)),
        "/points" => respond_json(request, &*exchange.read_points()),
        "/metrics" => match render_metrics() {
            Ok(buffer) => {
                let mut response = Response::from_data(buffer);
                if let Ok(header) = Header::from_bytes(
                    &b"Content-Type"[..],
                    &b"text/plain; version=0.0.4"[..],
                ) {
                    response = response.with_header(header);
                }
                request.respond(response)
            }
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {}", e);
                request.respond(Response::from_string("Internal Server Error").with_status_code(500))
            }
        },
        _ => request.respond(Response::from_string("Not Found").with_status_code(404)),
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "status response failed");
    }
}

fn respond_json<T: serde::Serialize>(request: Request, body: &T) -> std::io::Result<()> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::from_data(bytes);
            if let Ok(header) =
                Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
            {
                response = response.with_header(header);
            }
            request.respond(response)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to serialize status");
            request.respond(Response::from_string("Internal Server Error").with_status_code(500))
        }
    }
}
