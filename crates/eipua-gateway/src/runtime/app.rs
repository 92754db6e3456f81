use crate::infra::audit::{AuditEventType, AuditLogger};
use crate::runtime::config::RuntimeConfig;
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use async_trait::async_trait;
use eipua_core::{
    ConfigError, DeviceProfile, EngineCounters, GatewayError, TransportError, Value,
};
#[cfg(feature = "enip")]
use eipua_io::enip::EnipDevice;
#[cfg(feature = "opcua")]
use eipua_io::opcua_client::OpcUaClientTransport;
use eipua_io::transport::ItemResult;
use eipua_io::{
    load_profile, DeviceTransport, EnsureOutcome, EventSink, NodeSpec, NodeWrite, NullSink,
    Orchestrator, ServerTransport, SimDevice, SimServer,
};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("failed to open audit log: {0}")]
    Audit(std::io::Error),

    #[error("failed to start async runtime: {0}")]
    Runtime(std::io::Error),
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Gateway(err.into())
    }
}

impl AppError {
    /// 2 for configuration errors, 1 for anything else.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AppError::Gateway(e) if e.is_fatal() => ExitCode::from(2),
            _ => ExitCode::from(1),
        }
    }
}

enum GatewayDevice {
    Simulated(SimDevice),
    #[cfg(feature = "enip")]
    Enip(EnipDevice),
}

#[async_trait]
impl DeviceTransport for GatewayDevice {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        match self {
            Self::Simulated(d) => d.connect(endpoint).await,
            #[cfg(feature = "enip")]
            Self::Enip(d) => d.connect(endpoint).await,
        }
    }

    async fn read_batch(
        &mut self,
        paths: &[String],
    ) -> Result<Vec<ItemResult<Value>>, TransportError> {
        match self {
            Self::Simulated(d) => d.read_batch(paths).await,
            #[cfg(feature = "enip")]
            Self::Enip(d) => d.read_batch(paths).await,
        }
    }

    async fn heartbeat(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Simulated(d) => d.heartbeat().await,
            #[cfg(feature = "enip")]
            Self::Enip(d) => d.heartbeat().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Simulated(d) => d.disconnect().await,
            #[cfg(feature = "enip")]
            Self::Enip(d) => d.disconnect().await,
        }
    }

    fn max_batch(&self) -> usize {
        match self {
            Self::Simulated(d) => d.max_batch(),
            #[cfg(feature = "enip")]
            Self::Enip(d) => d.max_batch(),
        }
    }
}

enum GatewayServer {
    Simulated(SimServer),
    #[cfg(feature = "opcua")]
    OpcUa(OpcUaClientTransport),
}

#[async_trait]
impl ServerTransport for GatewayServer {
    async fn connect(&mut self, endpoint: &str) -> Result<(), TransportError> {
        match self {
            Self::Simulated(s) => s.connect(endpoint).await,
            #[cfg(feature = "opcua")]
            Self::OpcUa(s) => s.connect(endpoint).await,
        }
    }

    async fn ensure_nodes(
        &mut self,
        nodes: &[NodeSpec],
    ) -> Result<Vec<ItemResult<EnsureOutcome>>, TransportError> {
        match self {
            Self::Simulated(s) => s.ensure_nodes(nodes).await,
            #[cfg(feature = "opcua")]
            Self::OpcUa(s) => s.ensure_nodes(nodes).await,
        }
    }

    async fn write(&mut self, writes: &[NodeWrite]) -> Result<Vec<ItemResult<()>>, TransportError> {
        match self {
            Self::Simulated(s) => s.write(writes).await,
            #[cfg(feature = "opcua")]
            Self::OpcUa(s) => s.write(writes).await,
        }
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Simulated(s) => s.ping().await,
            #[cfg(feature = "opcua")]
            Self::OpcUa(s) => s.ping().await,
        }
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        match self {
            Self::Simulated(s) => s.disconnect().await,
            #[cfg(feature = "opcua")]
            Self::OpcUa(s) => s.disconnect().await,
        }
    }
}

#[allow(unused_variables)]
fn build_transports(
    config: &RuntimeConfig,
    profile: &DeviceProfile,
) -> Result<(GatewayDevice, GatewayServer), ConfigError> {
    if config.simulate {
        info!("Using simulated device and OPC UA server");
        return Ok((
            GatewayDevice::Simulated(SimDevice::for_profile(profile)),
            GatewayServer::Simulated(SimServer::new()),
        ));
    }

    #[cfg(all(feature = "enip", feature = "opcua"))]
    {
        Ok((
            GatewayDevice::Enip(EnipDevice::for_profile(profile)),
            GatewayServer::OpcUa(OpcUaClientTransport::new("eipua-gateway")),
        ))
    }

    #[cfg(not(all(feature = "enip", feature = "opcua")))]
    {
        Err(ConfigError::Option {
            option: "--simulate".to_string(),
            reason: "this build has no EtherNet/IP or OPC UA transport; \
                     rebuild with --features enip,opcua or run with --simulate"
                .to_string(),
        })
    }
}

pub fn run_from_args() -> ExitCode {
    let config = match RuntimeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };
    if config.show_help {
        RuntimeConfig::print_help();
        return ExitCode::SUCCESS;
    }

    let _log_guard = match init_tracing(config.json_logs, config.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e}");
            return AppError::from(e).exit_code();
        }
    };
    match run(config) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Gateway stopped with an error");
            e.exit_code()
        }
    }
}

pub fn run(config: RuntimeConfig) -> Result<EngineCounters, AppError> {
    telemetry::init();

    let profile_path = config.profile_path.clone().ok_or_else(|| ConfigError::Option {
        option: "--profile".to_string(),
        reason: "a device profile is required (or set EIPUA_PROFILE)".to_string(),
    })?;
    let profile = load_profile(&profile_path)?;
    let engine_config = config.engine_config()?;
    let (device, server) = build_transports(&config, &profile)?;

    let audit_logger = init_audit_logger(&config)?;
    let events: Arc<dyn EventSink> = match &audit_logger {
        Some(logger) => logger.clone(),
        None => Arc::new(NullSink),
    };
    if let Some(logger) = &audit_logger {
        let _ = logger.log_event(
            AuditEventType::SystemStart,
            serde_json::json!({
                "version": env!("CARGO_PKG_VERSION"),
                "device": profile.endpoint(),
                "opcua_endpoint": config.opcua_endpoint,
                "tags": profile.tags().len(),
                "simulate": config.simulate,
            }),
        );
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("eipua-worker")
        .build()
        .map_err(AppError::Runtime)?;

    let cancel = CancellationToken::new();
    let status_addr = config.status_addr.clone();
    let run_seconds = config.run_seconds;
    let result = runtime.block_on(async {
        let engine = Orchestrator::new(
            profile,
            engine_config,
            device,
            server,
            events,
            cancel.clone(),
        )?;
        let status_server =
            telemetry::start_status_server(status_addr.as_deref(), engine.exchange());
        info!(
            device = %engine.profile().endpoint(),
            opcua = %config.opcua_endpoint,
            tags = engine.profile().tags().len(),
            "eipua-gateway running"
        );

        tokio::spawn(shutdown_signal(cancel.clone(), run_seconds));
        let result = engine.run().await;
        if let Some(server) = status_server {
            server.shutdown();
        }
        result
    });

    match &result {
        Ok(counters) => {
            info!(
                cycles_polled = counters.cycles_polled,
                cycles_skipped = counters.cycles_skipped,
                cycles_dropped = counters.cycles_dropped,
                points_published = counters.points_published,
                points_failed = counters.points_failed,
                "Run complete"
            );
            if let Some(logger) = &audit_logger {
                let _ = logger.log_event(
                    AuditEventType::SystemShutdown,
                    serde_json::to_value(counters).unwrap_or_default(),
                );
            }
        }
        Err(e) => {
            if let Some(logger) = &audit_logger {
                let _ = logger.log_event(
                    AuditEventType::SystemShutdown,
                    serde_json::json!({ "error": e.to_string() }),
                );
            }
        }
    }
    result.map_err(AppError::from)
}

/// Cancels on SIGINT, SIGTERM or after `run_seconds`.
async fn shutdown_signal(cancel: CancellationToken, run_seconds: Option<u64>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match run_seconds {
            Some(seconds) => {
                info!(seconds, "Running for limited duration");
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = deadline => info!("Run duration elapsed"),
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
}

fn init_audit_logger(config: &RuntimeConfig) -> Result<Option<Arc<AuditLogger>>, AppError> {
    let Some(path) = config.audit_path.as_ref() else {
        return Ok(None);
    };
    let logger = AuditLogger::new(path).map_err(AppError::Audit)?;
    info!(path = %path.display(), "Audit logging enabled");
    Ok(Some(Arc::new(logger)))
}
