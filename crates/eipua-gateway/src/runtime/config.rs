use eipua_core::{BackoffPolicy, ConfigError, StaleMode};
use eipua_io::{validate_endpoint, BadQualityPolicy, EngineConfig, LinkConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub show_help: bool,
    pub profile_path: Option<PathBuf>,
    pub opcua_endpoint: String,
    pub opcua_namespace: String,
    pub watchdog_node: Option<String>,
    pub simulate: bool,
    pub status_addr: Option<String>,
    pub json_logs: bool,
    pub log_dir: Option<PathBuf>,
    pub audit_path: Option<PathBuf>,
    pub stale_mode: StaleMode,
    pub stale_threshold_ms: Option<u64>,
    pub bad_quality: BadQualityPolicy,
    pub health_interval_ms: u64,
    pub io_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub run_seconds: Option<u64>,
    endpoint_from_flag: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            show_help: false,
            profile_path: None,
            opcua_endpoint: "opc.tcp://127.0.0.1:4840".to_string(),
            opcua_namespace: "urn:eipua:gateway".to_string(),
            watchdog_node: None,
            simulate: false,
            status_addr: None,
            json_logs: false,
            log_dir: None,
            audit_path: None,
            stale_mode: StaleMode::Gap,
            stale_threshold_ms: None,
            bad_quality: BadQualityPolicy::Flag,
            health_interval_ms: 5000,
            io_timeout_ms: 2000,
            base_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            shutdown_timeout_ms: 5000,
            run_seconds: None,
            endpoint_from_flag: false,
        }
    }
}

fn invalid(option: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Option {
        option: option.to_string(),
        reason: reason.into(),
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, ConfigError> {
    args.get(i + 1)
        .map(String::as_str)
        .ok_or_else(|| invalid(flag, "missing value"))
}

fn millis(args: &[String], i: usize, flag: &str) -> Result<u64, ConfigError> {
    let raw = value(args, i, flag)?;
    raw.parse::<u64>()
        .map_err(|_| invalid(flag, format!("'{raw}' is not a whole number of milliseconds")))
}

impl RuntimeConfig {
    /// Command line first, then `EIPUA_PROFILE`, `OPCUA_ENDPOINT` and
    /// `EIPUA_STATUS_ADDR` for anything the flags left unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let args: Vec<String> = std::env::args().collect();
        let mut cfg = Self::from_args(&args)?;
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// `args[0]` is the program name.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let mut i = 1;
        while i < args.len() {
            let flag = args[i].as_str();
            match flag {
                "--help" | "-h" => {
                    cfg.show_help = true;
                }
                "--profile" => {
                    cfg.profile_path = Some(PathBuf::from(value(args, i, flag)?));
                    i += 1;
                }
                "--opcua-endpoint" => {
                    cfg.opcua_endpoint = value(args, i, flag)?.to_string();
                    cfg.endpoint_from_flag = true;
                    i += 1;
                }
                "--opcua-namespace" => {
                    cfg.opcua_namespace = value(args, i, flag)?.to_string();
                    i += 1;
                }
                "--watchdog-node" => {
                    cfg.watchdog_node = Some(value(args, i, flag)?.to_string());
                    i += 1;
                }
                "--simulate" => {
                    cfg.simulate = true;
                }
                "--status-addr" => {
                    cfg.status_addr = Some(value(args, i, flag)?.to_string());
                    i += 1;
                }
                "--json-logs" => {
                    cfg.json_logs = true;
                }
                "--log-dir" => {
                    cfg.log_dir = Some(PathBuf::from(value(args, i, flag)?));
                    i += 1;
                }
                "--audit-log" => {
                    cfg.audit_path = Some(PathBuf::from(value(args, i, flag)?));
                    i += 1;
                }
                "--stale-policy" => {
                    cfg.stale_mode = match value(args, i, flag)? {
                        "gap" => StaleMode::Gap,
                        "hold" => StaleMode::HoldLastValue,
                        other => return Err(invalid(flag, format!("expected gap|hold, got '{other}'"))),
                    };
                    i += 1;
                }
                "--stale-threshold-ms" => {
                    cfg.stale_threshold_ms = Some(millis(args, i, flag)?);
                    i += 1;
                }
                "--bad-quality" => {
                    cfg.bad_quality = match value(args, i, flag)? {
                        "skip" => BadQualityPolicy::Skip,
                        "flag" => BadQualityPolicy::Flag,
                        other => return Err(invalid(flag, format!("expected skip|flag, got '{other}'"))),
                    };
                    i += 1;
                }
                "--health-interval-ms" => {
                    cfg.health_interval_ms = millis(args, i, flag)?;
                    i += 1;
                }
                "--io-timeout-ms" => {
                    cfg.io_timeout_ms = millis(args, i, flag)?;
                    i += 1;
                }
                "--base-backoff-ms" => {
                    cfg.base_backoff_ms = millis(args, i, flag)?;
                    i += 1;
                }
                "--max-backoff-ms" => {
                    cfg.max_backoff_ms = millis(args, i, flag)?;
                    i += 1;
                }
                "--shutdown-timeout-ms" => {
                    cfg.shutdown_timeout_ms = millis(args, i, flag)?;
                    i += 1;
                }
                "--run-seconds" => {
                    let raw = value(args, i, flag)?;
                    cfg.run_seconds = Some(
                        raw.parse()
                            .map_err(|_| invalid(flag, format!("'{raw}' is not a number of seconds")))?,
                    );
                    i += 1;
                }
                other => return Err(invalid(other, "unknown option")),
            }
            i += 1;
        }
        if cfg.endpoint_from_flag {
            validate_endpoint(&cfg.opcua_endpoint)?;
        }
        Ok(cfg)
    }

    /// Fill unset values from the environment. Flags always win.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.profile_path.is_none() {
            self.profile_path = lookup("EIPUA_PROFILE").map(PathBuf::from);
        }
        if !self.endpoint_from_flag {
            if let Some(endpoint) = lookup("OPCUA_ENDPOINT") {
                self.opcua_endpoint = endpoint;
            }
        }
        if self.status_addr.is_none() {
            self.status_addr = lookup("EIPUA_STATUS_ADDR");
        }
    }

    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        validate_endpoint(&self.opcua_endpoint)?;
        for (option, ms) in [
            ("--health-interval-ms", self.health_interval_ms),
            ("--io-timeout-ms", self.io_timeout_ms),
            ("--base-backoff-ms", self.base_backoff_ms),
            ("--shutdown-timeout-ms", self.shutdown_timeout_ms),
        ] {
            if ms == 0 {
                return Err(invalid(option, "must be greater than zero"));
            }
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err(invalid(
                "--max-backoff-ms",
                format!(
                    "{} is below the base backoff of {}",
                    self.max_backoff_ms, self.base_backoff_ms
                ),
            ));
        }

        let link = LinkConfig {
            endpoint: String::new(),
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            health_interval: Duration::from_millis(self.health_interval_ms),
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.base_backoff_ms),
                Duration::from_millis(self.max_backoff_ms),
            ),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            ..LinkConfig::default()
        };

        let mut engine = EngineConfig::new(self.opcua_endpoint.clone());
        engine.device = link.clone();
        engine.publisher.link = LinkConfig {
            endpoint: self.opcua_endpoint.clone(),
            ..link
        };
        engine.publisher.bad_quality = self.bad_quality;
        engine.publisher.watchdog_node = self.watchdog_node.clone();
        engine.stale_mode = self.stale_mode;
        engine.stale_threshold = self.stale_threshold_ms.map(Duration::from_millis);
        Ok(engine)
    }

    pub fn print_help() {
        println!(
            r#"eipua-gateway - EtherNet/IP to OPC UA bridge

USAGE:
    eipua-gateway [OPTIONS]

OPTIONS:
    -h, --help                    Show this help message
    --profile <PATH>              JSON device profile (tags, address, poll interval)
    --opcua-endpoint <URL>        OPC UA server endpoint [default: opc.tcp://127.0.0.1:4840]
    --opcua-namespace <URI>       Namespace registered by opcua-test-server [default: urn:eipua:gateway]
    --watchdog-node <NODEID>      Boolean node toggled after every publish batch
    --simulate                    Use the in-memory simulated device and server
    --status-addr <ADDR>          Serve /health, /status, /points and /metrics on ADDR
    --json-logs                   Output logs in JSON format
    --log-dir <DIR>               Also write daily-rotated app.<date>.log files to DIR (30 kept)
    --audit-log <PATH>            Append engine events as JSON lines to PATH
    --stale-policy <gap|hold>     Publish failed reads as BAD gaps or hold the last value [default: gap]
    --stale-threshold-ms <MS>     Maximum age of a held value [default: 3 x poll interval]
    --bad-quality <skip|flag>     Skip BAD points or write them with a bad status [default: flag]
    --health-interval-ms <MS>     Session health check interval [default: 5000]
    --io-timeout-ms <MS>          Per-operation I/O timeout [default: 2000]
    --base-backoff-ms <MS>        First reconnect delay [default: 1000]
    --max-backoff-ms <MS>         Reconnect delay cap [default: 60000]
    --shutdown-timeout-ms <MS>    Bound on each session disconnect [default: 5000]
    --run-seconds <S>             Stop after S seconds

ENVIRONMENT VARIABLES:
    EIPUA_PROFILE                 Device profile path (overridden by --profile)
    OPCUA_ENDPOINT                OPC UA endpoint (overridden by --opcua-endpoint)
    EIPUA_STATUS_ADDR             Status server address (overridden by --status-addr)
    RUST_LOG                      Log filter [default: info,eipua_gateway=debug,eipua_io=debug]

EXIT CODES:
    0    Clean shutdown
    1    Runtime failure
    2    Configuration error

EXAMPLES:
    # Bridge a device to a local OPC UA server
    eipua-gateway --profile demos/m800_profile.json --opcua-endpoint opc.tcp://localhost:4840

    # Dry run against simulated transports with a status endpoint
    eipua-gateway --profile demos/m800_profile.json --simulate --status-addr 127.0.0.1:8080
"#
        );
    }
}
