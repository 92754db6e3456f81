use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const GATEWAY: &str = env!("CARGO_BIN_EXE_eipua-gateway");
const HEALTHCHECK: &str = env!("CARGO_BIN_EXE_eipua-healthcheck");

fn demo_profile() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos/m800_profile.json")
}

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind ephemeral port");
    let addr = listener.local_addr().expect("Failed to resolve bound address");
    format!("127.0.0.1:{}", addr.port())
}

fn http_get(addr: &str, path: &str) -> Option<(u16, String)> {
    let mut stream = TcpStream::connect(addr).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(2))).ok()?;
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n"
    )
    .ok()?;
    let mut response = String::new();
    stream.read_to_string(&mut response).ok()?;
    let code = response.split_whitespace().nth(1)?.parse().ok()?;
    let body = response.split("\r\n\r\n").nth(1).unwrap_or_default().to_string();
    Some((code, body))
}

struct GatewayProcess {
    child: Child,
    status_addr: String,
}

impl GatewayProcess {
    fn start(extra: &[&str]) -> Self {
        let status_addr = free_addr();
        let child = Command::new(GATEWAY)
            .arg("--simulate")
            .arg("--profile")
            .arg(demo_profile())
            .args(["--status-addr", &status_addr])
            .args(extra)
            .env_remove("EIPUA_PROFILE")
            .env_remove("OPCUA_ENDPOINT")
            .env_remove("EIPUA_STATUS_ADDR")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("Failed to start gateway");
        Self { child, status_addr }
    }

    /// Poll until `/health` answers 200 or the deadline passes.
    fn wait_healthy(&self, within: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < within {
            if let Some((200, _)) = http_get(&self.status_addr, "/health") {
                return true;
            }
            thread::sleep(Duration::from_millis(100));
        }
        false
    }

    fn wait_exit(&mut self, within: Duration) -> Option<i32> {
        let start = Instant::now();
        while start.elapsed() < within {
            if let Ok(Some(status)) = self.child.try_wait() {
                return status.code();
            }
            thread::sleep(Duration::from_millis(50));
        }
        None
    }
}

impl Drop for GatewayProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn simulated_bridge_serves_status_and_exits_cleanly() {
    let mut gateway = GatewayProcess::start(&["--run-seconds", "4"]);
    assert!(gateway.wait_healthy(Duration::from_secs(5)), "never became healthy");

    let (code, body) = http_get(&gateway.status_addr, "/status").expect("status unreachable");
    assert_eq!(code, 200);
    let status: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status["state"], "RUNNING");
    assert_eq!(status["healthy"], true);

    thread::sleep(Duration::from_millis(1200));
    let (_, body) = http_get(&gateway.status_addr, "/points").expect("points unreachable");
    let points: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(points["temperature_1"]["quality"], "GOOD");

    let (code, body) = http_get(&gateway.status_addr, "/metrics").expect("metrics unreachable");
    assert_eq!(code, 200);
    assert!(body.contains("eipua_poll_cycles_total"));

    let probe = Command::new(HEALTHCHECK)
        .arg(&gateway.status_addr)
        .status()
        .expect("Failed to run healthcheck");
    assert!(probe.success());

    assert_eq!(gateway.wait_exit(Duration::from_secs(10)), Some(0));
}

#[test]
fn audit_log_records_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let audit_arg = audit.to_string_lossy().to_string();
    let mut gateway = GatewayProcess::start(&["--run-seconds", "2", "--audit-log", &audit_arg]);
    assert_eq!(gateway.wait_exit(Duration::from_secs(10)), Some(0));

    let content = std::fs::read_to_string(&audit).unwrap();
    let entries: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(entries.first().unwrap()["event_type"], "system_start");
    assert_eq!(entries.last().unwrap()["event_type"], "system_shutdown");
    assert!(entries.iter().any(|e| e["details"]["event"] == "nodes_validated"));
    assert!(entries.iter().any(|e| e["details"]["event"] == "publish_batch"));
    assert!(entries
        .iter()
        .any(|e| e["details"]["event"] == "shutdown" && e["details"]["clean"] == true));
}

#[cfg(unix)]
#[test]
fn sigterm_shuts_down_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let audit_arg = audit.to_string_lossy().to_string();
    let mut gateway = GatewayProcess::start(&["--audit-log", &audit_arg]);
    assert!(gateway.wait_healthy(Duration::from_secs(5)), "never became healthy");
    thread::sleep(Duration::from_millis(1200));

    let sent = Command::new("kill")
        .args(["-TERM", &gateway.child.id().to_string()])
        .status()
        .expect("Failed to send SIGTERM");
    assert!(sent.success());
    assert_eq!(gateway.wait_exit(Duration::from_secs(10)), Some(0));

    let entries: Vec<serde_json::Value> = std::fs::read_to_string(&audit)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(entries.last().unwrap()["event_type"], "system_shutdown");
    assert!(entries
        .iter()
        .any(|e| e["details"]["event"] == "shutdown" && e["details"]["clean"] == true));
}

#[test]
fn unusable_log_dir_exits_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let occupied = dir.path().join("logs");
    std::fs::write(&occupied, b"").unwrap();

    let status = Command::new(GATEWAY)
        .args(["--simulate", "--run-seconds", "1", "--profile"])
        .arg(demo_profile())
        .arg("--log-dir")
        .arg(&occupied)
        .stderr(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .expect("Failed to run gateway");
    assert_eq!(status.code(), Some(2));
}

#[test]
fn invalid_profile_exits_with_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let profile = dir.path().join("bad.json");
    std::fs::write(
        &profile,
        r#"{"device_address": "10.0.0.1", "tags": [
            {"name": "a", "device_address_path": "A", "data_kind": "DOUBLE", "opc_node_id": "ns=2;s=A"}
        ]}"#,
    )
    .unwrap();

    let status = Command::new(GATEWAY)
        .args(["--simulate", "--profile"])
        .arg(&profile)
        .stderr(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .expect("Failed to run gateway");
    assert_eq!(status.code(), Some(2));
}

#[test]
fn bad_endpoint_exits_with_config_error() {
    let status = Command::new(GATEWAY)
        .args(["--simulate", "--opcua-endpoint", "http://historian:4840", "--profile"])
        .arg(demo_profile())
        .stderr(Stdio::null())
        .stdout(Stdio::null())
        .status()
        .expect("Failed to run gateway");
    assert_eq!(status.code(), Some(2));
}

#[test]
fn healthcheck_fails_without_a_gateway() {
    let status = Command::new(HEALTHCHECK)
        .arg(free_addr())
        .stderr(Stdio::null())
        .status()
        .expect("Failed to run healthcheck");
    assert_eq!(status.code(), Some(1));
}
