use eipua_core::{ConfigError, DataKind, DeviceProfile};
use std::path::PathBuf;
use std::time::Duration;

fn demo_profile_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../demos/m800_profile.json")
}

#[test]
fn loads_demo_profile() {
    let profile = DeviceProfile::load(&demo_profile_path()).expect("demo profile should load");
    assert_eq!(profile.endpoint(), "192.168.1.50:44818");
    assert_eq!(profile.poll_interval(), Duration::from_millis(1000));
    assert_eq!(profile.tags().len(), 6);

    let temperature = profile.tag("temperature_1").unwrap();
    assert_eq!(temperature.data_kind, DataKind::Int);
    assert_eq!(temperature.published_kind(), DataKind::Float);
    assert_eq!(profile.tag("conductivity_1").unwrap().scale, 1.0);
}

#[test]
fn minimal_document_takes_defaults() {
    let raw = r#"{
        "device_address": "10.0.0.7",
        "tags": [
            {"name":"level","device_address_path":"Level","data_kind":"INT","opc_node_id":"ns=2;s=Level"}
        ]
    }"#;
    let profile = DeviceProfile::from_json_str(raw).unwrap();
    assert_eq!(profile.port(), 44818);
    assert_eq!(profile.poll_interval(), Duration::from_millis(1000));
}

#[test]
fn rejects_unknown_data_kind() {
    let raw = r#"{
        "device_address": "10.0.0.7",
        "tags": [
            {"name":"level","device_address_path":"Level","data_kind":"DOUBLE","opc_node_id":"ns=2;s=Level"}
        ]
    }"#;
    assert!(matches!(
        DeviceProfile::from_json_str(raw),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn rejects_missing_address() {
    let raw = r#"{
        "tags": [
            {"name":"level","device_address_path":"Level","data_kind":"INT","opc_node_id":"ns=2;s=Level"}
        ]
    }"#;
    assert!(matches!(
        DeviceProfile::from_json_str(raw),
        Err(ConfigError::MissingAddress)
    ));
}

#[test]
fn rejects_duplicate_node_ids() {
    let raw = r#"{
        "device_address": "10.0.0.7",
        "tags": [
            {"name":"a","device_address_path":"A","data_kind":"INT","opc_node_id":"ns=2;s=Same"},
            {"name":"b","device_address_path":"B","data_kind":"INT","opc_node_id":"ns=2;s=Same"}
        ]
    }"#;
    match DeviceProfile::from_json_str(raw) {
        Err(ConfigError::DuplicateNodeId { node_id, first, second }) => {
            assert_eq!(node_id, "ns=2;s=Same");
            assert_eq!((first.as_str(), second.as_str()), ("a", "b"));
        }
        other => panic!("expected duplicate node id, got {other:?}"),
    }
}

#[test]
fn missing_file_is_a_config_error() {
    let err = DeviceProfile::load(std::path::Path::new("/nonexistent/profile.json")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
