//! Device profile: the structured result of parsing the device description.
//!
//! A profile is validated once at load and is immutable afterwards, so it can
//! be shared behind an `Arc` without locking.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ENIP_PORT: u16 = 44818;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataKind {
    Int,
    Float,
    Bool,
    String,
    Array,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Int => "INT",
            DataKind::Float => "FLOAT",
            DataKind::Bool => "BOOL",
            DataKind::String => "STRING",
            DataKind::Array => "ARRAY",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataKind::Int | DataKind::Float | DataKind::Array)
    }
}

/// Inclusive engineering range, checked after scaling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDescriptor {
    pub name: String,
    pub device_address_path: String,
    pub data_kind: DataKind,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    pub opc_node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ValueRange>,
}

fn default_scale() -> f64 {
    1.0
}

impl TagDescriptor {
    pub fn new(
        name: impl Into<String>,
        device_address_path: impl Into<String>,
        data_kind: DataKind,
        opc_node_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            device_address_path: device_address_path.into(),
            data_kind,
            scale: 1.0,
            offset: 0.0,
            opc_node_id: opc_node_id.into(),
            range: None,
        }
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some(ValueRange { min, max });
        self
    }

    /// True when scaling leaves integer values untouched.
    pub fn is_identity_scaling(&self) -> bool {
        self.scale == 1.0 && self.offset == 0.0
    }

    /// Kind of the value that ends up on the server node. Scaled integers
    /// are published as floating point.
    pub fn published_kind(&self) -> DataKind {
        match self.data_kind {
            DataKind::Int if !self.is_identity_scaling() => DataKind::Float,
            kind => kind,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                tag: self.name.clone(),
                field: "name",
            });
        }
        if self.device_address_path.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                tag: self.name.clone(),
                field: "device_address_path",
            });
        }
        if self.opc_node_id.trim().is_empty() {
            return Err(ConfigError::EmptyField {
                tag: self.name.clone(),
                field: "opc_node_id",
            });
        }
        if !self.scale.is_finite() || !self.offset.is_finite() {
            return Err(ConfigError::InvalidScale {
                tag: self.name.clone(),
            });
        }
        if let Some(range) = self.range {
            if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
                return Err(ConfigError::InvalidRange {
                    tag: self.name.clone(),
                    min: range.min,
                    max: range.max,
                });
            }
        }
        Ok(())
    }
}

/// On-disk shape of a profile, before validation.
#[derive(Debug, Deserialize)]
struct ProfileDocument {
    #[serde(default)]
    device_address: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(alias = "tags")]
    tag_descriptors: Vec<TagDescriptor>,
    #[serde(default = "default_poll_interval_ms")]
    poll_interval_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_ENIP_PORT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceProfile {
    device_address: String,
    port: u16,
    tag_descriptors: Vec<TagDescriptor>,
    poll_interval_ms: u64,
}

impl DeviceProfile {
    pub fn new(
        device_address: impl Into<String>,
        port: u16,
        tag_descriptors: Vec<TagDescriptor>,
        poll_interval_ms: u64,
    ) -> Result<Self, ConfigError> {
        let profile = Self {
            device_address: device_address.into().trim().to_string(),
            port,
            tag_descriptors,
            poll_interval_ms,
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let doc: ProfileDocument =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::new(
            doc.device_address,
            doc.port,
            doc.tag_descriptors,
            doc.poll_interval_ms,
        )
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let profile = Self::from_json_str(&json)?;
        log::info!(
            "loaded device profile {} with {} tags",
            path.display(),
            profile.tag_descriptors.len()
        );
        Ok(profile)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.device_address.is_empty() {
            return Err(ConfigError::MissingAddress);
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval);
        }
        if self.tag_descriptors.is_empty() {
            return Err(ConfigError::EmptyTagList);
        }

        let mut names: HashSet<&str> = HashSet::with_capacity(self.tag_descriptors.len());
        let mut node_ids: HashMap<&str, &str> = HashMap::with_capacity(self.tag_descriptors.len());
        for tag in &self.tag_descriptors {
            tag.validate()?;
            if !names.insert(tag.name.as_str()) {
                return Err(ConfigError::DuplicateTagName(tag.name.clone()));
            }
            if let Some(first) = node_ids.insert(tag.opc_node_id.as_str(), tag.name.as_str()) {
                return Err(ConfigError::DuplicateNodeId {
                    node_id: tag.opc_node_id.clone(),
                    first: first.to_string(),
                    second: tag.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn device_address(&self) -> &str {
        &self.device_address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` form used by the device transport.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.device_address, self.port)
    }

    pub fn tags(&self) -> &[TagDescriptor] {
        &self.tag_descriptors
    }

    pub fn tag(&self, name: &str) -> Option<&TagDescriptor> {
        self.tag_descriptors.iter().find(|t| t.name == name)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conductivity() -> TagDescriptor {
        TagDescriptor::new("conductivity_ch1", "AI1", DataKind::Float, "ns=2;s=Conductivity_Ch1")
            .with_scaling(0.1, 0.0)
    }

    #[test]
    fn accepts_minimal_profile() {
        let profile = DeviceProfile::new("192.168.178.237", 44818, vec![conductivity()], 1000)
            .expect("valid profile");
        assert_eq!(profile.endpoint(), "192.168.178.237:44818");
        assert_eq!(profile.poll_interval(), Duration::from_secs(1));
        assert!(profile.tag("conductivity_ch1").is_some());
    }

    #[test]
    fn rejects_missing_address() {
        let err = DeviceProfile::new("  ", 44818, vec![conductivity()], 1000).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAddress));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let mut second = conductivity();
        second.name = "conductivity_ch2".to_string();
        let err = DeviceProfile::new("10.0.0.1", 44818, vec![conductivity(), second], 1000)
            .unwrap_err();
        match err {
            ConfigError::DuplicateNodeId { first, second, .. } => {
                assert_eq!(first, "conductivity_ch1");
                assert_eq!(second, "conductivity_ch2");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_tag_names() {
        let mut second = conductivity();
        second.opc_node_id = "ns=2;s=Conductivity_Ch2".to_string();
        let err = DeviceProfile::new("10.0.0.1", 44818, vec![conductivity(), second], 1000)
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateTagName(name) if name == "conductivity_ch1"));
    }

    #[test]
    fn rejects_inverted_range() {
        let tag = conductivity().with_range(10.0, 0.0);
        let err = DeviceProfile::new("10.0.0.1", 44818, vec![tag], 1000).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidRange { .. }));
    }

    #[test]
    fn rejects_unknown_data_kind_in_json() {
        let json = r#"{
            "device_address": "10.0.0.1",
            "tag_descriptors": [
                {"name": "t", "device_address_path": "AI1", "data_kind": "DOUBLE", "opc_node_id": "ns=2;s=T"}
            ]
        }"#;
        assert!(matches!(
            DeviceProfile::from_json_str(json),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn json_defaults_apply() {
        let json = r#"{
            "device_address": "10.0.0.1",
            "tags": [
                {"name": "t", "device_address_path": "AI1", "data_kind": "INT", "opc_node_id": "ns=2;s=T"}
            ]
        }"#;
        let profile = DeviceProfile::from_json_str(json).unwrap();
        assert_eq!(profile.port(), DEFAULT_ENIP_PORT);
        assert_eq!(profile.poll_interval(), Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
        assert_eq!(profile.tags()[0].scale, 1.0);
        assert_eq!(profile.tags()[0].published_kind(), DataKind::Int);
    }

    #[test]
    fn scaled_int_publishes_as_float() {
        let tag = TagDescriptor::new("t", "AI1", DataKind::Int, "n").with_scaling(0.5, 0.0);
        assert_eq!(tag.published_kind(), DataKind::Float);
    }
}
