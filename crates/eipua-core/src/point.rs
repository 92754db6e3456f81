use crate::session::SessionState;
use serde::{Deserialize, Serialize};

/// A device or published value. The device side hands these out raw; the
/// translator produces the scaled form with the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<f64>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "BOOL",
            Value::Int(_) => "INT",
            Value::Float(_) => "FLOAT",
            Value::String(_) => "STRING",
            Value::Array(_) => "ARRAY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadErrorKind {
    Timeout,
    Transport,
    Protocol,
    Unsupported,
    NotConnected,
}

/// Outcome of reading one tag in one cycle. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResult {
    pub tag_name: String,
    pub raw_value: Option<Value>,
    /// Wall-clock sampling time, microseconds since the Unix epoch.
    pub timestamp_us: u64,
    pub ok: bool,
    pub error_kind: Option<ReadErrorKind>,
}

impl ReadResult {
    pub fn success(tag_name: impl Into<String>, raw_value: Value, timestamp_us: u64) -> Self {
        Self {
            tag_name: tag_name.into(),
            raw_value: Some(raw_value),
            timestamp_us,
            ok: true,
            error_kind: None,
        }
    }

    pub fn failure(tag_name: impl Into<String>, kind: ReadErrorKind, timestamp_us: u64) -> Self {
        Self {
            tag_name: tag_name.into(),
            raw_value: None,
            timestamp_us,
            ok: false,
            error_kind: Some(kind),
        }
    }
}

/// Reads of one poll cycle, in profile order.
#[derive(Debug, Clone, PartialEq)]
pub struct PollCycle {
    pub sequence: u64,
    /// Device session state observed when the reads were issued.
    pub session_state: SessionState,
    pub results: Vec<ReadResult>,
}

impl PollCycle {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.ok).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Quality {
    Good,
    Stale,
    Bad,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "GOOD",
            Quality::Stale => "STALE",
            Quality::Bad => "BAD",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub tag_name: String,
    /// Typed value. `None` only for BAD points with nothing to show.
    pub value: Option<Value>,
    pub quality: Quality,
    /// Sampling time of the read this point came from (held value's time for STALE).
    pub timestamp_us: u64,
    /// Raw device value kept for diagnostics on BAD points.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl DataPoint {
    pub fn is_good(&self) -> bool {
        self.quality == Quality::Good
    }
}
