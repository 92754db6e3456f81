//! Error taxonomy shared by every layer of the gateway.
//!
//! Only [`ConfigError`] is fatal. Transport and protocol errors are handled
//! by the component that owns the session, translation errors degrade a
//! single point to BAD quality, and [`GatewayError::Cancelled`] unwinds a
//! task during shutdown.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("translation error: {0}")]
    Translation(#[from] TranslationError),

    #[error("operation cancelled: shutdown in progress")]
    Cancelled,
}

impl GatewayError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, GatewayError::Config(_))
    }
}

/// Bad device profile or endpoint. Never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device profile has no device address")]
    MissingAddress,

    #[error("device profile declares no tags")]
    EmptyTagList,

    #[error("duplicate OPC UA node id '{node_id}' (tags '{first}' and '{second}')")]
    DuplicateNodeId {
        node_id: String,
        first: String,
        second: String,
    },

    #[error("duplicate tag name '{0}'")]
    DuplicateTagName(String),

    #[error("tag '{tag}' has an empty {field}")]
    EmptyField { tag: String, field: &'static str },

    #[error("tag '{tag}' has a non-finite scale or offset")]
    InvalidScale { tag: String },

    #[error("tag '{tag}' range is invalid (min {min} > max {max})")]
    InvalidRange { tag: String, min: f64, max: f64 },

    #[error("poll interval must be greater than zero")]
    InvalidPollInterval,

    #[error("invalid OPC UA endpoint '{0}'")]
    Endpoint(String),

    #[error("invalid option {option}: {reason}")]
    Option { option: String, reason: String },

    #[error("failed to read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("failed to parse device profile: {0}")]
    Parse(String),
}

/// Session-level failure. Drives backoff.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("connection refused or reset: {0}")]
    Io(String),

    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("session is not connected")]
    NotConnected,

    #[error("session closed by peer")]
    Closed,

    #[error("reconnect gated by backoff for another {remaining:?}")]
    BackingOff { remaining: Duration },
}

/// Failure scoped to a single tag or node; the item is skipped for the cycle.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{target}: {reason}")]
pub struct ProtocolError {
    pub target: String,
    pub reason: String,
    pub unsupported: bool,
}

impl ProtocolError {
    pub fn new(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
            unsupported: false,
        }
    }

    pub fn unsupported(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
            unsupported: true,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TranslationError {
    #[error("tag '{tag}' declared {expected} but device returned {actual}")]
    TypeMismatch {
        tag: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("tag '{tag}' value {value} outside [{min}, {max}]")]
    OutOfRange {
        tag: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("tag '{tag}' produced a non-finite value")]
    NonFinite { tag: String },

    #[error("tag '{tag}' read failed")]
    ReadFailed { tag: String },
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
