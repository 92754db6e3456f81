//! Persistent JSONL trail of engine events.
//!
//! Every state transition, session change and publish batch the engine
//! reports is appended as one line, alongside process start and stop.

use eipua_core::TimeBase;
use eipua_io::{EngineEvent, EventSink};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SystemStart,
    /// Anything reported by the running engine; `details` holds the event.
    Engine,
    SystemShutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotonic microseconds since the logger opened.
    pub timestamp_us: u64,
    pub unix_us: u64,
    pub event_type: AuditEventType,
    pub details: serde_json::Value,
}

/// Thread-safe audit logger that writes to a JSONL file.
pub struct AuditLogger {
    writer: Mutex<BufWriter<File>>,
    timebase: TimeBase,
}

impl AuditLogger {
    /// Opens `path` in append mode, creating parent directories.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            timebase: TimeBase::new(),
        })
    }

    fn writer(&self) -> MutexGuard<'_, BufWriter<File>> {
        self.writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn log(&self, entry: &AuditEntry) -> std::io::Result<()> {
        let mut writer = self.writer();
        serde_json::to_writer(&mut *writer, entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn log_event(
        &self,
        event_type: AuditEventType,
        details: serde_json::Value,
    ) -> std::io::Result<()> {
        self.log(&AuditEntry {
            timestamp_us: self.timebase.now_us(),
            unix_us: self.timebase.unix_us(),
            event_type,
            details,
        })
    }
}

impl EventSink for AuditLogger {
    fn record(&self, event: &EngineEvent) {
        let result = serde_json::to_value(event)
            .map_err(std::io::Error::from)
            .and_then(|details| self.log_event(AuditEventType::Engine, details));
        if let Err(e) = result {
            warn!(error = %e, "Failed to append audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eipua_core::{EngineState, SessionSide};
    use std::io::Read;
    use tempfile::tempdir;

    fn read_entries(path: &Path) -> Vec<AuditEntry> {
        let mut content = String::new();
        File::open(path)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn engine_events_are_written_as_jsonl() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let logger = AuditLogger::new(&path).unwrap();

        logger
            .log_event(
                AuditEventType::SystemStart,
                serde_json::json!({"version": "0.1.0"}),
            )
            .unwrap();
        logger.record(&EngineEvent::StateTransition {
            from: EngineState::Connecting,
            to: EngineState::Running,
        });
        logger.record(&EngineEvent::SessionFaulted {
            side: SessionSide::Device,
            error: "connection refused or reset: reset by peer".to_string(),
            consecutive_failures: 2,
            backoff_ms: 2000,
        });

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].event_type, AuditEventType::SystemStart);
        assert_eq!(entries[1].event_type, AuditEventType::Engine);
        assert_eq!(entries[1].details["event"], "state_transition");
        assert_eq!(entries[1].details["to"], "RUNNING");
        assert_eq!(entries[2].details["side"], "device");
        assert_eq!(entries[2].details["consecutive_failures"], 2);
        assert!(entries[2].timestamp_us >= entries[1].timestamp_us);
    }

    #[test]
    fn reopening_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        AuditLogger::new(&path)
            .unwrap()
            .record(&EngineEvent::Shutdown { clean: true });
        AuditLogger::new(&path)
            .unwrap()
            .record(&EngineEvent::Shutdown { clean: false });

        let entries = read_entries(&path);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].details["clean"], true);
        assert_eq!(entries[1].details["clean"], false);
    }
}
