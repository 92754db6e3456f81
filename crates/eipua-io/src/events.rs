use eipua_core::{EngineState, SessionSide};
use serde::Serialize;

/// Operational events worth keeping outside the log stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    StateTransition {
        from: EngineState,
        to: EngineState,
    },
    SessionConnected {
        side: SessionSide,
    },
    SessionDisconnected {
        side: SessionSide,
        clean: bool,
    },
    SessionFaulted {
        side: SessionSide,
        error: String,
        consecutive_failures: u32,
        backoff_ms: u64,
    },
    NodesValidated {
        existing: usize,
        created: usize,
        failed: usize,
    },
    PublishBatch {
        cycle: u64,
        written: usize,
        failed: usize,
        skipped: usize,
    },
    CycleSkipped {
        sequence: u64,
        reason: String,
    },
    Shutdown {
        clean: bool,
    },
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: &EngineEvent);
}

/// Sink used when no audit trail is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: &EngineEvent) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<EngineEvent>>,
    }

    impl RecordingSink {
        pub fn snapshot(&self) -> Vec<EngineEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn record(&self, event: &EngineEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
