pub mod adapter;
pub mod outbox;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

/// Outbound event boundary for the lifecycle and safety components.
///
/// The NATS implementation wraps payloads in signed envelopes and handles
/// dual-publish + outbox buffering; `MemorySink` is the loopback used by
/// tests and replay tooling.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish_event(
        &self,
        type_name: &str,
        partitions: &[&str],
        payload: Value,
        correlation_id: Option<&str>,
    );
}

/// Captures published events in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<RecordedEvent>>,
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub type_name: String,
    pub partitions: Vec<String>,
    pub payload: Value,
    pub correlation_id: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn events_of(&self, type_name: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.type_name == type_name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn publish_event(
        &self,
        type_name: &str,
        partitions: &[&str],
        payload: Value,
        correlation_id: Option<&str>,
    ) {
        self.events.lock().push(RecordedEvent {
            type_name: type_name.to_string(),
            partitions: partitions.iter().map(|s| s.to_string()).collect(),
            payload,
            correlation_id: correlation_id.map(|s| s.to_string()),
        });
    }
}
