use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Append-only record of every state-changing decision.
/// `seq` is globally monotonic; entries are never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(default)]
    pub seq: u64,
    pub ts: i64,
    pub kind: EventKind,
    pub correlation_id: String,
    /// Fencing token: the leader term at decision time. Appends carrying a
    /// term below the persisted current term are refused.
    pub leader_term: u64,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IntentReceived,
    IntentValidated,
    IntentRejected,
    IntentExpired,
    OrderSubmitted,
    OrderFill,
    OrderCancelled,
    OrderIndeterminate,
    IntentExecuted,
    PositionClosed,
    OperatorChange,
    RiskStateChange,
    LeaderChange,
    DriftDetected,
    Fatal,
}

impl EventLogEntry {
    pub fn new(
        kind: EventKind,
        correlation_id: impl Into<String>,
        leader_term: u64,
        ts: i64,
        payload: Value,
    ) -> Self {
        Self {
            seq: 0, // assigned on append
            ts,
            kind,
            correlation_id: correlation_id.into(),
            leader_term,
            payload,
        }
    }
}
