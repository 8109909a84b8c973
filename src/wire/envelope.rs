use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{BookTicker, FillEvent, HaltState, Intent};

/// Immutable wrapper around every bus message.
///
/// `(producer, nonce)` must be unique within the dedup window; the security
/// layer enforces that. `payload` stays a raw `Value` here so the signature
/// can be verified over the exact bytes-as-sent before typed dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub version: u32,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub ts: i64,
    pub producer: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    // Security fields: hex HMAC over ts.nonce.canonical_json(payload)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    pub payload: Value,
}

fn default_schema_version() -> u32 {
    1
}

impl Envelope {
    /// The broker dedup id: idempotency_key, falling back to the envelope id.
    pub fn dedup_id(&self) -> &str {
        self.idempotency_key.as_deref().unwrap_or(&self.id)
    }

    pub fn correlation_or_id(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.id)
    }
}

/// Typed payload variants, keyed by `(type, schema_version)` in the registry.
/// Dispatch is exhaustive: an unrecognized type is a decode error upstream,
/// never a catch-all variant.
#[derive(Debug, Clone)]
pub enum Payload {
    Intent(Intent),
    Operator(OperatorCommand),
    Halt(HaltCommand),
    Ticker(BookTicker),
    VenueStatus(VenueStatus),
    Fill(FillEvent),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperatorAction {
    #[serde(rename = "ARM")]
    Arm,
    #[serde(rename = "DISARM")]
    Disarm,
    #[serde(rename = "HALT")]
    Halt,
    #[serde(rename = "RESUME")]
    Resume,
    #[serde(rename = "POLICY_UPDATE")]
    PolicyUpdate,
}

impl OperatorAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperatorAction::Arm => "ARM",
            OperatorAction::Disarm => "DISARM",
            OperatorAction::Halt => "HALT",
            OperatorAction::Resume => "RESUME",
            OperatorAction::PolicyUpdate => "POLICY_UPDATE",
        }
    }
}

/// Operator command payload. Signature covers
/// `timestamp:action:actor_id:command_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCommand {
    pub command_id: String,
    pub action: OperatorAction,
    pub actor_id: String,
    pub timestamp: i64,
    pub signature: String,
    /// OCC: when present, must match the live OperatorState.state_hash.
    #[serde(default)]
    pub state_hash: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    /// New policy digest for POLICY_UPDATE.
    #[serde(default)]
    pub policy_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaltCommand {
    pub state: HaltState,
    #[serde(default)]
    pub reason: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueStatus {
    pub venue: String,
    pub status: String, // UP | DEGRADED | DOWN
    pub timestamp: i64,
}

/// Canonical JSON: UTF-8, keys sorted, no insignificant whitespace.
/// serde_json serializes `Value` objects from a BTreeMap (the `preserve_order`
/// feature is off), so `to_string` already yields sorted keys.
pub fn canonical_json(value: &Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let payload = json!({
            "b": 2,
            "a": 1,
            "c": [3, 2, 1] // arrays preserve order
        });
        assert_eq!(
            canonical_json(&payload).unwrap(),
            r#"{"a":1,"b":2,"c":[3,2,1]}"#
        );
    }

    #[test]
    fn schema_version_defaults_to_one() {
        let raw = json!({
            "id": "01HX0000000000000000000000",
            "type": "titan.cmd.sys.halt.v1",
            "version": 1,
            "ts": 1700000000000i64,
            "producer": "console",
            "payload": {"state": "NONE", "timestamp": 1700000000000i64}
        });
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(env.schema_version, 1);
        assert_eq!(env.dedup_id(), env.id);
    }
}
