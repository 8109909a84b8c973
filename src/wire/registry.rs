use serde_json::Value;

use crate::errors::ValidationError;
use crate::wire::envelope::{Envelope, Payload};
use crate::wire::subjects;

/// One recognized `(type, version)` tuple: its payload schema ceiling, its
/// subject template, and any legacy subjects still accepted on ingress.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    pub type_name: &'static str,
    pub version: u32,
    /// Highest payload `schema_version` this build can decode.
    pub max_schema_version: u32,
    pub subject_prefix: &'static str,
    /// Number of trailing partition tokens the subject takes
    /// (e.g. place is `<venue>.<account>.<symbol>` = 3).
    pub partition_arity: usize,
    pub legacy_subjects: &'static [&'static str],
}

/// The canonical table. Everything the core sends or accepts is listed here;
/// anything else is `UnknownType`.
const TABLE: &[MessageSpec] = &[
    MessageSpec {
        type_name: "titan.cmd.execution.place.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::CMD_EXECUTION_PLACE_PREFIX,
        partition_arity: 3,
        legacy_subjects: &[subjects::LEGACY_SIGNAL_SUBMIT],
    },
    MessageSpec {
        type_name: "titan.cmd.operator.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::CMD_OPERATOR,
        partition_arity: 0,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.cmd.sys.halt.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::CMD_SYS_HALT,
        partition_arity: 0,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.data.market.ticker.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::DATA_MARKET_TICKER_PREFIX,
        partition_arity: 2,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.data.venues.status.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::DATA_VENUES_STATUS,
        partition_arity: 0,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.evt.execution.fill.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::EVT_EXECUTION_FILL,
        partition_arity: 2,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.evt.execution.shadow_fill.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::EVT_EXECUTION_SHADOW_FILL,
        partition_arity: 1,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.evt.execution.report.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::EVT_EXECUTION_REPORT,
        partition_arity: 0,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.evt.execution.reject.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::EVT_EXECUTION_REJECT,
        partition_arity: 0,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.evt.execution.drift.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::EVT_EXECUTION_DRIFT,
        partition_arity: 0,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.evt.ops.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::EVT_OPS_PREFIX,
        partition_arity: 1,
        legacy_subjects: &[],
    },
    MessageSpec {
        type_name: "titan.sys.heartbeat.v1",
        version: 1,
        max_schema_version: 1,
        subject_prefix: subjects::SYS_HEARTBEAT_PREFIX,
        partition_arity: 1,
        legacy_subjects: &[],
    },
];

pub struct SubjectRegistry;

impl SubjectRegistry {
    pub fn resolve(type_name: &str) -> Result<&'static MessageSpec, ValidationError> {
        TABLE
            .iter()
            .find(|spec| spec.type_name == type_name)
            .ok_or_else(|| ValidationError::UnknownType(type_name.to_string()))
    }

    /// Build the concrete subject for a type plus its partition tokens.
    /// Symbol tokens must already be rendered subject-safe (`/` and `:` are
    /// not NATS token characters).
    pub fn subject_for(type_name: &str, partitions: &[&str]) -> Result<String, ValidationError> {
        let spec = Self::resolve(type_name)?;
        if partitions.len() != spec.partition_arity {
            return Err(ValidationError::Decode(format!(
                "subject for {} takes {} partition tokens, got {}",
                type_name,
                spec.partition_arity,
                partitions.len()
            )));
        }
        if partitions.is_empty() {
            return Ok(spec.subject_prefix.to_string());
        }
        let mut subject = String::from(spec.subject_prefix);
        for token in partitions {
            subject.push('.');
            subject.push_str(&subject_token(token));
        }
        Ok(subject)
    }

    /// During a subject migration both the canonical and every legacy subject
    /// receive the publish.
    pub fn dual_publish_subjects(type_name: &str) -> Result<Vec<String>, ValidationError> {
        let spec = Self::resolve(type_name)?;
        let mut out = vec![spec.subject_prefix.to_string()];
        out.extend(spec.legacy_subjects.iter().map(|s| s.to_string()));
        Ok(out)
    }

    /// Serialize an envelope after cross-validating its type and schema
    /// version against the table. `version` (the `type.vN` suffix) and
    /// `schema_version` are independent; both are checked.
    pub fn encode(env: &Envelope) -> Result<Vec<u8>, ValidationError> {
        let spec = Self::resolve(&env.message_type)?;
        if env.schema_version > spec.max_schema_version {
            return Err(ValidationError::SchemaMismatch {
                message_type: env.message_type.clone(),
                got: env.schema_version,
                supported: spec.max_schema_version,
            });
        }
        serde_json::to_vec(env).map_err(|e| ValidationError::Decode(e.to_string()))
    }

    /// Parse bytes into an envelope. Rejects unknown types and payload schema
    /// versions newer than implemented; normalizes legacy payload aliases.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, ValidationError> {
        let mut env: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::Decode(e.to_string()))?;

        let spec = Self::resolve(&env.message_type)?;
        if env.schema_version > spec.max_schema_version {
            return Err(ValidationError::SchemaMismatch {
                message_type: env.message_type.clone(),
                got: env.schema_version,
                supported: spec.max_schema_version,
            });
        }

        normalize_legacy_fields(&mut env.payload);
        Ok(env)
    }

    /// Typed dispatch keyed by the registry entry. Exhaustive: every entry in
    /// TABLE that can arrive on a consumer has a typed arm.
    pub fn decode_payload(env: &Envelope) -> Result<Payload, ValidationError> {
        let spec = Self::resolve(&env.message_type)?;
        let payload = env.payload.clone();
        let typed = match spec.type_name {
            "titan.cmd.execution.place.v1" => Payload::Intent(from_value(payload)?),
            "titan.cmd.operator.v1" => Payload::Operator(from_value(payload)?),
            "titan.cmd.sys.halt.v1" => Payload::Halt(from_value(payload)?),
            "titan.data.market.ticker.v1" => Payload::Ticker(from_value(payload)?),
            "titan.data.venues.status.v1" => Payload::VenueStatus(from_value(payload)?),
            "titan.evt.execution.fill.v1" => Payload::Fill(from_value(payload)?),
            other => return Err(ValidationError::UnknownType(other.to_string())),
        };
        Ok(typed)
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ValidationError> {
    serde_json::from_value(value).map_err(|e| ValidationError::Decode(e.to_string()))
}

/// Backward compatibility table, applied on ingress only.
/// Known aliases: `timestamp` -> `t_signal` on intent payloads.
fn normalize_legacy_fields(payload: &mut Value) {
    if let Some(obj) = payload.as_object_mut() {
        if !obj.contains_key("t_signal") {
            if let Some(ts) = obj.remove("timestamp") {
                obj.insert("t_signal".to_string(), ts);
            }
        }
    }
}

/// Render one canonical-symbol partition token: `BTC/USDT:PERP` -> `BTC_USDT_PERP`.
pub fn subject_token(raw: &str) -> String {
    raw.replace(['/', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn halt_envelope() -> Envelope {
        Envelope {
            id: "01HX0000000000000000000001".into(),
            message_type: "titan.cmd.sys.halt.v1".into(),
            version: 1,
            schema_version: 1,
            ts: 1_700_000_000_000,
            producer: "console".into(),
            correlation_id: Some("corr-1".into()),
            causation_id: None,
            partition_key: None,
            idempotency_key: Some("idem-1".into()),
            sig: None,
            key_id: None,
            nonce: None,
            payload: json!({"state": "HARD_HALT", "reason": "drill", "timestamp": 1_700_000_000_000i64}),
        }
    }

    #[test]
    fn round_trip() {
        let env = halt_envelope();
        let bytes = SubjectRegistry::encode(&env).unwrap();
        let decoded = SubjectRegistry::decode(&bytes).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn rejects_unknown_type() {
        let mut env = halt_envelope();
        env.message_type = "titan.cmd.mystery.v9".into();
        let err = SubjectRegistry::encode(&env).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownType(_)));
    }

    #[test]
    fn rejects_newer_schema_version() {
        let mut env = halt_envelope();
        env.schema_version = 2;
        let err = SubjectRegistry::encode(&env).unwrap_err();
        assert!(matches!(err, ValidationError::SchemaMismatch { .. }));
    }

    #[test]
    fn place_subject_is_partitioned() {
        let subject = SubjectRegistry::subject_for(
            "titan.cmd.execution.place.v1",
            &["paper", "main", "BTC/USDT:PERP"],
        )
        .unwrap();
        assert_eq!(
            subject,
            "titan.cmd.execution.place.v1.paper.main.BTC_USDT_PERP"
        );
    }

    #[test]
    fn place_subject_arity_enforced() {
        let err =
            SubjectRegistry::subject_for("titan.cmd.execution.place.v1", &["paper"]).unwrap_err();
        assert!(matches!(err, ValidationError::Decode(_)));
    }

    #[test]
    fn dual_publish_includes_legacy_alias() {
        let subjects =
            SubjectRegistry::dual_publish_subjects("titan.cmd.execution.place.v1").unwrap();
        assert!(subjects.contains(&"titan.cmd.execution.place.v1".to_string()));
        assert!(subjects.contains(&"titan.signal.submit.v1".to_string()));
    }

    #[test]
    fn legacy_timestamp_normalized_on_decode() {
        let raw = json!({
            "id": "01HX0000000000000000000002",
            "type": "titan.cmd.execution.place.v1",
            "version": 1,
            "ts": 1_700_000_000_000i64,
            "producer": "brain",
            "payload": {
                "signal_id": "sig-legacy",
                "symbol": "BTC/USDT:PERP",
                "direction": 1,
                "type": "BUY_SETUP",
                "size": 0.1,
                "status": "PENDING",
                "timestamp": 42
            }
        });
        let env = SubjectRegistry::decode(&serde_json::to_vec(&raw).unwrap()).unwrap();
        assert_eq!(env.payload.get("t_signal").and_then(|v| v.as_i64()), Some(42));
        assert!(env.payload.get("timestamp").is_none());

        match SubjectRegistry::decode_payload(&env).unwrap() {
            Payload::Intent(intent) => assert_eq!(intent.t_signal, 42),
            other => panic!("expected intent payload, got {:?}", other),
        }
    }
}
