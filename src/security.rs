use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::CoreContext;
use crate::errors::ValidationError;
use crate::wire::envelope::{canonical_json, Envelope, OperatorAction, OperatorCommand};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_KEY_ID: &str = "default";
const KEY_ENV_PREFIX: &str = "HMAC_KEY_";

/// Operator roles, least privilege first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ReadOnly,
    Operator,
    Admin,
}

impl Role {
    fn parse(raw: &str) -> Option<Role> {
        match raw.to_ascii_lowercase().as_str() {
            "readonly" => Some(Role::ReadOnly),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

/// Verifies HMAC-SHA256 signatures on envelopes and operator commands.
///
/// Envelope canonical string:  `ts.nonce.canonical_json(payload)`
/// Command canonical string:   `ts:action:actor_id:command_id`
///
/// Acceptance requires: skew within tolerance, unseen (producer, nonce)
/// within the dedup window, and a constant-time HMAC match against the key
/// named by `key_id`.
pub struct SignatureVerifier {
    keys: HashMap<String, String>,
    clock_skew_tolerance_ms: i64,
    dedup_window_ms: i64,
    // (producer, nonce) -> first_seen_ts
    seen_nonces: DashMap<(String, String), i64>,
    rbac: HashMap<String, Role>,
    ctx: Arc<CoreContext>,
}

impl SignatureVerifier {
    /// Load keys from the process environment. `HMAC_SECRET` is the default
    /// key; `HMAC_KEY_<ID>` adds named keys. `*_FILE` indirection is resolved
    /// by `load_secrets_from_files` before this runs.
    ///
    /// FAIL-CLOSED INVARIANT: an empty keyring is fatal unless
    /// `HMAC_ALLOW_EMPTY_SECRET=true` (test rigs only).
    pub fn from_env(
        clock_skew_tolerance_ms: i64,
        dedup_window_ms: i64,
        rbac_roles: &HashMap<String, String>,
        ctx: Arc<CoreContext>,
    ) -> Self {
        let mut keys = HashMap::new();
        if let Ok(secret) = env::var("HMAC_SECRET") {
            if !secret.is_empty() {
                keys.insert(DEFAULT_KEY_ID.to_string(), secret);
            }
        }
        for (name, value) in env::vars() {
            if let Some(key_id) = name.strip_prefix(KEY_ENV_PREFIX) {
                if !value.is_empty() {
                    keys.insert(key_id.to_ascii_lowercase(), value);
                }
            }
        }

        if keys.is_empty() {
            let allow_empty = env::var("HMAC_ALLOW_EMPTY_SECRET")
                .map(|v| v == "true")
                .unwrap_or(false);
            if allow_empty {
                warn!("⚠️ No HMAC keys configured but HMAC_ALLOW_EMPTY_SECRET=true. TEST MODE ONLY.");
            } else {
                panic!(
                    "FATAL: HMAC_SECRET (or HMAC_KEY_<ID>) is required. \
                     Set HMAC_ALLOW_EMPTY_SECRET=true only for testing."
                );
            }
        } else {
            info!(
                "🔐 Signature verifier initialized ({} key(s), tol {}ms)",
                keys.len(),
                clock_skew_tolerance_ms
            );
        }

        Self::with_keys(keys, clock_skew_tolerance_ms, dedup_window_ms, rbac_roles, ctx)
    }

    pub fn with_keys(
        keys: HashMap<String, String>,
        clock_skew_tolerance_ms: i64,
        dedup_window_ms: i64,
        rbac_roles: &HashMap<String, String>,
        ctx: Arc<CoreContext>,
    ) -> Self {
        let rbac = rbac_roles
            .iter()
            .filter_map(|(actor, role)| Role::parse(role).map(|r| (actor.clone(), r)))
            .collect();
        Self {
            keys,
            clock_skew_tolerance_ms,
            dedup_window_ms,
            seen_nonces: DashMap::new(),
            rbac,
            ctx,
        }
    }

    fn key_for(&self, key_id: Option<&str>) -> Result<&str, ValidationError> {
        let id = key_id.unwrap_or(DEFAULT_KEY_ID);
        self.keys
            .get(id)
            .map(|s| s.as_str())
            .ok_or_else(|| ValidationError::UnknownKeyId(id.to_string()))
    }

    fn check_skew(&self, ts: i64) -> Result<(), ValidationError> {
        let skew = (self.ctx.time.now_millis() - ts).abs();
        if skew > self.clock_skew_tolerance_ms {
            return Err(ValidationError::TimestampSkew {
                skew_ms: skew,
                tolerance_ms: self.clock_skew_tolerance_ms,
            });
        }
        Ok(())
    }

    /// Record (producer, nonce); a repeat inside the window is a replay.
    fn check_replay(&self, producer: &str, nonce: &str) -> Result<(), ValidationError> {
        let now = self.ctx.time.now_millis();
        let key = (producer.to_string(), nonce.to_string());
        if let Some(first_seen) = self.seen_nonces.get(&key) {
            if now - *first_seen <= self.dedup_window_ms {
                return Err(ValidationError::ReplayDetected {
                    producer: producer.to_string(),
                    nonce: nonce.to_string(),
                });
            }
        }
        self.seen_nonces.insert(key, now);
        Ok(())
    }

    /// Drop nonce records older than the window. Called from the compaction
    /// tick; the map is bounded by producer cadence x window.
    pub fn compact(&self) {
        let cutoff = self.ctx.time.now_millis() - self.dedup_window_ms;
        self.seen_nonces.retain(|_, first_seen| *first_seen >= cutoff);
    }

    fn verify_mac(&self, secret: &str, canonical: &str, sig_hex: &str) -> Result<(), ValidationError> {
        let sig_bytes = hex::decode(sig_hex).map_err(|_| ValidationError::SignatureInvalid)?;
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ValidationError::SignatureInvalid)?;
        mac.update(canonical.as_bytes());
        // verify_slice is constant time
        mac.verify_slice(&sig_bytes)
            .map_err(|_| ValidationError::SignatureInvalid)
    }

    /// Full envelope check: skew, replay, then signature.
    pub fn verify_envelope(&self, envelope: &Envelope) -> Result<(), ValidationError> {
        if self.keys.is_empty() {
            // Test mode: structural checks still apply
            let nonce = envelope
                .nonce
                .as_deref()
                .ok_or(ValidationError::SignatureInvalid)?;
            self.check_skew(envelope.ts)?;
            return self.check_replay(&envelope.producer, nonce);
        }

        let sig = envelope
            .sig
            .as_deref()
            .ok_or(ValidationError::SignatureInvalid)?;
        let nonce = envelope
            .nonce
            .as_deref()
            .ok_or(ValidationError::SignatureInvalid)?;

        self.check_skew(envelope.ts)?;
        self.check_replay(&envelope.producer, nonce)?;

        let secret = self.key_for(envelope.key_id.as_deref())?;
        let payload_json = canonical_json(&envelope.payload)
            .map_err(|e| ValidationError::Decode(e.to_string()))?;
        let canonical = format!("{}.{}.{}", envelope.ts, nonce, payload_json);
        self.verify_mac(secret, &canonical, sig)
    }

    /// Operator command check: skew, signature, then RBAC.
    pub fn verify_operator_command(&self, cmd: &OperatorCommand) -> Result<(), ValidationError> {
        self.check_skew(cmd.timestamp)?;

        if !self.keys.is_empty() {
            let canonical = format!(
                "{}:{}:{}:{}",
                cmd.timestamp,
                cmd.action.as_str(),
                cmd.actor_id,
                cmd.command_id
            );
            let secret = self.key_for(None)?;
            self.verify_mac(secret, &canonical, &cmd.signature)?;
        }

        self.check_rbac(&cmd.actor_id, cmd.action)
    }

    /// ARM (the only de-escalation path) requires admin; the remaining
    /// actions require at least operator; readonly can invoke nothing.
    fn check_rbac(&self, actor_id: &str, action: OperatorAction) -> Result<(), ValidationError> {
        let role = self.rbac.get(actor_id).copied().unwrap_or(Role::ReadOnly);
        let allowed = match action {
            OperatorAction::Arm => role == Role::Admin,
            OperatorAction::Disarm
            | OperatorAction::Halt
            | OperatorAction::Resume
            | OperatorAction::PolicyUpdate => {
                matches!(role, Role::Operator | Role::Admin)
            }
        };
        if allowed {
            Ok(())
        } else {
            Err(ValidationError::Forbidden {
                actor_id: actor_id.to_string(),
                action: action.as_str().to_string(),
            })
        }
    }
}

/// Sign helper used by tests and by synthetic intents the core itself emits.
pub fn sign_envelope_payload(secret: &str, ts: i64, nonce: &str, payload: &Value) -> String {
    let payload_json = canonical_json(payload).expect("payload serializes");
    let canonical = format!("{}.{}.{}", ts, nonce, payload_json);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn sign_operator_command(secret: &str, ts: i64, action: &str, actor_id: &str, command_id: &str) -> String {
    let canonical = format!("{}:{}:{}:{}", ts, action, actor_id, command_id);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_verifier(keys: Vec<(&str, &str)>) -> SignatureVerifier {
        let ctx = Arc::new(CoreContext::new_simulated(1_700_000_000_000));
        let keys = keys
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut rbac = HashMap::new();
        rbac.insert("alice".to_string(), "admin".to_string());
        rbac.insert("bob".to_string(), "operator".to_string());
        rbac.insert("carol".to_string(), "readonly".to_string());
        SignatureVerifier::with_keys(keys, 5_000, 60_000, &rbac, ctx)
    }

    fn signed_envelope(secret: &str, ts: i64, nonce: &str) -> Envelope {
        let payload = json!({"state": "NONE", "timestamp": ts});
        let sig = sign_envelope_payload(secret, ts, nonce, &payload);
        Envelope {
            id: "01HX0000000000000000000003".into(),
            message_type: "titan.cmd.sys.halt.v1".into(),
            version: 1,
            schema_version: 1,
            ts,
            producer: "console".into(),
            correlation_id: None,
            causation_id: None,
            partition_key: None,
            idempotency_key: None,
            sig: Some(sig),
            key_id: None,
            nonce: Some(nonce.into()),
            payload,
        }
    }

    #[test]
    fn accepts_valid_signature() {
        let v = test_verifier(vec![("default", "s3cr3t")]);
        let env = signed_envelope("s3cr3t", 1_700_000_000_000, "n-1");
        assert!(v.verify_envelope(&env).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let v = test_verifier(vec![("default", "other")]);
        let env = signed_envelope("s3cr3t", 1_700_000_000_000, "n-2");
        assert!(matches!(
            v.verify_envelope(&env),
            Err(ValidationError::SignatureInvalid)
        ));
    }

    #[test]
    fn rejects_replayed_nonce() {
        let v = test_verifier(vec![("default", "s3cr3t")]);
        let env = signed_envelope("s3cr3t", 1_700_000_000_000, "n-3");
        assert!(v.verify_envelope(&env).is_ok());
        assert!(matches!(
            v.verify_envelope(&env),
            Err(ValidationError::ReplayDetected { .. })
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let v = test_verifier(vec![("default", "s3cr3t")]);
        let env = signed_envelope("s3cr3t", 1_700_000_000_000 - 10_000, "n-4");
        assert!(matches!(
            v.verify_envelope(&env),
            Err(ValidationError::TimestampSkew { .. })
        ));
    }

    #[test]
    fn rejects_unknown_key_id() {
        let v = test_verifier(vec![("default", "s3cr3t")]);
        let mut env = signed_envelope("s3cr3t", 1_700_000_000_000, "n-5");
        env.key_id = Some("ghost".into());
        assert!(matches!(
            v.verify_envelope(&env),
            Err(ValidationError::UnknownKeyId(_))
        ));
    }

    #[test]
    fn signature_is_key_order_independent() {
        let a = json!({"a": 1, "b": {"y": 2, "x": 3}});
        let b = json!({"b": {"x": 3, "y": 2}, "a": 1});
        let sig_a = sign_envelope_payload("k", 1, "n", &a);
        let sig_b = sign_envelope_payload("k", 1, "n", &b);
        assert_eq!(sig_a, sig_b);
    }

    fn operator_cmd(actor: &str, action: OperatorAction, secret: &str) -> OperatorCommand {
        let ts = 1_700_000_000_000;
        let command_id = format!("cmd-{}", actor);
        OperatorCommand {
            command_id: command_id.clone(),
            action,
            actor_id: actor.into(),
            timestamp: ts,
            signature: sign_operator_command(secret, ts, action.as_str(), actor, &command_id),
            state_hash: None,
            reason: None,
            policy_hash: None,
        }
    }

    #[test]
    fn rbac_arm_requires_admin() {
        let v = test_verifier(vec![("default", "s3cr3t")]);

        let admin_arm = operator_cmd("alice", OperatorAction::Arm, "s3cr3t");
        assert!(v.verify_operator_command(&admin_arm).is_ok());

        let operator_arm = operator_cmd("bob", OperatorAction::Arm, "s3cr3t");
        assert!(matches!(
            v.verify_operator_command(&operator_arm),
            Err(ValidationError::Forbidden { .. })
        ));

        let operator_halt = operator_cmd("bob", OperatorAction::Halt, "s3cr3t");
        assert!(v.verify_operator_command(&operator_halt).is_ok());

        let readonly_halt = operator_cmd("carol", OperatorAction::Halt, "s3cr3t");
        assert!(matches!(
            v.verify_operator_command(&readonly_halt),
            Err(ValidationError::Forbidden { .. })
        ));
    }
}
