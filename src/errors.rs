use rust_decimal::Decimal;
use thiserror::Error;

use crate::model::{HaltState, RiskState};

/// Transport failures are retried locally with backoff; everything else in
/// this file surfaces as an event and terminates the unit of work.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bus error: {0}")]
    Bus(String),
    #[error("Broker disconnected")]
    Disconnected,
    #[error("Venue call timed out after {attempts} attempts ({deadline_ms}ms deadline)")]
    VenueTimeout { attempts: u32, deadline_ms: u64 },
    #[error("Venue error: {0}")]
    Venue(String),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Unknown envelope type: {0}")]
    UnknownType(String),
    #[error("Schema mismatch for {message_type}: version {got} not implemented (max {supported})")]
    SchemaMismatch {
        message_type: String,
        got: u32,
        supported: u32,
    },
    #[error("Signature invalid")]
    SignatureInvalid,
    #[error("Timestamp skew {skew_ms}ms exceeds tolerance {tolerance_ms}ms")]
    TimestampSkew { skew_ms: i64, tolerance_ms: i64 },
    #[error("Replay detected: nonce '{nonce}' already seen from '{producer}'")]
    ReplayDetected { producer: String, nonce: String },
    #[error("Unknown key id: {0}")]
    UnknownKeyId(String),
    #[error("Actor '{actor_id}' lacks role for action {action}")]
    Forbidden { actor_id: String, action: String },
}

/// Typed rejection for the intent admission pipeline. Every variant maps to a
/// stable `reason_code` published on `titan.evt.execution.reject.v1`.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    Expired {
        age_ms: i64,
        ttl_ms: i64,
    },
    DuplicateSignal {
        signal_id: String,
    },
    SystemDisarmed,
    HaltActive(HaltState),
    PolicyHashMismatch {
        expected: String,
        actual: String,
    },
    TickerStale {
        venue: String,
        symbol: String,
        age_ms: i64,
    },
    SpreadDrift {
        spread_bps: Decimal,
        limit_bps: Decimal,
    },
    PositionCap {
        symbol: String,
        current: Decimal,
        additional: Decimal,
        limit: Decimal,
    },
    SlippageCap {
        expected_bps: Decimal,
        limit_bps: Decimal,
    },
    LeverageCap {
        symbol: String,
        current: Decimal,
        limit: Decimal,
    },
    RiskStateBlock {
        state: RiskState,
    },
    InvalidSize,
    MalformedSymbol {
        symbol: String,
    },
    VenueRejected {
        venue: String,
        detail: String,
    },
}

impl RejectReason {
    pub fn reason_code(&self) -> &'static str {
        match self {
            RejectReason::Expired { .. } => "INTENT_EXPIRED",
            RejectReason::DuplicateSignal { .. } => "DUPLICATE_SIGNAL",
            RejectReason::SystemDisarmed => "SYSTEM_DISARMED",
            RejectReason::HaltActive(HaltState::SoftHalt) => "SOFT_HALT",
            RejectReason::HaltActive(_) => "HARD_HALT",
            RejectReason::PolicyHashMismatch { .. } => "POLICY_HASH_MISMATCH",
            RejectReason::TickerStale { .. } => "TICKER_STALE",
            RejectReason::SpreadDrift { .. } => "SPREAD_DRIFT",
            RejectReason::PositionCap { .. } => "POSITION_CAP",
            RejectReason::SlippageCap { .. } => "SLIPPAGE_CAP",
            RejectReason::LeverageCap { .. } => "LEVERAGE_CAP",
            RejectReason::RiskStateBlock { .. } => "RISK_STATE_BLOCK",
            RejectReason::InvalidSize => "INVALID_SIZE",
            RejectReason::MalformedSymbol { .. } => "MALFORMED_SYMBOL",
            RejectReason::VenueRejected { .. } => "VENUE_REJECTED",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Expired { age_ms, ttl_ms } => {
                write!(f, "Intent expired: age {}ms > ttl {}ms", age_ms, ttl_ms)
            }
            RejectReason::DuplicateSignal { signal_id } => {
                write!(f, "Duplicate signal '{}' already in ledger", signal_id)
            }
            RejectReason::SystemDisarmed => write!(f, "Execution is DISARMED"),
            RejectReason::HaltActive(h) => write!(f, "Halt active: {:?}", h),
            RejectReason::PolicyHashMismatch { expected, actual } => write!(
                f,
                "Policy hash mismatch: expected {}, got {}",
                expected, actual
            ),
            RejectReason::TickerStale { venue, symbol, age_ms } => {
                write!(f, "Ticker stale: {} on {} ({}ms old)", symbol, venue, age_ms)
            }
            RejectReason::SpreadDrift { spread_bps, limit_bps } => {
                write!(f, "Spread drift {}bps > {}bps", spread_bps, limit_bps)
            }
            RejectReason::PositionCap {
                symbol,
                current,
                additional,
                limit,
            } => write!(
                f,
                "Position cap for {}: curr {:.2} + add {:.2} > limit {:.2}",
                symbol, current, additional, limit
            ),
            RejectReason::SlippageCap {
                expected_bps,
                limit_bps,
            } => write!(
                f,
                "Expected slippage {}bps > cap {}bps",
                expected_bps, limit_bps
            ),
            RejectReason::LeverageCap {
                symbol,
                current,
                limit,
            } => write!(
                f,
                "Leverage cap for {}: {:.2}x > {:.2}x",
                symbol, current, limit
            ),
            RejectReason::RiskStateBlock { state } => {
                write!(f, "Blocked by risk state {:?}", state)
            }
            RejectReason::InvalidSize => write!(f, "Invalid size (<= 0)"),
            RejectReason::MalformedSymbol { symbol } => {
                write!(f, "Symbol '{}' is not canonical BASE/QUOTE form", symbol)
            }
            RejectReason::VenueRejected { venue, detail } => {
                write!(f, "Venue {} rejected order: {}", venue, detail)
            }
        }
    }
}

/// OCC conflicts on operator commands. The operator must re-read state.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("409 CONFLICT: state_hash mismatch (expected {expected}, got {got})")]
    Conflict { expected: String, got: String },
    #[error("Operator state missing from store")]
    Missing,
}

/// Fatal conditions: refuse new work, drain, emit the fatal event, exit
/// non-zero. Never swallowed.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("State store corruption: {0}")]
    StoreCorruption(String),
    #[error("Split brain: event term {event_term} behind persisted term {persisted_term}")]
    SplitBrain { event_term: u64, persisted_term: u64 },
    #[error("Internal assertion failed: {0}")]
    Assertion(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes_are_stable() {
        assert_eq!(RejectReason::SystemDisarmed.reason_code(), "SYSTEM_DISARMED");
        assert_eq!(
            RejectReason::HaltActive(HaltState::HardHalt).reason_code(),
            "HARD_HALT"
        );
        assert_eq!(
            RejectReason::HaltActive(HaltState::SoftHalt).reason_code(),
            "SOFT_HALT"
        );
        assert_eq!(
            RejectReason::PolicyHashMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .reason_code(),
            "POLICY_HASH_MISMATCH"
        );
    }
}
