use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "LONG")]
    Long,
    #[serde(rename = "SHORT")]
    Short,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy | Side::Long => Side::Sell,
            Side::Sell | Side::Short => Side::Buy,
        }
    }

    pub fn is_long(&self) -> bool {
        matches!(self, Side::Buy | Side::Long)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntentType {
    #[serde(rename = "BUY_SETUP")]
    BuySetup,
    #[serde(rename = "SELL_SETUP")]
    SellSetup,
    #[serde(rename = "CLOSE_LONG")]
    CloseLong,
    #[serde(rename = "CLOSE_SHORT")]
    CloseShort,
    #[serde(rename = "CLOSE")]
    Close,
}

impl IntentType {
    /// Close intents only ever reduce exposure; they bypass size-increasing
    /// risk gates and are the only intents EMERGENCY lets through.
    pub fn is_flatten(&self) -> bool {
        matches!(
            self,
            IntentType::Close | IntentType::CloseLong | IntentType::CloseShort
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum IntentStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "VALIDATED")]
    Validated,
    #[serde(rename = "REJECTED")]
    Rejected,
    #[serde(rename = "EXECUTED")]
    Executed,
    #[serde(rename = "EXPIRED")]
    Expired,
}

impl IntentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IntentStatus::Rejected | IntentStatus::Executed | IntentStatus::Expired
        )
    }
}

/// Authorized trade instruction. Enters on the partitioned command subject,
/// reaches a terminal status here, and lives in the intent ledger forever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub signal_id: String,
    #[serde(default)]
    pub source: Option<String>,
    pub symbol: String,
    pub direction: i32, // 1 long, -1 short, 0 flatten
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    #[serde(default)]
    pub entry_zone: Vec<Decimal>,
    #[serde(default)]
    pub stop_loss: Decimal,
    #[serde(default)]
    pub take_profits: Vec<Decimal>,
    #[serde(default)]
    pub size: Decimal,
    pub status: IntentStatus,

    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub leverage: Option<Decimal>,
    #[serde(default)]
    pub max_slippage_bps: Option<u32>,

    // Ingress normalizes the legacy `timestamp` field onto t_signal
    #[serde(alias = "timestamp")]
    pub t_signal: i64,
    #[serde(default)]
    pub t_ingress: Option<i64>,

    #[serde(default)]
    pub venue: Option<String>,
    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub policy_hash: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl Intent {
    pub fn venue_or_default(&self) -> &str {
        self.venue.as_deref().unwrap_or("paper")
    }

    pub fn account_or_default(&self) -> &str {
        self.account.as_deref().unwrap_or("main")
    }
}

/// Time-in-force for venue orders.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum TimeInForce {
    #[default]
    #[serde(rename = "GTC")]
    Gtc,
    #[serde(rename = "IOC")]
    Ioc,
    #[serde(rename = "POST_ONLY")]
    PostOnly,
}

/// Venue-facing realization of an intent. State transitions live in
/// `lifecycle::fsm`; this is the persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub signal_id: String,
    pub venue: String,
    pub account: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Option<Decimal>,
    pub tif: TimeInForce,
    pub state: crate::lifecycle::fsm::OrderState,
    #[serde(default)]
    pub filled_size: Decimal,
    #[serde(default)]
    pub avg_fill_price: Decimal,
    #[serde(default)]
    pub fees: Decimal,
    pub t_submit: i64,
    #[serde(default)]
    pub t_fill: Option<i64>,
    /// Venue fill ids already merged; replays are no-ops.
    #[serde(default)]
    pub fill_ids: Vec<String>,
}

impl Order {
    pub fn remaining(&self) -> Decimal {
        self.size - self.filled_size
    }
}

/// Aggregate per (venue, account, symbol). Exclusively owned by the
/// partition task; reconciliation only reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub venue: String,
    pub account: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry: Decimal,
    #[serde(default)]
    pub current_stop: Option<Decimal>,
    #[serde(default)]
    pub current_tp: Option<Decimal>,
    #[serde(default)]
    pub realized_pnl: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    #[serde(default)]
    pub fees_paid: Decimal,
    #[serde(default)]
    pub last_mark_price: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: i64,
}

impl Position {
    pub fn notional(&self) -> Decimal {
        self.size * self.last_mark_price.unwrap_or(self.avg_entry)
    }
}

/// Realized close, appended to the trade history (daily-loss accounting).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub signal_id: String,
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub size: Decimal,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
    pub fee: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub close_reason: String,
}

/// A single venue fill, authoritative. Merged idempotently by `fill_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub fill_id: String,
    pub order_id: String,
    pub signal_id: String,
    pub venue: String,
    pub account: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub t_exchange: i64,
}

/// Published on `titan.evt.execution.fill.v1` (and shadow_fill for the
/// simulated leg).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillReport {
    pub fill_id: String,
    pub signal_id: String,
    pub order_id: String,
    pub venue: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub fee: Decimal,
    pub fee_currency: String,
    pub t_signal: i64,
    pub t_ingress: i64,
    pub t_ack: i64,
    pub t_exchange: i64,
    pub client_order_id: String,
}

// --- Operator / safety model ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ArmState {
    #[serde(rename = "ARMED")]
    Armed,
    #[default]
    #[serde(rename = "DISARMED")]
    Disarmed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum HaltState {
    #[default]
    #[serde(rename = "NONE")]
    None,
    #[serde(rename = "SOFT_HALT")]
    SoftHalt,
    #[serde(rename = "HARD_HALT")]
    HardHalt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum RiskState {
    #[default]
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "CAUTIOUS")]
    Cautious,
    #[serde(rename = "DEFENSIVE")]
    Defensive,
    #[serde(rename = "EMERGENCY")]
    Emergency,
}

impl RiskState {
    pub fn as_metric(&self) -> i64 {
        match self {
            RiskState::Normal => 0,
            RiskState::Cautious => 1,
            RiskState::Defensive => 2,
            RiskState::Emergency => 3,
        }
    }
}

/// Singleton operator record. The live cache is the single-writer cell in
/// `safety::operator_state`; this struct is what gets persisted and hashed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperatorState {
    pub arm: ArmState,
    pub halt: HaltState,
    pub risk_state: RiskState,
    pub policy_hash: String,
    pub state_hash: String,
    pub leader_term: u64,
    pub last_operator_id: Option<String>,
    pub last_change_ts: i64,
}

impl OperatorState {
    /// Fail-safe boot state: disarmed, no halt, normal risk.
    pub fn fail_safe(policy_hash: String, now_ms: i64) -> Self {
        let mut state = Self {
            arm: ArmState::Disarmed,
            halt: HaltState::None,
            risk_state: RiskState::Normal,
            policy_hash,
            state_hash: String::new(),
            leader_term: 0,
            last_operator_id: None,
            last_change_ts: now_ms,
        };
        state.state_hash = state.compute_hash();
        state
    }

    /// OCC token over every field except the hash itself.
    pub fn compute_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let material = format!(
            "{:?}|{:?}|{:?}|{}|{}|{}|{}",
            self.arm,
            self.halt,
            self.risk_state,
            self.policy_hash,
            self.leader_term,
            self.last_operator_id.as_deref().unwrap_or(""),
            self.last_change_ts
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }
}

/// Best bid/ask snapshot from `titan.data.market.ticker.v1.<venue>.<symbol>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookTicker {
    pub venue: String,
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_bid_qty: Decimal,
    pub best_ask: Decimal,
    pub best_ask_qty: Decimal,
    /// Price velocity in %/s, supplied by the market data layer.
    #[serde(default)]
    pub velocity_pct_s: Option<Decimal>,
    pub transaction_time: i64,
}

impl BookTicker {
    pub fn mid(&self) -> Decimal {
        (self.best_bid + self.best_ask) / Decimal::from(2)
    }

    pub fn spread_bps(&self) -> Decimal {
        let mid = self.mid();
        if mid.is_zero() {
            return Decimal::ZERO;
        }
        (self.best_ask - self.best_bid) / mid * Decimal::from(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn side_opposite() {
        assert_eq!(Side::Long.opposite(), Side::Sell);
        assert_eq!(Side::Short.opposite(), Side::Buy);
    }

    #[test]
    fn operator_state_hash_changes_with_content() {
        let a = OperatorState::fail_safe("H1".into(), 1_000);
        let mut b = a.clone();
        b.arm = ArmState::Armed;
        assert_ne!(a.compute_hash(), b.compute_hash());
    }

    #[test]
    fn ticker_spread_bps() {
        let t = BookTicker {
            venue: "paper".into(),
            symbol: "BTC/USDT:PERP".into(),
            best_bid: dec!(99.0),
            best_bid_qty: dec!(1),
            best_ask: dec!(101.0),
            best_ask_qty: dec!(1),
            velocity_pct_s: None,
            transaction_time: 0,
        };
        // 2 / 100 = 200 bps
        assert_eq!(t.spread_bps(), dec!(200));
    }

    #[test]
    fn intent_accepts_timestamp_alias() {
        let raw = serde_json::json!({
            "signal_id": "01J0000000000000000000TEST",
            "symbol": "BTC/USDT:PERP",
            "direction": 1,
            "type": "BUY_SETUP",
            "size": "0.1",
            "status": "PENDING",
            "timestamp": 123456
        });
        let intent: Intent = serde_json::from_value(raw).unwrap();
        assert_eq!(intent.t_signal, 123456);
        assert!(intent.entry_zone.is_empty());
        assert!(intent.take_profits.is_empty());
    }
}
