use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub risk: RiskLimits,
    #[serde(default)]
    pub rbac_roles: HashMap<String, String>, // actor_id -> role
}

/// Recognized execution options. Defaults mirror the operational envelope the
/// rest of the platform assumes; override via config files or TITAN__ env.
#[derive(Debug, Deserialize, Clone)]
pub struct ExecutionConfig {
    pub nats_url: Option<String>,
    pub store_path: Option<String>,

    #[serde(default = "d_intent_ttl")]
    pub intent_ttl_ms: i64,
    #[serde(default = "d_dedup_window")]
    pub command_dedup_window_ms: i64,
    #[serde(default = "d_clock_skew")]
    pub clock_skew_tolerance_ms: i64,
    #[serde(default = "d_lease_ttl")]
    pub leader_lease_ttl_ms: u64,
    #[serde(default = "d_heartbeat")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "d_reconcile")]
    pub reconcile_period_ms: u64,
    #[serde(default = "d_venue_deadline")]
    pub venue_call_deadline_ms: u64,
    #[serde(default = "d_max_deliver")]
    pub max_deliver: i64,
    #[serde(default = "d_backoff")]
    pub backoff_schedule_ms: Vec<u64>,
    #[serde(default = "d_staleness")]
    pub staleness_threshold_ms: i64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            nats_url: None,
            store_path: None,
            intent_ttl_ms: d_intent_ttl(),
            command_dedup_window_ms: d_dedup_window(),
            clock_skew_tolerance_ms: d_clock_skew(),
            leader_lease_ttl_ms: d_lease_ttl(),
            heartbeat_interval_ms: d_heartbeat(),
            reconcile_period_ms: d_reconcile(),
            venue_call_deadline_ms: d_venue_deadline(),
            max_deliver: d_max_deliver(),
            backoff_schedule_ms: d_backoff(),
            staleness_threshold_ms: d_staleness(),
        }
    }
}

fn d_intent_ttl() -> i64 {
    60_000
}
fn d_dedup_window() -> i64 {
    60_000
}
fn d_clock_skew() -> i64 {
    5_000
}
fn d_lease_ttl() -> u64 {
    10_000
}
fn d_heartbeat() -> u64 {
    3_000
}
fn d_reconcile() -> u64 {
    5_000
}
fn d_venue_deadline() -> u64 {
    3_000
}
fn d_max_deliver() -> i64 {
    5
}
fn d_backoff() -> Vec<u64> {
    vec![1_000, 5_000, 15_000, 30_000]
}
fn d_staleness() -> i64 {
    5_000
}

/// Hard risk limits, enforced by the safety core on every admission.
#[derive(Debug, Deserialize, Clone)]
pub struct RiskLimits {
    /// Capital fraction a single position may reach (0..1).
    #[serde(default = "d_max_position_pct")]
    pub max_position_pct: Decimal,
    #[serde(default = "d_max_leverage")]
    pub max_leverage: Decimal,
    /// Drawdown limit as a fraction of equity (0..1). Breaker thresholds at
    /// 50/75/99% of this limit.
    #[serde(default = "d_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    #[serde(default = "d_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    #[serde(default = "d_max_slippage_bps")]
    pub max_slippage_bps: u32,
    /// Reflex check: reject when book spread exceeds this.
    #[serde(default = "d_spread_limit_bps")]
    pub spread_limit_bps: u32,
    #[serde(default = "d_drift_tolerance")]
    pub drift_tolerance: Decimal,
    /// Account equity the caps are computed against.
    #[serde(default = "d_capital")]
    pub capital: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_pct: d_max_position_pct(),
            max_leverage: d_max_leverage(),
            max_drawdown_pct: d_max_drawdown_pct(),
            max_daily_loss_pct: d_max_daily_loss_pct(),
            max_slippage_bps: d_max_slippage_bps(),
            spread_limit_bps: d_spread_limit_bps(),
            drift_tolerance: d_drift_tolerance(),
            capital: d_capital(),
        }
    }
}

fn d_max_position_pct() -> Decimal {
    Decimal::new(25, 2) // 0.25
}
fn d_max_leverage() -> Decimal {
    Decimal::from(10)
}
fn d_max_drawdown_pct() -> Decimal {
    Decimal::new(20, 2) // 0.20
}
fn d_max_daily_loss_pct() -> Decimal {
    Decimal::new(5, 2) // 0.05
}
fn d_max_slippage_bps() -> u32 {
    100
}
fn d_spread_limit_bps() -> u32 {
    50
}
fn d_drift_tolerance() -> Decimal {
    Decimal::new(1, 4) // 0.0001 contracts
}
fn d_capital() -> Decimal {
    Decimal::from(100_000)
}

impl RiskLimits {
    /// Digest of the active risk policy. Every intent must carry it.
    pub fn compute_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let material = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}",
            self.max_position_pct,
            self.max_leverage,
            self.max_drawdown_pct,
            self.max_daily_loss_pct,
            self.max_slippage_bps,
            self.spread_limit_bps,
            self.drift_tolerance,
            self.capital
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let home = env::var("HOME").unwrap_or_else(|_| ".".into());

        let s = Config::builder()
            // 1. Global config from ~/.titan/config.json
            .add_source(File::with_name(&format!("{}/.titan/config", home)).required(false))
            // 2. Project config
            .add_source(File::with_name("config/config").required(false))
            // 3. Local overrides (not checked in)
            .add_source(File::with_name("config/local").required(false))
            // 4. Environment, e.g. TITAN__EXECUTION__INTENT_TTL_MS
            .add_source(Environment::with_prefix("TITAN").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
