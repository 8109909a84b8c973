use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::warn;

use crate::config::RiskLimits;
use crate::model::RiskState;
use crate::safety::operator_state::OperatorCell;

/// Circuit-breaker ladder. Watches drawdown, drift, staleness and the
/// sentinel heartbeat; escalates the OperatorState risk ladder the moment a
/// threshold is crossed, before the next intent can be admitted.
///
/// Escalation is one-way per session; only an admin ARM resets it.
pub struct BreakerLadder {
    limits: RiskLimits,
    cell: Arc<OperatorCell>,
    equity: RwLock<EquityTrack>,
    last_sentinel_beat: RwLock<i64>,
}

#[derive(Debug, Clone, Copy)]
struct EquityTrack {
    peak: Decimal,
    current: Decimal,
}

const SENTINEL_LOSS_MS: i64 = 10_000;

impl BreakerLadder {
    pub fn new(limits: RiskLimits, cell: Arc<OperatorCell>, now_ms: i64) -> Self {
        let capital = limits.capital;
        Self {
            limits,
            cell,
            equity: RwLock::new(EquityTrack {
                peak: capital,
                current: capital,
            }),
            last_sentinel_beat: RwLock::new(now_ms),
        }
    }

    pub fn equity(&self) -> Decimal {
        self.equity.read().current
    }

    /// Drawdown from session peak, as a fraction of equity peak.
    pub fn drawdown(&self) -> Decimal {
        let track = self.equity.read();
        if track.peak.is_zero() {
            return Decimal::ZERO;
        }
        ((track.peak - track.current) / track.peak).max(Decimal::ZERO)
    }

    /// Feed a fresh equity mark. Crossing 50 / 75 / 99 % of the drawdown
    /// limit trips CAUTIOUS / DEFENSIVE / EMERGENCY.
    pub fn record_equity(&self, equity: Decimal) -> Option<RiskState> {
        {
            let mut track = self.equity.write();
            track.current = equity;
            if equity > track.peak {
                track.peak = equity;
            }
        }

        let dd = self.drawdown();
        let limit = self.limits.max_drawdown_pct;
        crate::metrics::set_equity(equity.to_f64().unwrap_or(0.0));
        if limit.is_zero() {
            return None;
        }
        let used = dd / limit;
        crate::metrics::set_drawdown_pct(used.to_f64().unwrap_or(0.0));

        let target = if used >= Decimal::new(99, 2) {
            RiskState::Emergency
        } else if used >= Decimal::new(75, 2) {
            RiskState::Defensive
        } else if used >= Decimal::new(50, 2) {
            RiskState::Cautious
        } else {
            return None;
        };

        self.cell
            .escalate_risk(target, &format!("drawdown {:.4} of limit {:.4}", dd, limit))
            .map(|s| s.risk_state)
    }

    /// Daily realized loss as a fraction of capital; crossing the cap goes
    /// straight to DEFENSIVE (close-only).
    pub fn record_daily_loss(&self, realized_loss: Decimal) -> Option<RiskState> {
        if self.limits.capital.is_zero() {
            return None;
        }
        let frac = realized_loss / self.limits.capital;
        if frac >= self.limits.max_daily_loss_pct {
            return self
                .cell
                .escalate_risk(
                    RiskState::Defensive,
                    &format!("daily loss {:.4} >= cap {:.4}", frac, self.limits.max_daily_loss_pct),
                )
                .map(|s| s.risk_state);
        }
        None
    }

    /// Reconciliation drift beyond tolerance.
    pub fn record_drift(&self, deviation: Decimal, emergency: bool) -> Option<RiskState> {
        let target = if emergency {
            RiskState::Emergency
        } else {
            RiskState::Defensive
        };
        self.cell
            .escalate_risk(target, &format!("reconciliation drift {}", deviation))
            .map(|s| s.risk_state)
    }

    pub fn record_sentinel_beat(&self, now_ms: i64) {
        *self.last_sentinel_beat.write() = now_ms;
    }

    /// Sentinel heartbeat loss > 10 s forces DEFENSIVE.
    pub fn check_sentinel(&self, now_ms: i64) -> Option<RiskState> {
        let last = *self.last_sentinel_beat.read();
        let silence = now_ms - last;
        if silence > SENTINEL_LOSS_MS {
            warn!("⚠️ Sentinel heartbeat lost ({}ms). Forcing DEFENSIVE.", silence);
            return self
                .cell
                .escalate_risk(RiskState::Defensive, "sentinel heartbeat loss")
                .map(|s| s.risk_state);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreContext;
    use crate::store::redb_store::RedbStore;
    use crate::store::state_store::StateStore;
    use rust_decimal_macros::dec;

    fn ladder() -> (BreakerLadder, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let redb = Arc::new(RedbStore::new(dir.path().join("b.redb")).unwrap());
        let store = Arc::new(StateStore::new(redb).unwrap());
        let ctx = Arc::new(CoreContext::new_simulated(1_000));
        let cell = Arc::new(OperatorCell::hydrate(store, ctx, "H".into()).unwrap());
        let limits = RiskLimits {
            capital: dec!(100000),
            max_drawdown_pct: dec!(0.20),
            ..RiskLimits::default()
        };
        (BreakerLadder::new(limits, cell, 1_000), dir)
    }

    #[test]
    fn drawdown_ladder_escalates_in_steps() {
        let (ladder, _d) = ladder();
        // 20% limit: 50% of it = 10% dd, 75% = 15%, 99% = 19.8%
        assert_eq!(ladder.record_equity(dec!(95000)), None); // 5% dd
        assert_eq!(ladder.record_equity(dec!(89000)), Some(RiskState::Cautious)); // 11%
        assert_eq!(ladder.record_equity(dec!(84000)), Some(RiskState::Defensive)); // 16%
        assert_eq!(ladder.record_equity(dec!(80000)), Some(RiskState::Emergency)); // 20%
    }

    #[test]
    fn peak_tracks_new_highs() {
        let (ladder, _d) = ladder();
        ladder.record_equity(dec!(110000));
        assert_eq!(ladder.drawdown(), Decimal::ZERO);
        ladder.record_equity(dec!(99000));
        // 11k off a 110k peak = 10% dd
        assert_eq!(ladder.drawdown(), dec!(0.1));
    }

    #[test]
    fn sentinel_loss_forces_defensive() {
        let (ladder, _d) = ladder();
        ladder.record_sentinel_beat(1_000);
        assert_eq!(ladder.check_sentinel(5_000), None);
        assert_eq!(ladder.check_sentinel(12_000), Some(RiskState::Defensive));
    }
}
