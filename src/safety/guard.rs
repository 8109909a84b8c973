use rust_decimal::Decimal;
use tracing::warn;

use crate::config::RiskLimits;
use crate::errors::RejectReason;
use crate::model::{BookTicker, Intent, RiskState};
use crate::safety::staleness::StalenessMonitor;

/// Outcome of the strategic tier: admit as-is, or admit with an adjusted
/// size (CAUTIOUS halves size-increasing intents).
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub size: Decimal,
    pub size_scaled: bool,
}

/// Layered per-intent checks, applied in tier order by the partition task.
/// Every method is synchronous and operates on in-memory snapshots only;
/// the reflex tier has a sub-millisecond budget and must never suspend.
pub struct AdmissionGuard {
    limits: RiskLimits,
    staleness: StalenessMonitor,
}

impl AdmissionGuard {
    pub fn new(limits: RiskLimits, staleness: StalenessMonitor) -> Self {
        Self { limits, staleness }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    pub fn staleness(&self) -> &StalenessMonitor {
        &self.staleness
    }

    /// Tier 1, reflex: ticker freshness and spread sanity.
    pub fn reflex(
        &self,
        intent: &Intent,
        book: Option<&BookTicker>,
        now_ms: i64,
        staleness_threshold_ms: i64,
    ) -> Result<(), RejectReason> {
        let venue = intent.venue_or_default();
        if self
            .staleness
            .is_stale(venue, &intent.symbol, now_ms, staleness_threshold_ms)
        {
            let age = self
                .staleness
                .age(venue, &intent.symbol, now_ms)
                .unwrap_or(i64::MAX);
            return Err(RejectReason::TickerStale {
                venue: venue.to_string(),
                symbol: intent.symbol.clone(),
                age_ms: age,
            });
        }

        if let Some(book) = book {
            let spread = book.spread_bps();
            let limit = Decimal::from(self.limits.spread_limit_bps);
            if spread > limit {
                return Err(RejectReason::SpreadDrift {
                    spread_bps: spread,
                    limit_bps: limit,
                });
            }
        }

        Ok(())
    }

    /// Tier 2, transactional: caps that need the position book.
    ///
    /// `current_notional` is the live notional for this partition's symbol;
    /// `gross_notional` is across all positions (leverage denominator).
    pub fn transactional(
        &self,
        intent: &Intent,
        book: Option<&BookTicker>,
        current_notional: Decimal,
        gross_notional: Decimal,
    ) -> Result<(), RejectReason> {
        if intent.size <= Decimal::ZERO {
            return Err(RejectReason::InvalidSize);
        }

        // Flatten intents only shrink exposure; caps do not apply
        if intent.intent_type.is_flatten() {
            return Ok(());
        }

        let mark = book
            .map(|b| b.mid())
            .filter(|p| !p.is_zero())
            .or_else(|| intent.entry_zone.first().copied())
            .unwrap_or(Decimal::ZERO);
        let additional = intent.size * mark;

        // Position cap: position_value <= capital * max_position_pct
        let cap = self.limits.capital * self.limits.max_position_pct;
        if !mark.is_zero() && current_notional + additional > cap {
            warn!(
                signal_id = %intent.signal_id,
                symbol = %intent.symbol,
                "Risk reject: position cap {:.2} + {:.2} > {:.2}",
                current_notional, additional, cap
            );
            return Err(RejectReason::PositionCap {
                symbol: intent.symbol.clone(),
                current: current_notional,
                additional,
                limit: cap,
            });
        }

        // Slippage cap against the current book
        if let Some(book) = book {
            let reference = intent.entry_zone.first().copied().unwrap_or_else(|| book.mid());
            let touch = if intent.direction >= 0 {
                book.best_ask
            } else {
                book.best_bid
            };
            if !reference.is_zero() {
                let expected_bps =
                    ((touch - reference).abs() / reference) * Decimal::from(10_000);
                let cap_bps = intent
                    .max_slippage_bps
                    .unwrap_or(self.limits.max_slippage_bps)
                    .min(self.limits.max_slippage_bps);
                if expected_bps > Decimal::from(cap_bps) {
                    return Err(RejectReason::SlippageCap {
                        expected_bps,
                        limit_bps: Decimal::from(cap_bps),
                    });
                }
            }
        }

        // Per-symbol leverage cap
        if !self.limits.capital.is_zero() {
            let leverage = (gross_notional + additional) / self.limits.capital;
            let cap = intent
                .leverage
                .unwrap_or(self.limits.max_leverage)
                .min(self.limits.max_leverage);
            if leverage > cap {
                return Err(RejectReason::LeverageCap {
                    symbol: intent.symbol.clone(),
                    current: leverage,
                    limit: cap,
                });
            }
        } else if gross_notional + additional > Decimal::ZERO {
            // Positive exposure with zero equity is unbounded leverage
            return Err(RejectReason::LeverageCap {
                symbol: intent.symbol.clone(),
                current: Decimal::from(999),
                limit: self.limits.max_leverage,
            });
        }

        Ok(())
    }

    /// Tier 3, strategic: risk-state policy.
    pub fn strategic(&self, intent: &Intent, risk_state: RiskState) -> Result<Admission, RejectReason> {
        let increases_exposure = !intent.intent_type.is_flatten();

        match risk_state {
            RiskState::Emergency if increases_exposure => {
                Err(RejectReason::RiskStateBlock { state: risk_state })
            }
            RiskState::Defensive if increases_exposure => {
                Err(RejectReason::RiskStateBlock { state: risk_state })
            }
            RiskState::Cautious if increases_exposure => {
                let halved = intent.size / Decimal::from(2);
                if halved <= Decimal::ZERO {
                    return Err(RejectReason::InvalidSize);
                }
                Ok(Admission {
                    size: halved,
                    size_scaled: true,
                })
            }
            _ => Ok(Admission {
                size: intent.size,
                size_scaled: false,
            }),
        }
    }
}
