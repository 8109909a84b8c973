use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::bus::EventSink;
use crate::config::RiskLimits;
use crate::context::CoreContext;
use crate::lifecycle::manager::ExecutionManager;
use crate::lifecycle::partition::PartitionRouter;
use crate::market::MarketCache;
use crate::metrics;
use crate::model::RiskState;
use crate::safety::leader::LeaderState;
use crate::safety::operator_state::OperatorCell;
use crate::safety::risk_state::BreakerLadder;
use crate::store::state_store::StateStore;
use crate::venue::router::VenueRouter;
use crate::wire::subjects;

/// Position drift beyond `drift_tolerance` escalates DEFENSIVE; beyond
/// EMERGENCY_FACTOR x tolerance it goes straight to EMERGENCY and flattens.
const EMERGENCY_FACTOR: Decimal = Decimal::from_parts(10, 0, 0, false, 0);

pub struct ReconciliationLoop {
    pub ctx: Arc<CoreContext>,
    pub store: Arc<StateStore>,
    pub cell: Arc<OperatorCell>,
    pub ladder: Arc<BreakerLadder>,
    pub positions: Arc<crate::lifecycle::positions::PositionBook>,
    pub manager: Arc<ExecutionManager>,
    pub partitions: Arc<PartitionRouter>,
    pub venues: Arc<VenueRouter>,
    pub sink: Arc<dyn EventSink>,
    pub market: Arc<MarketCache>,
    pub limits: RiskLimits,
    pub period_ms: u64,
    pub dedup_window_ms: i64,
    pub leader_rx: watch::Receiver<LeaderState>,
}

impl ReconciliationLoop {
    /// Drives the periodic drift check, heartbeat and metric emission.
    /// Followers stay silent; only the leader reconciles and emits.
    pub async fn run(self) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(self.period_ms.max(250)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("🔁 Reconciliation loop started ({}ms period)", self.period_ms);

        loop {
            interval.tick().await;

            let leader = *self.leader_rx.borrow();
            if !leader.is_leader {
                continue;
            }

            self.refresh_valuations();
            self.feed_breakers();

            if let Err(e) = self.reconcile_venues().await {
                error!("Reconciliation pass failed: {}", e);
            }

            self.emit_heartbeat(leader).await;
            self.compact_windows();
        }
    }

    /// Mark every position against the freshest book.
    fn refresh_valuations(&self) {
        let mut writes = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        for pos in self.positions.all() {
            if !seen.insert((pos.venue.clone(), pos.symbol.clone())) {
                continue;
            }
            if let Some(book) = self.market.get(&pos.venue, &pos.symbol) {
                writes.extend(self.positions.update_valuation(&book));
            }
        }
        if !writes.is_empty() {
            if let Err(e) = self.store.put_many(writes) {
                error!("Valuation persist failed: {}", e);
            }
        }
    }

    /// Equity, drawdown and daily-loss breakers. A trip here must land
    /// before the next intent is admitted; `escalate_risk` swaps the shared
    /// cell synchronously, so the next admission already sees it.
    fn feed_breakers(&self) {
        let realized = self.positions.realized_today();
        let unrealized = self.positions.unrealized_total();
        let equity = self.limits.capital + realized + unrealized;

        let tripped = self.ladder.record_equity(equity);
        let daily = self
            .ladder
            .record_daily_loss(-realized.min(Decimal::ZERO));

        if matches!(tripped, Some(RiskState::Emergency))
            || matches!(daily, Some(RiskState::Emergency))
        {
            let manager = self.manager.clone();
            let partitions = self.partitions.clone();
            tokio::spawn(async move {
                partitions.broadcast_cancel_all("drawdown emergency").await;
                manager.flatten_all("drawdown emergency").await;
            });
        }

        let now = self.ctx.time.now_millis();
        self.ladder.check_sentinel(now);
    }

    /// Compare local aggregates with what every venue reports.
    async fn reconcile_venues(&self) -> Result<(), crate::venue::VenueError> {
        // (venue, account) pairs worth polling: everything we hold locally,
        // plus the default account of every registered venue
        let mut pairs: HashSet<(String, String)> = self
            .positions
            .all()
            .into_iter()
            .map(|p| (p.venue, p.account))
            .collect();
        for venue in self.venues.venue_names() {
            pairs.insert((venue, "main".to_string()));
        }

        for (venue, account) in pairs {
            let remote = match self.venues.get_positions(&venue, &account).await {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(venue = %venue, "Venue position fetch failed: {}", e);
                    continue;
                }
            };

            // Signed sizes keyed by symbol; a missing side counts as zero
            let mut remote_sizes: HashMap<String, Decimal> = HashMap::new();
            for p in &remote {
                let signed = if p.side.is_long() { p.size } else { -p.size };
                *remote_sizes.entry(p.symbol.clone()).or_default() += signed;
            }

            let mut symbols: HashSet<String> = remote_sizes.keys().cloned().collect();
            let local_positions: Vec<_> = self
                .positions
                .all()
                .into_iter()
                .filter(|p| p.venue == venue && p.account == account)
                .collect();
            symbols.extend(local_positions.iter().map(|p| p.symbol.clone()));

            for symbol in symbols {
                let local = local_positions
                    .iter()
                    .find(|p| p.symbol == symbol)
                    .map(|p| if p.side.is_long() { p.size } else { -p.size })
                    .unwrap_or(Decimal::ZERO);
                let remote = remote_sizes.get(&symbol).copied().unwrap_or(Decimal::ZERO);
                let deviation = (local - remote).abs();

                if deviation <= self.limits.drift_tolerance {
                    continue;
                }

                let emergency = deviation > self.limits.drift_tolerance * EMERGENCY_FACTOR;
                metrics::inc_drift_events();
                warn!(
                    venue = %venue,
                    symbol = %symbol,
                    local = %local,
                    remote = %remote,
                    emergency,
                    "🚨 Position drift detected"
                );

                self.sink
                    .publish_event(
                        subjects::EVT_EXECUTION_DRIFT,
                        &[],
                        json!({
                            "class": "position",
                            "venue": venue,
                            "account": account,
                            "symbol": symbol,
                            "local": local,
                            "remote": remote,
                            "deviation": deviation,
                            "tolerance": self.limits.drift_tolerance,
                            "ts": self.ctx.time.now_millis(),
                        }),
                        None,
                    )
                    .await;

                self.ladder.record_drift(deviation, emergency);
                if emergency {
                    self.partitions.broadcast_cancel_all("drift emergency").await;
                    self.manager.flatten_all("drift emergency").await;
                }
            }
        }
        Ok(())
    }

    async fn emit_heartbeat(&self, leader: LeaderState) {
        let snapshot = self.cell.snapshot();
        let open_orders = self.manager.open_order_count();
        let open_positions = self.positions.count();
        let last_seq = self.store.last_seq().unwrap_or(0);

        let realized = self.positions.realized_today();
        let unrealized = self.positions.unrealized_total();
        let equity = self.limits.capital + realized + unrealized;
        let drawdown = self.ladder.drawdown();

        // Per-symbol leverage rides along for the ops dashboards
        let mut per_symbol_leverage: HashMap<String, f64> = HashMap::new();
        if !self.limits.capital.is_zero() {
            for pos in self.positions.all() {
                let lev = (pos.notional() / self.limits.capital)
                    .to_f64()
                    .unwrap_or(0.0);
                *per_symbol_leverage.entry(pos.symbol).or_default() += lev;
            }
        }

        metrics::set_open_orders(open_orders as i64);
        metrics::set_active_positions(open_positions as i64);

        self.sink
            .publish_event(
                "titan.sys.heartbeat.v1",
                &["execution"],
                json!({
                    "service": "execution",
                    "leader_term": leader.term,
                    "arm": snapshot.arm,
                    "halt": snapshot.halt,
                    "risk_state": snapshot.risk_state,
                    "open_orders": open_orders,
                    "open_positions": open_positions,
                    "last_seq": last_seq,
                    "metrics": {
                        "equity": equity,
                        "position_count": open_positions,
                        "drawdown_pct": drawdown,
                        "per_symbol_leverage": per_symbol_leverage,
                    },
                    "ts": self.ctx.time.now_millis(),
                }),
                None,
            )
            .await;
    }

    fn compact_windows(&self) {
        let cutoff = self.ctx.time.now_millis() - self.dedup_window_ms;
        match self.store.compact_dedup(cutoff) {
            Ok(0) => {}
            Ok(n) => info!("🧹 Dedup compaction removed {} entries", n),
            Err(e) => error!("Dedup compaction failed: {}", e),
        }
    }
}
