use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::EventSink;
use crate::config::ExecutionConfig;
use crate::context::CoreContext;
use crate::errors::RejectReason;
use crate::lifecycle::fsm::{self, OrderState};
use crate::lifecycle::order_class::{classify, OrderClass};
use crate::lifecycle::positions::{PositionBook, PositionEvent};
use crate::market::MarketCache;
use crate::metrics;
use crate::model::{
    FillEvent, FillReport, HaltState, Intent, IntentStatus, IntentType, Order, Side, TimeInForce,
};
use crate::safety::guard::AdmissionGuard;
use crate::safety::operator_state::OperatorCell;
use crate::safety::risk_state::BreakerLadder;
use crate::store::event_log::{EventKind, EventLogEntry};
use crate::store::state_store::{Namespace, StateStore, WriteOp};
use crate::venue::router::VenueRouter;
use crate::venue::{OrderRequest, VenueError};
use crate::wire::subjects;

/// Everything the hot path needs, threaded in at construction.
pub struct ExecutionDeps {
    pub ctx: Arc<CoreContext>,
    pub store: Arc<StateStore>,
    pub cell: Arc<OperatorCell>,
    pub guard: Arc<AdmissionGuard>,
    pub ladder: Arc<BreakerLadder>,
    pub positions: Arc<PositionBook>,
    pub router: Arc<VenueRouter>,
    pub sink: Arc<dyn EventSink>,
    pub market: Arc<MarketCache>,
    pub exec_cfg: ExecutionConfig,
}

/// Order lifecycle manager. One instance shared by every partition task;
/// partition serialization guarantees single-writer semantics per
/// (venue, account, symbol), so the maps below see no write races for a key.
pub struct ExecutionManager {
    deps: ExecutionDeps,
    /// Live (non-terminal) orders by order_id.
    orders: DashMap<String, Order>,
    /// signal_id -> order_id for fill routing and cancels.
    by_signal: DashMap<String, String>,
    /// Intents backing live orders.
    live_intents: DashMap<String, Intent>,
    /// Monotonic submit instants for expiry (never wall clock).
    submit_instants: DashMap<String, tokio::time::Instant>,
}

impl ExecutionManager {
    pub fn new(deps: ExecutionDeps) -> Self {
        Self {
            deps,
            orders: DashMap::new(),
            by_signal: DashMap::new(),
            live_intents: DashMap::new(),
            submit_instants: DashMap::new(),
        }
    }

    pub fn ctx(&self) -> &Arc<CoreContext> {
        &self.deps.ctx
    }

    pub fn open_order_count(&self) -> usize {
        self.orders.iter().filter(|o| !o.state.is_terminal()).count()
    }

    pub fn order_for_signal(&self, signal_id: &str) -> Option<Order> {
        self.by_signal
            .get(signal_id)
            .and_then(|oid| self.orders.get(oid.value()).map(|o| o.clone()))
    }

    // ------------------------------------------------------------------
    // Intent admission pipeline. Decode/verify already happened at the bus
    // boundary; any failure below publishes a typed rejection and
    // terminates the intent.
    // ------------------------------------------------------------------
    pub async fn handle_intent(
        &self,
        mut intent: Intent,
        correlation_id: String,
    ) -> Result<(), RejectReason> {
        let now = self.deps.ctx.time.now_millis();
        intent.t_ingress = Some(now);
        intent.status = IntentStatus::Pending;

        // 2. Freshness
        let age = now - intent.t_signal;
        if age > self.deps.exec_cfg.intent_ttl_ms {
            let reason = RejectReason::Expired {
                age_ms: age,
                ttl_ms: self.deps.exec_cfg.intent_ttl_ms,
            };
            metrics::inc_expired_intents();
            self.terminate_intent(&intent, IntentStatus::Expired, &reason, &correlation_id)
                .await;
            return Err(reason);
        }

        // Canonical symbol gate: everything downstream keys on it
        if crate::venue::symbol::CanonicalSymbol::parse(&intent.symbol).is_err() {
            let reason = RejectReason::MalformedSymbol {
                symbol: intent.symbol.clone(),
            };
            self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                .await;
            return Err(reason);
        }

        // 3. Duplicate signal
        match self.deps.store.load_intent(&intent.signal_id) {
            Ok(Some(_)) => {
                let reason = RejectReason::DuplicateSignal {
                    signal_id: intent.signal_id.clone(),
                };
                // Already terminal in the ledger; do not rewrite it
                warn!(signal_id = %intent.signal_id, "Duplicate signal dropped");
                self.publish_reject(&intent, &reason, &correlation_id).await;
                return Err(reason);
            }
            Ok(None) => {}
            Err(e) => {
                error!("Ledger read failed: {}", e);
                let reason = RejectReason::VenueRejected {
                    venue: "ledger".into(),
                    detail: e.to_string(),
                };
                return Err(reason);
            }
        }

        // Ledger entry before any further decision
        self.commit_intent(&intent, EventKind::IntentReceived, &correlation_id);

        // 4. Arm interlock
        if !self.deps.cell.is_armed() {
            let reason = RejectReason::SystemDisarmed;
            self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                .await;
            return Err(reason);
        }

        // 5. Halt
        let halt = self.deps.cell.halt();
        if halt != HaltState::None {
            let reason = RejectReason::HaltActive(halt);
            self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                .await;
            return Err(reason);
        }

        // 6. Policy hash
        let current_hash = self.deps.cell.policy_hash();
        let intent_hash = intent.policy_hash.clone().unwrap_or_default();
        if intent_hash != current_hash {
            let reason = RejectReason::PolicyHashMismatch {
                expected: current_hash,
                actual: intent_hash,
            };
            self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                .await;
            return Err(reason);
        }

        // 7. Reflex (<1ms budget; in-memory snapshots only)
        let venue = intent.venue_or_default().to_string();
        let book = self.deps.market.get(&venue, &intent.symbol);
        if let Err(reason) = self.deps.guard.reflex(
            &intent,
            book.as_ref(),
            now,
            self.deps.exec_cfg.staleness_threshold_ms,
        ) {
            self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                .await;
            return Err(reason);
        }

        // 8. Transactional
        let account = intent.account_or_default().to_string();
        let current_notional = self
            .deps
            .positions
            .notional_for(&venue, &account, &intent.symbol);
        let gross = self.deps.positions.gross_notional();
        if let Err(reason) =
            self.deps
                .guard
                .transactional(&intent, book.as_ref(), current_notional, gross)
        {
            metrics::inc_risk_rejections();
            self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                .await;
            return Err(reason);
        }

        // 9. Strategic
        let admission = match self.deps.guard.strategic(&intent, self.deps.cell.risk_state()) {
            Ok(admission) => admission,
            Err(reason) => {
                metrics::inc_risk_rejections();
                self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                    .await;
                return Err(reason);
            }
        };
        if admission.size_scaled {
            info!(
                signal_id = %intent.signal_id,
                original = %intent.size,
                admitted = %admission.size,
                "CAUTIOUS sizing applied"
            );
            intent.size = admission.size;
        }

        intent.status = IntentStatus::Validated;
        self.commit_intent(&intent, EventKind::IntentValidated, &correlation_id);

        // Shadow fill: fast, simulated leg ahead of the authoritative fill
        if let Some(book) = &book {
            self.publish_shadow_fill(&intent, book, &correlation_id).await;
        }

        // 10. Venue submit
        self.submit_order(intent, book.as_ref().map(|b| b.mid()), correlation_id)
            .await
    }

    async fn submit_order(
        &self,
        intent: Intent,
        mark: Option<Decimal>,
        correlation_id: String,
    ) -> Result<(), RejectReason> {
        let venue = intent.venue_or_default().to_string();
        let account = intent.account_or_default().to_string();
        let now = self.deps.ctx.time.now_millis();

        let side = infer_side(&intent);
        let velocity = self.deps.market.velocity(&venue, &intent.symbol);
        let order_class = classify(velocity);
        let limit_price = match order_class {
            OrderClass::Market => None,
            _ => intent.entry_zone.first().copied().or(mark),
        };

        let order_id = self.deps.ctx.id.new_id();
        // Client order id echoes the signal so venue retries dedup
        let client_order_id = format!("{}-0", intent.signal_id);

        let mut order = Order {
            order_id: order_id.clone(),
            signal_id: intent.signal_id.clone(),
            venue: venue.clone(),
            account: account.clone(),
            symbol: intent.symbol.clone(),
            side,
            size: intent.size,
            limit_price,
            tif: match order_class {
                OrderClass::Market => TimeInForce::Ioc,
                OrderClass::AggressiveLimit => TimeInForce::Gtc,
                OrderClass::Limit => TimeInForce::PostOnly,
            },
            state: OrderState::Pending,
            filled_size: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            t_submit: now,
            t_fill: None,
            fill_ids: Vec::new(),
        };

        self.commit_order(&order, EventKind::OrderSubmitted, &correlation_id);
        self.live_intents
            .insert(intent.signal_id.clone(), intent.clone());
        self.by_signal
            .insert(intent.signal_id.clone(), order_id.clone());
        self.submit_instants
            .insert(order_id.clone(), tokio::time::Instant::now());

        let request = OrderRequest {
            account,
            symbol: intent.symbol.clone(),
            side,
            order_class,
            quantity: intent.size,
            price: limit_price,
            client_order_id,
            reduce_only: intent.intent_type.is_flatten(),
        };

        info!(
            correlation_id = %correlation_id,
            signal_id = %intent.signal_id,
            venue = %venue,
            class = ?order_class,
            "🚀 Submitting order: {:?} {} x {}",
            side, intent.symbol, intent.size
        );

        match self.deps.router.place_with_retry(&venue, request).await {
            Ok(_ack) => {
                if fsm::transition(&mut order, OrderState::Open).is_ok() {
                    self.orders.insert(order_id, order.clone());
                    self.commit_order(&order, EventKind::OrderSubmitted, &correlation_id);
                }
                metrics::set_open_orders(self.open_order_count() as i64);
                Ok(())
            }
            Err(VenueError::Rejected(detail)) => {
                let reason = RejectReason::VenueRejected {
                    venue: venue.clone(),
                    detail,
                };
                let _ = fsm::transition(&mut order, OrderState::Rejected);
                self.commit_order(&order, EventKind::OrderCancelled, &correlation_id);
                self.forget(&intent.signal_id, &order.order_id);
                self.terminate_intent(&intent, IntentStatus::Rejected, &reason, &correlation_id)
                    .await;
                Err(reason)
            }
            Err(e) => {
                // Retries exhausted with the venue state unknown: park the
                // order for reconciliation instead of guessing
                warn!(
                    signal_id = %intent.signal_id,
                    venue = %venue,
                    "Venue submit indeterminate: {}",
                    e
                );
                let _ = fsm::transition(&mut order, OrderState::Indeterminate);
                self.orders.insert(order_id, order.clone());
                self.commit_order(&order, EventKind::OrderIndeterminate, &correlation_id);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Fills
    // ------------------------------------------------------------------
    pub async fn handle_fill(&self, fill: FillEvent) {
        let Some(order_id) = self.by_signal.get(&fill.signal_id).map(|v| v.clone()) else {
            warn!(signal_id = %fill.signal_id, fill_id = %fill.fill_id, "Fill for unknown order");
            return;
        };
        let Some(mut order_entry) = self.orders.get_mut(&order_id) else {
            warn!(order_id = %order_id, "Fill for untracked order");
            return;
        };
        let order = order_entry.value_mut();

        // Plan first: the lifecycle hop is validated before any fill
        // accounting mutates, so a refused transition can never strand
        // unpersisted state on the live order.
        let Some(plan) = plan_fill(order, &fill) else {
            // Terminal, duplicate fill_id, or nothing left to apply
            return;
        };
        let next = if plan.is_final {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        if !order.state.can_transition_to(&next) {
            error!(
                order_id = %order.order_id,
                fill_id = %fill.fill_id,
                from = %order.state,
                to = %next,
                "Fill refused by lifecycle guard; no accounting mutated"
            );
            return;
        }

        let Some(merge) = merge_fill(order, &fill) else {
            return;
        };
        let apply_qty = merge.applied_qty;
        let is_final = merge.is_final;

        if let Err(e) = fsm::transition(order, next) {
            error!("{}", e);
            return;
        }
        if is_final {
            order.t_fill = Some(self.deps.ctx.time.now_millis());
        }

        let Some(intent) = self.live_intents.get(&fill.signal_id).map(|i| i.clone()) else {
            error!(signal_id = %fill.signal_id, "Fill without backing intent");
            return;
        };

        let mut capped = fill.clone();
        capped.qty = apply_qty;
        capped.order_id = order.order_id.clone();
        let (position_events, mut writes) = self.deps.positions.apply_fill(&intent, &capped);

        // Completion is atomic: final fill commits order FILLED, the
        // position delta, and the intent EXECUTED in one durable batch.
        match WriteOp::put(Namespace::Orders, order.order_id.clone(), order) {
            Ok(op) => writes.push(op),
            Err(e) => error!("Failed to encode order {}: {}", order.order_id, e),
        }
        let correlation_id = fill.signal_id.clone();
        if is_final {
            let mut executed = intent.clone();
            executed.status = IntentStatus::Executed;
            match WriteOp::put(Namespace::Intents, executed.signal_id.clone(), &executed) {
                Ok(op) => writes.push(op),
                Err(e) => error!("Failed to encode intent: {}", e),
            }
        }
        let entry = EventLogEntry::new(
            if is_final {
                EventKind::IntentExecuted
            } else {
                EventKind::OrderFill
            },
            correlation_id.clone(),
            self.deps.cell.leader_term(),
            self.deps.ctx.time.now_millis(),
            json!({
                "order_id": order.order_id,
                "fill_id": capped.fill_id,
                "qty": capped.qty,
                "price": capped.price,
                "filled_size": order.filled_size,
                "state": order.state,
            }),
        );
        if let Err(e) = self.deps.store.commit(entry, writes) {
            error!("Fill commit failed: {}", e);
        }

        let order_snapshot = order.clone();
        drop(order_entry);

        // Authoritative fill event
        let report = FillReport {
            fill_id: capped.fill_id.clone(),
            signal_id: capped.signal_id.clone(),
            order_id: order_snapshot.order_id.clone(),
            venue: capped.venue.clone(),
            symbol: capped.symbol.clone(),
            side: capped.side,
            price: capped.price,
            qty: capped.qty,
            fee: capped.fee,
            fee_currency: capped.fee_currency.clone(),
            t_signal: intent.t_signal,
            t_ingress: intent.t_ingress.unwrap_or_default(),
            t_ack: order_snapshot.t_submit,
            t_exchange: capped.t_exchange,
            client_order_id: format!("{}-0", capped.signal_id),
        };
        self.deps
            .sink
            .publish_event(
                "titan.evt.execution.fill.v1",
                &[capped.venue.as_str(), capped.symbol.as_str()],
                serde_json::to_value(&report).unwrap_or_default(),
                Some(&correlation_id),
            )
            .await;

        for event in &position_events {
            if let PositionEvent::Closed(trade) = event {
                self.deps
                    .ladder
                    .record_daily_loss(-self.deps.positions.realized_today().min(Decimal::ZERO));
                info!(symbol = %trade.symbol, pnl = %trade.pnl, "Trade closed");
            }
        }

        if is_final {
            metrics::inc_filled_orders();
            let latency_ms = self.deps.ctx.time.now_millis() - intent.t_signal;
            metrics::observe_order_latency(latency_ms as f64 / 1000.0);
            if let Some(target) = intent.entry_zone.first() {
                if !target.is_zero() {
                    let slip = ((capped.price - *target).abs() / *target * Decimal::from(10_000))
                        .to_f64()
                        .unwrap_or(0.0);
                    metrics::observe_slippage(slip);
                }
            }

            self.deps
                .sink
                .publish_event(
                    subjects::EVT_EXECUTION_REPORT,
                    &[],
                    json!({
                        "signal_id": order_snapshot.signal_id,
                        "order_id": order_snapshot.order_id,
                        "state": order_snapshot.state,
                        "filled_size": order_snapshot.filled_size,
                        "avg_fill_price": order_snapshot.avg_fill_price,
                        "fees": order_snapshot.fees,
                    }),
                    Some(&correlation_id),
                )
                .await;

            self.forget(&order_snapshot.signal_id, &order_snapshot.order_id);
            metrics::set_open_orders(self.open_order_count() as i64);
        }
    }

    // ------------------------------------------------------------------
    // Cancels, expiry, halt
    // ------------------------------------------------------------------

    /// Cancel is honored only from OPEN or PARTIALLY_FILLED, idempotently.
    pub async fn handle_cancel(&self, signal_id: &str, reason: &str) {
        let Some(order_id) = self.by_signal.get(signal_id).map(|v| v.clone()) else {
            return;
        };
        // Snapshot before the venue round-trip; no map guard across awaits
        let Some((venue, symbol)) = self.orders.get(&order_id).and_then(|o| {
            matches!(o.state, OrderState::Open | OrderState::PartiallyFilled)
                .then(|| (o.venue.clone(), o.symbol.clone()))
        }) else {
            return;
        };

        if let Err(e) = self
            .deps
            .router
            .cancel(&venue, &symbol, &format!("{}-0", signal_id))
            .await
        {
            warn!(order_id = %order_id, "Venue cancel failed: {}", e);
        }

        let order_snapshot = {
            let Some(mut entry) = self.orders.get_mut(&order_id) else {
                return;
            };
            let order = entry.value_mut();
            // A fill may have completed the order during the venue call
            if order.state.is_terminal() {
                return;
            }
            let _ = fsm::transition(order, OrderState::Cancelled);
            self.commit_order(order, EventKind::OrderCancelled, signal_id);
            order.clone()
        };
        let had_fills = order_snapshot.filled_size > Decimal::ZERO;

        // Partially filled cancels keep what executed; virgin cancels
        // terminate the intent as rejected with the cancel reason.
        if let Some(mut intent) = self.live_intents.get(signal_id).map(|i| i.clone()) {
            intent.status = if had_fills {
                IntentStatus::Executed
            } else {
                IntentStatus::Rejected
            };
            intent.rejection_reason = Some(format!("cancelled: {}", reason));
            self.commit_intent(&intent, EventKind::OrderCancelled, signal_id);
        }
        self.forget(signal_id, &order_snapshot.order_id);
        metrics::set_open_orders(self.open_order_count() as i64);
        info!(signal_id, reason, "Order cancelled");
    }

    /// Expiry sweep for one partition, driven by its monotonic timer. The
    /// partition filter keeps single-writer ownership intact.
    pub async fn expire_due_orders_for(&self, partition: &str) {
        let ttl = std::time::Duration::from_millis(self.deps.exec_cfg.intent_ttl_ms as u64);
        let due: Vec<(String, String)> = self
            .orders
            .iter()
            .filter(|o| {
                crate::lifecycle::partition::partition_key(&o.venue, &o.account, &o.symbol)
                    == partition
            })
            .filter(|o| matches!(o.state, OrderState::Open | OrderState::PartiallyFilled))
            .filter(|o| {
                self.submit_instants
                    .get(&o.order_id)
                    .map(|t| t.elapsed() >= ttl)
                    .unwrap_or(false)
            })
            .map(|o| (o.signal_id.clone(), o.order_id.clone()))
            .collect();

        for (signal_id, order_id) in due {
            let Some((venue, symbol)) = self
                .orders
                .get(&order_id)
                .filter(|o| !o.state.is_terminal())
                .map(|o| (o.venue.clone(), o.symbol.clone()))
            else {
                continue;
            };
            if let Err(e) = self
                .deps
                .router
                .cancel(&venue, &symbol, &format!("{}-0", signal_id))
                .await
            {
                warn!(order_id = %order_id, "Venue cancel on expiry failed: {}", e);
            }

            let had_fills = {
                let Some(mut entry) = self.orders.get_mut(&order_id) else {
                    continue;
                };
                let order = entry.value_mut();
                if order.state.is_terminal() {
                    continue;
                }
                let _ = fsm::transition(order, OrderState::Expired);
                self.commit_order(order, EventKind::IntentExpired, &signal_id);
                order.filled_size > Decimal::ZERO
            };

            if let Some(mut intent) = self.live_intents.get(&signal_id).map(|i| i.clone()) {
                intent.status = if had_fills {
                    IntentStatus::Executed
                } else {
                    IntentStatus::Expired
                };
                self.commit_intent(&intent, EventKind::IntentExpired, &signal_id);
            }
            self.forget(&signal_id, &order_id);
            metrics::inc_expired_intents();
            warn!(signal_id, "Order expired by monotonic timer");
        }
        metrics::set_open_orders(self.open_order_count() as i64);
    }

    /// HARD_HALT path, per partition: cancel everything in flight. New
    /// intents are already refused at admission step 5.
    pub async fn cancel_all_for(&self, partition: &str, reason: &str) {
        let signals: Vec<String> = self
            .orders
            .iter()
            .filter(|o| {
                crate::lifecycle::partition::partition_key(&o.venue, &o.account, &o.symbol)
                    == partition
            })
            .filter(|o| matches!(o.state, OrderState::Open | OrderState::PartiallyFilled))
            .map(|o| o.signal_id.clone())
            .collect();
        if !signals.is_empty() {
            warn!(
                partition,
                "⛔ Cancelling {} in-flight orders: {}",
                signals.len(),
                reason
            );
        }
        for signal_id in signals {
            self.handle_cancel(&signal_id, reason).await;
        }
    }

    /// EMERGENCY flatten: synthetic CLOSE intents for every open position.
    pub async fn flatten_all(&self, reason: &str) {
        let positions = self.deps.positions.all();
        warn!(
            "🚨 FLATTEN: closing {} positions ({})",
            positions.len(),
            reason
        );
        for pos in positions {
            let signal_id = self.deps.ctx.id.new_id();
            // Closing a long sells; closing a short buys
            let direction = if pos.side.is_long() { -1 } else { 1 };
            let intent = Intent {
                signal_id: signal_id.clone(),
                source: Some("execution-flatten".to_string()),
                symbol: pos.symbol.clone(),
                direction,
                intent_type: IntentType::Close,
                entry_zone: vec![],
                stop_loss: Decimal::ZERO,
                take_profits: vec![],
                size: pos.size,
                status: IntentStatus::Pending,
                confidence: None,
                leverage: None,
                max_slippage_bps: None,
                t_signal: self.deps.ctx.time.now_millis(),
                t_ingress: None,
                venue: Some(pos.venue.clone()),
                account: Some(pos.account.clone()),
                policy_hash: Some(self.deps.cell.policy_hash()),
                rejection_reason: None,
                metadata: None,
            };
            if let Err(e) = self
                .handle_intent(intent, format!("flatten-{}", signal_id))
                .await
            {
                error!(symbol = %pos.symbol, "Flatten intent rejected: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn forget(&self, signal_id: &str, order_id: &str) {
        self.by_signal.remove(signal_id);
        self.live_intents.remove(signal_id);
        self.submit_instants.remove(order_id);
        if let Some(order) = self.orders.get(order_id) {
            if order.state.is_terminal() {
                drop(order);
                self.orders.remove(order_id);
            }
        }
    }

    fn commit_intent(&self, intent: &Intent, kind: EventKind, correlation_id: &str) {
        let writes = match WriteOp::put(Namespace::Intents, intent.signal_id.clone(), intent) {
            Ok(op) => vec![op],
            Err(e) => {
                error!("Failed to encode intent {}: {}", intent.signal_id, e);
                return;
            }
        };
        let entry = EventLogEntry::new(
            kind,
            correlation_id,
            self.deps.cell.leader_term(),
            self.deps.ctx.time.now_millis(),
            json!({"signal_id": intent.signal_id, "status": intent.status}),
        );
        if let Err(e) = self.deps.store.commit(entry, writes) {
            error!("Intent commit failed: {}", e);
        }
    }

    fn commit_order(&self, order: &Order, kind: EventKind, correlation_id: &str) {
        let writes = match WriteOp::put(Namespace::Orders, order.order_id.clone(), order) {
            Ok(op) => vec![op],
            Err(e) => {
                error!("Failed to encode order {}: {}", order.order_id, e);
                return;
            }
        };
        let entry = EventLogEntry::new(
            kind,
            correlation_id,
            self.deps.cell.leader_term(),
            self.deps.ctx.time.now_millis(),
            json!({"order_id": order.order_id, "signal_id": order.signal_id, "state": order.state}),
        );
        if let Err(e) = self.deps.store.commit(entry, writes) {
            error!("Order commit failed: {}", e);
        }
    }

    async fn terminate_intent(
        &self,
        intent: &Intent,
        status: IntentStatus,
        reason: &RejectReason,
        correlation_id: &str,
    ) {
        let mut terminal = intent.clone();
        terminal.status = status;
        terminal.rejection_reason = Some(reason.to_string());
        let kind = match status {
            IntentStatus::Expired => EventKind::IntentExpired,
            _ => EventKind::IntentRejected,
        };
        self.commit_intent(&terminal, kind, correlation_id);
        self.publish_reject(intent, reason, correlation_id).await;
        warn!(
            signal_id = %intent.signal_id,
            reason_code = reason.reason_code(),
            "⛔ Intent terminated: {}",
            reason
        );
    }

    async fn publish_reject(&self, intent: &Intent, reason: &RejectReason, correlation_id: &str) {
        self.deps
            .sink
            .publish_event(
                subjects::EVT_EXECUTION_REJECT,
                &[],
                json!({
                    "signal_id": intent.signal_id,
                    "symbol": intent.symbol,
                    "reason_code": reason.reason_code(),
                    "reason": reason.to_string(),
                    "correlation_id": correlation_id,
                    "ts": self.deps.ctx.time.now_millis(),
                }),
                Some(correlation_id),
            )
            .await;
    }

    async fn publish_shadow_fill(
        &self,
        intent: &Intent,
        book: &crate::model::BookTicker,
        correlation_id: &str,
    ) {
        let side = infer_side(intent);
        // Taker assumption: buys lift the ask, sells hit the bid
        let price = if side.is_long() {
            book.best_ask
        } else {
            book.best_bid
        };
        if price.is_zero() {
            return;
        }
        let payload = json!({
            "fill_id": format!("shadow-{}", self.deps.ctx.id.new_id()),
            "signal_id": intent.signal_id,
            "symbol": intent.symbol,
            "side": side,
            "price": price,
            "qty": intent.size,
            "t_signal": intent.t_signal,
            "ts": self.deps.ctx.time.now_millis(),
        });
        self.deps
            .sink
            .publish_event(
                "titan.evt.execution.shadow_fill.v1",
                &[intent.symbol.as_str()],
                payload,
                Some(correlation_id),
            )
            .await;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FillMerge {
    pub applied_qty: Decimal,
    pub is_final: bool,
}

/// Read-only merge plan: what `merge_fill` would do. Returns None for
/// terminal orders, replayed fill ids, or fills with nothing left to apply.
/// Callers validate the lifecycle hop against this plan BEFORE mutating.
pub fn plan_fill(order: &Order, fill: &FillEvent) -> Option<FillMerge> {
    if order.state.is_terminal() {
        warn!(
            order_id = %order.order_id,
            fill_id = %fill.fill_id,
            "Fill after terminal state ignored"
        );
        return None;
    }
    if order.fill_ids.iter().any(|f| f == &fill.fill_id) {
        return None;
    }

    let apply_qty = fill.qty.min(order.remaining());
    if apply_qty <= Decimal::ZERO {
        return None;
    }

    Some(FillMerge {
        applied_qty: apply_qty,
        is_final: order.filled_size + apply_qty >= order.size,
    })
}

/// Idempotent fill merge. Over-fill is impossible by construction: the
/// applied quantity is capped at the remainder, so `filled_size <= size`
/// holds across every history.
pub fn merge_fill(order: &mut Order, fill: &FillEvent) -> Option<FillMerge> {
    let plan = plan_fill(order, fill)?;
    let apply_qty = plan.applied_qty;

    let filled_before = order.filled_size;
    order.avg_fill_price = (order.avg_fill_price * filled_before + fill.price * apply_qty)
        / (filled_before + apply_qty);
    order.filled_size = filled_before + apply_qty;
    order.fees += fill.fee;
    order.fill_ids.push(fill.fill_id.clone());

    Some(plan)
}

pub fn infer_side(intent: &Intent) -> Side {
    match intent.intent_type {
        IntentType::BuySetup => Side::Buy,
        IntentType::SellSetup => Side::Sell,
        IntentType::CloseLong => Side::Sell,
        IntentType::CloseShort => Side::Buy,
        IntentType::Close => {
            if intent.direction > 0 {
                Side::Buy
            } else {
                Side::Sell
            }
        }
    }
}
