use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::context::CoreContext;
use crate::lifecycle::fsm::{self, OrderState};
use crate::model::IntentStatus;
use crate::safety::operator_state::OperatorCell;
use crate::store::event_log::{EventKind, EventLogEntry};
use crate::store::redb_store::StoreError;
use crate::store::state_store::{Namespace, StateStore, WriteOp};
use crate::venue::router::VenueRouter;

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub finalized_filled: usize,
    pub finalized_cancelled: usize,
    pub finalized_expired: usize,
}

/// Crash recovery, run before any consumer starts.
///
/// Reads the intent ledger and every non-terminal order, issues an
/// idempotent venue cancel (the client-order-id still echoes the signal),
/// and drives each order to a terminal state from its durable fill history.
/// `filled_size` was capped on every merge, so no resolution here can
/// violate the no-double-fill invariant.
pub async fn run_crash_recovery(
    store: &Arc<StateStore>,
    router: &Arc<VenueRouter>,
    cell: &Arc<OperatorCell>,
    ctx: &Arc<CoreContext>,
) -> Result<RecoveryReport, StoreError> {
    let open_orders = store.load_open_orders()?;
    let mut report = RecoveryReport {
        scanned: open_orders.len(),
        ..RecoveryReport::default()
    };
    if open_orders.is_empty() {
        info!("🧭 Recovery: no non-terminal orders");
        return Ok(report);
    }

    let last_seq = store.last_seq()?;
    // Recovery runs before any promotion: fence with the persisted term so
    // the appends below are never refused as stale.
    let term = store.current_term()?.max(cell.leader_term());
    warn!(
        "🧭 Recovery: {} non-terminal orders (event log at seq {})",
        open_orders.len(),
        last_seq
    );

    for mut order in open_orders {
        // Whatever the venue was doing, stop it; cancels are idempotent
        let client_order_id = format!("{}-0", order.signal_id);
        if let Err(e) = router
            .cancel(&order.venue, &order.symbol, &client_order_id)
            .await
        {
            warn!(order_id = %order.order_id, "Recovery cancel failed (continuing): {}", e);
        }

        // Query the venue's surviving position to sanity-log drift; the
        // fill history in the order record stays authoritative for state.
        if let Ok(positions) = router.get_positions(&order.venue, &order.account).await {
            if let Some(remote) = positions.iter().find(|p| p.symbol == order.symbol) {
                info!(
                    order_id = %order.order_id,
                    remote_size = %remote.size,
                    local_filled = %order.filled_size,
                    "Recovery venue snapshot"
                );
            }
        }

        let next = if order.filled_size >= order.size {
            OrderState::Filled
        } else if order.filled_size > Decimal::ZERO {
            OrderState::Cancelled
        } else {
            OrderState::Expired
        };

        // A crash mid-submission leaves PENDING, whose graph only reaches
        // the terminal set through INDETERMINATE. Hop through it so
        // resolution stays on the allowed transitions.
        if order.state == OrderState::Pending {
            if let Err(e) = fsm::transition(&mut order, OrderState::Indeterminate) {
                error!("Recovery cannot park {}: {}", order.order_id, e);
                continue;
            }
        }
        if let Err(e) = fsm::transition(&mut order, next) {
            error!("Recovery cannot resolve {}: {}", order.order_id, e);
            continue;
        }
        match next {
            OrderState::Filled => report.finalized_filled += 1,
            OrderState::Cancelled => report.finalized_cancelled += 1,
            _ => report.finalized_expired += 1,
        }

        let mut writes = vec![WriteOp::put(
            Namespace::Orders,
            order.order_id.clone(),
            &order,
        )?];

        if let Some(mut intent) = store.load_intent(&order.signal_id)? {
            intent.status = match next {
                OrderState::Filled => IntentStatus::Executed,
                OrderState::Cancelled if order.filled_size > Decimal::ZERO => {
                    IntentStatus::Executed
                }
                _ => IntentStatus::Expired,
            };
            intent.rejection_reason = Some("crash recovery".to_string());
            writes.push(WriteOp::put(
                Namespace::Intents,
                intent.signal_id.clone(),
                &intent,
            )?);
        }

        let entry = EventLogEntry::new(
            EventKind::OrderCancelled,
            format!("recovery-{}", order.signal_id),
            term,
            ctx.time.now_millis(),
            json!({
                "order_id": order.order_id,
                "resolved_to": next,
                "filled_size": order.filled_size,
                "size": order.size,
            }),
        );
        store.commit(entry, writes)?;
    }

    info!(
        "🧭 Recovery complete: {} filled, {} cancelled, {} expired",
        report.finalized_filled, report.finalized_cancelled, report.finalized_expired
    );
    Ok(report)
}
