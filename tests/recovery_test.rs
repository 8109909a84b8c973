mod common;

use std::sync::Arc;

use rust_decimal_macros::dec;
use serde_json::json;
use titan_execution_core::context::CoreContext;
use titan_execution_core::lifecycle::fsm::OrderState;
use titan_execution_core::lifecycle::recovery::run_crash_recovery;
use titan_execution_core::model::{IntentStatus, Order, Side, TimeInForce};
use titan_execution_core::safety::operator_state::OperatorCell;
use titan_execution_core::store::event_log::{EventKind, EventLogEntry};
use titan_execution_core::store::redb_store::RedbStore;
use titan_execution_core::store::state_store::{Namespace, StateStore, WriteOp};
use titan_execution_core::venue::paper::PaperVenue;
use titan_execution_core::venue::router::VenueRouter;
use titan_execution_core::venue::VenueAdapter;

fn order(signal_id: &str, state: OrderState, size: &str, filled: &str) -> Order {
    Order {
        order_id: format!("ord-{}", signal_id),
        signal_id: signal_id.into(),
        venue: "paper".into(),
        account: "main".into(),
        symbol: "BTC/USDT:PERP".into(),
        side: Side::Buy,
        size: size.parse().unwrap(),
        limit_price: None,
        tif: TimeInForce::Gtc,
        state,
        filled_size: filled.parse().unwrap(),
        avg_fill_price: dec!(50000),
        fees: dec!(0),
        t_submit: common::T0,
        t_fill: None,
        fill_ids: if filled == "0" { vec![] } else { vec!["f-1".into()] },
    }
}

#[tokio::test]
async fn restart_resolves_non_terminal_orders_without_double_fill() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recovery.redb");

    // --- Engine A: persist an order_submitted snapshot, then "crash" ---
    {
        let redb = Arc::new(RedbStore::new(&path).unwrap());
        let store = StateStore::new(redb).unwrap();

        let virgin = order("s-virgin", OrderState::Open, "0.1", "0");
        let partial = order("s-partial", OrderState::PartiallyFilled, "0.5", "0.2");
        let done = order("s-done", OrderState::Filled, "0.3", "0.3");
        // Crashed mid-submission: persisted before the venue ever acked
        let pending = order("s-pending", OrderState::Pending, "0.1", "0");

        let mut intent_virgin = common::intent_fixture("s-virgin");
        intent_virgin.status = IntentStatus::Validated;
        let mut intent_partial = common::intent_fixture("s-partial");
        intent_partial.status = IntentStatus::Validated;
        let mut intent_pending = common::intent_fixture("s-pending");
        intent_pending.status = IntentStatus::Validated;

        let writes = vec![
            WriteOp::put(Namespace::Orders, virgin.order_id.clone(), &virgin).unwrap(),
            WriteOp::put(Namespace::Orders, partial.order_id.clone(), &partial).unwrap(),
            WriteOp::put(Namespace::Orders, done.order_id.clone(), &done).unwrap(),
            WriteOp::put(Namespace::Orders, pending.order_id.clone(), &pending).unwrap(),
            WriteOp::put(Namespace::Intents, "s-virgin", &intent_virgin).unwrap(),
            WriteOp::put(Namespace::Intents, "s-partial", &intent_partial).unwrap(),
            WriteOp::put(Namespace::Intents, "s-pending", &intent_pending).unwrap(),
        ];
        let entry = EventLogEntry::new(
            EventKind::OrderSubmitted,
            "pre-crash",
            1,
            common::T0,
            json!({"orders": 4}),
        );
        store.commit(entry, writes).unwrap();
        // Engine A drops here without completing anything
    }

    // --- Engine B: restart, replay, poll venue, resolve ---
    let redb = Arc::new(RedbStore::new(&path).unwrap());
    let store = Arc::new(StateStore::new(redb).unwrap());
    let ctx = Arc::new(CoreContext::new_simulated(common::T0 + 5_000));
    let cell = Arc::new(OperatorCell::hydrate(store.clone(), ctx.clone(), "H".into()).unwrap());

    let venues = Arc::new(VenueRouter::new(3_000));
    let paper = Arc::new(PaperVenue::new(ctx.clone()));
    paper.init().await.unwrap();
    venues.register("paper", paper);

    let report = run_crash_recovery(&store, &venues, &cell, &ctx)
        .await
        .unwrap();
    assert_eq!(report.scanned, 3); // the Filled order was already terminal
    assert_eq!(report.finalized_expired, 2);
    assert_eq!(report.finalized_cancelled, 1);

    // Everything is terminal now and fill history is untouched (no double fill)
    let orders: Vec<(String, Order)> = store.scan(Namespace::Orders, "").unwrap();
    for (_, o) in &orders {
        assert!(o.state.is_terminal(), "{} not terminal", o.order_id);
        assert!(o.filled_size <= o.size);
    }
    let virgin = store.load_order("ord-s-virgin").unwrap().unwrap();
    assert_eq!(virgin.state, OrderState::Expired);
    assert_eq!(virgin.filled_size, dec!(0));

    let partial = store.load_order("ord-s-partial").unwrap().unwrap();
    assert_eq!(partial.state, OrderState::Cancelled);
    assert_eq!(partial.filled_size, dec!(0.2));

    // The crashed PENDING order resolved through the allowed graph
    let pending = store.load_order("ord-s-pending").unwrap().unwrap();
    assert_eq!(pending.state, OrderState::Expired);
    assert_eq!(pending.filled_size, dec!(0));

    // Intent ledger reflects the resolution
    assert_eq!(
        store.load_intent("s-virgin").unwrap().unwrap().status,
        IntentStatus::Expired
    );
    assert_eq!(
        store.load_intent("s-partial").unwrap().unwrap().status,
        IntentStatus::Executed
    );
    assert_eq!(
        store.load_intent("s-pending").unwrap().unwrap().status,
        IntentStatus::Expired
    );

    // Event log kept growing monotonically across the restart
    let events = store.read_events_from(0).unwrap();
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);
    assert!(events.len() >= 3);
}

#[tokio::test]
async fn recovery_is_a_noop_on_a_clean_store() {
    let dir = tempfile::tempdir().unwrap();
    let redb = Arc::new(RedbStore::new(dir.path().join("clean.redb")).unwrap());
    let store = Arc::new(StateStore::new(redb).unwrap());
    let ctx = Arc::new(CoreContext::new_simulated(common::T0));
    let cell = Arc::new(OperatorCell::hydrate(store.clone(), ctx.clone(), "H".into()).unwrap());
    let venues = Arc::new(VenueRouter::new(3_000));

    let report = run_crash_recovery(&store, &venues, &cell, &ctx)
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);
}
