mod common;

use common::{harness, intent};
use rust_decimal_macros::dec;
use titan_execution_core::context::TimeProvider;
use titan_execution_core::errors::RejectReason;
use titan_execution_core::model::{HaltState, IntentStatus};
use titan_execution_core::venue::VenueAdapter;

#[tokio::test]
async fn disarmed_intent_is_rejected_without_an_order() {
    let h = harness();
    h.prime_market("BTC/USDT:PERP", dec!(49995), dec!(50005));

    let i = intent(&h, "s1", "BTC/USDT:PERP", 1, dec!(0.1));
    let result = h.manager.handle_intent(i, "corr-s1".into()).await;
    assert!(matches!(result, Err(RejectReason::SystemDisarmed)));

    // Exactly one reject event with the typed reason, and no order anywhere
    let rejects = h.reject_events();
    assert_eq!(rejects.len(), 1);
    assert_eq!(
        rejects[0].payload.get("reason_code").and_then(|v| v.as_str()),
        Some("SYSTEM_DISARMED")
    );
    assert_eq!(
        rejects[0].payload.get("signal_id").and_then(|v| v.as_str()),
        Some("s1")
    );
    assert_eq!(h.manager.open_order_count(), 0);
    assert_eq!(h.paper.open_order_count(), 0);

    // Ledger keeps the terminal intent forever
    let stored = h.stored_intent("s1").unwrap();
    assert_eq!(stored.status, IntentStatus::Rejected);
}

#[tokio::test]
async fn policy_hash_mismatch_after_arm() {
    let h = harness();
    h.prime_market("BTC/USDT:PERP", dec!(49995), dec!(50005));
    h.arm();

    let mut i = intent(&h, "s-pol", "BTC/USDT:PERP", 1, dec!(0.1));
    i.policy_hash = Some("H0-stale".into());

    let result = h.manager.handle_intent(i, "corr-pol".into()).await;
    assert!(matches!(result, Err(RejectReason::PolicyHashMismatch { .. })));

    let rejects = h.reject_events();
    assert_eq!(rejects.len(), 1);
    assert_eq!(
        rejects[0].payload.get("reason_code").and_then(|v| v.as_str()),
        Some("POLICY_HASH_MISMATCH")
    );
    assert_eq!(h.manager.open_order_count(), 0);
}

#[tokio::test]
async fn halt_blocks_admission() {
    let h = harness();
    h.prime_market("BTC/USDT:PERP", dec!(49995), dec!(50005));
    h.arm();
    h.cell.set_halt(HaltState::HardHalt, "drill");

    let i = intent(&h, "s-halt", "BTC/USDT:PERP", 1, dec!(0.1));
    let result = h.manager.handle_intent(i, "corr-halt".into()).await;
    assert!(matches!(result, Err(RejectReason::HaltActive(_))));
    assert_eq!(
        h.reject_events()[0]
            .payload
            .get("reason_code")
            .and_then(|v| v.as_str()),
        Some("HARD_HALT")
    );
}

#[tokio::test]
async fn stale_intent_expires() {
    let h = harness();
    h.prime_market("BTC/USDT:PERP", dec!(49995), dec!(50005));
    h.arm();

    let mut i = intent(&h, "s-old", "BTC/USDT:PERP", 1, dec!(0.1));
    i.t_signal = h.time.now_millis() - 120_000; // ttl is 60s

    let result = h.manager.handle_intent(i, "corr-old".into()).await;
    assert!(matches!(result, Err(RejectReason::Expired { .. })));

    let stored = h.stored_intent("s-old").unwrap();
    assert_eq!(stored.status, IntentStatus::Expired);
}

#[tokio::test]
async fn duplicate_signal_is_dropped() {
    let h = harness();
    h.prime_market("BTC/USDT:PERP", dec!(49995), dec!(50005));
    h.arm();

    let first = intent(&h, "s-dup", "BTC/USDT:PERP", 1, dec!(0.1));
    h.manager
        .handle_intent(first.clone(), "corr-1".into())
        .await
        .unwrap();

    let result = h.manager.handle_intent(first, "corr-2".into()).await;
    assert!(matches!(result, Err(RejectReason::DuplicateSignal { .. })));

    // Only the original order exists
    assert_eq!(h.paper.get_positions("main").await.unwrap().len(), 1);
}

#[tokio::test]
async fn stale_ticker_fails_reflex_check() {
    let h = harness();
    h.prime_market("BTC/USDT:PERP", dec!(49995), dec!(50005));
    h.arm();

    // Advance past the staleness threshold without a new tick
    h.time.advance(10_000);
    let i = intent(&h, "s-stale", "BTC/USDT:PERP", 1, dec!(0.1));
    let result = h.manager.handle_intent(i, "corr-stale".into()).await;
    assert!(matches!(result, Err(RejectReason::TickerStale { .. })));
}

#[tokio::test]
async fn wide_spread_fails_reflex_check() {
    let h = harness();
    // 2000 wide on a ~50k mid is ~400bps, over the 50bps reflex limit
    h.prime_market("BTC/USDT:PERP", dec!(49000), dec!(51000));
    h.arm();

    let i = intent(&h, "s-spread", "BTC/USDT:PERP", 1, dec!(0.1));
    let result = h.manager.handle_intent(i, "corr-spread".into()).await;
    assert!(matches!(result, Err(RejectReason::SpreadDrift { .. })));
}

#[tokio::test]
async fn position_cap_rejects_oversized_intent() {
    let h = harness();
    h.prime_market("BTC/USDT:PERP", dec!(49995), dec!(50005));
    h.arm();

    // Cap = 1M * 0.25 = 250k; 6 BTC * 50k = 300k notional
    let i = intent(&h, "s-cap", "BTC/USDT:PERP", 1, dec!(6));
    let result = h.manager.handle_intent(i, "corr-cap".into()).await;
    assert!(matches!(result, Err(RejectReason::PositionCap { .. })));
    assert_eq!(
        h.reject_events()[0]
            .payload
            .get("reason_code")
            .and_then(|v| v.as_str()),
        Some("POSITION_CAP")
    );
}
