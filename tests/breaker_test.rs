mod common;

use common::{harness, intent};
use rust_decimal_macros::dec;
use titan_execution_core::errors::RejectReason;
use titan_execution_core::model::{IntentStatus, RiskState};
use titan_execution_core::venue::VenueAdapter;

#[tokio::test]
async fn drawdown_breaker_walks_the_ladder() {
    let h = harness();
    h.prime_market("ETH/USDT:PERP", dec!(1999), dec!(2001));
    h.arm();
    assert_eq!(h.operator_state().risk_state, RiskState::Normal);

    // Capital 1M, drawdown limit 20%: thresholds at 10% / 15% / 19.8%
    assert_eq!(h.ladder.record_equity(dec!(950000)), None);
    assert_eq!(
        h.ladder.record_equity(dec!(890000)),
        Some(RiskState::Cautious)
    );
    assert_eq!(
        h.ladder.record_equity(dec!(840000)),
        Some(RiskState::Defensive)
    );
    assert_eq!(
        h.ladder.record_equity(dec!(800000)),
        Some(RiskState::Emergency)
    );
    assert_eq!(h.operator_state().risk_state, RiskState::Emergency);
}

#[tokio::test]
async fn emergency_cancels_orders_and_flattens_positions() {
    let h = harness();
    h.prime_market("ETH/USDT:PERP", dec!(1999), dec!(2001));
    h.arm();

    // Open a 2 ETH long
    let mut fills = h.paper.subscribe_fills().await.unwrap();
    let i = intent(&h, "s-open", "ETH/USDT:PERP", 1, dec!(2));
    h.manager.handle_intent(i, "corr-open".into()).await.unwrap();
    let f = fills.recv().await.unwrap();
    h.manager.handle_fill(f).await;
    assert_eq!(h.positions.count(), 1);

    // Drawdown crosses the full limit -> EMERGENCY
    h.ladder.record_equity(dec!(790000));
    assert_eq!(h.operator_state().risk_state, RiskState::Emergency);

    // New size-increasing intents are blocked before any venue call
    let blocked = intent(&h, "s-blocked", "ETH/USDT:PERP", 1, dec!(1));
    let result = h.manager.handle_intent(blocked, "corr-b".into()).await;
    assert!(matches!(result, Err(RejectReason::RiskStateBlock { .. })));

    // Flatten issues synthetic CLOSE intents that EMERGENCY lets through
    h.manager.flatten_all("drawdown emergency").await;
    let close_fill = fills.recv().await.unwrap();
    h.manager.handle_fill(close_fill).await;

    assert_eq!(h.positions.count(), 0);
    let venue_positions = h.paper.get_positions("main").await.unwrap();
    assert!(venue_positions.is_empty());
}

#[tokio::test]
async fn risk_state_is_monotonic_until_admin_arm() {
    let h = harness();
    h.arm();

    h.cell.escalate_risk(RiskState::Defensive, "drift");
    assert_eq!(h.operator_state().risk_state, RiskState::Defensive);

    // Lower target is ignored; the ladder is one-way within a session
    h.cell.escalate_risk(RiskState::Cautious, "recovered?");
    assert_eq!(h.operator_state().risk_state, RiskState::Defensive);

    // ARM (admin-gated upstream) is the only de-escalation path
    h.arm();
    assert_eq!(h.operator_state().risk_state, RiskState::Normal);
}

#[tokio::test]
async fn cautious_state_halves_admitted_size() {
    let h = harness();
    h.prime_market("ETH/USDT:PERP", dec!(1999), dec!(2001));
    h.arm();
    h.cell.escalate_risk(RiskState::Cautious, "elevated slippage");

    let mut fills = h.paper.subscribe_fills().await.unwrap();
    let i = intent(&h, "s-half", "ETH/USDT:PERP", 1, dec!(2));
    h.manager.handle_intent(i, "corr".into()).await.unwrap();

    let f = fills.recv().await.unwrap();
    assert_eq!(f.qty, dec!(1)); // half of the requested 2

    h.manager.handle_fill(f).await;
    let stored = h.stored_intent("s-half").unwrap();
    assert_eq!(stored.status, IntentStatus::Executed);
    assert_eq!(stored.size, dec!(1));
}

#[tokio::test]
async fn defensive_state_still_allows_closes() {
    let h = harness();
    h.prime_market("ETH/USDT:PERP", dec!(1999), dec!(2001));
    h.arm();

    // Open first, then go DEFENSIVE
    let mut fills = h.paper.subscribe_fills().await.unwrap();
    let i = intent(&h, "s-d-open", "ETH/USDT:PERP", 1, dec!(1));
    h.manager.handle_intent(i, "c1".into()).await.unwrap();
    let f = fills.recv().await.unwrap();
    h.manager.handle_fill(f).await;

    h.cell.escalate_risk(RiskState::Defensive, "staleness");

    let open = intent(&h, "s-d-new", "ETH/USDT:PERP", 1, dec!(1));
    assert!(h.manager.handle_intent(open, "c2".into()).await.is_err());

    let mut close = intent(&h, "s-d-close", "ETH/USDT:PERP", -1, dec!(1));
    close.intent_type = titan_execution_core::model::IntentType::CloseLong;
    h.manager.handle_intent(close, "c3".into()).await.unwrap();
    let f = fills.recv().await.unwrap();
    h.manager.handle_fill(f).await;
    assert_eq!(h.positions.count(), 0);
}

#[tokio::test]
async fn daily_loss_cap_forces_defensive() {
    let h = harness();
    h.arm();

    // 5% of 1M = 50k daily loss cap
    assert_eq!(h.ladder.record_daily_loss(dec!(10000)), None);
    assert_eq!(
        h.ladder.record_daily_loss(dec!(60000)),
        Some(RiskState::Defensive)
    );
}
