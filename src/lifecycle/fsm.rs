/// Order lifecycle state machine.
///
/// ```text
///   Pending → Open → PartiallyFilled → Filled
///      ↓       ↓           ↓
///   Rejected  Expired / Cancelled / Indeterminate
///
///   Indeterminate → PartiallyFilled | Filled | Cancelled | Expired
///   Terminal: Filled, Cancelled, Rejected, Expired
/// ```
///
/// `Indeterminate` is the parking state after venue retries exhaust;
/// reconciliation or an authoritative venue fill resolves it (a fill proves
/// the venue accepted the order after all). Terminal is final: once entered,
/// outgoing transitions are refused.
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    /// Created locally, not yet acknowledged by the venue
    Pending,
    /// Venue acknowledged; resting or working
    Open,
    PartiallyFilled,
    /// Fully filled (terminal)
    Filled,
    /// Cancelled by operator, halt, or expiry race (terminal)
    Cancelled,
    /// Refused before or by the venue (terminal)
    Rejected,
    /// TTL elapsed before completion (terminal)
    Expired,
    /// Venue state unknown after retry exhaustion; reconciliation resolves
    Indeterminate,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected | OrderState::Expired
        )
    }

    pub fn valid_transitions(&self) -> &'static [OrderState] {
        use OrderState::*;
        match self {
            Pending => &[Open, Rejected, Indeterminate],
            Open => &[PartiallyFilled, Filled, Expired, Cancelled, Indeterminate],
            PartiallyFilled => &[PartiallyFilled, Filled, Expired, Cancelled, Indeterminate],
            // A venue fill resolves indeterminacy; never back to Open
            Indeterminate => &[PartiallyFilled, Filled, Cancelled, Expired],
            // Terminal states never leave
            Filled | Cancelled | Rejected | Expired => &[],
        }
    }

    pub fn can_transition_to(&self, next: &OrderState) -> bool {
        self.valid_transitions().contains(next)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Guarded transition on an order record. Illegal transitions are typed
/// errors, logged, and leave the order untouched.
pub fn transition(
    order: &mut crate::model::Order,
    next: OrderState,
) -> Result<(), IllegalTransition> {
    if !order.state.can_transition_to(&next) {
        let err = IllegalTransition {
            order_id: order.order_id.clone(),
            from: order.state,
            to: next,
        };
        error!(
            order_id = %order.order_id,
            from = %order.state,
            to = %next,
            "Illegal order transition refused"
        );
        return Err(err);
    }
    order.state = next;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal transition for {order_id}: {from} → {to}")]
pub struct IllegalTransition {
    pub order_id: String,
    pub from: OrderState,
    pub to: OrderState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Order, Side, TimeInForce};
    use rust_decimal_macros::dec;

    fn order(state: OrderState) -> Order {
        Order {
            order_id: "ord-1".into(),
            signal_id: "sig-1".into(),
            venue: "paper".into(),
            account: "main".into(),
            symbol: "BTC/USDT:PERP".into(),
            side: Side::Buy,
            size: dec!(1),
            limit_price: None,
            tif: TimeInForce::Gtc,
            state,
            filled_size: dec!(0),
            avg_fill_price: dec!(0),
            fees: dec!(0),
            t_submit: 0,
            t_fill: None,
            fill_ids: vec![],
        }
    }

    #[test]
    fn happy_path() {
        let mut o = order(OrderState::Pending);
        transition(&mut o, OrderState::Open).unwrap();
        transition(&mut o, OrderState::PartiallyFilled).unwrap();
        transition(&mut o, OrderState::PartiallyFilled).unwrap();
        transition(&mut o, OrderState::Filled).unwrap();
        assert!(o.state.is_terminal());
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [
            OrderState::Filled,
            OrderState::Cancelled,
            OrderState::Rejected,
            OrderState::Expired,
        ] {
            let mut o = order(terminal);
            for next in [
                OrderState::Pending,
                OrderState::Open,
                OrderState::PartiallyFilled,
                OrderState::Filled,
                OrderState::Cancelled,
                OrderState::Indeterminate,
            ] {
                assert!(transition(&mut o, next).is_err());
                assert_eq!(o.state, terminal);
            }
        }
    }

    #[test]
    fn indeterminate_resolves_by_fill_or_reconciliation() {
        let mut o = order(OrderState::Indeterminate);
        assert!(transition(&mut o, OrderState::Open).is_err());
        // A venue partial resolves indeterminacy back into the fill flow
        transition(&mut o, OrderState::PartiallyFilled).unwrap();
        transition(&mut o, OrderState::Filled).unwrap();

        let mut parked = order(OrderState::Indeterminate);
        transition(&mut parked, OrderState::Cancelled).unwrap();
    }

    #[test]
    fn pending_reaches_terminals_only_through_indeterminate() {
        for terminal in [
            OrderState::Filled,
            OrderState::Cancelled,
            OrderState::Expired,
        ] {
            let mut o = order(OrderState::Pending);
            assert!(transition(&mut o, terminal).is_err());
            transition(&mut o, OrderState::Indeterminate).unwrap();
            transition(&mut o, terminal).unwrap();
        }
    }

    #[test]
    fn pending_cannot_skip_to_filled() {
        let mut o = order(OrderState::Pending);
        assert!(transition(&mut o, OrderState::Filled).is_err());
        assert_eq!(o.state, OrderState::Pending);
    }
}
