use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Market-taker order class, least aggressive first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderClass {
    Limit,
    AggressiveLimit,
    Market,
}

const FAST: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5 %/s
const SLOW: Decimal = Decimal::from_parts(1, 0, 0, false, 1); // 0.1 %/s

/// Deterministic class selection from price velocity (%/s).
/// Ties go to the less aggressive class:
///   |v| > 0.5      → MARKET
///   0.1 < |v| ≤ 0.5 → AGGRESSIVE_LIMIT
///   |v| ≤ 0.1      → LIMIT
pub fn classify(velocity_pct_s: Decimal) -> OrderClass {
    let v = velocity_pct_s.abs();
    if v > FAST {
        OrderClass::Market
    } else if v > SLOW {
        OrderClass::AggressiveLimit
    } else {
        OrderClass::Limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn bands() {
        assert_eq!(classify(dec!(0.0)), OrderClass::Limit);
        assert_eq!(classify(dec!(0.05)), OrderClass::Limit);
        assert_eq!(classify(dec!(0.3)), OrderClass::AggressiveLimit);
        assert_eq!(classify(dec!(0.9)), OrderClass::Market);
        assert_eq!(classify(dec!(-0.9)), OrderClass::Market);
    }

    #[test]
    fn ties_go_less_aggressive() {
        assert_eq!(classify(dec!(0.1)), OrderClass::Limit);
        assert_eq!(classify(dec!(-0.1)), OrderClass::Limit);
        assert_eq!(classify(dec!(0.5)), OrderClass::AggressiveLimit);
        assert_eq!(classify(dec!(-0.5)), OrderClass::AggressiveLimit);
    }

    #[test]
    fn sign_symmetric() {
        for v in ["0.05", "0.1", "0.2", "0.5", "0.7"] {
            let v: Decimal = v.parse().unwrap();
            assert_eq!(classify(v), classify(-v));
        }
    }
}
