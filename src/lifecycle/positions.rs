use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::context::CoreContext;
use crate::metrics;
use crate::model::{BookTicker, FillEvent, Intent, Position, Side, TradeRecord};
use crate::store::redb_store::StoreError;
use crate::store::state_store::{position_key, Namespace, StateStore, WriteOp};

#[derive(Debug, Clone)]
pub enum PositionEvent {
    Opened(Position),
    Updated(Position),
    Closed(TradeRecord),
}

/// Shadow view of positions per (venue, account, symbol).
///
/// Mutations come only from the owning partition task; reconciliation and
/// the guard read snapshots. Mutators return the `WriteOp`s for the caller's
/// atomic commit instead of writing through themselves, so a final fill can
/// land order + position + intent in one durable batch.
pub struct PositionBook {
    positions: RwLock<HashMap<String, Position>>,
    trades: RwLock<Vec<TradeRecord>>,
    ctx: Arc<CoreContext>,
}

impl PositionBook {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            trades: RwLock::new(Vec::new()),
            ctx,
        }
    }

    pub fn hydrate(&self, store: &StateStore) -> Result<(), StoreError> {
        let positions = store.load_positions()?;
        let trades = store.load_trades()?;
        {
            let mut map = self.positions.write();
            for pos in positions {
                map.insert(
                    position_key(&pos.venue, &pos.account, &pos.symbol),
                    pos,
                );
            }
            metrics::set_active_positions(map.len() as i64);
            info!("Positions hydrated: {}", map.len());
        }
        {
            let mut history = self.trades.write();
            *history = trades;
            history.sort_by(|a, b| a.closed_at.cmp(&b.closed_at));
            info!("Trade history hydrated: {}", history.len());
        }
        Ok(())
    }

    pub fn get(&self, venue: &str, account: &str, symbol: &str) -> Option<Position> {
        self.positions
            .read()
            .get(&position_key(venue, account, symbol))
            .cloned()
    }

    pub fn all(&self) -> Vec<Position> {
        self.positions.read().values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.positions.read().len()
    }

    pub fn notional_for(&self, venue: &str, account: &str, symbol: &str) -> Decimal {
        self.get(venue, account, symbol)
            .map(|p| p.notional())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn gross_notional(&self) -> Decimal {
        self.positions.read().values().map(|p| p.notional()).sum()
    }

    pub fn unrealized_total(&self) -> Decimal {
        self.positions
            .read()
            .values()
            .map(|p| p.unrealized_pnl)
            .sum()
    }

    /// Realized PnL of the current UTC day.
    pub fn realized_today(&self) -> Decimal {
        let today = self.ctx.time.now().date_naive();
        self.trades
            .read()
            .iter()
            .filter(|t| t.closed_at.date_naive() == today)
            .map(|t| t.pnl)
            .sum()
    }

    fn calculate_pnl(side: Side, entry: Decimal, exit: Decimal, size: Decimal) -> (Decimal, Decimal) {
        let per_unit = if side.is_long() { exit - entry } else { entry - exit };
        let pnl = per_unit * size;
        let pnl_pct = if entry.is_zero() {
            Decimal::ZERO
        } else {
            per_unit / entry * Decimal::from(100)
        };
        (pnl, pnl_pct)
    }

    /// Fold one fill into the aggregate. Same-side fills pyramid at the
    /// weighted average; opposite fills reduce, close, or flip.
    pub fn apply_fill(
        &self,
        intent: &Intent,
        fill: &FillEvent,
    ) -> (Vec<PositionEvent>, Vec<WriteOp>) {
        let mut events = Vec::new();
        let mut writes = Vec::new();

        let venue = fill.venue.as_str();
        let account = intent.account_or_default();
        let key = position_key(venue, account, &fill.symbol);
        let fill_long = fill.side.is_long();

        let mut map = self.positions.write();
        // Take the aggregate out, fold the fill, put the survivor back.
        let existing = map.remove(&key);

        match existing {
            Some(mut position) if position.side.is_long() == fill_long => {
                // Pyramid: weighted average entry
                let total = position.size + fill.qty;
                position.avg_entry =
                    (position.avg_entry * position.size + fill.price * fill.qty) / total;
                position.size = total;
                position.fees_paid += fill.fee;
                position.updated_at = self.ctx.time.now_millis();

                match WriteOp::put(Namespace::Positions, key.clone(), &position) {
                    Ok(op) => writes.push(op),
                    Err(e) => error!("Failed to encode position {}: {}", key, e),
                }
                info!(
                    signal_id = %fill.signal_id,
                    symbol = %fill.symbol,
                    new_size = %position.size,
                    avg_entry = %position.avg_entry,
                    "Position increased (pyramid)"
                );
                events.push(PositionEvent::Updated(position.clone()));
                map.insert(key.clone(), position);
            }
            Some(mut position) => {
                // Opposite-side fill: reduce, close, or flip
                let close_size = fill.qty.min(position.size);
                let (pnl, pnl_pct) =
                    Self::calculate_pnl(position.side, position.avg_entry, fill.price, close_size);

                let trade = TradeRecord {
                    signal_id: fill.signal_id.clone(),
                    venue: venue.to_string(),
                    symbol: fill.symbol.clone(),
                    side: position.side,
                    entry_price: position.avg_entry,
                    exit_price: fill.price,
                    size: close_size,
                    pnl,
                    pnl_pct,
                    fee: fill.fee,
                    opened_at: position.opened_at,
                    closed_at: self.ctx.time.now(),
                    close_reason: if intent.intent_type.is_flatten() {
                        "CLOSE_INTENT".to_string()
                    } else {
                        "OPPOSITE_FILL".to_string()
                    },
                };
                let trade_key = format!("{}|{}", fill.signal_id, fill.fill_id);
                match WriteOp::put(Namespace::Trades, trade_key, &trade) {
                    Ok(op) => writes.push(op),
                    Err(e) => error!("Failed to encode trade record: {}", e),
                }
                self.trades.write().push(trade.clone());

                let remainder = fill.qty - close_size;
                if remainder.is_zero() && close_size < position.size {
                    // Partial reduce
                    position.size -= close_size;
                    position.realized_pnl += pnl;
                    position.fees_paid += fill.fee;
                    position.updated_at = self.ctx.time.now_millis();
                    match WriteOp::put(Namespace::Positions, key.clone(), &position) {
                        Ok(op) => writes.push(op),
                        Err(e) => error!("Failed to encode position {}: {}", key, e),
                    }
                    info!(
                        signal_id = %fill.signal_id,
                        symbol = %fill.symbol,
                        remaining = %position.size,
                        pnl = %pnl,
                        "Position partially closed"
                    );
                    events.push(PositionEvent::Updated(position.clone()));
                    map.insert(key.clone(), position);
                } else if remainder.is_zero() {
                    // Full close: the aggregate stays removed
                    writes.push(WriteOp::delete(Namespace::Positions, key.clone()));
                    info!(
                        signal_id = %fill.signal_id,
                        symbol = %fill.symbol,
                        pnl = %pnl,
                        "Position closed"
                    );
                    events.push(PositionEvent::Closed(trade));
                } else {
                    // Flip: close existing, open remainder the other way
                    let flipped = Position {
                        venue: venue.to_string(),
                        account: account.to_string(),
                        symbol: fill.symbol.clone(),
                        side: if fill_long { Side::Long } else { Side::Short },
                        size: remainder,
                        avg_entry: fill.price,
                        current_stop: non_zero(intent.stop_loss),
                        current_tp: intent.take_profits.first().copied(),
                        realized_pnl: Decimal::ZERO,
                        unrealized_pnl: Decimal::ZERO,
                        fees_paid: Decimal::ZERO,
                        last_mark_price: Some(fill.price),
                        opened_at: self.ctx.time.now(),
                        updated_at: self.ctx.time.now_millis(),
                    };
                    match WriteOp::put(Namespace::Positions, key.clone(), &flipped) {
                        Ok(op) => writes.push(op),
                        Err(e) => error!("Failed to encode position {}: {}", key, e),
                    }
                    warn!(
                        signal_id = %fill.signal_id,
                        symbol = %fill.symbol,
                        size = %remainder,
                        "Position flipped"
                    );
                    events.push(PositionEvent::Closed(trade));
                    events.push(PositionEvent::Opened(flipped.clone()));
                    map.insert(key.clone(), flipped);
                }
            }
            None => {
                if intent.intent_type.is_flatten() {
                    warn!(
                        signal_id = %fill.signal_id,
                        symbol = %fill.symbol,
                        "Close fill with no local position; reconciliation will verify"
                    );
                } else {
                    let position = Position {
                        venue: venue.to_string(),
                        account: account.to_string(),
                        symbol: fill.symbol.clone(),
                        side: if fill_long { Side::Long } else { Side::Short },
                        size: fill.qty,
                        avg_entry: fill.price,
                        current_stop: non_zero(intent.stop_loss),
                        current_tp: intent.take_profits.first().copied(),
                        realized_pnl: Decimal::ZERO,
                        unrealized_pnl: Decimal::ZERO,
                        fees_paid: fill.fee,
                        last_mark_price: Some(fill.price),
                        opened_at: self.ctx.time.now(),
                        updated_at: self.ctx.time.now_millis(),
                    };
                    match WriteOp::put(Namespace::Positions, key.clone(), &position) {
                        Ok(op) => writes.push(op),
                        Err(e) => error!("Failed to encode position {}: {}", key, e),
                    }
                    info!(
                        signal_id = %fill.signal_id,
                        symbol = %fill.symbol,
                        side = ?position.side,
                        size = %fill.qty,
                        entry = %fill.price,
                        "Position opened"
                    );
                    events.push(PositionEvent::Opened(position.clone()));
                    map.insert(key.clone(), position);
                }
            }
        }

        metrics::set_active_positions(map.len() as i64);
        (events, writes)
    }

    /// Mark-to-market from a fresh ticker. Derived data, not a decision:
    /// callers persist with `put_many`, no event-log entry.
    pub fn update_valuation(&self, ticker: &BookTicker) -> Vec<WriteOp> {
        let mut writes = Vec::new();
        let mut map = self.positions.write();
        for (key, position) in map.iter_mut() {
            if position.symbol != ticker.symbol || position.venue != ticker.venue {
                continue;
            }
            let mid = ticker.mid();
            position.unrealized_pnl = if position.side.is_long() {
                (mid - position.avg_entry) * position.size
            } else {
                (position.avg_entry - mid) * position.size
            };
            position.last_mark_price = Some(mid);
            position.updated_at = ticker.transaction_time;
            if let Ok(op) = WriteOp::put(Namespace::Positions, key.clone(), position) {
                writes.push(op);
            }
        }
        writes
    }
}

fn non_zero(d: Decimal) -> Option<Decimal> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IntentStatus, IntentType};
    use rust_decimal_macros::dec;

    fn book() -> PositionBook {
        PositionBook::new(Arc::new(CoreContext::new_simulated(1_000)))
    }

    fn intent(intent_type: IntentType) -> Intent {
        Intent {
            signal_id: "sig-p".into(),
            source: None,
            symbol: "ETH/USDT:PERP".into(),
            direction: 1,
            intent_type,
            entry_zone: vec![],
            stop_loss: dec!(0),
            take_profits: vec![],
            size: dec!(1),
            status: IntentStatus::Validated,
            confidence: None,
            leverage: None,
            max_slippage_bps: None,
            t_signal: 1_000,
            t_ingress: None,
            venue: Some("paper".into()),
            account: Some("main".into()),
            policy_hash: None,
            rejection_reason: None,
            metadata: None,
        }
    }

    fn fill(id: &str, side: Side, qty: Decimal, price: Decimal) -> FillEvent {
        FillEvent {
            fill_id: id.into(),
            order_id: "ord-p".into(),
            signal_id: "sig-p".into(),
            venue: "paper".into(),
            account: "main".into(),
            symbol: "ETH/USDT:PERP".into(),
            side,
            price,
            qty,
            fee: dec!(0),
            fee_currency: "USDT".into(),
            t_exchange: 1_000,
        }
    }

    #[test]
    fn open_then_pyramid_weighted_average() {
        let book = book();
        let i = intent(IntentType::BuySetup);
        book.apply_fill(&i, &fill("f1", Side::Buy, dec!(1), dec!(100)));
        book.apply_fill(&i, &fill("f2", Side::Buy, dec!(1), dec!(110)));

        let pos = book.get("paper", "main", "ETH/USDT:PERP").unwrap();
        assert_eq!(pos.size, dec!(2));
        assert_eq!(pos.avg_entry, dec!(105));
    }

    #[test]
    fn full_close_realizes_pnl() {
        let book = book();
        book.apply_fill(
            &intent(IntentType::BuySetup),
            &fill("f1", Side::Buy, dec!(2), dec!(100)),
        );
        let (events, _) = book.apply_fill(
            &intent(IntentType::Close),
            &fill("f2", Side::Sell, dec!(2), dec!(110)),
        );

        assert!(book.get("paper", "main", "ETH/USDT:PERP").is_none());
        match &events[0] {
            PositionEvent::Closed(trade) => {
                assert_eq!(trade.pnl, dec!(20));
                assert_eq!(trade.pnl_pct, dec!(10));
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(book.realized_today(), dec!(20));
    }

    #[test]
    fn oversized_opposite_fill_flips() {
        let book = book();
        book.apply_fill(
            &intent(IntentType::BuySetup),
            &fill("f1", Side::Buy, dec!(1), dec!(100)),
        );
        let (events, _) = book.apply_fill(
            &intent(IntentType::SellSetup),
            &fill("f2", Side::Sell, dec!(3), dec!(105)),
        );

        assert_eq!(events.len(), 2);
        let pos = book.get("paper", "main", "ETH/USDT:PERP").unwrap();
        assert_eq!(pos.side, Side::Short);
        assert_eq!(pos.size, dec!(2));
        assert_eq!(pos.avg_entry, dec!(105));
    }

    #[test]
    fn valuation_marks_unrealized() {
        let book = book();
        book.apply_fill(
            &intent(IntentType::BuySetup),
            &fill("f1", Side::Buy, dec!(2), dec!(100)),
        );
        let ticker = BookTicker {
            venue: "paper".into(),
            symbol: "ETH/USDT:PERP".into(),
            best_bid: dec!(109),
            best_bid_qty: dec!(1),
            best_ask: dec!(111),
            best_ask_qty: dec!(1),
            velocity_pct_s: None,
            transaction_time: 2_000,
        };
        book.update_valuation(&ticker);
        let pos = book.get("paper", "main", "ETH/USDT:PERP").unwrap();
        assert_eq!(pos.unrealized_pnl, dec!(20));
        assert_eq!(pos.last_mark_price, Some(dec!(110)));
    }
}
