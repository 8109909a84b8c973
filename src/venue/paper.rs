use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::CoreContext;
use crate::model::{FillEvent, Side};
use crate::venue::{OrderAck, OrderRequest, VenueAdapter, VenueBalance, VenueError, VenuePosition};

/// One scripted partial fill for a pending order.
#[derive(Debug, Clone)]
pub struct FillSlice {
    pub qty: Decimal,
    pub price: Decimal,
}

#[derive(Default)]
struct PaperBook {
    marks: HashMap<String, Decimal>,
    /// Scripted fills keyed by signal_id (client order ids are prefixed with it).
    fill_plans: HashMap<String, VecDeque<FillSlice>>,
    open_orders: HashMap<String, OrderRequest>,
    /// Idempotency: acks already handed out, by client_order_id.
    acks: HashMap<String, OrderAck>,
    positions: HashMap<(String, String), VenuePosition>,
    balances: HashMap<String, Decimal>,
    fail_next: u32,
    /// When false, orders rest until the test pumps fills explicitly.
    auto_fill: bool,
}

/// Deterministic in-process venue. Serves three roles: the shadow-execution
/// leg, the integration-test venue, and the recovery-drill counterparty.
pub struct PaperVenue {
    ctx: Arc<CoreContext>,
    book: Mutex<PaperBook>,
    subscribers: Mutex<Vec<mpsc::Sender<FillEvent>>>,
    taker_fee_rate: Decimal,
}

impl PaperVenue {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            ctx,
            book: Mutex::new(PaperBook {
                auto_fill: true,
                ..PaperBook::default()
            }),
            subscribers: Mutex::new(Vec::new()),
            taker_fee_rate: Decimal::new(5, 4), // 0.05%
        }
    }

    pub fn set_mark(&self, symbol: &str, price: Decimal) {
        self.book.lock().marks.insert(symbol.to_string(), price);
    }

    pub fn set_balance(&self, currency: &str, amount: Decimal) {
        self.book.lock().balances.insert(currency.to_string(), amount);
    }

    /// Script the fill sequence for an upcoming order (keyed by signal_id).
    pub fn plan_fills(&self, signal_id: &str, slices: Vec<FillSlice>) {
        self.book
            .lock()
            .fill_plans
            .insert(signal_id.to_string(), slices.into());
    }

    /// Fail the next N place_order calls with a network error.
    pub fn fail_next(&self, n: u32) {
        self.book.lock().fail_next = n;
    }

    /// Orders rest instead of filling; tests drive fills via `pump_fills`.
    pub fn manual_mode(&self) {
        self.book.lock().auto_fill = false;
    }

    pub fn open_order_count(&self) -> usize {
        self.book.lock().open_orders.len()
    }

    /// Overwrite a venue-side position (reconciliation drift injection).
    pub fn force_position(&self, account: &str, symbol: &str, side: Side, size: Decimal, avg_entry: Decimal) {
        let mut book = self.book.lock();
        let key = (account.to_string(), symbol.to_string());
        if size.is_zero() {
            book.positions.remove(&key);
        } else {
            book.positions.insert(
                key,
                VenuePosition {
                    account: account.to_string(),
                    symbol: symbol.to_string(),
                    side,
                    size,
                    avg_entry,
                },
            );
        }
    }

    fn apply_fill_to_position(book: &mut PaperBook, req: &OrderRequest, qty: Decimal, price: Decimal) {
        let key = (req.account.clone(), req.symbol.clone());
        let fill_is_long = req.side.is_long();
        let fill_side = if fill_is_long { Side::Long } else { Side::Short };

        let updated = match book.positions.remove(&key) {
            None => Some(VenuePosition {
                account: req.account.clone(),
                symbol: req.symbol.clone(),
                side: fill_side,
                size: qty,
                avg_entry: price,
            }),
            Some(mut pos) if pos.side.is_long() == fill_is_long => {
                let total = pos.size + qty;
                pos.avg_entry = (pos.avg_entry * pos.size + price * qty) / total;
                pos.size = total;
                Some(pos)
            }
            Some(mut pos) => {
                if qty >= pos.size {
                    let flipped = qty - pos.size;
                    if flipped.is_zero() {
                        None
                    } else {
                        pos.side = fill_side;
                        pos.size = flipped;
                        pos.avg_entry = price;
                        Some(pos)
                    }
                } else {
                    pos.size -= qty;
                    Some(pos)
                }
            }
        };

        if let Some(pos) = updated {
            book.positions.insert(key, pos);
        }
    }

    async fn emit(&self, fill: FillEvent) {
        let subscribers = self.subscribers.lock().clone();
        for tx in subscribers {
            if tx.send(fill.clone()).await.is_err() {
                warn!("Paper fill subscriber dropped");
            }
        }
    }

    fn next_fill(&self, req: &OrderRequest, remaining: &mut Decimal) -> Option<FillEvent> {
        let mut book = self.book.lock();
        let signal_id = req
            .client_order_id
            .split('-')
            .next()
            .unwrap_or(&req.client_order_id)
            .to_string();

        let slice = match book.fill_plans.get_mut(&signal_id) {
            Some(plan) => plan.pop_front(),
            None => {
                // No script: single full fill at the mark
                let price = book
                    .marks
                    .get(&req.symbol)
                    .copied()
                    .or(req.price)
                    .unwrap_or(Decimal::ZERO);
                if price.is_zero() || remaining.is_zero() {
                    return None;
                }
                Some(FillSlice {
                    qty: *remaining,
                    price,
                })
            }
        }?;

        if slice.qty.is_zero() {
            return None;
        }
        let qty = slice.qty.min(*remaining);
        *remaining -= qty;
        Self::apply_fill_to_position(&mut book, req, qty, slice.price);

        Some(FillEvent {
            fill_id: format!("pf-{}", self.ctx.id.new_id()),
            order_id: format!("po-{}", req.client_order_id),
            signal_id,
            venue: "paper".to_string(),
            account: req.account.clone(),
            symbol: req.symbol.clone(),
            side: req.side,
            price: slice.price,
            qty,
            fee: qty * slice.price * self.taker_fee_rate,
            fee_currency: "USDT".to_string(),
            t_exchange: self.ctx.time.now_millis(),
        })
    }

    /// Drive scripted fills for a resting order (manual mode).
    pub async fn pump_fills(&self, client_order_id: &str) {
        let req = {
            let book = self.book.lock();
            book.open_orders.get(client_order_id).cloned()
        };
        let Some(req) = req else { return };

        let mut remaining = req.quantity;
        while let Some(fill) = self.next_fill(&req, &mut remaining) {
            self.emit(fill).await;
            if remaining.is_zero() {
                break;
            }
        }
        if remaining.is_zero() {
            self.book.lock().open_orders.remove(client_order_id);
        }
    }
}

#[async_trait]
impl VenueAdapter for PaperVenue {
    async fn init(&self) -> Result<(), VenueError> {
        info!("📄 Paper venue ready");
        Ok(())
    }

    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, VenueError> {
        let (ack, auto_fill) = {
            let mut book = self.book.lock();

            if book.fail_next > 0 {
                book.fail_next -= 1;
                return Err(VenueError::Network("injected failure".to_string()));
            }

            // Idempotent on retry: same client_order_id returns the same ack
            if let Some(existing) = book.acks.get(&order.client_order_id) {
                return Ok(existing.clone());
            }

            let ack = OrderAck {
                venue_order_id: format!("po-{}", order.client_order_id),
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                status: "NEW".to_string(),
                t_ack: self.ctx.time.now_millis(),
            };
            book.acks.insert(order.client_order_id.clone(), ack.clone());
            book.open_orders
                .insert(order.client_order_id.clone(), order.clone());
            (ack, book.auto_fill)
        };

        if auto_fill {
            self.pump_fills(&order.client_order_id).await;
        }

        Ok(ack)
    }

    async fn cancel_order(&self, _symbol: &str, client_order_id: &str) -> Result<(), VenueError> {
        // Idempotent: cancelling a done/unknown order is a no-op
        self.book.lock().open_orders.remove(client_order_id);
        Ok(())
    }

    async fn get_positions(&self, account: &str) -> Result<Vec<VenuePosition>, VenueError> {
        let book = self.book.lock();
        Ok(book
            .positions
            .values()
            .filter(|p| p.account == account)
            .cloned()
            .collect())
    }

    async fn get_balances(&self, account: &str) -> Result<Vec<VenueBalance>, VenueError> {
        let book = self.book.lock();
        Ok(book
            .balances
            .iter()
            .map(|(currency, amount)| VenueBalance {
                account: account.to_string(),
                currency: currency.clone(),
                available: *amount,
                locked: Decimal::ZERO,
            })
            .collect())
    }

    async fn subscribe_fills(&self) -> Result<mpsc::Receiver<FillEvent>, VenueError> {
        let (tx, rx) = mpsc::channel(256);
        self.subscribers.lock().push(tx);
        Ok(rx)
    }

    fn name(&self) -> &str {
        "paper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::order_class::OrderClass;
    use rust_decimal_macros::dec;

    fn venue() -> PaperVenue {
        let ctx = Arc::new(CoreContext::new_simulated(1_000));
        let v = PaperVenue::new(ctx);
        v.set_mark("ETH/USDT:PERP", dec!(2000));
        v
    }

    fn request(signal_id: &str, qty: Decimal) -> OrderRequest {
        OrderRequest {
            account: "main".into(),
            symbol: "ETH/USDT:PERP".into(),
            side: Side::Sell,
            order_class: OrderClass::Market,
            quantity: qty,
            price: None,
            client_order_id: format!("{}-0", signal_id),
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn scripted_partials_arrive_in_order() {
        let v = venue();
        let mut fills = v.subscribe_fills().await.unwrap();
        v.plan_fills(
            "s2",
            vec![
                FillSlice { qty: dec!(0.2), price: dec!(2000) },
                FillSlice { qty: dec!(0.3), price: dec!(1999) },
            ],
        );

        v.place_order(request("s2", dec!(0.5))).await.unwrap();

        let f1 = fills.recv().await.unwrap();
        let f2 = fills.recv().await.unwrap();
        assert_eq!(f1.qty, dec!(0.2));
        assert_eq!(f2.qty, dec!(0.3));
        assert_ne!(f1.fill_id, f2.fill_id);
        assert_eq!(v.open_order_count(), 0);
    }

    #[tokio::test]
    async fn replayed_client_order_id_is_idempotent() {
        let v = venue();
        let _fills = v.subscribe_fills().await.unwrap();
        let req = request("s4", dec!(1));

        let a1 = v.place_order(req.clone()).await.unwrap();
        let a2 = v.place_order(req).await.unwrap();
        assert_eq!(a1.venue_order_id, a2.venue_order_id);

        let positions = v.get_positions("main").await.unwrap();
        // One fill only despite two placements
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(1));
    }

    #[tokio::test]
    async fn injected_failures_then_recovery() {
        let v = venue();
        v.fail_next(2);
        let req = request("s9", dec!(1));
        assert!(v.place_order(req.clone()).await.is_err());
        assert!(v.place_order(req.clone()).await.is_err());
        assert!(v.place_order(req).await.is_ok());
    }
}
