pub mod paper;
pub mod router;
pub mod symbol;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::lifecycle::order_class::OrderClass;
use crate::model::{FillEvent, Side};

#[derive(Error, Debug)]
pub enum VenueError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("API error: {0}")]
    Api(String),
    #[error("Order rejected: {0}")]
    Rejected(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Deadline exceeded")]
    Timeout,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub account: String,
    pub symbol: String,
    pub side: Side,
    pub order_class: OrderClass,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    /// Echoes the signal_id so retries are idempotent on the venue side.
    pub client_order_id: String,
    pub reduce_only: bool,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub venue_order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub status: String,
    pub t_ack: i64,
}

#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub account: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub avg_entry: Decimal,
}

#[derive(Debug, Clone)]
pub struct VenueBalance {
    pub account: String,
    pub currency: String,
    pub available: Decimal,
    pub locked: Decimal,
}

/// Minimal capability surface every venue integration provides. Adapters are
/// idempotent on retry: the venue's client-order-id echoes the signal_id, so
/// a replayed `place_order` must not double-book.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    async fn init(&self) -> Result<(), VenueError>;

    async fn place_order(&self, order: OrderRequest) -> Result<OrderAck, VenueError>;

    /// Idempotent; cancelling an unknown or done order is not an error.
    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<(), VenueError>;

    async fn get_positions(&self, account: &str) -> Result<Vec<VenuePosition>, VenueError>;

    async fn get_balances(&self, account: &str) -> Result<Vec<VenueBalance>, VenueError>;

    /// Stream of authoritative fills, already deduplicated by fill_id.
    async fn subscribe_fills(&self) -> Result<mpsc::Receiver<FillEvent>, VenueError>;

    fn name(&self) -> &str;
}
