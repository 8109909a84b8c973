use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::model::BookTicker;

/// Last-known book per (venue, symbol), fed by the DATA stream consumer and
/// read by the reflex checks and the shadow-fill leg. In-memory only.
#[derive(Default)]
pub struct MarketCache {
    books: DashMap<(String, String), BookTicker>,
}

impl MarketCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, ticker: BookTicker) {
        self.books
            .insert((ticker.venue.clone(), ticker.symbol.clone()), ticker);
    }

    pub fn get(&self, venue: &str, symbol: &str) -> Option<BookTicker> {
        self.books
            .get(&(venue.to_string(), symbol.to_string()))
            .map(|t| t.clone())
    }

    /// Velocity for order-class selection; zero when the feed doesn't
    /// supply one (ties to the least aggressive class).
    pub fn velocity(&self, venue: &str, symbol: &str) -> Decimal {
        self.get(venue, symbol)
            .and_then(|t| t.velocity_pct_s)
            .unwrap_or(Decimal::ZERO)
    }
}
