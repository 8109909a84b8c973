use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::venue::{OrderAck, OrderRequest, VenueAdapter, VenueError, VenueBalance, VenuePosition};

/// Registry of venue adapters plus the deadline/retry policy every outbound
/// call goes through.
pub struct VenueRouter {
    adapters: RwLock<HashMap<String, Arc<dyn VenueAdapter>>>,
    call_deadline: Duration,
    max_attempts: u32,
}

impl VenueRouter {
    pub fn new(venue_call_deadline_ms: u64) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            call_deadline: Duration::from_millis(venue_call_deadline_ms),
            max_attempts: 3,
        }
    }

    pub fn register(&self, name: &str, adapter: Arc<dyn VenueAdapter>) {
        self.adapters.write().insert(name.to_lowercase(), adapter);
        info!("🔌 Registered venue adapter: {}", name);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VenueAdapter>> {
        self.adapters.read().get(&name.to_lowercase()).cloned()
    }

    pub fn venue_names(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    /// Place with deadline + exponential backoff, preserving the same
    /// client-order-id across attempts so the venue dedups. After the last
    /// attempt the caller parks the order INDETERMINATE for reconciliation.
    pub async fn place_with_retry(
        &self,
        venue: &str,
        request: OrderRequest,
    ) -> Result<OrderAck, VenueError> {
        let adapter = self
            .get(venue)
            .ok_or_else(|| VenueError::Config(format!("venue '{}' not registered", venue)))?;

        let mut backoff = Duration::from_millis(250);
        let mut last_err = VenueError::Timeout;

        for attempt in 1..=self.max_attempts {
            let call = adapter.place_order(request.clone());
            match tokio::time::timeout(self.call_deadline, call).await {
                Ok(Ok(ack)) => return Ok(ack),
                Ok(Err(VenueError::Rejected(detail))) => {
                    // A venue rejection is authoritative; retrying won't help
                    return Err(VenueError::Rejected(detail));
                }
                Ok(Err(e)) => {
                    warn!(venue, attempt, "Venue place failed: {}", e);
                    last_err = e;
                }
                Err(_) => {
                    warn!(venue, attempt, "Venue place timed out");
                    last_err = VenueError::Timeout;
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }

        Err(last_err)
    }

    pub async fn cancel(&self, venue: &str, symbol: &str, client_order_id: &str) -> Result<(), VenueError> {
        let adapter = self
            .get(venue)
            .ok_or_else(|| VenueError::Config(format!("venue '{}' not registered", venue)))?;
        tokio::time::timeout(self.call_deadline, adapter.cancel_order(symbol, client_order_id))
            .await
            .map_err(|_| VenueError::Timeout)?
    }

    pub async fn get_positions(&self, venue: &str, account: &str) -> Result<Vec<VenuePosition>, VenueError> {
        let adapter = self
            .get(venue)
            .ok_or_else(|| VenueError::Config(format!("venue '{}' not registered", venue)))?;
        tokio::time::timeout(self.call_deadline, adapter.get_positions(account))
            .await
            .map_err(|_| VenueError::Timeout)?
    }

    pub async fn get_balances(&self, venue: &str, account: &str) -> Result<Vec<VenueBalance>, VenueError> {
        let adapter = self
            .get(venue)
            .ok_or_else(|| VenueError::Config(format!("venue '{}' not registered", venue)))?;
        tokio::time::timeout(self.call_deadline, adapter.get_balances(account))
            .await
            .map_err(|_| VenueError::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CoreContext;
    use crate::lifecycle::order_class::OrderClass;
    use crate::model::Side;
    use crate::venue::paper::PaperVenue;
    use rust_decimal_macros::dec;

    fn request() -> OrderRequest {
        OrderRequest {
            account: "main".into(),
            symbol: "BTC/USDT:PERP".into(),
            side: Side::Buy,
            order_class: OrderClass::Market,
            quantity: dec!(0.1),
            price: None,
            client_order_id: "sig-r-0".into(),
            reduce_only: false,
        }
    }

    #[tokio::test]
    async fn retries_preserve_client_order_id() {
        let ctx = Arc::new(CoreContext::new_simulated(1_000));
        let paper = Arc::new(PaperVenue::new(ctx));
        paper.set_mark("BTC/USDT:PERP", dec!(50000));
        paper.fail_next(2);

        let router = VenueRouter::new(3_000);
        router.register("paper", paper.clone());

        let ack = router.place_with_retry("paper", request()).await.unwrap();
        assert_eq!(ack.client_order_id, "sig-r-0");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_last_error() {
        let ctx = Arc::new(CoreContext::new_simulated(1_000));
        let paper = Arc::new(PaperVenue::new(ctx));
        paper.fail_next(5);

        let router = VenueRouter::new(3_000);
        router.register("paper", paper);

        let err = router.place_with_retry("paper", request()).await.unwrap_err();
        assert!(matches!(err, VenueError::Network(_)));
    }

    #[tokio::test]
    async fn unknown_venue_is_config_error() {
        let router = VenueRouter::new(3_000);
        let err = router.place_with_retry("ghost", request()).await.unwrap_err();
        assert!(matches!(err, VenueError::Config(_)));
    }
}
