use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Tracks the last ticker update per (venue, symbol). No data yet counts as
/// stale (fail safe).
#[derive(Debug, Clone)]
pub struct StalenessMonitor {
    last_updates: Arc<RwLock<HashMap<(String, String), i64>>>,
}

impl Default for StalenessMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl StalenessMonitor {
    pub fn new() -> Self {
        Self {
            last_updates: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn update(&self, venue: &str, symbol: &str, now_ms: i64) {
        let key = (venue.to_string(), symbol.to_string());
        self.last_updates.write().insert(key, now_ms);
    }

    pub fn is_stale(&self, venue: &str, symbol: &str, now_ms: i64, threshold_ms: i64) -> bool {
        let key = (venue.to_string(), symbol.to_string());
        match self.last_updates.read().get(&key) {
            Some(last_ts) => (now_ms - last_ts) > threshold_ms,
            None => true,
        }
    }

    pub fn age(&self, venue: &str, symbol: &str, now_ms: i64) -> Option<i64> {
        let key = (venue.to_string(), symbol.to_string());
        self.last_updates.read().get(&key).map(|ts| now_ms - ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_symbol_is_stale() {
        let m = StalenessMonitor::new();
        assert!(m.is_stale("paper", "BTC/USDT:PERP", 1_000, 5_000));
    }

    #[test]
    fn fresh_then_stale() {
        let m = StalenessMonitor::new();
        m.update("paper", "BTC/USDT:PERP", 1_000);
        assert!(!m.is_stale("paper", "BTC/USDT:PERP", 3_000, 5_000));
        assert!(m.is_stale("paper", "BTC/USDT:PERP", 7_000, 5_000));
        assert_eq!(m.age("paper", "BTC/USDT:PERP", 7_000), Some(6_000));
    }
}
