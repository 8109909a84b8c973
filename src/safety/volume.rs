use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

const WINDOW_MS: i64 = 100;

/// Per-symbol trade-burst trigger.
///
/// Fires iff the trade count inside the trailing 100 ms window reaches the
/// threshold. Time is injected by the caller so the trigger is deterministic
/// and symbols are fully independent.
pub struct VolumeTrigger {
    threshold: usize,
    windows: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl VolumeTrigger {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Record one trade print; returns true when this print brings the
    /// window count to the threshold.
    pub fn record_trade(&self, symbol: &str, ts_ms: i64) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let mut windows = self.windows.lock();
        let window = windows.entry(symbol.to_string()).or_default();

        window.push_back(ts_ms);
        let cutoff = ts_ms - WINDOW_MS;
        while window.front().is_some_and(|t| *t < cutoff) {
            window.pop_front();
        }

        window.len() >= self.threshold
    }

    pub fn count_in_window(&self, symbol: &str, now_ms: i64) -> usize {
        let windows = self.windows.lock();
        windows
            .get(symbol)
            .map(|w| w.iter().filter(|t| now_ms - **t <= WINDOW_MS).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_only_at_threshold() {
        let trig = VolumeTrigger::new(3);
        assert!(!trig.record_trade("BTC", 0));
        assert!(!trig.record_trade("BTC", 10));
        assert!(trig.record_trade("BTC", 20));
        // Stays fired while the window stays saturated
        assert!(trig.record_trade("BTC", 30));
    }

    #[test]
    fn window_slides() {
        let trig = VolumeTrigger::new(3);
        assert!(!trig.record_trade("BTC", 0));
        assert!(!trig.record_trade("BTC", 10));
        // Third print lands after the first fell out of the window
        assert!(!trig.record_trade("BTC", 150));
        assert!(!trig.record_trade("BTC", 160));
        assert!(trig.record_trade("BTC", 170));
    }

    #[test]
    fn symbols_are_independent() {
        let trig = VolumeTrigger::new(2);
        assert!(!trig.record_trade("BTC", 0));
        assert!(!trig.record_trade("ETH", 0));
        assert!(trig.record_trade("BTC", 10));
        assert_eq!(trig.count_in_window("ETH", 10), 1);
    }
}
