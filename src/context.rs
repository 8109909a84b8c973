use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for providing the current time.
/// Decouples logic from `Utc::now()` to enable deterministic replay.
pub trait TimeProvider: Send + Sync {
    fn now_millis(&self) -> i64;
    fn now(&self) -> DateTime<Utc>;
}

/// Trait for generating unique IDs.
/// Live implementation emits ULIDs (sortable, envelope-friendly).
pub trait IdProvider: Send + Sync {
    fn new_id(&self) -> String;
}

/// Context holding the providers.
/// Threaded through every component at construction; never a global.
#[derive(Clone)]
pub struct CoreContext {
    pub time: Arc<dyn TimeProvider>,
    pub id: Arc<dyn IdProvider>,
    pub producer: String,
}

impl CoreContext {
    pub fn new_system() -> Self {
        Self {
            time: Arc::new(SystemTimeProvider),
            id: Arc::new(UlidProvider),
            producer: "titan-execution-core".to_string(),
        }
    }

    pub fn new_simulated(start_time_ms: i64) -> Self {
        Self {
            time: Arc::new(SimulatedTimeProvider::new(start_time_ms)),
            id: Arc::new(SequentialIdProvider::new()),
            producer: "titan-execution-core".to_string(),
        }
    }
}

// --- Live Implementations ---

pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct UlidProvider;

impl IdProvider for UlidProvider {
    fn new_id(&self) -> String {
        ulid::Ulid::new().to_string()
    }
}

// --- Simulated Implementations ---

pub struct SimulatedTimeProvider {
    current_time_ms: AtomicI64,
}

impl SimulatedTimeProvider {
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            current_time_ms: AtomicI64::new(start_time_ms),
        }
    }

    pub fn set_time(&self, time_ms: i64) {
        self.current_time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, duration_ms: i64) {
        self.current_time_ms.fetch_add(duration_ms, Ordering::SeqCst);
    }
}

impl TimeProvider for SimulatedTimeProvider {
    fn now_millis(&self) -> i64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }

    fn now(&self) -> DateTime<Utc> {
        let ms = self.now_millis();
        Utc.timestamp_millis_opt(ms).unwrap()
    }
}

pub struct SequentialIdProvider {
    counter: AtomicU64,
}

impl SequentialIdProvider {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for SequentialIdProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdProvider for SequentialIdProvider {
    fn new_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        // Recognizable prefix so replay transcripts are easy to diff
        format!("00000000000000000000{:06}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_time_advances() {
        let time = SimulatedTimeProvider::new(1_000);
        assert_eq!(time.now_millis(), 1_000);
        time.advance(250);
        assert_eq!(time.now_millis(), 1_250);
    }

    #[test]
    fn sequential_ids_are_unique_and_ordered() {
        let ids = SequentialIdProvider::new();
        let a = ids.new_id();
        let b = ids.new_id();
        assert_ne!(a, b);
        assert!(a < b);
    }
}
