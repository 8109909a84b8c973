use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{info, warn};

use crate::metrics;

const DEFAULT_CAPACITY: usize = 4_096;

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub subject: String,
    pub payload: Vec<u8>,
    pub msg_id: Option<String>,
}

/// Bounded buffer for event publishes that failed while the broker was
/// unreachable. Drained in order on reconnect; overflow drops the oldest
/// entry (events are re-derivable from the event log, commands never pass
/// through here).
pub struct Outbox {
    entries: Mutex<VecDeque<OutboxEntry>>,
    capacity: usize,
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn push(&self, entry: OutboxEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            let dropped = entries.pop_front();
            warn!(
                "Outbox full; dropping oldest entry {:?}",
                dropped.map(|e| e.subject)
            );
        }
        entries.push_back(entry);
        metrics::set_outbox_depth(entries.len() as i64);
    }

    pub fn depth(&self) -> usize {
        self.entries.lock().len()
    }

    /// Hand back everything buffered, oldest first. Entries that still fail
    /// to publish should be re-pushed by the caller.
    pub fn drain(&self) -> Vec<OutboxEntry> {
        let mut entries = self.entries.lock();
        let drained: Vec<OutboxEntry> = entries.drain(..).collect();
        metrics::set_outbox_depth(0);
        if !drained.is_empty() {
            info!("📤 Draining outbox: {} buffered events", drained.len());
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(subject: &str) -> OutboxEntry {
        OutboxEntry {
            subject: subject.into(),
            payload: vec![1, 2, 3],
            msg_id: None,
        }
    }

    #[test]
    fn drains_in_order() {
        let outbox = Outbox::new(10);
        outbox.push(entry("a"));
        outbox.push(entry("b"));
        let drained = outbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].subject, "a");
        assert_eq!(outbox.depth(), 0);
    }

    #[test]
    fn overflow_drops_oldest() {
        let outbox = Outbox::new(2);
        outbox.push(entry("a"));
        outbox.push(entry("b"));
        outbox.push(entry("c"));
        let drained = outbox.drain();
        assert_eq!(drained[0].subject, "b");
        assert_eq!(drained[1].subject, "c");
    }
}
