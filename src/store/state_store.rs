use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::model::{Intent, OperatorState, Order, Position, TradeRecord};
use crate::store::event_log::EventLogEntry;
use crate::store::redb_store::{RedbStore, StoreError};

// Namespaces. One table per namespace; writes are serialized by redb's
// single-writer transaction, reads never block.
const INTENTS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("intents");
const ORDERS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("orders");
const POSITIONS_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("positions");
const OP_STATE_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("op_state");
const EVENT_LOG_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("event_log");
const DEDUP_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("dedup");
const TRADES_TABLE: TableDefinition<&str, Vec<u8>> = TableDefinition::new("trades");

const OP_STATE_KEY: &str = "singleton";
const TERM_KEY: &str = "current_term";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Intents,
    Orders,
    Positions,
    Trades,
}

impl Namespace {
    fn table(&self) -> TableDefinition<'static, &'static str, Vec<u8>> {
        match self {
            Namespace::Intents => INTENTS_TABLE,
            Namespace::Orders => ORDERS_TABLE,
            Namespace::Positions => POSITIONS_TABLE,
            Namespace::Trades => TRADES_TABLE,
        }
    }
}

/// One keyed write inside an atomic commit.
pub struct WriteOp {
    pub ns: Namespace,
    pub key: String,
    /// None deletes the key.
    pub value: Option<Vec<u8>>,
}

impl WriteOp {
    pub fn put<T: Serialize>(ns: Namespace, key: impl Into<String>, value: &T) -> Result<Self, StoreError> {
        Ok(Self {
            ns,
            key: key.into(),
            value: Some(serde_json::to_vec(value)?),
        })
    }

    pub fn delete(ns: Namespace, key: impl Into<String>) -> Self {
        Self {
            ns,
            key: key.into(),
            value: None,
        }
    }
}

/// Entry in the `dedup` namespace, expired by `compact_dedup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRecord {
    pub idempotency_key: String,
    pub first_seen_ts: i64,
    pub result_ref: Option<String>,
}

/// Key for a position aggregate: one per (venue, account, symbol).
pub fn position_key(venue: &str, account: &str, symbol: &str) -> String {
    format!("{}|{}|{}", venue, account, symbol)
}

/// Embedded durable store over redb. Owns every persisted entity; all
/// multi-key commits ride one write transaction so either every record in a
/// commit is visible after crash or none is.
pub struct StateStore {
    store: Arc<RedbStore>,
}

impl StateStore {
    pub fn new(store: Arc<RedbStore>) -> Result<Self, StoreError> {
        // Declare every table up front so first reads don't race first writes
        let txn = store.begin_write()?;
        {
            let _ = txn.open_table(INTENTS_TABLE)?;
            let _ = txn.open_table(ORDERS_TABLE)?;
            let _ = txn.open_table(POSITIONS_TABLE)?;
            let _ = txn.open_table(OP_STATE_TABLE)?;
            let _ = txn.open_table(EVENT_LOG_TABLE)?;
            let _ = txn.open_table(DEDUP_TABLE)?;
            let _ = txn.open_table(TRADES_TABLE)?;
        }
        txn.commit()?;
        Ok(Self { store })
    }

    // --- Generic operations ---

    pub fn get<T: serde::de::DeserializeOwned>(
        &self,
        ns: Namespace,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(ns.table())?;
        let maybe = table.get(key)?;
        maybe
            .map(|v| serde_json::from_slice::<T>(&v.value()))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Atomic multi-key write with an event-log append in the same
    /// transaction. The fencing check and seq assignment happen here.
    pub fn commit(&self, event: EventLogEntry, writes: Vec<WriteOp>) -> Result<u64, StoreError> {
        let txn = self.store.begin_write()?;
        let seq = {
            let mut log = txn.open_table(EVENT_LOG_TABLE)?;
            let mut ops = txn.open_table(OP_STATE_TABLE)?;

            // Fencing: refuse appends from a stale leader term
            let persisted_term: u64 = ops
                .get(TERM_KEY)?
                .map(|v| serde_json::from_slice(&v.value()))
                .transpose()?
                .unwrap_or(0);
            if event.leader_term < persisted_term {
                return Err(StoreError::Fenced {
                    event_term: event.leader_term,
                    persisted_term,
                });
            }
            if event.leader_term > persisted_term {
                ops.insert(TERM_KEY, serde_json::to_vec(&event.leader_term)?)?;
            }

            let last_seq = log.last()?.map(|(k, _)| k.value()).unwrap_or(0);
            let seq = last_seq + 1;
            let mut stamped = event;
            stamped.seq = seq;
            log.insert(seq, serde_json::to_vec(&stamped)?)?;

            for op in &writes {
                let mut table = txn.open_table(op.ns.table())?;
                match &op.value {
                    Some(bytes) => {
                        table.insert(op.key.as_str(), bytes.clone())?;
                    }
                    None => {
                        table.remove(op.key.as_str())?;
                    }
                }
            }
            seq
        };
        txn.commit()?;
        debug!("📝 Event log append: seq {}", seq);
        Ok(seq)
    }

    /// Plain write batch without an event-log entry (valuation refreshes and
    /// other derived updates that are not decisions).
    pub fn put_many(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            for op in &writes {
                let mut table = txn.open_table(op.ns.table())?;
                match &op.value {
                    Some(bytes) => {
                        table.insert(op.key.as_str(), bytes.clone())?;
                    }
                    None => {
                        table.remove(op.key.as_str())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn append_event(&self, event: EventLogEntry) -> Result<u64, StoreError> {
        self.commit(event, Vec::new())
    }

    pub fn scan<T: serde::de::DeserializeOwned>(
        &self,
        ns: Namespace,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(ns.table())?;
        let mut items = Vec::new();
        for res in table.range::<&str>(..)? {
            let (k, v) = res?;
            let key = k.value().to_string();
            if !key.starts_with(prefix) {
                continue;
            }
            let item: T = serde_json::from_slice(&v.value())?;
            items.push((key, item));
        }
        Ok(items)
    }

    pub fn read_events_from(&self, start_seq: u64) -> Result<Vec<EventLogEntry>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(EVENT_LOG_TABLE)?;
        let mut entries = Vec::new();
        for res in table.range(start_seq..)? {
            let (_, v) = res?;
            entries.push(serde_json::from_slice::<EventLogEntry>(&v.value())?);
        }
        Ok(entries)
    }

    pub fn last_seq(&self) -> Result<u64, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(EVENT_LOG_TABLE)?;
        let result = table.last()?.map(|(k, _)| k.value()).unwrap_or(0);
        Ok(result)
    }

    pub fn current_term(&self) -> Result<u64, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(OP_STATE_TABLE)?;
        let maybe = table.get(TERM_KEY)?;
        maybe
            .map(|v| serde_json::from_slice(&v.value()))
            .transpose()
            .map_err(StoreError::from)
            .map(|t| t.unwrap_or(0))
    }

    // --- Typed helpers ---

    pub fn load_intent(&self, signal_id: &str) -> Result<Option<Intent>, StoreError> {
        self.get(Namespace::Intents, signal_id)
    }

    pub fn load_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.get(Namespace::Orders, order_id)
    }

    pub fn load_open_orders(&self) -> Result<Vec<Order>, StoreError> {
        let all: Vec<(String, Order)> = self.scan(Namespace::Orders, "")?;
        Ok(all
            .into_iter()
            .map(|(_, o)| o)
            .filter(|o| !o.state.is_terminal())
            .collect())
    }

    pub fn load_positions(&self) -> Result<Vec<Position>, StoreError> {
        let all: Vec<(String, Position)> = self.scan(Namespace::Positions, "")?;
        Ok(all.into_iter().map(|(_, p)| p).collect())
    }

    pub fn load_trades(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let all: Vec<(String, TradeRecord)> = self.scan(Namespace::Trades, "")?;
        Ok(all.into_iter().map(|(_, t)| t).collect())
    }

    pub fn load_operator_state(&self) -> Result<Option<OperatorState>, StoreError> {
        let txn = self.store.begin_read()?;
        let table = txn.open_table(OP_STATE_TABLE)?;
        let maybe = table.get(OP_STATE_KEY)?;
        maybe
            .map(|v| serde_json::from_slice(&v.value()))
            .transpose()
            .map_err(StoreError::from)
    }

    pub fn save_operator_state(&self, state: &OperatorState) -> Result<(), StoreError> {
        let txn = self.store.begin_write()?;
        {
            let mut table = txn.open_table(OP_STATE_TABLE)?;
            table.insert(OP_STATE_KEY, serde_json::to_vec(state)?)?;
        }
        txn.commit()?;
        Ok(())
    }

    // --- Dedup window ---

    /// Returns false when the key was already present inside the window
    /// (duplicate); records first sight otherwise.
    pub fn check_and_set_dedup(
        &self,
        idempotency_key: &str,
        now_ms: i64,
        window_ms: i64,
        result_ref: Option<String>,
    ) -> Result<bool, StoreError> {
        let txn = self.store.begin_write()?;
        let fresh = {
            let mut table = txn.open_table(DEDUP_TABLE)?;
            let existing: Option<DedupRecord> = table
                .get(idempotency_key)?
                .map(|v| serde_json::from_slice(&v.value()))
                .transpose()?;

            match existing {
                Some(rec) if now_ms - rec.first_seen_ts <= window_ms => false,
                _ => {
                    let rec = DedupRecord {
                        idempotency_key: idempotency_key.to_string(),
                        first_seen_ts: now_ms,
                        result_ref,
                    };
                    table.insert(idempotency_key, serde_json::to_vec(&rec)?)?;
                    true
                }
            }
        };
        txn.commit()?;
        Ok(fresh)
    }

    pub fn compact_dedup(&self, cutoff_ts: i64) -> Result<usize, StoreError> {
        let txn = self.store.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DEDUP_TABLE)?;
            let mut stale_keys = Vec::new();
            for res in table.range::<&str>(..)? {
                let (k, v) = res?;
                let rec: DedupRecord = serde_json::from_slice(&v.value())?;
                if rec.first_seen_ts < cutoff_ts {
                    stale_keys.push(k.value().to_string());
                }
            }
            for key in &stale_keys {
                table.remove(key.as_str())?;
            }
            stale_keys.len()
        };
        txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::event_log::EventKind;
    use serde_json::json;

    fn temp_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let redb = Arc::new(RedbStore::new(dir.path().join("test.redb")).unwrap());
        (StateStore::new(redb).unwrap(), dir)
    }

    fn entry(term: u64) -> EventLogEntry {
        EventLogEntry::new(EventKind::IntentReceived, "corr", term, 1_000, json!({}))
    }

    #[test]
    fn event_log_seq_is_monotonic() {
        let (store, _dir) = temp_store();
        let s1 = store.append_event(entry(1)).unwrap();
        let s2 = store.append_event(entry(1)).unwrap();
        let s3 = store.append_event(entry(2)).unwrap();
        assert!(s1 < s2 && s2 < s3);

        let events = store.read_events_from(0).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events.last().unwrap().seq, s3);
    }

    #[test]
    fn fencing_refuses_stale_terms() {
        let (store, _dir) = temp_store();
        store.append_event(entry(3)).unwrap();
        let err = store.append_event(entry(2)).unwrap_err();
        assert!(matches!(err, StoreError::Fenced { .. }));
        assert_eq!(store.current_term().unwrap(), 3);
    }

    #[test]
    fn commit_is_atomic_across_namespaces() {
        let (store, _dir) = temp_store();
        let writes = vec![
            WriteOp::put(Namespace::Intents, "sig-1", &json!({"x": 1})).unwrap(),
            WriteOp::put(Namespace::Orders, "ord-1", &json!({"y": 2})).unwrap(),
        ];
        store.commit(entry(1), writes).unwrap();

        let intent: Option<serde_json::Value> = store.get(Namespace::Intents, "sig-1").unwrap();
        let order: Option<serde_json::Value> = store.get(Namespace::Orders, "ord-1").unwrap();
        assert!(intent.is_some());
        assert!(order.is_some());
    }

    #[test]
    fn dedup_window_expires() {
        let (store, _dir) = temp_store();
        assert!(store.check_and_set_dedup("k1", 1_000, 60_000, None).unwrap());
        assert!(!store.check_and_set_dedup("k1", 30_000, 60_000, None).unwrap());
        // Outside the window the key is fresh again
        assert!(store.check_and_set_dedup("k1", 120_000, 60_000, None).unwrap());

        let removed = store.compact_dedup(200_000).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn scan_filters_by_prefix() {
        let (store, _dir) = temp_store();
        store
            .put_many(vec![
                WriteOp::put(Namespace::Positions, "paper|main|BTC", &json!({"s": 1})).unwrap(),
                WriteOp::put(Namespace::Positions, "paper|main|ETH", &json!({"s": 2})).unwrap(),
                WriteOp::put(Namespace::Positions, "live|main|BTC", &json!({"s": 3})).unwrap(),
            ])
            .unwrap();

        let paper: Vec<(String, serde_json::Value)> =
            store.scan(Namespace::Positions, "paper|").unwrap();
        assert_eq!(paper.len(), 2);
    }
}
