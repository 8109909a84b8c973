use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::lifecycle::manager::ExecutionManager;
use crate::model::{FillEvent, Intent};

const PARTITION_QUEUE_DEPTH: usize = 512;

/// Unit of serialized execution: (venue, account, symbol).
pub fn partition_key(venue: &str, account: &str, symbol: &str) -> String {
    format!("{}|{}|{}", venue, account, symbol)
}

pub fn key_for_intent(intent: &Intent) -> String {
    partition_key(
        intent.venue_or_default(),
        intent.account_or_default(),
        &intent.symbol,
    )
}

#[derive(Debug)]
pub enum PartitionMsg {
    Intent {
        intent: Intent,
        correlation_id: String,
    },
    Fill(FillEvent),
    Cancel {
        signal_id: String,
        reason: String,
    },
    CancelAll {
        reason: String,
    },
}

/// Routes messages onto single-writer partition tasks. Within a partition,
/// intents, fills, cancels and expiry ticks are strictly serialized; across
/// partitions everything runs independently.
pub struct PartitionRouter {
    manager: Arc<ExecutionManager>,
    partitions: DashMap<String, mpsc::Sender<PartitionMsg>>,
    expiry_tick_ms: u64,
}

impl PartitionRouter {
    pub fn new(manager: Arc<ExecutionManager>, expiry_tick_ms: u64) -> Self {
        Self {
            manager,
            partitions: DashMap::new(),
            expiry_tick_ms,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub async fn dispatch(&self, key: &str, msg: PartitionMsg) {
        let sender = self.sender_for(key);
        if sender.send(msg).await.is_err() {
            warn!(partition = key, "Partition task gone; message dropped");
            self.partitions.remove(key);
        }
    }

    /// Fan a control message (e.g. halt-cancel) to every live partition.
    pub async fn broadcast_cancel_all(&self, reason: &str) {
        let senders: Vec<(String, mpsc::Sender<PartitionMsg>)> = self
            .partitions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, sender) in senders {
            if sender
                .send(PartitionMsg::CancelAll {
                    reason: reason.to_string(),
                })
                .await
                .is_err()
            {
                self.partitions.remove(&key);
            }
        }
    }

    fn sender_for(&self, key: &str) -> mpsc::Sender<PartitionMsg> {
        use dashmap::mapref::entry::Entry;
        match self.partitions.entry(key.to_string()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let (tx, rx) = mpsc::channel(PARTITION_QUEUE_DEPTH);
                vacant.insert(tx.clone());
                tokio::spawn(run_partition(
                    self.manager.clone(),
                    key.to_string(),
                    rx,
                    self.expiry_tick_ms,
                ));
                tx
            }
        }
    }
}

/// Single-writer loop for one (venue, account, symbol).
async fn run_partition(
    manager: Arc<ExecutionManager>,
    partition: String,
    mut rx: mpsc::Receiver<PartitionMsg>,
    expiry_tick_ms: u64,
) {
    info!(partition = %partition, "Partition task started");
    let mut expiry = tokio::time::interval(std::time::Duration::from_millis(expiry_tick_ms.max(100)));
    expiry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    info!(partition = %partition, "Partition channel closed");
                    return;
                };
                match msg {
                    PartitionMsg::Intent { intent, correlation_id } => {
                        // Rejections already published inside; nothing to do here
                        let _ = manager.handle_intent(intent, correlation_id).await;
                    }
                    PartitionMsg::Fill(fill) => manager.handle_fill(fill).await,
                    PartitionMsg::Cancel { signal_id, reason } => {
                        manager.handle_cancel(&signal_id, &reason).await
                    }
                    PartitionMsg::CancelAll { reason } => {
                        manager.cancel_all_for(&partition, &reason).await
                    }
                }
            }
            _ = expiry.tick() => {
                manager.expire_due_orders_for(&partition).await;
            }
        }
    }
}
