use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::context::CoreContext;
use crate::safety::operator_state::OperatorCell;
use crate::store::event_log::{EventKind, EventLogEntry};
use crate::store::state_store::StateStore;

const LEASE_KEY: &str = "execution_leader";
pub const LEASE_BUCKET: &str = "TITAN_LEASES";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderState {
    pub is_leader: bool,
    pub term: u64,
}

impl LeaderState {
    pub fn follower() -> Self {
        Self {
            is_leader: false,
            term: 0,
        }
    }
}

/// Leader lease over a JetStream KV bucket.
///
/// The bucket's max_age is the lease TTL (~2x heartbeat): a leader that stops
/// renewing loses the key and someone else's `create` wins. `update` with the
/// held revision is the CAS renewal; any CAS failure demotes synchronously.
/// Each promotion takes a fresh monotonic `leader_term` which fences every
/// subsequent state-changing event.
pub struct LeaderElector {
    kv: async_nats::jetstream::kv::Store,
    node_id: String,
    heartbeat_interval: Duration,
    cell: Arc<OperatorCell>,
    store: Arc<StateStore>,
    ctx: Arc<CoreContext>,
    tx: watch::Sender<LeaderState>,
    rx: watch::Receiver<LeaderState>,
    /// Set by the bus adapter on disconnect; the next tick demotes.
    demote_flag: Arc<AtomicBool>,
}

impl LeaderElector {
    pub async fn create_bucket(
        jetstream: &async_nats::jetstream::Context,
        lease_ttl_ms: u64,
    ) -> Result<async_nats::jetstream::kv::Store, Box<dyn std::error::Error + Send + Sync>> {
        let kv = jetstream
            .create_key_value(async_nats::jetstream::kv::Config {
                bucket: LEASE_BUCKET.to_string(),
                max_age: Duration::from_millis(lease_ttl_ms),
                history: 1,
                ..Default::default()
            })
            .await?;
        Ok(kv)
    }

    pub fn new(
        kv: async_nats::jetstream::kv::Store,
        node_id: String,
        heartbeat_interval_ms: u64,
        cell: Arc<OperatorCell>,
        store: Arc<StateStore>,
        ctx: Arc<CoreContext>,
        demote_flag: Arc<AtomicBool>,
    ) -> Self {
        let (tx, rx) = watch::channel(LeaderState::follower());
        Self {
            kv,
            node_id,
            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms),
            cell,
            store,
            ctx,
            tx,
            rx,
            demote_flag,
        }
    }

    pub fn watch(&self) -> watch::Receiver<LeaderState> {
        self.rx.clone()
    }

    pub fn demote_flag(&self) -> Arc<AtomicBool> {
        self.demote_flag.clone()
    }

    /// Election loop. Followers try to take the lease each tick; the leader
    /// renews it and demotes the instant a renewal or the bus fails.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut held_revision: Option<u64> = None;

        loop {
            interval.tick().await;

            if self.demote_flag.swap(false, Ordering::SeqCst) {
                if held_revision.take().is_some() {
                    self.demote("bus disconnect").await;
                }
                continue;
            }

            match held_revision {
                Some(revision) => {
                    // Renew via CAS on the revision we hold
                    match self
                        .kv
                        .update(LEASE_KEY, self.node_id.clone().into(), revision)
                        .await
                    {
                        Ok(next) => held_revision = Some(next),
                        Err(e) => {
                            error!("❌ Lease renewal failed: {}. Demoting.", e);
                            held_revision = None;
                            self.demote("lease renewal failure").await;
                        }
                    }
                }
                None => {
                    // create() only succeeds when no live lease exists
                    match self.kv.update(LEASE_KEY, self.node_id.clone().into(), 0).await {
                        Ok(revision) => {
                            held_revision = Some(revision);
                            self.promote().await;
                        }
                        Err(_) => {
                            // Someone else holds the lease; stay follower
                        }
                    }
                }
            }
        }
    }

    async fn promote(&self) {
        let term = self.store.current_term().unwrap_or(0) + 1;
        self.cell.set_leader_term(term);

        let entry = EventLogEntry::new(
            EventKind::LeaderChange,
            format!("promote-{}", self.node_id),
            term,
            self.ctx.time.now_millis(),
            json!({"node_id": self.node_id, "term": term, "role": "leader"}),
        );
        if let Err(e) = self.store.append_event(entry) {
            error!("Failed to persist leader promotion: {}", e);
        }

        let _ = self.tx.send(LeaderState {
            is_leader: true,
            term,
        });
        info!("👑 Promoted to LEADER (term {})", term);
    }

    async fn demote(&self, reason: &str) {
        let term = self.cell.leader_term();
        let entry = EventLogEntry::new(
            EventKind::LeaderChange,
            format!("demote-{}", self.node_id),
            term,
            self.ctx.time.now_millis(),
            json!({"node_id": self.node_id, "term": term, "role": "follower", "reason": reason}),
        );
        if let Err(e) = self.store.append_event(entry) {
            error!("Failed to persist leader demotion: {}", e);
        }

        let _ = self.tx.send(LeaderState::follower());
        crate::metrics::set_leader_term(0);
        warn!("🪂 Demoted to follower: {}", reason);
    }
}
