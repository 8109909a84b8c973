use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::bus::outbox::{Outbox, OutboxEntry};
use crate::bus::EventSink;
use crate::config::ExecutionConfig;
use crate::context::CoreContext;
use crate::errors::ValidationError;
use crate::lifecycle::partition::{key_for_intent, partition_key, PartitionMsg, PartitionRouter};
use crate::market::MarketCache;
use crate::metrics;
use crate::model::{BookTicker, HaltState};
use crate::safety::leader::LeaderState;
use crate::safety::operator_state::OperatorCell;
use crate::safety::risk_state::BreakerLadder;
use crate::safety::staleness::StalenessMonitor;
use crate::safety::volume::VolumeTrigger;
use crate::security::{sign_envelope_payload, SignatureVerifier};
use crate::store::event_log::{EventKind, EventLogEntry};
use crate::store::state_store::StateStore;
use crate::venue::router::VenueRouter;
use crate::venue::VenueAdapter;
use crate::wire::envelope::{Envelope, OperatorAction, Payload};
use crate::wire::registry::SubjectRegistry;
use crate::wire::subjects;

pub const CMD_STREAM: &str = "TITAN_COMMANDS";
pub const EVT_STREAM: &str = "TITAN_EVENTS";
pub const DATA_STREAM: &str = "TITAN_DATA";
pub const SIGNAL_STREAM: &str = "TITAN_SIGNALS";
pub const DLQ_STREAM: &str = "TITAN_DLQ";

const EXECUTION_CONSUMER: &str = "EXECUTION_CORE";

/// Connect with an event callback that flags disconnects (forcing leader
/// demotion) and wakes the outbox drainer on reconnect.
pub async fn connect(
    nats_url: &str,
    demote_flag: Arc<AtomicBool>,
    reconnected: Arc<Notify>,
) -> Result<async_nats::Client, Box<dyn std::error::Error + Send + Sync>> {
    let flag = demote_flag.clone();
    let notify = reconnected.clone();

    let opts = async_nats::ConnectOptions::new().event_callback(move |event| {
        let flag = flag.clone();
        let notify = notify.clone();
        async move {
            match event {
                async_nats::Event::Disconnected => {
                    error!("❌ Bus disconnected; demoting leadership");
                    flag.store(true, Ordering::SeqCst);
                }
                async_nats::Event::Connected => {
                    info!("✅ Bus (re)connected");
                    notify.notify_one();
                }
                other => debug!("Bus event: {}", other),
            }
        }
    });

    let client = async_nats::connect_with_options(nats_url, opts).await?;
    Ok(client)
}

/// Declare the five required streams. Idempotent: existing streams are
/// taken as-is.
pub async fn declare_streams(
    jetstream: &async_nats::jetstream::Context,
) -> Result<async_nats::jetstream::stream::Stream, Box<dyn std::error::Error + Send + Sync>> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    let day = 24 * 60 * 60;

    // COMMANDS: work-queue, 7d, 60s dedup window
    let cmd_stream = ensure_stream(
        jetstream,
        Config {
            name: CMD_STREAM.to_string(),
            subjects: vec![subjects::CMD_WILDCARD.to_string()],
            storage: StorageType::File,
            retention: RetentionPolicy::WorkQueue,
            max_age: Duration::from_secs(7 * day),
            duplicate_window: Duration::from_secs(60),
            ..Default::default()
        },
    )
    .await?;

    // EVENTS: limits, 30d
    ensure_stream(
        jetstream,
        Config {
            name: EVT_STREAM.to_string(),
            subjects: vec![subjects::EVT_WILDCARD.to_string()],
            storage: StorageType::File,
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(30 * day),
            ..Default::default()
        },
    )
    .await?;

    // DATA: limits, 15 min, memory
    ensure_stream(
        jetstream,
        Config {
            name: DATA_STREAM.to_string(),
            subjects: vec![subjects::DATA_WILDCARD.to_string()],
            storage: StorageType::Memory,
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(15 * 60),
            ..Default::default()
        },
    )
    .await?;

    // SIGNALS: limits, 1d (legacy intent entry point retained during migration)
    ensure_stream(
        jetstream,
        Config {
            name: SIGNAL_STREAM.to_string(),
            subjects: vec![subjects::SIGNAL_WILDCARD.to_string()],
            storage: StorageType::File,
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(day),
            ..Default::default()
        },
    )
    .await?;

    // DLQ: limits, 30d
    ensure_stream(
        jetstream,
        Config {
            name: DLQ_STREAM.to_string(),
            subjects: vec![subjects::DLQ_WILDCARD.to_string()],
            storage: StorageType::File,
            retention: RetentionPolicy::Limits,
            max_age: Duration::from_secs(30 * day),
            ..Default::default()
        },
    )
    .await?;

    Ok(cmd_stream)
}

async fn ensure_stream(
    jetstream: &async_nats::jetstream::Context,
    config: async_nats::jetstream::stream::Config,
) -> Result<async_nats::jetstream::stream::Stream, Box<dyn std::error::Error + Send + Sync>> {
    let name = config.name.clone();
    match jetstream.get_stream(&name).await {
        Ok(stream) => Ok(stream),
        Err(_) => {
            info!("Creating JetStream stream: {}", name);
            Ok(jetstream.create_stream(config).await?)
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound: enveloped event publishing with dedup header + outbox fallback
// ---------------------------------------------------------------------------

pub struct NatsEventSink {
    client: async_nats::Client,
    ctx: Arc<CoreContext>,
    outbox: Arc<Outbox>,
    signing_secret: Option<String>,
}

impl NatsEventSink {
    pub fn new(
        client: async_nats::Client,
        ctx: Arc<CoreContext>,
        outbox: Arc<Outbox>,
        signing_secret: Option<String>,
    ) -> Self {
        Self {
            client,
            ctx,
            outbox,
            signing_secret,
        }
    }

    pub fn outbox(&self) -> Arc<Outbox> {
        self.outbox.clone()
    }

    async fn publish_raw(&self, subject: String, payload: Vec<u8>, msg_id: Option<String>) {
        let mut headers = async_nats::HeaderMap::new();
        if let Some(id) = &msg_id {
            // Broker-side dedup key (falls back to envelope id upstream)
            headers.insert("Nats-Msg-Id", id.as_str());
        }
        if let Err(e) = self
            .client
            .publish_with_headers(subject.clone(), headers, payload.clone().into())
            .await
        {
            warn!(subject = %subject, "Publish failed, parking in outbox: {}", e);
            self.outbox.push(OutboxEntry {
                subject,
                payload,
                msg_id,
            });
        }
    }

    /// Re-publish everything parked while the broker was away.
    pub async fn drain_outbox(&self) {
        for entry in self.outbox.drain() {
            self.publish_raw(entry.subject, entry.payload, entry.msg_id).await;
        }
    }
}

#[async_trait]
impl EventSink for NatsEventSink {
    async fn publish_event(
        &self,
        type_name: &str,
        partitions: &[&str],
        payload: Value,
        correlation_id: Option<&str>,
    ) {
        let subject = match SubjectRegistry::subject_for(type_name, partitions) {
            Ok(s) => s,
            Err(e) => {
                error!("Refusing to publish unregistered event {}: {}", type_name, e);
                return;
            }
        };

        let id = self.ctx.id.new_id();
        let ts = self.ctx.time.now_millis();
        let nonce = self.ctx.id.new_id();
        let sig = self
            .signing_secret
            .as_deref()
            .map(|secret| sign_envelope_payload(secret, ts, &nonce, &payload));

        let envelope = Envelope {
            id: id.clone(),
            message_type: type_name.to_string(),
            version: 1,
            schema_version: 1,
            ts,
            producer: self.ctx.producer.clone(),
            correlation_id: correlation_id.map(|s| s.to_string()),
            causation_id: None,
            partition_key: None,
            idempotency_key: Some(id.clone()),
            sig,
            key_id: None,
            nonce: Some(nonce),
            payload,
        };

        match SubjectRegistry::encode(&envelope) {
            Ok(bytes) => self.publish_raw(subject, bytes, Some(id)).await,
            Err(e) => error!("Envelope encode failed for {}: {}", type_name, e),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound: consumers
// ---------------------------------------------------------------------------

/// Everything the consumer loops need.
#[allow(clippy::too_many_arguments)]
pub struct BusEngineDeps {
    pub client: async_nats::Client,
    pub ctx: Arc<CoreContext>,
    pub store: Arc<StateStore>,
    pub cell: Arc<OperatorCell>,
    pub ladder: Arc<BreakerLadder>,
    pub staleness: StalenessMonitor,
    pub market: Arc<MarketCache>,
    pub volume: Arc<VolumeTrigger>,
    pub verifier: Arc<SignatureVerifier>,
    pub partitions: Arc<PartitionRouter>,
    pub venues: Arc<VenueRouter>,
    pub sink: Arc<NatsEventSink>,
    pub exec_cfg: ExecutionConfig,
    pub leader_rx: tokio::sync::watch::Receiver<LeaderState>,
}

/// Start every bus-facing task: the intent command consumer, operator and
/// halt listeners, data/heartbeat ingestion, RPC handlers and venue fill
/// bridges. Returns the handle of the command consumer (the engine's
/// lifetime anchor).
pub async fn start_bus_engine(
    deps: BusEngineDeps,
) -> Result<tokio::task::JoinHandle<()>, Box<dyn std::error::Error + Send + Sync>> {
    let jetstream = async_nats::jetstream::new(deps.client.clone());
    let cmd_stream = declare_streams(&jetstream).await?;

    // --- Intent Command Consumer (JetStream, durable, explicit ack) ---
    let backoff: Vec<Duration> = deps
        .exec_cfg
        .backoff_schedule_ms
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect();

    let consumer = cmd_stream
        .create_consumer(async_nats::jetstream::consumer::pull::Config {
            durable_name: Some(EXECUTION_CONSUMER.to_string()),
            filter_subject: subjects::CMD_EXEC_WILDCARD.to_string(),
            ack_policy: async_nats::jetstream::consumer::AckPolicy::Explicit,
            ack_wait: Duration::from_secs(30),
            max_deliver: deps.exec_cfg.max_deliver,
            backoff,
            ..Default::default()
        })
        .await
        .map_err(|e| {
            error!("❌ Failed to create consumer '{}': {}", EXECUTION_CONSUMER, e);
            e
        })?;

    info!(
        "🚀 JetStream consumer '{}' listening on '{}'",
        EXECUTION_CONSUMER,
        subjects::CMD_EXEC_WILDCARD
    );

    let mut messages = consumer.messages().await.map_err(|e| {
        error!("❌ Failed to get messages stream: {}", e);
        e
    })?;

    let intent_deps = IntentConsumerDeps {
        ctx: deps.ctx.clone(),
        store: deps.store.clone(),
        verifier: deps.verifier.clone(),
        partitions: deps.partitions.clone(),
        sink: deps.sink.clone(),
        client: deps.client.clone(),
        exec_cfg: deps.exec_cfg.clone(),
        leader_rx: deps.leader_rx.clone(),
    };

    let consumer_handle = tokio::spawn(async move {
        while let Some(msg_result) = messages.next().await {
            match msg_result {
                Ok(msg) => handle_command_message(&intent_deps, msg).await,
                Err(e) => error!("Error receiving from JetStream: {}", e),
            }
        }
        warn!("Intent consumer stream ended");
    });

    // --- Operator Command Listener ---
    spawn_operator_listener(&deps).await?;

    // --- System Halt Listener ---
    spawn_halt_listener(&deps).await?;

    // --- Market Data Listener (staleness + cache + volume trigger) ---
    spawn_data_listener(&deps).await?;

    // --- Sentinel Heartbeat Listener ---
    spawn_heartbeat_listener(&deps).await?;

    // --- RPC: get_positions / get_balances ---
    spawn_rpc_handlers(&deps).await?;

    // --- Venue fill bridges ---
    spawn_fill_bridges(&deps).await;

    Ok(consumer_handle)
}

struct IntentConsumerDeps {
    ctx: Arc<CoreContext>,
    store: Arc<StateStore>,
    verifier: Arc<SignatureVerifier>,
    partitions: Arc<PartitionRouter>,
    sink: Arc<NatsEventSink>,
    client: async_nats::Client,
    exec_cfg: ExecutionConfig,
    leader_rx: tokio::sync::watch::Receiver<LeaderState>,
}

async fn handle_command_message(
    deps: &IntentConsumerDeps,
    msg: async_nats::jetstream::Message,
) {
    let subject = msg.subject.to_string();
    let delivered = msg.info().map(|i| i.delivered).unwrap_or(1);

    // Followers only observe; nak so the leader's puller picks it up. On
    // the final delivery the message goes to the DLQ instead of vanishing.
    if !deps.leader_rx.borrow().is_leader {
        if delivered >= deps.exec_cfg.max_deliver {
            dead_letter(
                &deps.client,
                &subject,
                &msg.payload,
                "max deliveries exhausted without a leader",
                &deps.ctx,
            )
            .await;
            ack(&msg).await;
        } else {
            let _ = msg
                .ack_with(async_nats::jetstream::AckKind::Nak(Some(
                    Duration::from_secs(1),
                )))
                .await;
        }
        return;
    }

    // Step 1 of the admission pipeline: decode and verify at the boundary
    let envelope = match SubjectRegistry::decode(&msg.payload) {
        Ok(env) => env,
        Err(e) => {
            metrics::inc_invalid_envelopes();
            error!("⛔ Undecodable command on {}: {}", subject, e);
            dead_letter(&deps.client, &subject, &msg.payload, &e.to_string(), &deps.ctx).await;
            ack(&msg).await;
            return;
        }
    };

    if let Err(e) = deps.verifier.verify_envelope(&envelope) {
        metrics::inc_invalid_envelopes();
        if matches!(e, ValidationError::ReplayDetected { .. }) {
            metrics::inc_replays_detected();
        }
        error!("⛔ Envelope verification failed: {}", e);
        publish_boundary_reject(deps, &envelope, &e).await;
        dead_letter(&deps.client, &subject, &msg.payload, &e.to_string(), &deps.ctx).await;
        ack(&msg).await;
        return;
    }

    // Command dedup window: identical idempotency_key is a no-op
    let now = deps.ctx.time.now_millis();
    match deps.store.check_and_set_dedup(
        envelope.dedup_id(),
        now,
        deps.exec_cfg.command_dedup_window_ms,
        Some(subject.clone()),
    ) {
        Ok(true) => {}
        Ok(false) => {
            debug!(idempotency_key = envelope.dedup_id(), "Duplicate command dropped");
            ack(&msg).await;
            return;
        }
        Err(e) => {
            // Store trouble is transient; let redelivery retry with backoff,
            // DLQ once deliveries run out
            error!("Dedup check failed: {}", e);
            if delivered >= deps.exec_cfg.max_deliver {
                dead_letter(&deps.client, &subject, &msg.payload, "dedup store failure", &deps.ctx)
                    .await;
                ack(&msg).await;
            }
            return;
        }
    }

    match SubjectRegistry::decode_payload(&envelope) {
        Ok(Payload::Intent(mut intent)) => {
            // Subject tokens carry the partition: .<venue>.<account>.<symbol>
            let tokens: Vec<&str> = subject.split('.').collect();
            if tokens.len() >= 8 {
                if intent.venue.is_none() {
                    intent.venue = Some(tokens[5].to_string());
                }
                if intent.account.is_none() {
                    intent.account = Some(tokens[6].to_string());
                }
            }

            let correlation_id = envelope.correlation_or_id().to_string();
            // Producer-supplied partition key wins; otherwise derive it
            let key = envelope
                .partition_key
                .clone()
                .unwrap_or_else(|| key_for_intent(&intent));
            info!(
                correlation_id = %correlation_id,
                signal_id = %intent.signal_id,
                symbol = %intent.symbol,
                partition = %key,
                "Intent received"
            );
            deps.partitions
                .dispatch(&key, PartitionMsg::Intent {
                    intent,
                    correlation_id,
                })
                .await;
            ack(&msg).await;
        }
        Ok(other) => {
            warn!("Non-intent payload on execution subject: {:?}", other);
            dead_letter(
                &deps.client,
                &subject,
                &msg.payload,
                "unexpected payload type",
                &deps.ctx,
            )
            .await;
            ack(&msg).await;
        }
        Err(e) => {
            metrics::inc_invalid_envelopes();
            error!("⛔ Intent payload invalid: {}", e);
            dead_letter(&deps.client, &subject, &msg.payload, &e.to_string(), &deps.ctx).await;
            ack(&msg).await;
        }
    }
}

async fn ack(msg: &async_nats::jetstream::Message) {
    if let Err(e) = msg.ack().await {
        error!("Failed to ACK message: {}", e);
    }
}

/// Route a poisoned message to `titan.dlq.<original-subject>` with the
/// failure reason, then the caller acks.
pub async fn dead_letter(
    client: &async_nats::Client,
    original_subject: &str,
    payload: &[u8],
    reason: &str,
    ctx: &Arc<CoreContext>,
) {
    let parsed = serde_json::from_slice::<Value>(payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(payload).to_string()));
    let dlq_payload = serde_json::json!({
        "reason": reason,
        "original_subject": original_subject,
        "payload": parsed,
        "t_ingress": ctx.time.now_millis(),
    });
    if let Ok(bytes) = serde_json::to_vec(&dlq_payload) {
        let subject = subjects::dlq_for(original_subject);
        if let Err(e) = client.publish(subject, bytes.into()).await {
            error!("DLQ publish failed: {}", e);
        } else {
            metrics::inc_dlq_published();
        }
    }
}

async fn publish_boundary_reject(
    deps: &IntentConsumerDeps,
    envelope: &Envelope,
    err: &ValidationError,
) {
    // Best-effort signal id for telemetry
    let signal_id = envelope
        .payload
        .get("signal_id")
        .and_then(|v| v.as_str())
        .unwrap_or("N/A");
    deps.sink
        .publish_event(
            subjects::EVT_EXECUTION_REJECT,
            &[],
            serde_json::json!({
                "signal_id": signal_id,
                "reason_code": "ENVELOPE_INVALID",
                "reason": err.to_string(),
                "correlation_id": envelope.correlation_or_id(),
                "ts": deps.ctx.time.now_millis(),
            }),
            Some(envelope.correlation_or_id()),
        )
        .await;
}

// ---------------------------------------------------------------------------
// Control-plane listeners (core NATS fan-out: every replica applies these)
// ---------------------------------------------------------------------------

async fn spawn_operator_listener(
    deps: &BusEngineDeps,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut sub = deps.client.subscribe(subjects::CMD_OPERATOR).await.map_err(|e| {
        error!("❌ Failed to subscribe to operator commands: {}", e);
        e
    })?;

    let verifier = deps.verifier.clone();
    let cell = deps.cell.clone();
    let store = deps.store.clone();
    let ctx = deps.ctx.clone();
    let sink = deps.sink.clone();
    let partitions = deps.partitions.clone();
    let dedup_window = deps.exec_cfg.command_dedup_window_ms;

    tokio::spawn(async move {
        info!("👂 Listening for operator commands...");
        while let Some(msg) = sub.next().await {
            let envelope = match SubjectRegistry::decode(&msg.payload) {
                Ok(env) => env,
                Err(e) => {
                    warn!("Malformed operator envelope: {}", e);
                    continue;
                }
            };
            let cmd = match SubjectRegistry::decode_payload(&envelope) {
                Ok(Payload::Operator(cmd)) => cmd,
                Ok(_) | Err(_) => {
                    warn!("Operator subject carried a non-operator payload");
                    continue;
                }
            };

            // Signature + RBAC
            if let Err(e) = verifier.verify_operator_command(&cmd) {
                error!("⛔ REJECTED operator command ({}): {}", cmd.action.as_str(), e);
                continue;
            }

            // Command dedup: one audit entry, one effect
            let now = ctx.time.now_millis();
            match store.check_and_set_dedup(&cmd.command_id, now, dedup_window, None) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(command_id = %cmd.command_id, "Duplicate operator command dropped");
                    continue;
                }
                Err(e) => {
                    error!("Operator dedup failed: {}", e);
                    continue;
                }
            }

            match cell.apply_command(&cmd) {
                Ok(state) => {
                    let entry = EventLogEntry::new(
                        EventKind::OperatorChange,
                        cmd.command_id.clone(),
                        state.leader_term,
                        now,
                        serde_json::json!({
                            "action": cmd.action.as_str(),
                            "actor_id": cmd.actor_id,
                            "reason": cmd.reason,
                            "state_hash": state.state_hash,
                        }),
                    );
                    if let Err(e) = store.append_event(entry) {
                        error!("Operator audit append failed: {}", e);
                    }

                    let action_token = cmd.action.as_str().to_lowercase();
                    sink.publish_event(
                        "titan.evt.ops.v1",
                        &[action_token.as_str()],
                        serde_json::json!({
                            "action": cmd.action.as_str(),
                            "operator_id": cmd.actor_id,
                            "reason": cmd.reason,
                            "correlation_id": cmd.command_id,
                            "state_hash": state.state_hash,
                            "ts": now,
                        }),
                        Some(&cmd.command_id),
                    )
                    .await;

                    if cmd.action == OperatorAction::Halt {
                        partitions.broadcast_cancel_all("operator HALT").await;
                    }
                }
                Err(e) => {
                    // OCC conflict: the operator acted on a stale snapshot
                    warn!("Operator command conflict: {}", e);
                    sink.publish_event(
                        "titan.evt.ops.v1",
                        &["conflict"],
                        serde_json::json!({
                            "action": cmd.action.as_str(),
                            "operator_id": cmd.actor_id,
                            "error": e.to_string(),
                            "correlation_id": cmd.command_id,
                            "ts": now,
                        }),
                        Some(&cmd.command_id),
                    )
                    .await;
                }
            }
        }
    });
    Ok(())
}

async fn spawn_halt_listener(
    deps: &BusEngineDeps,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut sub = deps.client.subscribe(subjects::CMD_SYS_HALT).await.map_err(|e| {
        error!("❌ Failed to subscribe to system halt: {}", e);
        e
    })?;

    let cell = deps.cell.clone();
    let partitions = deps.partitions.clone();

    tokio::spawn(async move {
        info!("👂 Listening for system halt signals...");
        while let Some(msg) = sub.next().await {
            // Accept both enveloped and bare payloads on this subject
            let halt = SubjectRegistry::decode(&msg.payload)
                .ok()
                .and_then(|env| match SubjectRegistry::decode_payload(&env) {
                    Ok(Payload::Halt(h)) => Some(h),
                    _ => None,
                })
                .or_else(|| serde_json::from_slice(&msg.payload).ok());

            let Some(halt) = halt else {
                warn!("Malformed system.halt payload");
                continue;
            };

            let reason = halt.reason.as_deref().unwrap_or("system command");
            cell.set_halt(halt.state, reason);
            if halt.state == HaltState::HardHalt {
                // HARD_HALT cancels all in-flight orders
                partitions.broadcast_cancel_all(reason).await;
            }
        }
    });
    Ok(())
}

async fn spawn_data_listener(
    deps: &BusEngineDeps,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut sub = deps
        .client
        .subscribe(format!("{}.>", subjects::DATA_MARKET_TICKER_PREFIX))
        .await
        .map_err(|e| {
            error!("❌ Failed to subscribe to tickers: {}", e);
            e
        })?;

    let staleness = deps.staleness.clone();
    let market = deps.market.clone();
    let volume = deps.volume.clone();
    let ctx = deps.ctx.clone();

    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            // Tickers arrive enveloped from the gateway; raw from test rigs
            let ticker: Option<BookTicker> = SubjectRegistry::decode(&msg.payload)
                .ok()
                .and_then(|env| match SubjectRegistry::decode_payload(&env) {
                    Ok(Payload::Ticker(t)) => Some(t),
                    _ => None,
                })
                .or_else(|| serde_json::from_slice(&msg.payload).ok());

            let Some(ticker) = ticker else {
                continue;
            };

            let now = ctx.time.now_millis();
            staleness.update(&ticker.venue, &ticker.symbol, now);
            if volume.record_trade(&ticker.symbol, now) {
                debug!(symbol = %ticker.symbol, "Volume trigger fired");
            }
            market.update(ticker);
        }
    });

    // Venue status ingress: DOWN/DEGRADED venues are surfaced in the logs
    // and their tickers naturally go stale, which the reflex tier rejects.
    let mut status_sub = deps
        .client
        .subscribe(subjects::DATA_VENUES_STATUS)
        .await
        .map_err(|e| {
            error!("❌ Failed to subscribe to venue status: {}", e);
            e
        })?;
    tokio::spawn(async move {
        while let Some(msg) = status_sub.next().await {
            let status = SubjectRegistry::decode(&msg.payload)
                .ok()
                .and_then(|env| match SubjectRegistry::decode_payload(&env) {
                    Ok(Payload::VenueStatus(s)) => Some(s),
                    _ => None,
                });
            if let Some(status) = status {
                match status.status.as_str() {
                    "UP" => info!(venue = %status.venue, "Venue status: UP"),
                    other => warn!(venue = %status.venue, status = other, "Venue degraded"),
                }
            }
        }
    });
    Ok(())
}

async fn spawn_heartbeat_listener(
    deps: &BusEngineDeps,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut sub = deps
        .client
        .subscribe(format!("{}.>", subjects::SYS_HEARTBEAT_PREFIX))
        .await
        .map_err(|e| {
            error!("❌ Failed to subscribe to heartbeats: {}", e);
            e
        })?;

    let ladder = deps.ladder.clone();
    let ctx = deps.ctx.clone();

    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            if msg.subject.ends_with(".sentinel") {
                ladder.record_sentinel_beat(ctx.time.now_millis());
            }
        }
    });
    Ok(())
}

async fn spawn_rpc_handlers(
    deps: &BusEngineDeps,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // get_positions
    let mut positions_sub = deps
        .client
        .subscribe(format!("{}.>", subjects::RPC_GET_POSITIONS_PREFIX))
        .await
        .map_err(|e| {
            error!("❌ Failed to subscribe to get_positions: {}", e);
            e
        })?;
    let venues = deps.venues.clone();
    let client = deps.client.clone();

    tokio::spawn(async move {
        info!("👂 Listening for get_positions requests...");
        while let Some(msg) = positions_sub.next().await {
            let Some(reply_to) = msg.reply else { continue };
            let subject = msg.subject.to_string();
            let venue = subject.split('.').last().unwrap_or("unknown").to_string();

            info!("🔍 Fetching LIVE positions for '{}'...", venue);
            let response = match venues.get_positions(&venue, "main").await {
                Ok(positions) => serde_json::json!({
                    "positions": positions
                        .iter()
                        .map(|p| serde_json::json!({
                            "account": p.account,
                            "symbol": p.symbol,
                            "side": p.side,
                            "size": p.size,
                            "avg_entry": p.avg_entry,
                        }))
                        .collect::<Vec<_>>()
                }),
                Err(e) => {
                    error!("❌ Failed to fetch positions from {}: {}", venue, e);
                    serde_json::json!({"positions": [], "error": e.to_string()})
                }
            };
            if let Ok(payload) = serde_json::to_vec(&response) {
                client.publish(reply_to, payload.into()).await.ok();
            }
        }
    });

    // get_balances
    let mut balances_sub = deps
        .client
        .subscribe(format!("{}.>", subjects::RPC_GET_BALANCES_PREFIX))
        .await
        .map_err(|e| {
            error!("❌ Failed to subscribe to get_balances: {}", e);
            e
        })?;
    let venues = deps.venues.clone();
    let client = deps.client.clone();
    let ctx = deps.ctx.clone();

    tokio::spawn(async move {
        while let Some(msg) = balances_sub.next().await {
            let Some(reply_to) = msg.reply else { continue };
            let subject = msg.subject.to_string();
            let venue = subject.split('.').last().unwrap_or("unknown").to_string();

            let response = match venues.get_balances(&venue, "main").await {
                Ok(balances) => serde_json::json!({
                    "balances": balances
                        .iter()
                        .map(|b| serde_json::json!({
                            "currency": b.currency,
                            "available": b.available,
                            "locked": b.locked,
                            "updateTime": ctx.time.now_millis(),
                        }))
                        .collect::<Vec<_>>()
                }),
                Err(e) => serde_json::json!({"balances": [], "error": e.to_string()}),
            };
            if let Ok(payload) = serde_json::to_vec(&response) {
                client.publish(reply_to, payload.into()).await.ok();
            }
        }
    });

    Ok(())
}

/// Bridge each venue's fill stream onto the owning partition task.
async fn spawn_fill_bridges(deps: &BusEngineDeps) {
    for venue_name in deps.venues.venue_names() {
        let Some(adapter) = deps.venues.get(&venue_name) else {
            continue;
        };
        let partitions = deps.partitions.clone();
        tokio::spawn(async move {
            let mut fills = match adapter.subscribe_fills().await {
                Ok(rx) => rx,
                Err(e) => {
                    error!("Fill subscription failed for {}: {}", adapter.name(), e);
                    return;
                }
            };
            while let Some(fill) = fills.recv().await {
                let key = partition_key(&fill.venue, &fill.account, &fill.symbol);
                partitions.dispatch(&key, PartitionMsg::Fill(fill)).await;
            }
        });
    }
}

/// Outbox drainer: waits for reconnect notifications and re-publishes.
pub fn spawn_outbox_drainer(sink: Arc<NatsEventSink>, reconnected: Arc<Notify>) {
    tokio::spawn(async move {
        loop {
            reconnected.notified().await;
            sink.drain_outbox().await;
        }
    });
}
