use std::env;
use std::fs;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, Level};

use titan_execution_core::bus::adapter::{self, BusEngineDeps, NatsEventSink};
use titan_execution_core::bus::outbox::Outbox;
use titan_execution_core::config::Settings;
use titan_execution_core::context::CoreContext;
use titan_execution_core::lifecycle::manager::{ExecutionDeps, ExecutionManager};
use titan_execution_core::lifecycle::partition::PartitionRouter;
use titan_execution_core::lifecycle::positions::PositionBook;
use titan_execution_core::lifecycle::recovery::run_crash_recovery;
use titan_execution_core::market::MarketCache;
use titan_execution_core::recon::ReconciliationLoop;
use titan_execution_core::safety::guard::AdmissionGuard;
use titan_execution_core::safety::leader::LeaderElector;
use titan_execution_core::safety::operator_state::OperatorCell;
use titan_execution_core::safety::risk_state::BreakerLadder;
use titan_execution_core::safety::staleness::StalenessMonitor;
use titan_execution_core::safety::volume::VolumeTrigger;
use titan_execution_core::security::SignatureVerifier;
use titan_execution_core::store::redb_store::RedbStore;
use titan_execution_core::store::state_store::StateStore;
use titan_execution_core::venue::paper::PaperVenue;
use titan_execution_core::venue::router::VenueRouter;
use titan_execution_core::venue::VenueAdapter;

/// Resolve `*_FILE` secret indirection before anything reads the
/// environment. Called once, before the runtime spawns threads.
fn load_secrets_from_files() {
    const FILE_SUFFIX: &str = "_FILE";

    let vars: Vec<(String, String)> = env::vars().collect();
    for (key, value) in vars {
        if !key.ends_with(FILE_SUFFIX) {
            continue;
        }
        let target_key = key.trim_end_matches(FILE_SUFFIX);
        if env::var(target_key).is_ok() || value.is_empty() {
            continue;
        }
        if let Ok(contents) = fs::read_to_string(&value) {
            let trimmed = contents.trim().to_string();
            if !trimmed.is_empty() {
                env::set_var(target_key, trimmed);
            }
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(false);
    let filter =
        tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into());

    // OTLP export only when an endpoint is configured
    if let Ok(endpoint) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        use opentelemetry::KeyValue;
        use opentelemetry_otlp::WithExportConfig;
        use opentelemetry_sdk::{trace as sdktrace, Resource};

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(endpoint),
            )
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "titan-execution-core"),
                KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .expect("OTel pipeline install failed");

        let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
        let subscriber = Registry::default().with(filter).with(fmt_layer).with(telemetry);
        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    } else {
        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)
            .expect("setting default subscriber failed");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    load_secrets_from_files();
    dotenv::dotenv().ok();
    init_tracing();

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║                  TITAN EXECUTION CORE                         ║");
    info!("║        Intent admission · Order lifecycle · Safety            ║");
    info!("╚═══════════════════════════════════════════════════════════════╝");

    // =========================================================================
    // FAIL-CLOSED SECURITY CHECK: validate HMAC keys before ANY network ops
    // =========================================================================
    let signing_secret = {
        let hmac_secret = env::var("HMAC_SECRET").unwrap_or_default();
        let allow_empty = env::var("HMAC_ALLOW_EMPTY_SECRET")
            .map(|v| v == "true")
            .unwrap_or(false);

        if hmac_secret.is_empty() && !allow_empty {
            error!(
                "❌ FATAL: HMAC_SECRET environment variable is required for production. \
                 Set HMAC_ALLOW_EMPTY_SECRET=true only for testing."
            );
            std::process::exit(1);
        } else if hmac_secret.is_empty() {
            info!("⚠️  HMAC_SECRET not set but HMAC_ALLOW_EMPTY_SECRET=true. TEST MODE ONLY.");
            None
        } else {
            info!("🔐 HMAC_SECRET configured ({} bytes)", hmac_secret.len());
            Some(hmac_secret)
        }
    };

    let settings = Settings::new().expect("❌ critical: failed to load configuration");
    let exec_cfg = settings.execution.clone();
    let limits = settings.risk.clone();
    let policy_hash = limits.compute_hash();
    info!("✅ Risk policy loaded. Hash: {}", policy_hash);

    let ctx = Arc::new(CoreContext::new_system());

    // --- Durable state store ---
    let store_path = exec_cfg
        .store_path
        .clone()
        .or_else(|| env::var("PERSISTENCE_PATH").ok())
        .unwrap_or_else(|| "titan_execution.redb".to_string());
    let redb = Arc::new(RedbStore::new(&store_path).expect("Failed to open state store"));
    let store = Arc::new(StateStore::new(redb).expect("Failed to initialize namespaces"));

    // --- Safety core (fail-safe boot: DISARMED, no halt) ---
    let cell = Arc::new(
        OperatorCell::hydrate(store.clone(), ctx.clone(), policy_hash.clone())
            .expect("Failed to hydrate operator state"),
    );
    let ladder = Arc::new(BreakerLadder::new(
        limits.clone(),
        cell.clone(),
        ctx.time.now_millis(),
    ));
    let staleness = StalenessMonitor::new();
    let guard = Arc::new(AdmissionGuard::new(limits.clone(), staleness.clone()));
    let market = Arc::new(MarketCache::new());
    let volume = Arc::new(VolumeTrigger::new(10));

    // --- Bus connection (disconnects force demotion) ---
    let nats_url = exec_cfg
        .nats_url
        .clone()
        .or_else(|| env::var("NATS_URL").ok())
        .unwrap_or_else(|| "nats://localhost:4222".to_string());
    info!("Connecting to NATS at {}", nats_url);

    let demote_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reconnected = Arc::new(Notify::new());
    let client = match adapter::connect(&nats_url, demote_flag.clone(), reconnected.clone()).await
    {
        Ok(c) => {
            info!("✅ Connected to NATS");
            c
        }
        Err(e) => {
            error!("❌ Failed to connect to NATS: {}", e);
            std::process::exit(1);
        }
    };

    let outbox = Arc::new(Outbox::default());
    let sink = Arc::new(NatsEventSink::new(
        client.clone(),
        ctx.clone(),
        outbox,
        signing_secret,
    ));
    adapter::spawn_outbox_drainer(sink.clone(), reconnected);

    // --- Venues ---
    let venues = Arc::new(VenueRouter::new(exec_cfg.venue_call_deadline_ms));
    let paper = Arc::new(PaperVenue::new(ctx.clone()));
    paper.init().await.expect("Paper venue init");
    venues.register("paper", paper);

    // --- Position book + lifecycle ---
    let positions = Arc::new(PositionBook::new(ctx.clone()));
    positions
        .hydrate(&store)
        .expect("Failed to hydrate positions");

    let manager = Arc::new(ExecutionManager::new(ExecutionDeps {
        ctx: ctx.clone(),
        store: store.clone(),
        cell: cell.clone(),
        guard: guard.clone(),
        ladder: ladder.clone(),
        positions: positions.clone(),
        router: venues.clone(),
        sink: sink.clone(),
        market: market.clone(),
        exec_cfg: exec_cfg.clone(),
    }));
    let partitions = Arc::new(PartitionRouter::new(manager.clone(), 1_000));

    // --- Crash recovery before any consumer starts ---
    let report = run_crash_recovery(&store, &venues, &cell, &ctx)
        .await
        .expect("Crash recovery failed");
    info!(
        "✅ Recovery: {} scanned, {} filled, {} cancelled, {} expired",
        report.scanned,
        report.finalized_filled,
        report.finalized_cancelled,
        report.finalized_expired
    );

    // --- Leader lease ---
    let jetstream = async_nats::jetstream::new(client.clone());
    let kv = LeaderElector::create_bucket(&jetstream, exec_cfg.leader_lease_ttl_ms)
        .await
        .expect("Failed to create lease bucket");
    let node_id = env::var("NODE_ID").unwrap_or_else(|_| ctx.id.new_id());
    // Bus disconnects demote through the same flag the connect callback sets
    let elector = LeaderElector::new(
        kv,
        node_id,
        exec_cfg.heartbeat_interval_ms,
        cell.clone(),
        store.clone(),
        ctx.clone(),
        demote_flag,
    );
    let leader_rx = elector.watch();
    tokio::spawn(elector.run());
    info!("✅ Leader elector started");

    // --- Signature verifier ---
    let verifier = Arc::new(SignatureVerifier::from_env(
        exec_cfg.clock_skew_tolerance_ms,
        exec_cfg.command_dedup_window_ms,
        &settings.rbac_roles,
        ctx.clone(),
    ));

    // --- Bus engine (consumers, listeners, RPC, fill bridges) ---
    let bus_handle = adapter::start_bus_engine(BusEngineDeps {
        client: client.clone(),
        ctx: ctx.clone(),
        store: store.clone(),
        cell: cell.clone(),
        ladder: ladder.clone(),
        staleness,
        market: market.clone(),
        volume,
        verifier,
        partitions: partitions.clone(),
        venues: venues.clone(),
        sink: sink.clone(),
        exec_cfg: exec_cfg.clone(),
        leader_rx: leader_rx.clone(),
    })
    .await?;
    info!("✅ Bus engine started");

    // --- Reconciliation & telemetry loop ---
    let recon = ReconciliationLoop {
        ctx: ctx.clone(),
        store: store.clone(),
        cell: cell.clone(),
        ladder,
        positions,
        manager,
        partitions,
        venues,
        sink,
        market,
        limits,
        period_ms: exec_cfg.reconcile_period_ms,
        dedup_window_ms: exec_cfg.command_dedup_window_ms,
        leader_rx,
    };
    let recon_handle = tokio::spawn(recon.run());
    info!("✅ Reconciliation loop started");

    info!("✅ Execution core running (DISARMED until operator ARM)");

    // --- Shutdown: drain cleanly on SIGINT ---
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received; draining...");
    bus_handle.abort();
    recon_handle.abort();
    info!("✅ Execution core stopped");

    Ok(())
}
