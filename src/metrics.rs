use once_cell::sync::Lazy;
use prometheus::{
    register_gauge, register_histogram, register_int_counter, register_int_gauge, Gauge,
    Histogram, IntCounter, IntGauge,
};

pub static ORDER_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "titan_execution_order_latency_seconds",
        "End-to-end order execution latency (Intent -> Fill)",
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    )
    .expect("order_latency histogram")
});

pub static SLIPPAGE_BPS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "titan_execution_slippage_bps",
        "Execution slippage in basis points",
        vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    )
    .expect("slippage_bps histogram")
});

pub static RISK_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "titan_execution_risk_state",
        "Current Risk State (0=Normal, 1=Cautious, 2=Defensive, 3=Emergency)"
    )
    .expect("risk_state gauge")
});

pub static LEADER_TERM: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "titan_execution_leader_term",
        "Current leader term (0 while follower)"
    )
    .expect("leader_term gauge")
});

pub static ACTIVE_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "titan_execution_active_positions",
        "Number of currently active positions"
    )
    .expect("active_positions gauge")
});

pub static OPEN_ORDERS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "titan_execution_open_orders",
        "Number of non-terminal orders"
    )
    .expect("open_orders gauge")
});

pub static DRAWDOWN_PCT: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "titan_execution_drawdown_pct",
        "Session drawdown as a fraction of the configured limit"
    )
    .expect("drawdown_pct gauge")
});

pub static EQUITY: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("titan_execution_equity", "Current account equity").expect("equity gauge")
});

pub static FILLED_ORDERS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "titan_execution_filled_orders_total",
        "Total orders fully filled"
    )
    .expect("filled_orders counter")
});

pub static INVALID_ENVELOPES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "titan_execution_invalid_envelopes_total",
        "Total envelopes rejected at the wire boundary"
    )
    .expect("invalid_envelopes counter")
});

pub static EXPIRED_INTENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "titan_execution_expired_intents_total",
        "Total intents rejected due to expiry"
    )
    .expect("expired_intents counter")
});

pub static DLQ_PUBLISHED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "titan_execution_dlq_published_total",
        "Total messages routed to the DLQ"
    )
    .expect("dlq_published counter")
});

pub static RISK_REJECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "titan_execution_risk_rejections_total",
        "Total admission pipeline rejections"
    )
    .expect("risk_rejections counter")
});

pub static REPLAYS_DETECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "titan_execution_replays_detected_total",
        "Total envelopes dropped by the nonce replay guard"
    )
    .expect("replays_detected counter")
});

pub static DRIFT_EVENTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "titan_execution_drift_events_total",
        "Total reconciliation drift events published"
    )
    .expect("drift_events counter")
});

pub static OUTBOX_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "titan_execution_outbox_depth",
        "Events parked in the outbox awaiting reconnect"
    )
    .expect("outbox_depth gauge")
});

pub fn inc_invalid_envelopes() {
    INVALID_ENVELOPES.inc();
}

pub fn inc_expired_intents() {
    EXPIRED_INTENTS.inc();
}

pub fn inc_dlq_published() {
    DLQ_PUBLISHED.inc();
}

pub fn inc_risk_rejections() {
    RISK_REJECTIONS.inc();
}

pub fn inc_replays_detected() {
    REPLAYS_DETECTED.inc();
}

pub fn inc_drift_events() {
    DRIFT_EVENTS.inc();
}

pub fn inc_filled_orders() {
    FILLED_ORDERS.inc();
}

pub fn observe_order_latency(duration_sec: f64) {
    ORDER_LATENCY.observe(duration_sec);
}

pub fn observe_slippage(bps: f64) {
    SLIPPAGE_BPS.observe(bps);
}

pub fn set_risk_state(state: i64) {
    RISK_STATE.set(state);
}

pub fn set_leader_term(term: i64) {
    LEADER_TERM.set(term);
}

pub fn set_active_positions(count: i64) {
    ACTIVE_POSITIONS.set(count);
}

pub fn set_open_orders(count: i64) {
    OPEN_ORDERS.set(count);
}

pub fn set_drawdown_pct(value: f64) {
    DRAWDOWN_PCT.set(value);
}

pub fn set_equity(value: f64) {
    EQUITY.set(value);
}

pub fn set_outbox_depth(depth: i64) {
    OUTBOX_DEPTH.set(depth);
}
