#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use titan_execution_core::bus::MemorySink;
use titan_execution_core::config::{ExecutionConfig, RiskLimits};
use titan_execution_core::context::{
    CoreContext, SequentialIdProvider, SimulatedTimeProvider, TimeProvider,
};
use titan_execution_core::lifecycle::manager::{ExecutionDeps, ExecutionManager};
use titan_execution_core::lifecycle::positions::PositionBook;
use titan_execution_core::market::MarketCache;
use titan_execution_core::model::{
    ArmState, BookTicker, Intent, IntentStatus, IntentType, OperatorState,
};
use titan_execution_core::safety::guard::AdmissionGuard;
use titan_execution_core::safety::operator_state::OperatorCell;
use titan_execution_core::safety::risk_state::BreakerLadder;
use titan_execution_core::safety::staleness::StalenessMonitor;
use titan_execution_core::store::redb_store::RedbStore;
use titan_execution_core::store::state_store::StateStore;
use titan_execution_core::venue::paper::PaperVenue;
use titan_execution_core::venue::router::VenueRouter;
use titan_execution_core::wire::envelope::{OperatorAction, OperatorCommand};

pub const T0: i64 = 1_700_000_000_000;

pub struct Harness {
    pub ctx: Arc<CoreContext>,
    pub time: Arc<SimulatedTimeProvider>,
    pub store: Arc<StateStore>,
    pub cell: Arc<OperatorCell>,
    pub ladder: Arc<BreakerLadder>,
    pub staleness: StalenessMonitor,
    pub market: Arc<MarketCache>,
    pub positions: Arc<PositionBook>,
    pub venues: Arc<VenueRouter>,
    pub paper: Arc<PaperVenue>,
    pub sink: Arc<MemorySink>,
    pub manager: Arc<ExecutionManager>,
    pub limits: RiskLimits,
    pub policy_hash: String,
    _dir: tempfile::TempDir,
}

pub fn limits() -> RiskLimits {
    RiskLimits {
        capital: dec!(1000000),
        max_position_pct: dec!(0.25),
        max_leverage: dec!(10),
        max_drawdown_pct: dec!(0.20),
        max_daily_loss_pct: dec!(0.05),
        max_slippage_bps: 100,
        spread_limit_bps: 50,
        drift_tolerance: dec!(0.0001),
    }
}

pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let time = Arc::new(SimulatedTimeProvider::new(T0));
    let ctx = Arc::new(CoreContext {
        time: time.clone(),
        id: Arc::new(SequentialIdProvider::new()),
        producer: "titan-execution-core".to_string(),
    });

    let redb = Arc::new(RedbStore::new(dir.path().join("core.redb")).unwrap());
    let store = Arc::new(StateStore::new(redb).unwrap());

    let limits = limits();
    let policy_hash = limits.compute_hash();
    let cell =
        Arc::new(OperatorCell::hydrate(store.clone(), ctx.clone(), policy_hash.clone()).unwrap());
    let ladder = Arc::new(BreakerLadder::new(limits.clone(), cell.clone(), T0));
    let staleness = StalenessMonitor::new();
    let guard = Arc::new(AdmissionGuard::new(limits.clone(), staleness.clone()));
    let market = Arc::new(MarketCache::new());
    let positions = Arc::new(PositionBook::new(ctx.clone()));

    let venues = Arc::new(VenueRouter::new(3_000));
    let paper = Arc::new(PaperVenue::new(ctx.clone()));
    paper.set_balance("USDT", limits.capital);
    venues.register("paper", paper.clone());

    let sink = Arc::new(MemorySink::new());

    let manager = Arc::new(ExecutionManager::new(ExecutionDeps {
        ctx: ctx.clone(),
        store: store.clone(),
        cell: cell.clone(),
        guard,
        ladder: ladder.clone(),
        positions: positions.clone(),
        router: venues.clone(),
        sink: sink.clone(),
        market: market.clone(),
        exec_cfg: ExecutionConfig::default(),
    }));

    Harness {
        ctx,
        time,
        store,
        cell,
        ladder,
        staleness,
        market,
        positions,
        venues,
        paper,
        sink,
        manager,
        limits,
        policy_hash,
        _dir: dir,
    }
}

impl Harness {
    /// Prime a tight, fresh book so reflex checks pass.
    pub fn prime_market(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        let now = self.time.now_millis();
        self.staleness.update("paper", symbol, now);
        self.market.update(BookTicker {
            venue: "paper".into(),
            symbol: symbol.into(),
            best_bid: bid,
            best_bid_qty: dec!(100),
            best_ask: ask,
            best_ask_qty: dec!(100),
            velocity_pct_s: Some(dec!(0.9)), // fast tape -> market orders
            transaction_time: now,
        });
        self.paper.set_mark(symbol, (bid + ask) / dec!(2));
    }

    /// Admin ARM straight through the operator cell (signature/RBAC are
    /// covered by the security tests).
    pub fn arm(&self) {
        let cmd = OperatorCommand {
            command_id: format!("arm-{}", self.ctx.id.new_id()),
            action: OperatorAction::Arm,
            actor_id: "admin-test".into(),
            timestamp: self.time.now_millis(),
            signature: String::new(),
            state_hash: None,
            reason: Some("test arm".into()),
            policy_hash: None,
        };
        let state = self.cell.apply_command(&cmd).unwrap();
        assert_eq!(state.arm, ArmState::Armed);
    }

    pub fn operator_state(&self) -> OperatorState {
        self.cell.snapshot()
    }

    pub fn stored_intent(&self, signal_id: &str) -> Option<Intent> {
        self.store.load_intent(signal_id).unwrap()
    }

    pub fn reject_events(&self) -> Vec<titan_execution_core::bus::RecordedEvent> {
        self.sink.events_of("titan.evt.execution.reject.v1")
    }
}

/// Bare fixture for tests that do not carry a full harness.
pub fn intent_fixture(signal_id: &str) -> Intent {
    Intent {
        signal_id: signal_id.to_string(),
        source: Some("brain".into()),
        symbol: "BTC/USDT:PERP".to_string(),
        direction: 1,
        intent_type: IntentType::BuySetup,
        entry_zone: vec![],
        stop_loss: Decimal::ZERO,
        take_profits: vec![],
        size: dec!(0.1),
        status: IntentStatus::Pending,
        confidence: None,
        leverage: None,
        max_slippage_bps: None,
        t_signal: T0,
        t_ingress: None,
        venue: Some("paper".into()),
        account: Some("main".into()),
        policy_hash: None,
        rejection_reason: None,
        metadata: None,
    }
}

pub fn intent(h: &Harness, signal_id: &str, symbol: &str, direction: i32, size: Decimal) -> Intent {
    let intent_type = if direction >= 0 {
        IntentType::BuySetup
    } else {
        IntentType::SellSetup
    };
    Intent {
        signal_id: signal_id.to_string(),
        source: Some("brain".into()),
        symbol: symbol.to_string(),
        direction,
        intent_type,
        entry_zone: vec![],
        stop_loss: Decimal::ZERO,
        take_profits: vec![],
        size,
        status: IntentStatus::Pending,
        confidence: Some(0.9),
        leverage: None,
        max_slippage_bps: None,
        t_signal: h.time.now_millis(),
        t_ingress: None,
        venue: Some("paper".into()),
        account: Some("main".into()),
        policy_hash: Some(h.policy_hash.clone()),
        rejection_reason: None,
        metadata: None,
    }
}
