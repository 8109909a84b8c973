use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::CoreContext;
use crate::errors::StateError;
use crate::model::{ArmState, HaltState, OperatorState, RiskState};
use crate::store::state_store::StateStore;
use crate::wire::envelope::{OperatorAction, OperatorCommand};

/// Single-writer, many-reader cell for the OperatorState singleton.
///
/// Every mutation recomputes `state_hash` and writes through to the
/// `op_state` namespace before the new snapshot becomes visible. Operator
/// commands carrying a `state_hash` are compare-and-swapped against the live
/// hash (OCC); a mismatch is a conflict the operator resolves by re-reading.
pub struct OperatorCell {
    state: RwLock<OperatorState>,
    store: Arc<StateStore>,
    ctx: Arc<CoreContext>,
}

impl OperatorCell {
    /// Hydrate from the store, falling back to the fail-safe boot state
    /// (DISARMED, no halt, NORMAL risk).
    pub fn hydrate(
        store: Arc<StateStore>,
        ctx: Arc<CoreContext>,
        policy_hash: String,
    ) -> Result<Self, crate::store::redb_store::StoreError> {
        let state = match store.load_operator_state()? {
            Some(persisted) => {
                info!(
                    arm = ?persisted.arm,
                    halt = ?persisted.halt,
                    risk_state = ?persisted.risk_state,
                    "Operator state hydrated"
                );
                persisted
            }
            None => {
                let boot = OperatorState::fail_safe(policy_hash, ctx.time.now_millis());
                warn!("🔒 No persisted operator state. Booting DISARMED (fail-safe).");
                store.save_operator_state(&boot)?;
                boot
            }
        };
        Ok(Self {
            state: RwLock::new(state),
            store,
            ctx,
        })
    }

    pub fn snapshot(&self) -> OperatorState {
        self.state.read().clone()
    }

    pub fn is_armed(&self) -> bool {
        self.state.read().arm == ArmState::Armed
    }

    pub fn halt(&self) -> HaltState {
        self.state.read().halt
    }

    pub fn risk_state(&self) -> RiskState {
        self.state.read().risk_state
    }

    pub fn policy_hash(&self) -> String {
        self.state.read().policy_hash.clone()
    }

    pub fn leader_term(&self) -> u64 {
        self.state.read().leader_term
    }

    fn mutate<F>(&self, f: F) -> Result<OperatorState, crate::store::redb_store::StoreError>
    where
        F: FnOnce(&mut OperatorState),
    {
        let mut guard = self.state.write();
        let mut next = guard.clone();
        f(&mut next);
        next.last_change_ts = self.ctx.time.now_millis();
        next.state_hash = next.compute_hash();
        self.store.save_operator_state(&next)?;
        *guard = next.clone();
        Ok(next)
    }

    /// Apply a verified operator command. OCC happens here; signature and
    /// RBAC were already checked by the verifier.
    pub fn apply_command(&self, cmd: &OperatorCommand) -> Result<OperatorState, StateError> {
        // OCC: a stale state_hash means the operator acted on an old view
        if let Some(expected) = &cmd.state_hash {
            let live = self.state.read().state_hash.clone();
            if *expected != live {
                return Err(StateError::Conflict {
                    expected: expected.clone(),
                    got: live,
                });
            }
        }

        let actor = cmd.actor_id.clone();
        let result = self.mutate(|s| {
            s.last_operator_id = Some(actor.clone());
            match cmd.action {
                OperatorAction::Arm => {
                    s.arm = ArmState::Armed;
                    // ARM is the sanctioned de-escalation path
                    s.risk_state = RiskState::Normal;
                }
                OperatorAction::Disarm => s.arm = ArmState::Disarmed,
                OperatorAction::Halt => s.halt = HaltState::HardHalt,
                OperatorAction::Resume => s.halt = HaltState::None,
                OperatorAction::PolicyUpdate => {
                    if let Some(hash) = &cmd.policy_hash {
                        s.policy_hash = hash.clone();
                    }
                }
            }
        });

        match result {
            Ok(next) => {
                match cmd.action {
                    OperatorAction::Arm => {
                        info!("🔫 EXECUTION ARMED by {} - order placement ENABLED", cmd.actor_id)
                    }
                    OperatorAction::Disarm => {
                        warn!("🔒 EXECUTION DISARMED by {} - order placement DISABLED", cmd.actor_id)
                    }
                    OperatorAction::Halt => warn!("🚨 HARD_HALT by {}", cmd.actor_id),
                    OperatorAction::Resume => info!("✅ Halt lifted by {}", cmd.actor_id),
                    OperatorAction::PolicyUpdate => {
                        info!("🛡️ Policy hash updated by {}", cmd.actor_id)
                    }
                }
                Ok(next)
            }
            Err(e) => {
                // A write-through failure must not leave a half-applied cell;
                // mutate() only swaps after a successful save.
                warn!("Failed to persist operator state: {}", e);
                Err(StateError::Missing)
            }
        }
    }

    /// Bus-driven halt (titan.cmd.sys.halt.v1), not operator-initiated.
    pub fn set_halt(&self, halt: HaltState, reason: &str) -> Option<OperatorState> {
        let prev = self.state.read().halt;
        if prev == halt {
            return None;
        }
        let result = self.mutate(|s| s.halt = halt).ok();
        match halt {
            HaltState::None => info!("✅ SYSTEM HALT LIFTED: {}", reason),
            HaltState::SoftHalt => warn!("🟡 SOFT_HALT: {}", reason),
            HaltState::HardHalt => warn!("🚨 HARD_HALT ACTIVATED: {}", reason),
        }
        result
    }

    /// Escalate risk state. Monotonic: moves toward EMERGENCY only; the
    /// return path is an admin ARM.
    pub fn escalate_risk(&self, target: RiskState, reason: &str) -> Option<OperatorState> {
        let current = self.state.read().risk_state;
        if target <= current {
            return None;
        }
        let next = self.mutate(|s| s.risk_state = target).ok();
        warn!(
            "🛡️ RISK STATE TRANSITION: {:?} -> {:?} ({})",
            current, target, reason
        );
        crate::metrics::set_risk_state(target.as_metric());
        next
    }

    /// Called by the leader elector on promotion. Term must only grow.
    pub fn set_leader_term(&self, term: u64) -> Option<OperatorState> {
        let current = self.state.read().leader_term;
        if term <= current {
            return None;
        }
        crate::metrics::set_leader_term(term as i64);
        self.mutate(|s| s.leader_term = term).ok()
    }
}
