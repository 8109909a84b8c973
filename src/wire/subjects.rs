// Canonical Subject Catalog.
// This file is the Source of Truth for subject strings in the execution core.
// Naming convention: titan.{layer}.{domain}.{action}.v{N}[.partition]

// -----------------------------------------------------------------------------
// COMMANDS
// -----------------------------------------------------------------------------

// System Control
pub const CMD_SYS_HALT: &str = "titan.cmd.sys.halt.v1";

// Operator Control (ARM / DISARM / RESUME / POLICY_UPDATE)
pub const CMD_OPERATOR: &str = "titan.cmd.operator.v1";

// Execution Intent (partitioned: .<venue>.<account>.<symbol>)
pub const CMD_EXECUTION_PLACE_PREFIX: &str = "titan.cmd.execution.place.v1";

// -----------------------------------------------------------------------------
// EVENTS
// -----------------------------------------------------------------------------

pub const EVT_EXECUTION_FILL: &str = "titan.evt.execution.fill.v1";
pub const EVT_EXECUTION_SHADOW_FILL: &str = "titan.evt.execution.shadow_fill.v1";
pub const EVT_EXECUTION_REPORT: &str = "titan.evt.execution.report.v1";
pub const EVT_EXECUTION_REJECT: &str = "titan.evt.execution.reject.v1";
pub const EVT_EXECUTION_DRIFT: &str = "titan.evt.execution.drift.v1";
pub const EVT_OPS_PREFIX: &str = "titan.evt.ops";

// -----------------------------------------------------------------------------
// DATA (ingress)
// -----------------------------------------------------------------------------

pub const DATA_MARKET_TICKER_PREFIX: &str = "titan.data.market.ticker.v1";
pub const DATA_VENUES_STATUS: &str = "titan.data.venues.status.v1";

// -----------------------------------------------------------------------------
// RPC (request/reply)
// -----------------------------------------------------------------------------

pub const RPC_GET_POSITIONS_PREFIX: &str = "titan.rpc.execution.get_positions.v1";
pub const RPC_GET_BALANCES_PREFIX: &str = "titan.rpc.execution.get_balances.v1";

// -----------------------------------------------------------------------------
// SYSTEM
// -----------------------------------------------------------------------------

pub const SYS_HEARTBEAT_PREFIX: &str = "titan.sys.heartbeat.v1";
pub const SYS_HEARTBEAT_EXECUTION: &str = "titan.sys.heartbeat.v1.execution";

pub const DLQ_PREFIX: &str = "titan.dlq";

// Legacy intent entry point, accepted during migration only. The partitioned
// place subject is canonical.
pub const LEGACY_SIGNAL_SUBMIT: &str = "titan.signal.submit.v1";

// -----------------------------------------------------------------------------
// SUBSCRIPTION PATTERNS (WILDCARDS)
// -----------------------------------------------------------------------------

pub const CMD_WILDCARD: &str = "titan.cmd.>";
pub const CMD_EXEC_WILDCARD: &str = "titan.cmd.execution.>";
pub const EVT_WILDCARD: &str = "titan.evt.>";
pub const DATA_WILDCARD: &str = "titan.data.>";
pub const SIGNAL_WILDCARD: &str = "titan.signal.>";
pub const DLQ_WILDCARD: &str = "titan.dlq.>";

/// DLQ subject for a message that exhausted its deliveries.
pub fn dlq_for(original_subject: &str) -> String {
    format!("{}.{}", DLQ_PREFIX, original_subject)
}

/// Heartbeat subject for a named service.
pub fn heartbeat_for(service: &str) -> String {
    format!("{}.{}", SYS_HEARTBEAT_PREFIX, service)
}
