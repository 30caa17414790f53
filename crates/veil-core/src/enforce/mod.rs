//! Statement-level enforcement: planning obligations and applying them to rows.

pub mod hook;
pub mod planner;

pub use hook::{BatchResult, ExecutionHook, FaultSummary, HookOutput, RowOutcome};
pub use planner::{EnforcementPlanner, MaskObligation, ObligationSet, RowObligation};
