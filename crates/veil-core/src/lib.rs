//! Veil Core - role graph, policy store, evaluator, and enforcement.
//!
//! This crate decides, per statement, which columns a principal sees masked
//! and which rows it sees at all, and applies that decision to rows fetched
//! by a host database. Stored data is never modified.

pub mod audit;
pub mod catalog;
pub mod config;
pub mod enforce;
pub mod engine;
pub mod error;
pub mod eval;
pub mod persist;
pub mod policy;
pub mod role;
pub mod value;
pub mod version;

pub use catalog::{Catalog, ColumnId, TableDef, TableId};
pub use config::EngineConfig;
pub use engine::{Engine, PreparedStatement};
pub use error::{Error, Result};
pub use value::{DataType, Value};
pub use version::{Timestamp, Validity};

// Policy exports
pub use policy::{
    AttachmentTarget, CompareOp, CompiledMaskingPolicy, CompiledRowAccessPolicy, Expr, Function,
    MaskingPolicyDef, Node, PolicyAttachment, PolicyCompiler, PolicyKind, PolicyStore,
    RowAccessPolicyDef,
};

// Role exports
pub use role::{GrantEdge, Grantee, Principal, RoleGraph, SessionRoles, PUBLIC_ROLE};

// Evaluation and enforcement exports
pub use enforce::{
    BatchResult, EnforcementPlanner, ExecutionHook, FaultSummary, HookOutput, MaskObligation,
    ObligationSet, RowObligation, RowOutcome,
};
pub use eval::{EvaluationContext, EvaluationFault, PolicyEvaluator};

// Audit exports
pub use audit::{
    AuditEvent, AuditEventType, AuditLogger, MemoryAuditLogger, NullAuditLogger,
    TracingAuditLogger,
};
