//! Masking and row-access policies: definitions, compilation, and storage.

pub mod compile;
pub mod definition;
pub mod expr;
pub mod store;

pub use compile::{CompiledMaskingPolicy, CompiledRowAccessPolicy, Node, PolicyCompiler};
pub use definition::{MaskingPolicyDef, PolicyKind, RowAccessPolicyDef};
pub use expr::{CompareOp, Expr, Function};
pub use store::{AttachmentTarget, PolicyAttachment, PolicyStore, PolicyVersion, Stored};
