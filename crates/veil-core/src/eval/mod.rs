//! Policy evaluation.

pub mod context;
pub mod evaluator;

pub use context::EvaluationContext;
pub use evaluator::{EvalResult, EvaluationFault, PolicyEvaluator};
