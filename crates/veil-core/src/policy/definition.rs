//! Masking and row-access policy definitions as submitted by administrators.

use super::expr::Expr;
use crate::value::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two kinds of policy. Names are unique per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyKind {
    /// Column masking policy.
    Masking,
    /// Table row-access policy.
    RowAccess,
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyKind::Masking => f.write_str("masking"),
            PolicyKind::RowAccess => f.write_str("row access"),
        }
    }
}

/// A masking policy definition.
///
/// The body sees exactly one argument, the value of the column the policy is
/// attached to, plus the evaluation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskingPolicyDef {
    /// Policy name, unique among masking policies.
    pub name: String,
    /// Name the body uses for the masked value.
    pub arg_name: String,
    /// Type of the masked column.
    pub input_type: DataType,
    /// Type of the value the body returns.
    pub output_type: DataType,
    /// Body expression.
    pub body: Expr,
    /// Free-form description.
    pub comment: Option<String>,
}

impl MaskingPolicyDef {
    /// Create a masking policy whose input and output types are equal.
    pub fn new(
        name: impl Into<String>,
        arg_name: impl Into<String>,
        ty: DataType,
        body: Expr,
    ) -> Self {
        Self {
            name: name.into(),
            arg_name: arg_name.into(),
            input_type: ty,
            output_type: ty,
            body,
            comment: None,
        }
    }

    /// Set a distinct output type.
    pub fn returning(mut self, ty: DataType) -> Self {
        self.output_type = ty;
        self
    }

    /// Attach a comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// A row-access policy definition.
///
/// The body is a predicate over its parameters, which are bound to raw
/// column values of the protected table when the policy is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowAccessPolicyDef {
    /// Policy name, unique among row-access policies.
    pub name: String,
    /// Parameter names and types, in binding order.
    pub params: Vec<(String, DataType)>,
    /// Boolean body expression.
    pub body: Expr,
    /// Free-form description.
    pub comment: Option<String>,
}

impl RowAccessPolicyDef {
    /// Create a row-access policy with no parameters.
    pub fn new(name: impl Into<String>, body: Expr) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            body,
            comment: None,
        }
    }

    /// Add a parameter.
    pub fn with_param(mut self, name: impl Into<String>, ty: DataType) -> Self {
        self.params.push((name.into(), ty));
        self
    }

    /// Attach a comment.
    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}
