//! Policy expression language.
//!
//! Bodies are stored as an [`Expr`] tree exactly as authored and compiled
//! into a type-checked [`super::compile::Node`] tree before they are
//! accepted.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `!=` / `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        };
        f.write_str(s)
    }
}

/// Built-in functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Function {
    /// `current_role()`: the session's primary role.
    CurrentRole,
    /// `current_user()`: the session user.
    CurrentUser,
    /// `is_role_in_session(role)`: whether the role is in the active set.
    IsRoleInSession,
    /// `context(key)`: a session attribute.
    Context,
    /// `concat(a, b, ...)`, also written `a || b`.
    Concat,
    /// `split_part(text, delimiter, n)`.
    SplitPart,
    /// `substr(text, start[, length])`.
    Substr,
    /// `left(text, n)`.
    Left,
    /// `right(text, n)`.
    Right,
    /// `length(text)`.
    Length,
    /// `upper(text)`.
    Upper,
    /// `lower(text)`.
    Lower,
    /// `replace(text, from, to)`.
    Replace,
    /// `repeat(text, n)`.
    Repeat,
    /// `coalesce(a, b, ...)`.
    Coalesce,
    /// `partial(text, keep_first, mask, keep_last)`.
    Partial,
    /// `hash(value)`: blake3 digest as `hash:<hex>`.
    Hash,
}

impl Function {
    /// Every function, for name lookup.
    pub const ALL: [Function; 17] = [
        Function::CurrentRole,
        Function::CurrentUser,
        Function::IsRoleInSession,
        Function::Context,
        Function::Concat,
        Function::SplitPart,
        Function::Substr,
        Function::Left,
        Function::Right,
        Function::Length,
        Function::Upper,
        Function::Lower,
        Function::Replace,
        Function::Repeat,
        Function::Coalesce,
        Function::Partial,
        Function::Hash,
    ];

    /// Name as written in policy bodies.
    pub fn name(&self) -> &'static str {
        match self {
            Function::CurrentRole => "current_role",
            Function::CurrentUser => "current_user",
            Function::IsRoleInSession => "is_role_in_session",
            Function::Context => "context",
            Function::Concat => "concat",
            Function::SplitPart => "split_part",
            Function::Substr => "substr",
            Function::Left => "left",
            Function::Right => "right",
            Function::Length => "length",
            Function::Upper => "upper",
            Function::Lower => "lower",
            Function::Replace => "replace",
            Function::Repeat => "repeat",
            Function::Coalesce => "coalesce",
            Function::Partial => "partial",
            Function::Hash => "hash",
        }
    }

    /// Look up a function by name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        let lower = match lower.as_str() {
            "substring" => "substr",
            "len" => "length",
            other => other,
        };
        Self::ALL.iter().copied().find(|f| f.name() == lower)
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A policy body as authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Constant.
    Literal(Value),
    /// Reference to a signature argument by name.
    Arg(String),
    /// Built-in function call.
    Call {
        /// Function.
        func: Function,
        /// Arguments.
        args: Vec<Expr>,
    },
    /// Binary comparison.
    Compare {
        /// Operator.
        op: CompareOp,
        /// Left operand.
        left: Box<Expr>,
        /// Right operand.
        right: Box<Expr>,
    },
    /// `expr [NOT] IN (list)`.
    InList {
        /// Tested value.
        expr: Box<Expr>,
        /// Candidates.
        list: Vec<Expr>,
        /// `NOT IN`.
        negated: bool,
    },
    /// `expr IS [NOT] NULL`.
    IsNull {
        /// Operand.
        expr: Box<Expr>,
        /// `IS NOT NULL`.
        negated: bool,
    },
    /// Conjunction.
    And(Vec<Expr>),
    /// Disjunction.
    Or(Vec<Expr>),
    /// Negation.
    Not(Box<Expr>),
    /// Searched `CASE WHEN c THEN r ... ELSE e END`.
    Case {
        /// `(condition, result)` pairs, tried in order.
        branches: Vec<(Expr, Expr)>,
        /// `ELSE` result; NULL when absent.
        otherwise: Option<Box<Expr>>,
    },
}

impl Expr {
    /// Constant expression.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// NULL constant.
    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    /// Argument reference.
    pub fn arg(name: impl Into<String>) -> Self {
        Expr::Arg(name.into())
    }

    /// Function call.
    pub fn call(func: Function, args: Vec<Expr>) -> Self {
        Expr::Call { func, args }
    }

    /// `current_role()`.
    pub fn current_role() -> Self {
        Expr::call(Function::CurrentRole, vec![])
    }

    /// `current_user()`.
    pub fn current_user() -> Self {
        Expr::call(Function::CurrentUser, vec![])
    }

    /// `is_role_in_session(role)`.
    pub fn role_in_session(role: impl Into<String>) -> Self {
        Expr::call(Function::IsRoleInSession, vec![Expr::lit(role.into())])
    }

    /// Comparison.
    pub fn compare(op: CompareOp, left: Expr, right: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Equality comparison.
    pub fn equals(left: Expr, right: Expr) -> Self {
        Expr::compare(CompareOp::Eq, left, right)
    }

    /// `expr IN (list)`.
    pub fn in_list(expr: Expr, list: Vec<Expr>) -> Self {
        Expr::InList {
            expr: Box::new(expr),
            list,
            negated: false,
        }
    }

    /// Two-way `CASE WHEN condition THEN then ELSE otherwise END`.
    pub fn case(condition: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Case {
            branches: vec![(condition, then)],
            otherwise: Some(Box::new(otherwise)),
        }
    }

    /// Nesting depth of the tree.
    pub fn depth(&self) -> usize {
        let children = match self {
            Expr::Literal(_) | Expr::Arg(_) => return 1,
            Expr::Call { args, .. } => args.iter().map(Expr::depth).max(),
            Expr::Compare { left, right, .. } => Some(left.depth().max(right.depth())),
            Expr::InList { expr, list, .. } => {
                list.iter().map(Expr::depth).chain([expr.depth()]).max()
            }
            Expr::IsNull { expr, .. } | Expr::Not(expr) => Some(expr.depth()),
            Expr::And(items) | Expr::Or(items) => items.iter().map(Expr::depth).max(),
            Expr::Case {
                branches,
                otherwise,
            } => branches
                .iter()
                .map(|(c, r)| c.depth().max(r.depth()))
                .chain(otherwise.iter().map(|e| e.depth()))
                .max(),
        };
        1 + children.unwrap_or(0)
    }
}
