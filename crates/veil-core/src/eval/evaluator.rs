//! Interpreter for compiled policy bodies.

use super::context::EvaluationContext;
use crate::policy::compile::{CompiledMaskingPolicy, CompiledRowAccessPolicy, Node};
use crate::policy::expr::{CompareOp, Function};
use crate::value::{DataType, Value};
use std::cmp::Ordering;
use thiserror::Error;

/// Default cap, in bytes, on any string a policy function produces.
pub const DEFAULT_MAX_STRING_LEN: usize = 1 << 20;

/// Runtime failure while evaluating one policy on one row.
///
/// Faults never fail a statement. The execution hook turns a masking fault
/// into NULL and a row-access fault into an excluded row.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationFault {
    /// A value did not have the type the policy was compiled for.
    #[error("type mismatch in {context}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Where the mismatch happened.
        context: String,
        /// Expected type.
        expected: String,
        /// Actual value type.
        found: String,
    },

    /// A function received an argument it cannot work with.
    #[error("invalid argument to {function}(): {reason}")]
    InvalidArgument {
        /// Function name.
        function: String,
        /// What was wrong.
        reason: String,
    },
}

impl EvaluationFault {
    fn mismatch(context: impl Into<String>, expected: impl Into<String>, found: &Value) -> Self {
        EvaluationFault::TypeMismatch {
            context: context.into(),
            expected: expected.into(),
            found: found
                .data_type()
                .map_or_else(|| "NULL".to_string(), |t| t.to_string()),
        }
    }

    fn invalid(function: Function, reason: impl Into<String>) -> Self {
        EvaluationFault::InvalidArgument {
            function: function.name().to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type for evaluation.
pub type EvalResult<T> = std::result::Result<T, EvaluationFault>;

/// Evaluates compiled policy bodies against values and a context.
///
/// Stateless apart from limits; one instance is shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct PolicyEvaluator {
    max_string_len: usize,
}

impl Default for PolicyEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEvaluator {
    /// Create an evaluator with default limits.
    pub fn new() -> Self {
        Self {
            max_string_len: DEFAULT_MAX_STRING_LEN,
        }
    }

    /// Set the longest string, in bytes, any function may produce.
    pub fn with_max_string_len(mut self, len: usize) -> Self {
        self.max_string_len = len;
        self
    }

    // =========================================================================
    // Policy entry points
    // =========================================================================

    /// Apply a masking policy, turning any fault into NULL.
    pub fn evaluate_mask(
        &self,
        policy: &CompiledMaskingPolicy,
        value: &Value,
        ctx: &EvaluationContext,
    ) -> Value {
        self.try_evaluate_mask(policy, value, ctx)
            .unwrap_or(Value::Null)
    }

    /// Apply a masking policy, reporting faults.
    pub fn try_evaluate_mask(
        &self,
        policy: &CompiledMaskingPolicy,
        value: &Value,
        ctx: &EvaluationContext,
    ) -> EvalResult<Value> {
        self.mask_with(
            &policy.body,
            policy.input_type(),
            policy.output_type(),
            value,
            ctx,
        )
    }

    /// Evaluate a masking body (or its specialized residual) on one value.
    pub fn mask_with(
        &self,
        body: &Node,
        input_type: DataType,
        output_type: DataType,
        value: &Value,
        ctx: &EvaluationContext,
    ) -> EvalResult<Value> {
        if !value.conforms_to(input_type) {
            return Err(EvaluationFault::mismatch(
                "masked column",
                input_type.to_string(),
                value,
            ));
        }
        let out = self.eval(body, std::slice::from_ref(value), ctx)?;
        if !out.conforms_to(output_type) {
            return Err(EvaluationFault::mismatch(
                "mask result",
                output_type.to_string(),
                &out,
            ));
        }
        Ok(out)
    }

    /// Apply a row-access policy. Faults and NULL results exclude the row.
    pub fn evaluate_row(
        &self,
        policy: &CompiledRowAccessPolicy,
        args: &[Value],
        ctx: &EvaluationContext,
    ) -> bool {
        self.try_evaluate_row(policy, args, ctx).unwrap_or(false)
    }

    /// Apply a row-access policy, reporting faults. NULL is `Ok(false)`.
    pub fn try_evaluate_row(
        &self,
        policy: &CompiledRowAccessPolicy,
        args: &[Value],
        ctx: &EvaluationContext,
    ) -> EvalResult<bool> {
        let types = policy.param_types();
        self.filter_with(&policy.body, &types, args, ctx)
    }

    /// Evaluate a row predicate (or its residual) on bound column values.
    pub fn filter_with(
        &self,
        body: &Node,
        param_types: &[DataType],
        args: &[Value],
        ctx: &EvaluationContext,
    ) -> EvalResult<bool> {
        for (value, ty) in args.iter().zip(param_types) {
            if !value.conforms_to(*ty) {
                return Err(EvaluationFault::mismatch("row-access argument", ty.to_string(), value));
            }
        }
        match self.eval(body, args, ctx)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(EvaluationFault::mismatch("row-access predicate", "BOOLEAN", &other)),
        }
    }

    // =========================================================================
    // Partial evaluation
    // =========================================================================

    /// Fold every part of `node` that does not depend on arguments.
    ///
    /// The context is fixed for a statement, so this runs once per statement
    /// and per-row evaluation only walks what is left. A sub-tree whose
    /// folding faults is kept, so the fault still surfaces per row.
    pub fn specialize(&self, node: &Node, ctx: &EvaluationContext) -> Node {
        let node = match node {
            Node::Const(_) | Node::Arg(_) => return node.clone(),
            Node::CurrentRole => return Node::Const(Value::String(ctx.primary_role.clone())),
            Node::CurrentUser => return Node::Const(Value::String(ctx.user.clone())),
            Node::RoleInSession(n) => Node::RoleInSession(Box::new(self.specialize(n, ctx))),
            Node::Context(n) => Node::Context(Box::new(self.specialize(n, ctx))),
            Node::Not(n) => Node::Not(Box::new(self.specialize(n, ctx))),
            Node::IsNull { expr, negated } => Node::IsNull {
                expr: Box::new(self.specialize(expr, ctx)),
                negated: *negated,
            },
            Node::Compare(op, l, r) => Node::Compare(
                *op,
                Box::new(self.specialize(l, ctx)),
                Box::new(self.specialize(r, ctx)),
            ),
            Node::InList {
                expr,
                list,
                negated,
            } => Node::InList {
                expr: Box::new(self.specialize(expr, ctx)),
                list: list.iter().map(|n| self.specialize(n, ctx)).collect(),
                negated: *negated,
            },
            Node::And(items) => self.specialize_connective(items, false, ctx, Node::And),
            Node::Or(items) => self.specialize_connective(items, true, ctx, Node::Or),
            Node::Case {
                branches,
                otherwise,
            } => {
                let mut kept = Vec::with_capacity(branches.len());
                let mut fallback = None;
                for (cond, result) in branches {
                    match self.specialize(cond, ctx) {
                        Node::Const(Value::Bool(true)) => {
                            fallback = Some(self.specialize(result, ctx));
                            break;
                        }
                        Node::Const(_) => {}
                        cond => kept.push((cond, self.specialize(result, ctx))),
                    }
                }
                let fallback = fallback.unwrap_or_else(|| self.specialize(otherwise, ctx));
                if kept.is_empty() {
                    return fallback;
                }
                Node::Case {
                    branches: kept,
                    otherwise: Box::new(fallback),
                }
            }
            Node::Call(Function::Coalesce, args) => {
                let mut kept: Vec<Node> = Vec::with_capacity(args.len());
                for arg in args {
                    match self.specialize(arg, ctx) {
                        Node::Const(Value::Null) => {}
                        Node::Const(v) if kept.is_empty() => return Node::Const(v),
                        other => {
                            let done = other.is_const();
                            kept.push(other);
                            if done {
                                break;
                            }
                        }
                    }
                }
                match kept.len() {
                    0 => return Node::Const(Value::Null),
                    1 => return kept.remove(0),
                    _ => Node::Call(Function::Coalesce, kept),
                }
            }
            Node::Call(func, args) => {
                Node::Call(*func, args.iter().map(|n| self.specialize(n, ctx)).collect())
            }
        };

        if node.reads_args() {
            return node;
        }
        match self.eval(&node, &[], ctx) {
            Ok(value) => Node::Const(value),
            Err(_) => node,
        }
    }

    /// Fold the operands of AND (`decisive = false`) or OR (`decisive = true`).
    ///
    /// Operands equal to the identity drop out. A decisive constant ends the
    /// list, but operands before it stay in front of it, since evaluation
    /// runs left to right and they may still fault on a row.
    fn specialize_connective(
        &self,
        items: &[Node],
        decisive: bool,
        ctx: &EvaluationContext,
        rebuild: fn(Vec<Node>) -> Node,
    ) -> Node {
        let mut kept = Vec::with_capacity(items.len());
        for item in items {
            match self.specialize(item, ctx) {
                Node::Const(Value::Bool(b)) if b == decisive => {
                    if kept.is_empty() {
                        return Node::Const(Value::Bool(decisive));
                    }
                    kept.push(Node::Const(Value::Bool(decisive)));
                    return rebuild(kept);
                }
                Node::Const(Value::Bool(_)) => {}
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => Node::Const(Value::Bool(!decisive)),
            _ => rebuild(kept),
        }
    }

    // =========================================================================
    // Interpreter
    // =========================================================================

    /// Evaluate a node with positional arguments.
    pub fn eval(&self, node: &Node, args: &[Value], ctx: &EvaluationContext) -> EvalResult<Value> {
        match node {
            Node::Const(v) => Ok(v.clone()),
            Node::Arg(i) => args.get(*i).cloned().ok_or_else(|| EvaluationFault::TypeMismatch {
                context: format!("argument {}", i + 1),
                expected: "a bound value".to_string(),
                found: "nothing".to_string(),
            }),
            Node::CurrentRole => Ok(Value::String(ctx.primary_role.clone())),
            Node::CurrentUser => Ok(Value::String(ctx.user.clone())),
            Node::RoleInSession(n) => match self.eval(n, args, ctx)? {
                Value::Null => Ok(Value::Null),
                Value::String(role) => Ok(Value::Bool(ctx.is_role_active(&role))),
                other => Err(EvaluationFault::mismatch("is_role_in_session()", "TEXT", &other)),
            },
            Node::Context(n) => match self.eval(n, args, ctx)? {
                Value::Null => Ok(Value::Null),
                Value::String(key) => Ok(ctx.attribute(&key).cloned().unwrap_or(Value::Null)),
                other => Err(EvaluationFault::mismatch("context()", "TEXT", &other)),
            },
            Node::Compare(op, l, r) => {
                let l = self.eval(l, args, ctx)?;
                let r = self.eval(r, args, ctx)?;
                if l.is_null() || r.is_null() {
                    return Ok(Value::Null);
                }
                let ord = compare(&l, &r, op)?;
                let b = match op {
                    CompareOp::Eq => ord == Ordering::Equal,
                    CompareOp::Ne => ord != Ordering::Equal,
                    CompareOp::Lt => ord == Ordering::Less,
                    CompareOp::Le => ord != Ordering::Greater,
                    CompareOp::Gt => ord == Ordering::Greater,
                    CompareOp::Ge => ord != Ordering::Less,
                };
                Ok(Value::Bool(b))
            }
            Node::InList {
                expr,
                list,
                negated,
            } => {
                let subject = self.eval(expr, args, ctx)?;
                if subject.is_null() {
                    return Ok(Value::Null);
                }
                let mut saw_null = false;
                for item in list {
                    let candidate = self.eval(item, args, ctx)?;
                    if candidate.is_null() {
                        saw_null = true;
                        continue;
                    }
                    if compare(&subject, &candidate, "IN")? == Ordering::Equal {
                        return Ok(Value::Bool(!negated));
                    }
                }
                if saw_null {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Bool(*negated))
                }
            }
            Node::IsNull { expr, negated } => {
                let v = self.eval(expr, args, ctx)?;
                Ok(Value::Bool(v.is_null() != *negated))
            }
            Node::And(items) => {
                let mut saw_null = false;
                for item in items {
                    match self.eval(item, args, ctx)? {
                        Value::Bool(false) => return Ok(Value::Bool(false)),
                        Value::Bool(true) => {}
                        Value::Null => saw_null = true,
                        other => return Err(EvaluationFault::mismatch("AND", "BOOLEAN", &other)),
                    }
                }
                Ok(if saw_null { Value::Null } else { Value::Bool(true) })
            }
            Node::Or(items) => {
                let mut saw_null = false;
                for item in items {
                    match self.eval(item, args, ctx)? {
                        Value::Bool(true) => return Ok(Value::Bool(true)),
                        Value::Bool(false) => {}
                        Value::Null => saw_null = true,
                        other => return Err(EvaluationFault::mismatch("OR", "BOOLEAN", &other)),
                    }
                }
                Ok(if saw_null { Value::Null } else { Value::Bool(false) })
            }
            Node::Not(n) => match self.eval(n, args, ctx)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                Value::Null => Ok(Value::Null),
                other => Err(EvaluationFault::mismatch("NOT", "BOOLEAN", &other)),
            },
            Node::Case {
                branches,
                otherwise,
            } => {
                for (cond, result) in branches {
                    if let Value::Bool(true) = self.eval(cond, args, ctx)? {
                        return self.eval(result, args, ctx);
                    }
                }
                self.eval(otherwise, args, ctx)
            }
            Node::Call(Function::Coalesce, items) => {
                for item in items {
                    let v = self.eval(item, args, ctx)?;
                    if !v.is_null() {
                        return Ok(v);
                    }
                }
                Ok(Value::Null)
            }
            Node::Call(func, items) => {
                let values = items
                    .iter()
                    .map(|n| self.eval(n, args, ctx))
                    .collect::<EvalResult<Vec<_>>>()?;
                if values.iter().any(Value::is_null) {
                    return Ok(Value::Null);
                }
                self.call(*func, &values)
            }
        }
    }

    fn call(&self, func: Function, args: &[Value]) -> EvalResult<Value> {
        let out = match func {
            Function::Concat => {
                let parts: Vec<String> = args.iter().map(Value::to_string).collect();
                self.check_len(func, parts.iter().map(String::len).sum())?;
                parts.concat()
            }
            Function::SplitPart => {
                let text = text_arg(func, &args[0])?;
                let delim = text_arg(func, &args[1])?;
                let n = int_arg(func, &args[2])?;
                split_part(text, delim, n)
            }
            Function::Substr => {
                let text = text_arg(func, &args[0])?;
                let start = int_arg(func, &args[1])?;
                let len = args.get(2).map(|v| int_arg(func, v)).transpose()?;
                substr(text, start, len)
            }
            Function::Left | Function::Right => {
                let text = text_arg(func, &args[0])?;
                let n = count_arg(func, &args[1])?;
                let total = text.chars().count();
                if func == Function::Left {
                    text.chars().take(n).collect()
                } else {
                    text.chars().skip(total.saturating_sub(n)).collect()
                }
            }
            Function::Length => {
                let text = text_arg(func, &args[0])?;
                return Ok(Value::Int(text.chars().count() as i64));
            }
            Function::Upper => text_arg(func, &args[0])?.to_uppercase(),
            Function::Lower => text_arg(func, &args[0])?.to_lowercase(),
            Function::Replace => {
                let text = text_arg(func, &args[0])?;
                let from = text_arg(func, &args[1])?;
                let to = text_arg(func, &args[2])?;
                if from.is_empty() {
                    text.to_string()
                } else {
                    let hits = text.matches(from).count();
                    let kept = text.len() - hits * from.len();
                    let len = kept.saturating_add(hits.saturating_mul(to.len()));
                    self.check_len(func, len)?;
                    text.replace(from, to)
                }
            }
            Function::Repeat => {
                let text = text_arg(func, &args[0])?;
                let n = count_arg(func, &args[1])?;
                self.check_len(func, text.len().saturating_mul(n))?;
                text.repeat(n)
            }
            Function::Partial => {
                let text = text_arg(func, &args[0])?;
                let keep_first = count_arg(func, &args[1])?;
                let mask = text_arg(func, &args[2])?;
                let keep_last = count_arg(func, &args[3])?;
                self.check_len(func, text.chars().count().saturating_mul(mask.len().max(1)))?;
                partial(text, keep_first, mask, keep_last)
            }
            Function::Hash => return Ok(Value::String(hash_value(&args[0]))),
            Function::CurrentRole
            | Function::CurrentUser
            | Function::IsRoleInSession
            | Function::Context
            | Function::Coalesce => {
                return Err(EvaluationFault::invalid(func, "not a scalar function"));
            }
        };
        self.check_len(func, out.len())?;
        Ok(Value::String(out))
    }

    fn check_len(&self, func: Function, len: usize) -> EvalResult<()> {
        if len > self.max_string_len {
            return Err(EvaluationFault::invalid(
                func,
                format!("result of {} bytes exceeds the limit of {}", len, self.max_string_len),
            ));
        }
        Ok(())
    }
}

fn compare(l: &Value, r: &Value, what: impl std::fmt::Display) -> EvalResult<Ordering> {
    l.compare(r).ok_or_else(|| EvaluationFault::TypeMismatch {
        context: format!("'{}'", what),
        expected: l
            .data_type()
            .map_or_else(|| "NULL".to_string(), |t| t.to_string()),
        found: r
            .data_type()
            .map_or_else(|| "NULL".to_string(), |t| t.to_string()),
    })
}

fn text_arg(func: Function, v: &Value) -> EvalResult<&str> {
    v.as_str()
        .ok_or_else(|| EvaluationFault::mismatch(format!("{}()", func), "TEXT", v))
}

fn int_arg(func: Function, v: &Value) -> EvalResult<i64> {
    match v {
        Value::Int(i) => Ok(*i),
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(*f as i64),
        Value::Float(f) => Err(EvaluationFault::invalid(
            func,
            format!("expected an integer, got {}", f),
        )),
        other => Err(EvaluationFault::mismatch(format!("{}()", func), "NUMBER", other)),
    }
}

fn count_arg(func: Function, v: &Value) -> EvalResult<usize> {
    let n = int_arg(func, v)?;
    usize::try_from(n).map_err(|_| {
        EvaluationFault::invalid(func, format!("count must not be negative, got {}", n))
    })
}

/// 1-based field of `text` split on `delim`. Negative `n` counts from the
/// end, 0 behaves as 1, and an out-of-range field is empty.
fn split_part(text: &str, delim: &str, n: i64) -> String {
    let parts: Vec<&str> = if delim.is_empty() {
        vec![text]
    } else {
        text.split(delim).collect()
    };
    let len = parts.len() as i64;
    let index = match n {
        0 => 0,
        n if n > 0 => n - 1,
        n => len.saturating_add(n),
    };
    if (0..len).contains(&index) {
        parts[index as usize].to_string()
    } else {
        String::new()
    }
}

/// 1-based substring by characters. A negative start counts from the end.
fn substr(text: &str, start: i64, len: Option<i64>) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len() as i64;
    let begin = match start {
        0 => 0,
        s if s > 0 => s - 1,
        s => total.saturating_add(s).max(0),
    };
    if begin >= total {
        return String::new();
    }
    let end = match len {
        Some(l) if l <= 0 => return String::new(),
        Some(l) => begin.saturating_add(l).min(total),
        None => total,
    };
    chars[begin as usize..end as usize].iter().collect()
}

/// Keep the first and last characters and mask the middle. Strings too
/// short to keep anything are masked entirely.
fn partial(text: &str, keep_first: usize, mask: &str, keep_last: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total <= keep_first.saturating_add(keep_last) {
        return mask.repeat(total);
    }
    let mut out: String = chars[..keep_first].iter().collect();
    out.push_str(&mask.repeat(total - keep_first - keep_last));
    out.extend(&chars[total - keep_last..]);
    out
}

fn hash_value(value: &Value) -> String {
    let hash = match value {
        Value::String(s) => blake3::hash(s.as_bytes()),
        Value::Int(i) => blake3::hash(&i.to_le_bytes()),
        Value::Float(f) => blake3::hash(&f.to_bits().to_le_bytes()),
        Value::Bool(b) => blake3::hash(&[*b as u8]),
        Value::Timestamp(t) => blake3::hash(&t.to_le_bytes()),
        Value::Null => blake3::hash(&[]),
    };
    format!("hash:{}", hash.to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::compile::PolicyCompiler;
    use crate::policy::definition::{MaskingPolicyDef, RowAccessPolicyDef};
    use crate::policy::expr::Expr;

    fn ctx(role: &str) -> EvaluationContext {
        EvaluationContext::for_roles("alice", role, Vec::<String>::new())
    }

    fn compile_mask(ty: DataType, body: Expr) -> CompiledMaskingPolicy {
        let def = MaskingPolicyDef::new("m", "val", ty, body);
        PolicyCompiler::default().compile_masking(&def).unwrap()
    }

    fn salary_mask() -> CompiledMaskingPolicy {
        compile_mask(
            DataType::Number,
            Expr::case(
                Expr::in_list(
                    Expr::current_role(),
                    vec![Expr::lit("HR_ADMIN"), Expr::lit("ACCOUNTANT")],
                ),
                Expr::arg("val"),
                Expr::null(),
            ),
        )
    }

    fn email_mask() -> CompiledMaskingPolicy {
        compile_mask(
            DataType::Text,
            Expr::case(
                Expr::role_in_session("ADMIN"),
                Expr::arg("val"),
                Expr::call(
                    Function::Concat,
                    vec![
                        Expr::lit("***@"),
                        Expr::call(
                            Function::SplitPart,
                            vec![Expr::arg("val"), Expr::lit("@"), Expr::lit(2i64)],
                        ),
                    ],
                ),
            ),
        )
    }

    #[test]
    fn test_salary_mask_by_role() {
        let eval = PolicyEvaluator::new();
        let policy = salary_mask();
        let v = Value::Int(90000);
        assert_eq!(eval.evaluate_mask(&policy, &v, &ctx("ANALYST")), Value::Null);
        assert_eq!(eval.evaluate_mask(&policy, &v, &ctx("HR_ADMIN")), v);
        assert_eq!(eval.evaluate_mask(&policy, &v, &ctx("ACCOUNTANT")), v);
    }

    #[test]
    fn test_email_mask() {
        let eval = PolicyEvaluator::new();
        let policy = email_mask();
        let v = Value::from("alice@snowflake.com");
        assert_eq!(
            eval.evaluate_mask(&policy, &v, &ctx("ANALYST")),
            Value::from("***@snowflake.com")
        );
        let admin = EvaluationContext::for_roles("bob", "SYSADMIN", ["ADMIN"]);
        assert_eq!(eval.evaluate_mask(&policy, &v, &admin), v);
        assert_eq!(eval.evaluate_mask(&policy, &Value::Null, &ctx("ANALYST")), Value::Null);
    }

    #[test]
    fn test_type_mismatch_is_contained() {
        let eval = PolicyEvaluator::new();
        let policy = email_mask();
        let err = eval
            .try_evaluate_mask(&policy, &Value::Int(3), &ctx("ANALYST"))
            .unwrap_err();
        assert!(matches!(err, EvaluationFault::TypeMismatch { .. }));
        assert_eq!(eval.evaluate_mask(&policy, &Value::Int(3), &ctx("ANALYST")), Value::Null);
    }

    #[test]
    fn test_three_valued_logic() {
        let eval = PolicyEvaluator::new();
        let c = ctx("R");
        let null = Node::Const(Value::Null);
        let t = Node::Const(Value::Bool(true));
        let f = Node::Const(Value::Bool(false));

        let and = Node::And(vec![null.clone(), f.clone()]);
        assert_eq!(eval.eval(&and, &[], &c).unwrap(), Value::Bool(false));
        let and = Node::And(vec![null.clone(), t.clone()]);
        assert_eq!(eval.eval(&and, &[], &c).unwrap(), Value::Null);
        let or = Node::Or(vec![null.clone(), t.clone()]);
        assert_eq!(eval.eval(&or, &[], &c).unwrap(), Value::Bool(true));
        let or = Node::Or(vec![null.clone(), f]);
        assert_eq!(eval.eval(&or, &[], &c).unwrap(), Value::Null);
        let not = Node::Not(Box::new(null.clone()));
        assert_eq!(eval.eval(&not, &[], &c).unwrap(), Value::Null);

        let in_list = Node::InList {
            expr: Box::new(Node::Const(Value::Int(1))),
            list: vec![Node::Const(Value::Int(2)), null],
            negated: false,
        };
        assert_eq!(eval.eval(&in_list, &[], &c).unwrap(), Value::Null);
    }

    #[test]
    fn test_row_predicate_null_excludes() {
        let eval = PolicyEvaluator::new();
        let def = RowAccessPolicyDef::new(
            "eu_only",
            Expr::equals(Expr::arg("region"), Expr::lit("EU")),
        )
        .with_param("region", DataType::Text);
        let policy = PolicyCompiler::default().compile_row_access(&def).unwrap();
        let c = ctx("R");
        assert!(eval.evaluate_row(&policy, &[Value::from("EU")], &c));
        assert!(!eval.evaluate_row(&policy, &[Value::from("US")], &c));
        assert!(!eval.evaluate_row(&policy, &[Value::Null], &c));
        assert!(eval.try_evaluate_row(&policy, &[Value::Int(1)], &c).is_err());
        assert!(!eval.evaluate_row(&policy, &[Value::Int(1)], &c));
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(split_part("a@b@c", "@", 2), "b");
        assert_eq!(split_part("a@b@c", "@", -1), "c");
        assert_eq!(split_part("a@b@c", "@", 0), "a");
        assert_eq!(split_part("a@b@c", "@", 9), "");
        assert_eq!(split_part("abc", "", 1), "abc");

        assert_eq!(substr("snowflake", 5, None), "flake");
        assert_eq!(substr("snowflake", 1, Some(4)), "snow");
        assert_eq!(substr("snowflake", -5, Some(2)), "fl");
        assert_eq!(substr("snow", 10, None), "");
        assert_eq!(substr("snow", 1, Some(-1)), "");
        assert_eq!(substr("alice", 2, Some(i64::MAX)), "lice");
        assert_eq!(substr("alice", i64::MIN, Some(2)), "al");
        assert_eq!(substr("alice", i64::MAX, Some(i64::MAX)), "");
        assert_eq!(split_part("a@b", "@", i64::MIN), "");
        assert_eq!(split_part("a@b", "@", i64::MAX), "");

        assert_eq!(partial("4111111111111111", 0, "*", 4), "************1111");
        assert_eq!(partial("ab", 1, "X", 1), "XX");
        assert_eq!(partial("héllo", 1, "*", 1), "h***o");
    }

    #[test]
    fn test_function_faults() {
        let eval = PolicyEvaluator::new().with_max_string_len(10);
        let c = ctx("R");
        let left = Node::Call(
            Function::Left,
            vec![Node::Const("abc".into()), Node::Const(Value::Int(-1))],
        );
        assert!(matches!(
            eval.eval(&left, &[], &c),
            Err(EvaluationFault::InvalidArgument { .. })
        ));
        let repeat = Node::Call(
            Function::Repeat,
            vec![Node::Const("abc".into()), Node::Const(Value::Int(5))],
        );
        assert!(eval.eval(&repeat, &[], &c).is_err());
        let upper_null = Node::Call(Function::Upper, vec![Node::Const(Value::Null)]);
        assert_eq!(eval.eval(&upper_null, &[], &c).unwrap(), Value::Null);
    }

    #[test]
    fn test_every_string_result_is_capped() {
        let eval = PolicyEvaluator::new().with_max_string_len(10);
        let c = ctx("R");
        let text = |s: &str| Node::Const(s.into());

        let replace = Node::Call(
            Function::Replace,
            vec![text("aaaaaaaaaa"), text("a"), text("bbbbbbbbbb")],
        );
        assert!(matches!(
            eval.eval(&replace, &[], &c),
            Err(EvaluationFault::InvalidArgument { .. })
        ));
        let concat = Node::Call(Function::Concat, vec![text("abcdef"), text("ghijkl")]);
        assert!(eval.eval(&concat, &[], &c).is_err());
        let upper = Node::Call(Function::Upper, vec![text("abcdefghijk")]);
        assert!(eval.eval(&upper, &[], &c).is_err());

        let short = Node::Call(Function::Replace, vec![text("abc"), text("b"), text("xy")]);
        assert_eq!(eval.eval(&short, &[], &c).unwrap(), Value::from("axyc"));
        let hash = Node::Call(Function::Hash, vec![text("x")]);
        assert!(eval.eval(&hash, &[], &c).is_ok());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let eval = PolicyEvaluator::new();
        let c = ctx("R");
        let node = Node::Call(Function::Hash, vec![Node::Arg(0)]);
        let a = eval.eval(&node, &[Value::from("secret")], &c).unwrap();
        let b = eval.eval(&node, &[Value::from("secret")], &c).unwrap();
        assert_eq!(a, b);
        assert!(a.as_str().unwrap().starts_with("hash:"));
        assert_eq!(eval.eval(&node, &[Value::Null], &c).unwrap(), Value::Null);
    }

    #[test]
    fn test_specialize_folds_role_checks() {
        let eval = PolicyEvaluator::new();
        let policy = salary_mask();
        assert_eq!(eval.specialize(&policy.body, &ctx("HR_ADMIN")), Node::Arg(0));
        assert_eq!(
            eval.specialize(&policy.body, &ctx("ANALYST")),
            Node::Const(Value::Null)
        );
    }

    #[test]
    fn test_specialize_keeps_row_dependent_parts() {
        let eval = PolicyEvaluator::new();
        let policy = email_mask();
        let residual = eval.specialize(&policy.body, &ctx("ANALYST"));
        assert!(residual.reads_args());
        assert!(!matches!(residual, Node::Case { .. }));

        let c = ctx("ANALYST");
        let v = Value::from("carol@example.org");
        assert_eq!(
            eval.mask_with(&residual, DataType::Text, DataType::Text, &v, &c)
                .unwrap(),
            eval.try_evaluate_mask(&policy, &v, &c).unwrap()
        );
    }

    #[test]
    fn test_specialize_keeps_faulting_subtree() {
        let eval = PolicyEvaluator::new();
        let node = Node::Call(
            Function::Left,
            vec![Node::Const("abc".into()), Node::Const(Value::Int(-1))],
        );
        assert_eq!(eval.specialize(&node, &ctx("R")), node);
    }

    #[test]
    fn test_specialize_keeps_operands_before_decisive_constant() {
        let eval = PolicyEvaluator::new();
        let c = ctx("ANALYST");
        let faulting = Node::Compare(
            CompareOp::Eq,
            Box::new(Node::Call(
                Function::Left,
                vec![Node::Arg(0), Node::Const(Value::Int(-1))],
            )),
            Box::new(Node::Const("x".into())),
        );
        let not_in_session = Node::RoleInSession(Box::new(Node::Const("NOPE".into())));
        let body = Node::Case {
            branches: vec![(
                Node::And(vec![faulting.clone(), not_in_session.clone()]),
                Node::Const(Value::Null),
            )],
            otherwise: Box::new(Node::Arg(0)),
        };

        let residual = eval.specialize(&body, &c);
        let v = Value::from("secret");
        let direct = eval.mask_with(&body, DataType::Text, DataType::Text, &v, &c);
        let folded = eval.mask_with(&residual, DataType::Text, DataType::Text, &v, &c);
        assert!(direct.is_err());
        assert_eq!(folded, direct);

        let or = Node::Or(vec![faulting, Node::Const(Value::Bool(true))]);
        let residual = eval.specialize(&or, &c);
        assert_eq!(eval.eval(&residual, &[v.clone()], &c), eval.eval(&or, &[v], &c));

        let leading = Node::And(vec![not_in_session, Node::Arg(0)]);
        assert_eq!(eval.specialize(&leading, &c), Node::Const(Value::Bool(false)));
    }

    #[test]
    fn test_specialize_context_attribute() {
        let eval = PolicyEvaluator::new();
        let c = ctx("R").with_attribute("region", "EU");
        let node = Node::Compare(
            CompareOp::Eq,
            Box::new(Node::Arg(0)),
            Box::new(Node::Context(Box::new(Node::Const("region".into())))),
        );
        assert_eq!(
            eval.specialize(&node, &c),
            Node::Compare(
                CompareOp::Eq,
                Box::new(Node::Arg(0)),
                Box::new(Node::Const("EU".into()))
            )
        );
    }
}
