//! Type-checking compiler from [`Expr`] to executable [`Node`] trees.
//!
//! Every check that can fail happens here, at create time. A body that
//! compiles can only fail at evaluation time if stored data does not match
//! its declared column type, or a function receives an out-of-range
//! argument computed from row content.

use super::definition::{MaskingPolicyDef, RowAccessPolicyDef};
use super::expr::{CompareOp, Expr, Function};
use crate::error::{Error, Result};
use crate::value::{DataType, Value};
use std::collections::HashSet;

/// Executable policy body.
///
/// Arguments are resolved to positions and context reads have their own
/// variants so [`crate::eval::PolicyEvaluator::specialize`] can fold them.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Constant.
    Const(Value),
    /// Positional argument.
    Arg(usize),
    /// Primary role of the session.
    CurrentRole,
    /// Session user.
    CurrentUser,
    /// Membership of a role in the active role set.
    RoleInSession(Box<Node>),
    /// Session attribute lookup.
    Context(Box<Node>),
    /// Context-free built-in.
    Call(Function, Vec<Node>),
    /// Comparison.
    Compare(CompareOp, Box<Node>, Box<Node>),
    /// List membership.
    InList {
        /// Tested value.
        expr: Box<Node>,
        /// Candidates.
        list: Vec<Node>,
        /// `NOT IN`.
        negated: bool,
    },
    /// Null test.
    IsNull {
        /// Operand.
        expr: Box<Node>,
        /// `IS NOT NULL`.
        negated: bool,
    },
    /// Conjunction.
    And(Vec<Node>),
    /// Disjunction.
    Or(Vec<Node>),
    /// Negation.
    Not(Box<Node>),
    /// Searched case with a mandatory fallback.
    Case {
        /// `(condition, result)` pairs.
        branches: Vec<(Node, Node)>,
        /// Fallback result.
        otherwise: Box<Node>,
    },
}

impl Node {
    /// Whether this node is a constant.
    pub fn is_const(&self) -> bool {
        matches!(self, Node::Const(_))
    }

    /// Whether evaluating this node reads an argument.
    pub fn reads_args(&self) -> bool {
        match self {
            Node::Arg(_) => true,
            Node::Const(_) | Node::CurrentRole | Node::CurrentUser => false,
            Node::RoleInSession(n) | Node::Context(n) | Node::Not(n) => n.reads_args(),
            Node::IsNull { expr, .. } => expr.reads_args(),
            Node::Call(_, args) | Node::And(args) | Node::Or(args) => {
                args.iter().any(Node::reads_args)
            }
            Node::Compare(_, l, r) => l.reads_args() || r.reads_args(),
            Node::InList { expr, list, .. } => {
                expr.reads_args() || list.iter().any(Node::reads_args)
            }
            Node::Case {
                branches,
                otherwise,
            } => {
                otherwise.reads_args()
                    || branches
                        .iter()
                        .any(|(c, r)| c.reads_args() || r.reads_args())
            }
        }
    }
}

/// A masking policy version that passed compilation.
#[derive(Debug, Clone)]
pub struct CompiledMaskingPolicy {
    /// Definition as submitted.
    pub def: MaskingPolicyDef,
    /// Version number, assigned by the store (1 for the first create).
    pub version: u64,
    /// Executable body.
    pub body: Node,
}

impl CompiledMaskingPolicy {
    /// Policy name.
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Declared input type.
    pub fn input_type(&self) -> DataType {
        self.def.input_type
    }

    /// Declared output type.
    pub fn output_type(&self) -> DataType {
        self.def.output_type
    }
}

/// A row-access policy version that passed compilation.
#[derive(Debug, Clone)]
pub struct CompiledRowAccessPolicy {
    /// Definition as submitted.
    pub def: RowAccessPolicyDef,
    /// Version number, assigned by the store.
    pub version: u64,
    /// Executable predicate.
    pub body: Node,
}

impl CompiledRowAccessPolicy {
    /// Policy name.
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Declared parameter types, in binding order.
    pub fn param_types(&self) -> Vec<DataType> {
        self.def.params.iter().map(|(_, ty)| *ty).collect()
    }
}

/// Static type of a sub-expression. `None` is the type of NULL and of
/// session attributes, which unify with anything.
type Ty = Option<DataType>;

/// Policy body compiler.
#[derive(Debug, Clone, Copy)]
pub struct PolicyCompiler {
    max_depth: usize,
}

impl PolicyCompiler {
    /// Create a compiler that rejects bodies nested deeper than `max_depth`.
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Deepest nesting accepted.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Compile a masking policy.
    pub fn compile_masking(&self, def: &MaskingPolicyDef) -> Result<CompiledMaskingPolicy> {
        validate_name(&def.name, &def.name, "policy")?;
        validate_name(&def.name, &def.arg_name, "argument")?;

        let params = [(def.arg_name.clone(), def.input_type)];
        let checker = Checker::new(&def.name, &params, self.max_depth);
        let (body, ty) = checker.check_root(&def.body)?;

        if let Some(ty) = ty {
            if ty != def.output_type {
                return Err(checker.err(format!(
                    "body returns {} but the policy is declared to return {}",
                    ty, def.output_type
                )));
            }
        }
        if def.input_type == DataType::Number && !lossless(&body) {
            return Err(checker.err(
                "numeric masks may only return the input value or NULL".to_string(),
            ));
        }

        Ok(CompiledMaskingPolicy {
            def: def.clone(),
            version: 0,
            body,
        })
    }

    /// Compile a row-access policy.
    pub fn compile_row_access(
        &self,
        def: &RowAccessPolicyDef,
    ) -> Result<CompiledRowAccessPolicy> {
        validate_name(&def.name, &def.name, "policy")?;
        let mut seen = HashSet::new();
        for (name, _) in &def.params {
            validate_name(&def.name, name, "parameter")?;
            if !seen.insert(name.as_str()) {
                return Err(Error::compile(
                    &def.name,
                    format!("duplicate parameter '{}'", name),
                ));
            }
        }

        let checker = Checker::new(&def.name, &def.params, self.max_depth);
        let (body, ty) = checker.check_root(&def.body)?;
        checker.expect(ty, DataType::Boolean, "row-access predicate")?;

        Ok(CompiledRowAccessPolicy {
            def: def.clone(),
            version: 0,
            body,
        })
    }
}

impl Default for PolicyCompiler {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_EXPRESSION_DEPTH)
    }
}

fn validate_name(policy: &str, name: &str, what: &str) -> Result<()> {
    if name.trim().is_empty() {
        Err(Error::compile(policy, format!("{} name must not be empty", what)))
    } else {
        Ok(())
    }
}

/// Every value a mask over a NUMBER column can produce is either the input
/// or NULL.
fn lossless(node: &Node) -> bool {
    match node {
        Node::Arg(0) | Node::Const(Value::Null) => true,
        Node::Case {
            branches,
            otherwise,
        } => branches.iter().all(|(_, r)| lossless(r)) && lossless(otherwise),
        Node::Call(Function::Coalesce, args) => args.iter().all(lossless),
        _ => false,
    }
}

struct Checker<'a> {
    policy: &'a str,
    params: &'a [(String, DataType)],
    max_depth: usize,
}

impl<'a> Checker<'a> {
    fn new(policy: &'a str, params: &'a [(String, DataType)], max_depth: usize) -> Self {
        Self {
            policy,
            params,
            max_depth,
        }
    }

    fn err(&self, reason: String) -> Error {
        Error::compile(self.policy, reason)
    }

    fn expect(&self, ty: Ty, want: DataType, what: &str) -> Result<()> {
        match ty {
            Some(found) if found != want => Err(self.err(format!(
                "{} must be {}, found {}",
                what, want, found
            ))),
            _ => Ok(()),
        }
    }

    fn unify(&self, a: Ty, b: Ty, what: &str) -> Result<Ty> {
        match (a, b) {
            (None, t) | (t, None) => Ok(t),
            (Some(x), Some(y)) if x == y => Ok(Some(x)),
            (Some(x), Some(y)) => Err(self.err(format!(
                "{} have incompatible types {} and {}",
                what, x, y
            ))),
        }
    }

    fn check_root(&self, expr: &Expr) -> Result<(Node, Ty)> {
        let depth = expr.depth();
        if depth > self.max_depth {
            return Err(self.err(format!(
                "expression nesting depth {} exceeds the limit of {}",
                depth, self.max_depth
            )));
        }
        self.check(expr)
    }

    fn check(&self, expr: &Expr) -> Result<(Node, Ty)> {
        match expr {
            Expr::Literal(v) => Ok((Node::Const(v.clone()), v.data_type())),
            Expr::Arg(name) => {
                let index = self
                    .params
                    .iter()
                    .position(|(p, _)| p == name)
                    .ok_or_else(|| self.err(format!("unknown argument '{}'", name)))?;
                Ok((Node::Arg(index), Some(self.params[index].1)))
            }
            Expr::Call { func, args } => self.check_call(*func, args),
            Expr::Compare { op, left, right } => {
                let (l, lt) = self.check(left)?;
                let (r, rt) = self.check(right)?;
                self.unify(lt, rt, &format!("operands of '{}'", op))?;
                Ok((
                    Node::Compare(*op, Box::new(l), Box::new(r)),
                    Some(DataType::Boolean),
                ))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                if list.is_empty() {
                    return Err(self.err("IN list must not be empty".to_string()));
                }
                let (subject, mut ty) = self.check(expr)?;
                let mut nodes = Vec::with_capacity(list.len());
                for item in list {
                    let (node, item_ty) = self.check(item)?;
                    ty = self.unify(ty, item_ty, "IN list elements")?;
                    nodes.push(node);
                }
                Ok((
                    Node::InList {
                        expr: Box::new(subject),
                        list: nodes,
                        negated: *negated,
                    },
                    Some(DataType::Boolean),
                ))
            }
            Expr::IsNull { expr, negated } => {
                let (node, _) = self.check(expr)?;
                Ok((
                    Node::IsNull {
                        expr: Box::new(node),
                        negated: *negated,
                    },
                    Some(DataType::Boolean),
                ))
            }
            Expr::And(items) | Expr::Or(items) => {
                if items.is_empty() {
                    return Err(self.err("empty boolean connective".to_string()));
                }
                let mut nodes = Vec::with_capacity(items.len());
                for item in items {
                    let (node, ty) = self.check(item)?;
                    self.expect(ty, DataType::Boolean, "boolean operand")?;
                    nodes.push(node);
                }
                let node = if matches!(expr, Expr::And(_)) {
                    Node::And(nodes)
                } else {
                    Node::Or(nodes)
                };
                Ok((node, Some(DataType::Boolean)))
            }
            Expr::Not(inner) => {
                let (node, ty) = self.check(inner)?;
                self.expect(ty, DataType::Boolean, "NOT operand")?;
                Ok((Node::Not(Box::new(node)), Some(DataType::Boolean)))
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                if branches.is_empty() {
                    return Err(self.err("CASE needs at least one WHEN branch".to_string()));
                }
                let mut ty: Ty = None;
                let mut nodes = Vec::with_capacity(branches.len());
                for (cond, result) in branches {
                    let (c, ct) = self.check(cond)?;
                    self.expect(ct, DataType::Boolean, "WHEN condition")?;
                    let (r, rt) = self.check(result)?;
                    ty = self.unify(ty, rt, "CASE results")?;
                    nodes.push((c, r));
                }
                let fallback = match otherwise {
                    Some(e) => {
                        let (n, t) = self.check(e)?;
                        ty = self.unify(ty, t, "CASE results")?;
                        n
                    }
                    None => Node::Const(Value::Null),
                };
                Ok((
                    Node::Case {
                        branches: nodes,
                        otherwise: Box::new(fallback),
                    },
                    ty,
                ))
            }
        }
    }

    fn arity(&self, func: Function, got: usize, min: usize, max: usize) -> Result<()> {
        if got < min || got > max {
            let expected = if min == max {
                format!("{}", min)
            } else if max == usize::MAX {
                format!("at least {}", min)
            } else {
                format!("{} to {}", min, max)
            };
            return Err(self.err(format!(
                "{}() takes {} argument(s), got {}",
                func, expected, got
            )));
        }
        Ok(())
    }

    /// Check arguments against a fixed list of expected types.
    fn typed_args(&self, func: Function, args: &[Expr], types: &[DataType]) -> Result<Vec<Node>> {
        args.iter()
            .zip(types)
            .enumerate()
            .map(|(i, (arg, want))| {
                let (node, ty) = self.check(arg)?;
                self.expect(ty, *want, &format!("argument {} of {}()", i + 1, func))?;
                Ok(node)
            })
            .collect()
    }

    fn check_call(&self, func: Function, args: &[Expr]) -> Result<(Node, Ty)> {
        use DataType::{Number, Text};

        let n = args.len();
        match func {
            Function::CurrentRole => {
                self.arity(func, n, 0, 0)?;
                Ok((Node::CurrentRole, Some(Text)))
            }
            Function::CurrentUser => {
                self.arity(func, n, 0, 0)?;
                Ok((Node::CurrentUser, Some(Text)))
            }
            Function::IsRoleInSession => {
                self.arity(func, n, 1, 1)?;
                let mut nodes = self.typed_args(func, args, &[Text])?;
                Ok((
                    Node::RoleInSession(Box::new(nodes.remove(0))),
                    Some(DataType::Boolean),
                ))
            }
            Function::Context => {
                self.arity(func, n, 1, 1)?;
                let mut nodes = self.typed_args(func, args, &[Text])?;
                Ok((Node::Context(Box::new(nodes.remove(0))), None))
            }
            Function::Concat | Function::Hash => {
                let max = if func == Function::Hash { 1 } else { usize::MAX };
                self.arity(func, n, 1, max)?;
                let nodes = args
                    .iter()
                    .map(|a| self.check(a).map(|(node, _)| node))
                    .collect::<Result<Vec<_>>>()?;
                Ok((Node::Call(func, nodes), Some(Text)))
            }
            Function::Coalesce => {
                self.arity(func, n, 1, usize::MAX)?;
                let mut ty: Ty = None;
                let mut nodes = Vec::with_capacity(n);
                for arg in args {
                    let (node, t) = self.check(arg)?;
                    ty = self.unify(ty, t, "coalesce() arguments")?;
                    nodes.push(node);
                }
                Ok((Node::Call(func, nodes), ty))
            }
            Function::Length => {
                self.arity(func, n, 1, 1)?;
                let nodes = self.typed_args(func, args, &[Text])?;
                Ok((Node::Call(func, nodes), Some(Number)))
            }
            _ => {
                let (min, signature): (usize, &[DataType]) = match func {
                    Function::SplitPart => (3, &[Text, Text, Number]),
                    Function::Substr => (2, &[Text, Number, Number]),
                    Function::Left | Function::Right | Function::Repeat => (2, &[Text, Number]),
                    Function::Upper | Function::Lower => (1, &[Text]),
                    Function::Replace => (3, &[Text, Text, Text]),
                    Function::Partial => (4, &[Text, Number, Text, Number]),
                    _ => unreachable!("handled above"),
                };
                self.arity(func, n, min, signature.len())?;
                let nodes = self.typed_args(func, args, signature)?;
                Ok((Node::Call(func, nodes), Some(Text)))
            }
        }
    }
}
