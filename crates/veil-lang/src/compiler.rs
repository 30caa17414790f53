//! Lowering from the syntax tree to [`veil_core::Expr`].
//!
//! Only name resolution happens here. Arity and type checks belong to the
//! policy compiler in `veil-core`, which sees the declared signature.

use crate::ast::{Expr, ExprKind, Literal};
use crate::error::CompileError;
use veil_core::{Expr as PolicyExpr, Function, Value};

/// Lowers a parsed body against the names of the policy's arguments.
pub struct Compiler<'a> {
    params: &'a [&'a str],
}

impl<'a> Compiler<'a> {
    /// Create a compiler for a body whose arguments are `params`.
    pub fn new(params: &'a [&'a str]) -> Self {
        Self { params }
    }

    /// Lower one expression.
    pub fn compile(&self, expr: &Expr) -> Result<PolicyExpr, CompileError> {
        Ok(match &expr.kind {
            ExprKind::Literal(lit) => PolicyExpr::Literal(literal_value(lit)),
            ExprKind::Ident(name) => self.resolve_ident(name, expr)?,
            ExprKind::Call { name, args } => {
                let func = Function::from_name(&name.value)
                    .ok_or_else(|| CompileError::unknown_function(&name.value, name.span))?;
                PolicyExpr::call(func, self.compile_all(args)?)
            }
            ExprKind::Compare { op, left, right } => {
                PolicyExpr::compare(*op, self.compile(left)?, self.compile(right)?)
            }
            ExprKind::Concat(parts) => PolicyExpr::call(Function::Concat, self.compile_all(parts)?),
            ExprKind::InList {
                expr: subject,
                list,
                negated,
            } => PolicyExpr::InList {
                expr: Box::new(self.compile(subject)?),
                list: self.compile_all(list)?,
                negated: *negated,
            },
            ExprKind::IsNull {
                expr: operand,
                negated,
            } => PolicyExpr::IsNull {
                expr: Box::new(self.compile(operand)?),
                negated: *negated,
            },
            ExprKind::And(items) => PolicyExpr::And(self.compile_all(items)?),
            ExprKind::Or(items) => PolicyExpr::Or(self.compile_all(items)?),
            ExprKind::Not(inner) => PolicyExpr::Not(Box::new(self.compile(inner)?)),
            ExprKind::Case {
                branches,
                otherwise,
            } => {
                let branches = branches
                    .iter()
                    .map(|(c, r)| Ok((self.compile(c)?, self.compile(r)?)))
                    .collect::<Result<Vec<_>, CompileError>>()?;
                let otherwise = match otherwise {
                    Some(e) => Some(Box::new(self.compile(e)?)),
                    None => None,
                };
                PolicyExpr::Case {
                    branches,
                    otherwise,
                }
            }
        })
    }

    fn compile_all(&self, exprs: &[Expr]) -> Result<Vec<PolicyExpr>, CompileError> {
        exprs.iter().map(|e| self.compile(e)).collect()
    }

    /// Arguments match case-insensitively and resolve to the declared
    /// spelling. `current_role` and `current_user` may omit their parens.
    fn resolve_ident(&self, name: &str, expr: &Expr) -> Result<PolicyExpr, CompileError> {
        if let Some(param) = self.params.iter().find(|p| p.eq_ignore_ascii_case(name)) {
            return Ok(PolicyExpr::arg(*param));
        }
        match Function::from_name(name) {
            Some(Function::CurrentRole) => Ok(PolicyExpr::current_role()),
            Some(Function::CurrentUser) => Ok(PolicyExpr::current_user()),
            _ => Err(CompileError::unknown_argument(name, self.params, expr.span)),
        }
    }
}

fn literal_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::Int(*n),
        Literal::Float(n) => Value::Float(*n),
        Literal::String(s) => Value::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileErrorKind;
    use crate::parser::parse;
    use pretty_assertions::assert_eq;

    fn lower(source: &str, params: &[&str]) -> Result<PolicyExpr, CompileError> {
        let ast = parse(source).unwrap();
        Compiler::new(params).compile(&ast)
    }

    #[test]
    fn test_salary_mask_body() {
        let expr = lower(
            "CASE WHEN current_role() IN ('HR_ADMIN', 'ACCOUNTANT') THEN val ELSE NULL END",
            &["val"],
        )
        .unwrap();
        assert_eq!(
            expr,
            PolicyExpr::case(
                PolicyExpr::in_list(
                    PolicyExpr::current_role(),
                    vec![PolicyExpr::lit("HR_ADMIN"), PolicyExpr::lit("ACCOUNTANT")],
                ),
                PolicyExpr::arg("val"),
                PolicyExpr::null(),
            )
        );
    }

    #[test]
    fn test_concat_operator_becomes_call() {
        let expr = lower("'***@' || split_part(val, '@', 2)", &["val"]).unwrap();
        assert_eq!(
            expr,
            PolicyExpr::call(
                Function::Concat,
                vec![
                    PolicyExpr::lit("***@"),
                    PolicyExpr::call(
                        Function::SplitPart,
                        vec![PolicyExpr::arg("val"), PolicyExpr::lit("@"), PolicyExpr::lit(2i64)],
                    ),
                ],
            )
        );
    }

    #[test]
    fn test_argument_names_resolve_case_insensitively() {
        let expr = lower("VAL IS NULL", &["val"]).unwrap();
        assert_eq!(
            expr,
            PolicyExpr::IsNull {
                expr: Box::new(PolicyExpr::arg("val")),
                negated: false,
            }
        );
    }

    #[test]
    fn test_niladic_functions_without_parens() {
        assert_eq!(
            lower("CURRENT_ROLE = 'ADMIN'", &[]).unwrap(),
            PolicyExpr::equals(PolicyExpr::current_role(), PolicyExpr::lit("ADMIN"))
        );
    }

    #[test]
    fn test_unknown_names() {
        let err = lower("frobnicate(val)", &["val"]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnknownFunction);
        assert_eq!(err.message, "unknown function 'frobnicate'");

        let err = lower("upper(vall)", &["val"]).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnknownArgument);
        assert_eq!(err.span.start, 6);
    }
}
