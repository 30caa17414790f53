//! Veil policy language
//!
//! Parses masking and row-access policy bodies written in a small SQL
//! expression dialect and lowers them to [`veil_core::Expr`].
//!
//! ```text
//! CASE WHEN current_role() IN ('HR_ADMIN', 'ACCOUNTANT') THEN val ELSE NULL END
//! CASE WHEN is_role_in_session('SYSADMIN') THEN val
//!      ELSE '***@' || split_part(val, '@', 2) END
//! region = context('region') OR is_role_in_session('GLOBAL_READER')
//! ```
//!
//! # Usage
//!
//! ```rust
//! use veil_lang::parse_and_compile;
//!
//! let body = parse_and_compile("upper(val)", &["val"]).unwrap();
//! ```

pub mod ast;
pub mod compiler;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod span;

pub use ast::{Expr, ExprKind, Literal};
pub use compiler::Compiler;
pub use error::{CompileError, CompileErrorKind, LangError, ParseError};
pub use span::{Span, Spanned};

use veil_core::config::DEFAULT_MAX_EXPRESSION_DEPTH;
use veil_core::{DataType, MaskingPolicyDef, RowAccessPolicyDef};

/// Parse a policy body into a syntax tree.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    parser::parse(source)
}

/// Lower a syntax tree against the policy's argument names.
pub fn compile(expr: &Expr, params: &[&str]) -> Result<veil_core::Expr, CompileError> {
    Compiler::new(params).compile(expr)
}

/// Parse and lower a policy body in one step.
pub fn parse_and_compile(source: &str, params: &[&str]) -> Result<veil_core::Expr, LangError> {
    PolicyParser::default().parse_and_compile(source, params)
}

/// Build a masking policy definition from source text. The output type
/// defaults to the input type.
pub fn masking_policy(
    name: &str,
    arg: &str,
    input_type: DataType,
    source: &str,
) -> Result<MaskingPolicyDef, LangError> {
    PolicyParser::default().masking_policy(name, arg, input_type, source)
}

/// Build a row-access policy definition from source text.
pub fn row_access_policy(
    name: &str,
    params: &[(&str, DataType)],
    source: &str,
) -> Result<RowAccessPolicyDef, LangError> {
    PolicyParser::default().row_access_policy(name, params, source)
}

/// Builds policy definitions from source text under a nesting limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyParser {
    max_depth: usize,
}

impl Default for PolicyParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EXPRESSION_DEPTH)
    }
}

impl PolicyParser {
    /// Reject bodies nested deeper than `max_depth` while parsing.
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn parse_and_compile(
        &self,
        source: &str,
        params: &[&str],
    ) -> Result<veil_core::Expr, LangError> {
        let ast = parser::parse_with_max_depth(source, self.max_depth)?;
        Ok(compile(&ast, params)?)
    }

    pub fn masking_policy(
        &self,
        name: &str,
        arg: &str,
        input_type: DataType,
        source: &str,
    ) -> Result<MaskingPolicyDef, LangError> {
        let body = self.parse_and_compile(source, &[arg])?;
        Ok(MaskingPolicyDef::new(name, arg, input_type, body))
    }

    pub fn row_access_policy(
        &self,
        name: &str,
        params: &[(&str, DataType)],
        source: &str,
    ) -> Result<RowAccessPolicyDef, LangError> {
        let names: Vec<&str> = params.iter().map(|(n, _)| *n).collect();
        let body = self.parse_and_compile(source, &names)?;
        Ok(params
            .iter()
            .fold(RowAccessPolicyDef::new(name, body), |def, (n, ty)| {
                def.with_param(*n, *ty)
            }))
    }
}

/// Tokenize a source string (for debugging).
pub fn tokenize(source: &str) -> Result<Vec<lexer::SpannedToken>, ParseError> {
    lexer::tokenize(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::{
        EvaluationContext, PolicyCompiler, PolicyEvaluator, Value,
    };

    #[test]
    fn test_email_mask_end_to_end() {
        let def = masking_policy(
            "email_mask",
            "val",
            DataType::Text,
            "CASE WHEN is_role_in_session('SYSADMIN') THEN val \
             ELSE '***@' || split_part(val, '@', 2) END",
        )
        .unwrap();
        let compiled = PolicyCompiler::default().compile_masking(&def).unwrap();
        let evaluator = PolicyEvaluator::new();

        let analyst = EvaluationContext::for_roles("andy", "ANALYST", Vec::<String>::new());
        assert_eq!(
            evaluator.evaluate_mask(&compiled, &Value::from("alice@snowflake.com"), &analyst),
            Value::from("***@snowflake.com")
        );

        let admin = EvaluationContext::for_roles("sam", "SYSADMIN", Vec::<String>::new());
        assert_eq!(
            evaluator.evaluate_mask(&compiled, &Value::from("alice@snowflake.com"), &admin),
            Value::from("alice@snowflake.com")
        );
    }

    #[test]
    fn test_row_access_policy_params() {
        let def = row_access_policy(
            "eu_rows",
            &[("region", DataType::Text)],
            "region = 'EU' or is_role_in_session('GLOBAL')",
        )
        .unwrap();
        let compiled = PolicyCompiler::default().compile_row_access(&def).unwrap();
        let evaluator = PolicyEvaluator::new();
        let ctx = EvaluationContext::for_roles("u", "ANALYST", Vec::<String>::new());
        assert!(evaluator.evaluate_row(&compiled, &[Value::from("EU")], &ctx));
        assert!(!evaluator.evaluate_row(&compiled, &[Value::from("US")], &ctx));
        assert!(!evaluator.evaluate_row(&compiled, &[Value::Null], &ctx));
    }

    #[test]
    fn test_policy_parser_depth_limit() {
        let body = "coalesce(upper(lower(val)), 'x')";
        assert!(PolicyParser::new(8).masking_policy("m", "val", DataType::Text, body).is_ok());
        let err = PolicyParser::new(2)
            .masking_policy("m", "val", DataType::Text, body)
            .unwrap_err();
        assert!(matches!(err, LangError::Parse(_)));
        assert!(err.to_string().contains("nested deeper than 2 levels"));
    }

    #[test]
    fn test_error_with_source_context() {
        let source = "CASE WHEN current_role() = 'HR' THEN salary END";
        let err = parse_and_compile(source, &["val"]).unwrap_err();
        assert!(matches!(err, LangError::Compile(_)));
        assert_eq!(err.span().start, 37);
        let formatted = err.format_with_source(source);
        assert!(formatted.contains("line 1:38"));
        assert!(formatted.contains("unknown identifier 'salary'"));
    }
}
