//! Recursive descent parser for policy bodies.
//!
//! Precedence, loosest first: `OR`, `AND`, `NOT`, comparison / `IS` / `IN`,
//! `||`, unary minus on numeric literals.

use crate::ast::{Expr, ExprKind, Literal};
use crate::error::ParseError;
use crate::lexer::{tokenize, SpannedToken, Token};
use crate::span::{Span, Spanned};
use veil_core::config::DEFAULT_MAX_EXPRESSION_DEPTH;
use veil_core::CompareOp;

/// Parser over a tokenized policy body.
pub struct Parser<'source> {
    tokens: Vec<SpannedToken>,
    pos: usize,
    source: &'source str,
    depth: usize,
    max_depth: usize,
}

impl<'source> Parser<'source> {
    /// Tokenize `source` and create a parser for it.
    pub fn new(source: &'source str) -> Result<Self, ParseError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
            source,
            depth: 0,
            max_depth: DEFAULT_MAX_EXPRESSION_DEPTH,
        })
    }

    /// Reject input nested deeper than `max_depth` levels.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Parse the whole input as one expression.
    pub fn parse(&mut self) -> Result<Expr, ParseError> {
        if self.tokens.is_empty() {
            return Err(ParseError::new(
                "empty policy body",
                Span::new(0, self.source.len()),
            ));
        }
        let expr = self.parse_or()?;
        if let Some(tok) = self.peek() {
            return Err(ParseError::new(
                format!("unexpected {} after end of expression", tok.token),
                tok.span,
            ));
        }
        Ok(expr)
    }

    /// Parse a full sub-expression one nesting level down.
    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        self.enter()?;
        let expr = self.parse_disjunction();
        self.depth -= 1;
        expr
    }

    fn parse_disjunction(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_and()?;
        let mut items = vec![first];
        while self.eat(&Token::Or).is_some() {
            items.push(self.parse_and()?);
        }
        Ok(fold_chain(items, ExprKind::Or))
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_not()?;
        let mut items = vec![first];
        while self.eat(&Token::And).is_some() {
            items.push(self.parse_not()?);
        }
        Ok(fold_chain(items, ExprKind::And))
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if let Some(span) = self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.parse_not();
            self.depth -= 1;
            let inner = inner?;
            let span = span.to(inner.span);
            return Ok(Expr::new(ExprKind::Not(Box::new(inner)), span));
        }
        self.parse_predicate()
    }

    fn parse_predicate(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_concat()?;
        let Some((token, tok_span)) = self.peek().map(|t| (t.token.clone(), t.span)) else {
            return Ok(left);
        };

        let op = match token {
            Token::Eq => Some(CompareOp::Eq),
            Token::Ne => Some(CompareOp::Ne),
            Token::Lt => Some(CompareOp::Lt),
            Token::Le => Some(CompareOp::Le),
            Token::Gt => Some(CompareOp::Gt),
            Token::Ge => Some(CompareOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_concat()?;
            let span = left.span.to(right.span);
            return Ok(Expr::new(
                ExprKind::Compare {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            ));
        }

        match token {
            Token::Is => {
                self.advance();
                let negated = self.eat(&Token::Not).is_some();
                let end = self.expect(&Token::Null, "NULL after IS")?;
                let span = left.span.to(end);
                Ok(Expr::new(
                    ExprKind::IsNull {
                        expr: Box::new(left),
                        negated,
                    },
                    span,
                ))
            }
            Token::In => {
                self.advance();
                self.parse_in_list(left, false)
            }
            Token::Not => {
                // `x NOT IN (...)`
                self.advance();
                if self.eat(&Token::In).is_none() {
                    return Err(ParseError::new("expected IN after NOT", tok_span));
                }
                self.parse_in_list(left, true)
            }
            _ => Ok(left),
        }
    }

    fn parse_in_list(&mut self, subject: Expr, negated: bool) -> Result<Expr, ParseError> {
        self.expect(&Token::LParen, "'(' to start the IN list")?;
        let list = self.parse_comma_list()?;
        let end = self.expect(&Token::RParen, "')' to close the IN list")?;
        if list.is_empty() {
            return Err(ParseError::new("IN list must not be empty", subject.span.to(end)));
        }
        let span = subject.span.to(end);
        Ok(Expr::new(
            ExprKind::InList {
                expr: Box::new(subject),
                list,
                negated,
            },
            span,
        ))
    }

    fn parse_concat(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_unary()?;
        let mut items = vec![first];
        while self.eat(&Token::Concat).is_some() {
            items.push(self.parse_unary()?);
        }
        Ok(fold_chain(items, ExprKind::Concat))
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let Some(minus) = self.eat(&Token::Minus) else {
            return self.parse_primary();
        };
        let tok = self.next("a number after '-'", minus)?;
        let span = minus.to(tok.span);
        let literal = match tok.token {
            Token::Int(n) => Literal::Int(-n),
            Token::Float(n) => Literal::Float(-n),
            other => {
                return Err(ParseError::new(
                    format!("expected a number after '-', found {}", other),
                    tok.span,
                )
                .with_hint("arithmetic is not supported in policy bodies"))
            }
        };
        Ok(Expr::new(ExprKind::Literal(literal), span))
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let eof = self.eof_span();
        let tok = self.next("an expression", eof)?;
        let span = tok.span;
        let kind = match tok.token {
            Token::Null => ExprKind::Literal(Literal::Null),
            Token::True => ExprKind::Literal(Literal::Bool(true)),
            Token::False => ExprKind::Literal(Literal::Bool(false)),
            Token::Int(n) => ExprKind::Literal(Literal::Int(n)),
            Token::Float(n) => ExprKind::Literal(Literal::Float(n)),
            Token::String(s) => ExprKind::Literal(Literal::String(s)),
            Token::Ident(name) => {
                if self.eat(&Token::LParen).is_none() {
                    ExprKind::Ident(name)
                } else {
                    let args = self.parse_comma_list()?;
                    let end = self.expect(&Token::RParen, "')' to close the argument list")?;
                    return Ok(Expr::new(
                        ExprKind::Call {
                            name: Spanned::new(name, span),
                            args,
                        },
                        span.to(end),
                    ));
                }
            }
            Token::LParen => {
                let inner = self.parse_or()?;
                let end = self.expect(&Token::RParen, "')'")?;
                return Ok(Expr::new(inner.kind, span.to(end)));
            }
            Token::Case => return self.parse_case(span),
            Token::Eq => {
                return Err(ParseError::new("unexpected '='", span)
                    .with_hint("use '=' for equality, not '=='"))
            }
            other => {
                return Err(ParseError::new(
                    format!("expected an expression, found {}", other),
                    span,
                ))
            }
        };
        Ok(Expr::new(kind, span))
    }

    fn parse_case(&mut self, start: Span) -> Result<Expr, ParseError> {
        let mut branches = Vec::new();
        while self.eat(&Token::When).is_some() {
            let condition = self.parse_or()?;
            self.expect(&Token::Then, "THEN")?;
            let result = self.parse_or()?;
            branches.push((condition, result));
        }
        if branches.is_empty() {
            let at = self.peek().map(|t| t.span).unwrap_or_else(|| self.eof_span());
            return Err(ParseError::new("CASE requires at least one WHEN branch", at));
        }
        let otherwise = match self.eat(&Token::Else) {
            Some(_) => Some(Box::new(self.parse_or()?)),
            None => None,
        };
        let end = self.expect(&Token::End, "END to close CASE")?;
        Ok(Expr::new(
            ExprKind::Case {
                branches,
                otherwise,
            },
            start.to(end),
        ))
    }

    /// Comma-separated expressions up to, not including, `)`.
    fn parse_comma_list(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        if matches!(self.peek(), Some(t) if t.token == Token::RParen) {
            return Ok(items);
        }
        loop {
            items.push(self.parse_or()?);
            if self.eat(&Token::Comma).is_none() {
                return Ok(items);
            }
        }
    }

    // =========================================================================
    // Token helpers
    // =========================================================================

    fn peek(&self) -> Option<&SpannedToken> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn next(&mut self, expected: &str, at: Span) -> Result<SpannedToken, ParseError> {
        match self.tokens.get(self.pos) {
            Some(tok) => {
                self.pos += 1;
                Ok(tok.clone())
            }
            None => Err(ParseError::new(
                format!("unexpected end of input, expected {}", expected),
                at.end_point(),
            )),
        }
    }

    /// Consume the next token if it is `token`, returning its span.
    fn eat(&mut self, token: &Token) -> Option<Span> {
        match self.peek() {
            Some(tok) if &tok.token == token => {
                let span = tok.span;
                self.pos += 1;
                Some(span)
            }
            _ => None,
        }
    }

    fn expect(&mut self, token: &Token, expected: &str) -> Result<Span, ParseError> {
        if let Some(span) = self.eat(token) {
            return Ok(span);
        }
        match self.peek() {
            Some(tok) => Err(ParseError::new(
                format!("expected {}, found {}", expected, tok.token),
                tok.span,
            )),
            None => Err(ParseError::new(
                format!("unexpected end of input, expected {}", expected),
                self.eof_span(),
            )),
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        if self.depth >= self.max_depth {
            let at = self.peek().map(|t| t.span).unwrap_or_else(|| self.eof_span());
            return Err(ParseError::new(
                format!("expression nested deeper than {} levels", self.max_depth),
                at,
            )
            .with_hint("split the body into simpler conditions"));
        }
        self.depth += 1;
        Ok(())
    }

    fn eof_span(&self) -> Span {
        let end = self.tokens.last().map(|t| t.span.end).unwrap_or(0);
        Span::new(end, end)
    }
}

/// Collapse a one-element chain to its element.
fn fold_chain(mut items: Vec<Expr>, wrap: fn(Vec<Expr>) -> ExprKind) -> Expr {
    if items.len() == 1 {
        if let Some(only) = items.pop() {
            return only;
        }
    }
    let span = match (items.first(), items.last()) {
        (Some(first), Some(last)) => first.span.to(last.span),
        _ => Span::default(),
    };
    Expr::new(wrap(items), span)
}

/// Parse a policy body.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    Parser::new(source)?.parse()
}

/// Parse a policy body, rejecting nesting deeper than `max_depth`.
pub fn parse_with_max_depth(source: &str, max_depth: usize) -> Result<Expr, ParseError> {
    Parser::new(source)?.with_max_depth(max_depth).parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ident(e: &Expr) -> &str {
        match &e.kind {
            ExprKind::Ident(name) => name,
            other => panic!("expected identifier, got {:?}", other),
        }
    }

    #[test]
    fn test_case_with_in_list() {
        let expr = parse(
            "CASE WHEN current_role() IN ('HR_ADMIN', 'ACCOUNTANT') THEN val ELSE NULL END",
        )
        .unwrap();
        let ExprKind::Case {
            branches,
            otherwise,
        } = &expr.kind
        else {
            panic!("expected CASE, got {:?}", expr.kind);
        };
        assert_eq!(branches.len(), 1);
        let (condition, result) = &branches[0];
        match &condition.kind {
            ExprKind::InList {
                expr,
                list,
                negated,
            } => {
                assert!(!negated);
                assert_eq!(list.len(), 2);
                assert!(matches!(&expr.kind, ExprKind::Call { name, args }
                    if name.value == "current_role" && args.is_empty()));
            }
            other => panic!("expected IN list, got {:?}", other),
        }
        assert_eq!(ident(result), "val");
        assert_eq!(
            otherwise.as_ref().map(|e| &e.kind),
            Some(&ExprKind::Literal(Literal::Null))
        );
        assert_eq!(expr.span, Span::new(0, 77));
    }

    #[test]
    fn test_precedence() {
        // NOT binds looser than comparison, AND tighter than OR.
        let expr = parse("NOT a = 1 OR b AND c").unwrap();
        let ExprKind::Or(items) = &expr.kind else {
            panic!("expected OR, got {:?}", expr.kind);
        };
        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0].kind, ExprKind::Not(inner)
            if matches!(inner.kind, ExprKind::Compare { op: CompareOp::Eq, .. })));
        assert!(matches!(&items[1].kind, ExprKind::And(v) if v.len() == 2));
    }

    #[test]
    fn test_concat_binds_tighter_than_comparison() {
        let expr = parse("'***@' || split_part(val, '@', 2) = x").unwrap();
        let ExprKind::Compare { left, .. } = &expr.kind else {
            panic!("expected comparison");
        };
        assert!(matches!(&left.kind, ExprKind::Concat(parts) if parts.len() == 2));
    }

    #[test]
    fn test_is_null_and_not_in() {
        let expr = parse("val IS NOT NULL AND r NOT IN ('US')").unwrap();
        let ExprKind::And(items) = &expr.kind else {
            panic!("expected AND");
        };
        assert!(matches!(items[0].kind, ExprKind::IsNull { negated: true, .. }));
        assert!(matches!(items[1].kind, ExprKind::InList { negated: true, .. }));
    }

    #[test]
    fn test_negative_literals() {
        let expr = parse("split_part(val, '.', -1)").unwrap();
        let ExprKind::Call { args, .. } = &expr.kind else {
            panic!("expected call");
        };
        assert_eq!(args[2].kind, ExprKind::Literal(Literal::Int(-1)));

        let err = parse("-val").unwrap_err();
        assert_eq!(
            err.hint.as_deref(),
            Some("arithmetic is not supported in policy bodies")
        );
    }

    #[test]
    fn test_parenthesized_expression_keeps_outer_span() {
        let expr = parse("(val)").unwrap();
        assert_eq!(ident(&expr), "val");
        assert_eq!(expr.span, Span::new(0, 5));
    }

    #[test]
    fn test_searched_case_without_else() {
        let expr = parse("case when a then 1 when b then 2 end").unwrap();
        assert!(matches!(&expr.kind, ExprKind::Case { branches, otherwise: None }
            if branches.len() == 2));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}val{}", "(".repeat(100_000), ")".repeat(100_000));
        let err = parse(&deep).unwrap_err();
        assert_eq!(
            err.message,
            format!("expression nested deeper than {} levels", DEFAULT_MAX_EXPRESSION_DEPTH)
        );

        let nots = format!("{}x", "NOT ".repeat(100_000));
        assert!(parse(&nots).unwrap_err().message.contains("nested deeper"));

        let three = "upper(lower(upper(val)))";
        assert!(parse_with_max_depth(three, 4).is_ok());
        let err = parse_with_max_depth(three, 3).unwrap_err();
        assert_eq!(err.span, Span::new(18, 21));
    }

    #[test]
    fn test_errors() {
        let err = parse("").unwrap_err();
        assert_eq!(err.message, "empty policy body");

        let err = parse("CASE WHEN a THEN b").unwrap_err();
        assert_eq!(err.message, "unexpected end of input, expected END to close CASE");

        let err = parse("CASE ELSE 1 END").unwrap_err();
        assert_eq!(err.message, "CASE requires at least one WHEN branch");

        let err = parse("a == 1").unwrap_err();
        assert_eq!(err.span, Span::new(3, 4));
        assert!(err.hint.is_some());

        let err = parse("val val").unwrap_err();
        assert_eq!(err.message, "unexpected identifier 'val' after end of expression");

        let err = parse("a IN ()").unwrap_err();
        assert_eq!(err.message, "IN list must not be empty");

        let err = parse("upper(val").unwrap_err();
        assert!(err.message.contains("')' to close the argument list"));
    }
}
