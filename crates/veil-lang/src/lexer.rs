//! Lexer for policy bodies using logos.
//!
//! Keywords are case-insensitive, strings are single-quoted with `''` as
//! the escape for a quote.

use crate::error::ParseError;
use crate::span::Span;
use logos::Logos;
use std::fmt;

/// Token types for policy bodies.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"--[^\n]*")]
pub enum Token {
    // Keywords
    #[token("case", ignore(ascii_case))]
    Case,
    #[token("when", ignore(ascii_case))]
    When,
    #[token("then", ignore(ascii_case))]
    Then,
    #[token("else", ignore(ascii_case))]
    Else,
    #[token("end", ignore(ascii_case))]
    End,
    #[token("and", ignore(ascii_case))]
    And,
    #[token("or", ignore(ascii_case))]
    Or,
    #[token("not", ignore(ascii_case))]
    Not,
    #[token("in", ignore(ascii_case))]
    In,
    #[token("is", ignore(ascii_case))]
    Is,
    #[token("null", ignore(ascii_case))]
    Null,
    #[token("true", ignore(ascii_case))]
    True,
    #[token("false", ignore(ascii_case))]
    False,

    // Comparison operators
    #[token("=")]
    Eq,
    #[token("!=")]
    #[token("<>")]
    Ne,
    #[token("<=")]
    Le,
    #[token(">=")]
    Ge,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,

    #[token("||")]
    Concat,
    #[token("-")]
    Minus,

    // Identifier
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_$]*", |lex| lex.slice().to_string())]
    Ident(String),

    // String literal
    #[regex(r"'([^']|'')*'", |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].replace("''", "'")
    })]
    String(String),

    // Integer literal
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    // Float literal
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),

    // Punctuation
    #[token(",")]
    Comma,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Case => f.write_str("CASE"),
            Token::When => f.write_str("WHEN"),
            Token::Then => f.write_str("THEN"),
            Token::Else => f.write_str("ELSE"),
            Token::End => f.write_str("END"),
            Token::And => f.write_str("AND"),
            Token::Or => f.write_str("OR"),
            Token::Not => f.write_str("NOT"),
            Token::In => f.write_str("IN"),
            Token::Is => f.write_str("IS"),
            Token::Null => f.write_str("NULL"),
            Token::True => f.write_str("TRUE"),
            Token::False => f.write_str("FALSE"),
            Token::Eq => f.write_str("'='"),
            Token::Ne => f.write_str("'!='"),
            Token::Le => f.write_str("'<='"),
            Token::Ge => f.write_str("'>='"),
            Token::Lt => f.write_str("'<'"),
            Token::Gt => f.write_str("'>'"),
            Token::Concat => f.write_str("'||'"),
            Token::Minus => f.write_str("'-'"),
            Token::Ident(name) => write!(f, "identifier '{}'", name),
            Token::String(s) => write!(f, "string '{}'", s),
            Token::Int(n) => write!(f, "number {}", n),
            Token::Float(n) => write!(f, "number {}", n),
            Token::Comma => f.write_str("','"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

/// A token with its span in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub span: Span,
}

/// Tokenize a source string, failing on the first unrecognized input.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, ParseError> {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    while let Some(result) = lexer.next() {
        let span: Span = lexer.span().into();
        match result {
            Ok(token) => tokens.push(SpannedToken { token, span }),
            Err(()) => {
                let slice = lexer.slice();
                let err = if slice.starts_with('\'') {
                    ParseError::new("unterminated string literal", span)
                } else if slice.starts_with('"') {
                    ParseError::new("unexpected '\"'", span)
                        .with_hint("string literals use single quotes")
                } else if slice.chars().all(|c| c.is_ascii_digit()) {
                    ParseError::new(format!("integer literal {} is out of range", slice), span)
                } else {
                    ParseError::new(format!("unexpected character '{}'", slice), span)
                };
                return Err(err);
            }
        }
    }
    Ok(tokens)
}
