//! Recursive-descent parser for routing conditions
//!
//! ```text
//! expr       := or
//! or         := and ("or" and)*
//! and        := unary ("and" unary)*
//! unary      := "not" unary | comparison
//! comparison := operand (cmp_op operand)?
//! operand    := literal | path | "(" expr ")"
//! ```
//!
//! Comparisons do not chain; `a < b < c` is rejected. Nesting through `not`
//! and parentheses is bounded by [`MAX_DEPTH`] and the token count by
//! [`MAX_TOKENS`], so hostile input fails with an error instead of
//! exhausting the stack.

use super::lexer::{tokenize, Token, TokenKind};
use crate::error::ExpressionError;

/// Deepest `not` / parenthesis nesting a condition may use
pub const MAX_DEPTH: usize = 128;

/// Longest condition accepted, in tokens; also bounds `and` / `or` chains
pub const MAX_TOKENS: usize = 2048;

/// A literal value in a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

/// Parsed condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    /// Field path segments, without any `state.` prefix
    Path(Vec<String>),
    Compare {
        op: CompareOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

impl Expr {
    /// Every field path referenced by the expression
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut Vec<String>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Path(segments) => out.push(segments.join(".")),
            Expr::Compare { lhs, rhs, .. } | Expr::And(lhs, rhs) | Expr::Or(lhs, rhs) => {
                lhs.collect_paths(out);
                rhs.collect_paths(out);
            }
            Expr::Not(inner) => inner.collect_paths(out),
        }
    }
}

/// Parse `source` into an expression tree.
pub fn parse(source: &str) -> Result<Expr, ExpressionError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExpressionError::new(source, 0, "empty condition"));
    }
    if tokens.len() > MAX_TOKENS {
        return Err(ExpressionError::new(
            source,
            tokens[MAX_TOKENS].pos,
            format!("condition longer than {} tokens", MAX_TOKENS),
        ));
    }
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    if let Some(token) = parser.peek() {
        let message = match token.kind {
            TokenKind::LParen => "function calls are not supported",
            TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge | TokenKind::Eq | TokenKind::Ne => {
                "comparisons cannot be chained"
            }
            _ => "unexpected token",
        };
        return Err(ExpressionError::new(source, token.pos, message));
    }
    Ok(expr)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn end_pos(&self) -> usize {
        self.source.len()
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> ExpressionError {
        ExpressionError::new(self.source, pos, message)
    }

    fn descend(&mut self, pos: usize) -> Result<(), ExpressionError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(pos, "expression nested too deeply"));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.and()?;
        while self.eat(&TokenKind::Or) {
            let rhs = self.and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, ExpressionError> {
        let mut lhs = self.unary()?;
        while self.eat(&TokenKind::And) {
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ExpressionError> {
        if let Some(pos) = self.peek().filter(|t| t.kind == TokenKind::Not).map(|t| t.pos) {
            self.pos += 1;
            self.descend(pos)?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExpressionError> {
        let lhs = self.operand()?;
        let op = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Lt) => CompareOp::Lt,
            Some(TokenKind::Le) => CompareOp::Le,
            Some(TokenKind::Gt) => CompareOp::Gt,
            Some(TokenKind::Ge) => CompareOp::Ge,
            Some(TokenKind::Eq) => CompareOp::Eq,
            Some(TokenKind::Ne) => CompareOp::Ne,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.operand()?;
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn operand(&mut self) -> Result<Expr, ExpressionError> {
        let Some(token) = self.next() else {
            return Err(self.error(self.end_pos(), "unexpected end of condition"));
        };
        match token.kind {
            TokenKind::Int(v) => Ok(Expr::Literal(Literal::Int(v))),
            TokenKind::Float(v) => Ok(Expr::Literal(Literal::Float(v))),
            TokenKind::Str(v) => Ok(Expr::Literal(Literal::Str(v))),
            TokenKind::Bool(v) => Ok(Expr::Literal(Literal::Bool(v))),
            TokenKind::Null => Ok(Expr::Literal(Literal::Null)),
            TokenKind::Path(mut segments) => {
                if self.peek().map(|t| &t.kind) == Some(&TokenKind::LParen) {
                    return Err(self.error(token.pos, "function calls are not supported"));
                }
                if segments.len() > 1 && segments[0] == "state" {
                    segments.remove(0);
                }
                Ok(Expr::Path(segments))
            }
            TokenKind::LParen => {
                self.descend(token.pos)?;
                let inner = self.or()?;
                if !self.eat(&TokenKind::RParen) {
                    let pos = self.peek().map(|t| t.pos).unwrap_or_else(|| self.end_pos());
                    return Err(self.error(pos, "expected `)`"));
                }
                self.depth -= 1;
                Ok(inner)
            }
            _ => Err(self.error(token.pos, "expected a value or field path")),
        }
    }
}
