//! Tokenizer for routing conditions

use crate::error::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Dotted field path, already split into segments
    Path(Vec<String>),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset in the source
    pub pos: usize,
}

/// Split `source` into tokens.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn error(&self, pos: usize, message: impl Into<String>) -> ExpressionError {
        ExpressionError::new(self.source, pos, message)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn push(&mut self, kind: TokenKind, pos: usize) {
        self.tokens.push(Token { kind, pos });
    }

    fn run(mut self) -> Result<Vec<Token>, ExpressionError> {
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                b' ' | b'\t' | b'\n' | b'\r' => self.pos += 1,
                b'(' => {
                    self.pos += 1;
                    self.push(TokenKind::LParen, start);
                }
                b')' => {
                    self.pos += 1;
                    self.push(TokenKind::RParen, start);
                }
                b'<' | b'>' | b'=' | b'!' => self.operator(c)?,
                b'\'' | b'"' => self.string(c)?,
                b'0'..=b'9' => self.number()?,
                b'-' if matches!(self.peek_at(1), Some(b'0'..=b'9')) => self.number()?,
                b'a'..=b'z' | b'A'..=b'Z' | b'_' => self.word()?,
                b'&' | b'|' => {
                    return Err(self.error(start, "use `and` / `or` instead of symbolic connectives"))
                }
                b'[' | b']' => return Err(self.error(start, "indexing is not supported")),
                b'+' | b'-' | b'*' | b'/' | b'%' => {
                    return Err(self.error(start, "arithmetic is not supported"))
                }
                _ => {
                    let ch = self.source[start..].chars().next().unwrap_or('?');
                    return Err(self.error(start, format!("unexpected character `{ch}`")));
                }
            }
        }
        Ok(self.tokens)
    }

    fn operator(&mut self, c: u8) -> Result<(), ExpressionError> {
        let start = self.pos;
        let followed_by_eq = self.peek_at(1) == Some(b'=');
        let kind = match (c, followed_by_eq) {
            (b'<', true) => TokenKind::Le,
            (b'<', false) => TokenKind::Lt,
            (b'>', true) => TokenKind::Ge,
            (b'>', false) => TokenKind::Gt,
            (b'=', true) => TokenKind::Eq,
            (b'!', true) => TokenKind::Ne,
            (b'=', false) => return Err(self.error(start, "assignment is not supported")),
            _ => return Err(self.error(start, "use `not` instead of `!`")),
        };
        self.pos += if followed_by_eq { 2 } else { 1 };
        self.push(kind, start);
        Ok(())
    }

    fn string(&mut self, quote: u8) -> Result<(), ExpressionError> {
        let start = self.pos;
        self.pos += 1;
        let mut value = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.error(start, "unterminated string literal"));
            };
            if c == quote {
                self.pos += 1;
                break;
            }
            if c == b'\\' {
                match self.peek_at(1) {
                    Some(escaped @ (b'\\' | b'\'' | b'"')) => {
                        value.push(escaped as char);
                        self.pos += 2;
                        continue;
                    }
                    Some(b'n') => {
                        value.push('\n');
                        self.pos += 2;
                        continue;
                    }
                    _ => return Err(self.error(self.pos, "unsupported escape sequence")),
                }
            }
            // Copy whole UTF-8 characters
            let ch = self.source[self.pos..].chars().next().unwrap_or('\u{fffd}');
            value.push(ch);
            self.pos += ch.len_utf8();
        }
        self.push(TokenKind::Str(value), start);
        Ok(())
    }

    fn number(&mut self) -> Result<(), ExpressionError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' | b'_' => self.pos += 1,
                b'.' if !is_float && matches!(self.peek_at(1), Some(b'0'..=b'9')) => {
                    is_float = true;
                    self.pos += 1;
                }
                _ => break,
            }
        }
        if matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'.')) {
            return Err(self.error(self.pos, "malformed number"));
        }
        let text: String = self.source[start..self.pos].chars().filter(|c| *c != '_').collect();
        let kind = if is_float {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|_| self.error(start, "malformed number"))?
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| self.error(start, "integer out of range"))?
        };
        self.push(kind, start);
        Ok(())
    }

    fn identifier(&mut self) -> &'a str {
        let source = self.source;
        let start = self.pos;
        while matches!(self.peek(), Some(b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_')) {
            self.pos += 1;
        }
        &source[start..self.pos]
    }

    fn word(&mut self) -> Result<(), ExpressionError> {
        let start = self.pos;
        let first = self.identifier();

        let keyword = match first {
            "and" => Some(TokenKind::And),
            "or" => Some(TokenKind::Or),
            "not" => Some(TokenKind::Not),
            "true" | "True" => Some(TokenKind::Bool(true)),
            "false" | "False" => Some(TokenKind::Bool(false)),
            "null" | "None" => Some(TokenKind::Null),
            _ => None,
        };
        if let Some(kind) = keyword {
            self.push(kind, start);
            return Ok(());
        }

        let mut segments = vec![first.to_string()];
        while self.peek() == Some(b'.') {
            let dot = self.pos;
            self.pos += 1;
            let segment = self.identifier();
            if segment.is_empty() {
                return Err(self.error(dot, "expected a field name after `.`"));
            }
            segments.push(segment.to_string());
        }
        self.push(TokenKind::Path(segments), start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_comparison_tokens() {
        assert_eq!(
            kinds("state.count <= 3 and name != 'x'"),
            vec![
                TokenKind::Path(vec!["state".into(), "count".into()]),
                TokenKind::Le,
                TokenKind::Int(3),
                TokenKind::And,
                TokenKind::Path(vec!["name".into()]),
                TokenKind::Ne,
                TokenKind::Str("x".into()),
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            kinds(r#"-2 0.75 1_000 "a \"q\"" True null"#),
            vec![
                TokenKind::Int(-2),
                TokenKind::Float(0.75),
                TokenKind::Int(1000),
                TokenKind::Str("a \"q\"".into()),
                TokenKind::Bool(true),
                TokenKind::Null,
            ]
        );
    }

    #[test]
    fn test_unicode_strings() {
        assert_eq!(kinds("'héllo'"), vec![TokenKind::Str("héllo".into())]);
    }

    #[test]
    fn test_rejections_carry_position() {
        let err = tokenize("count = 3").unwrap_err();
        assert_eq!(err.position, 6);
        assert!(err.message.contains("assignment"));

        assert!(tokenize("items[0] == 1").unwrap_err().message.contains("indexing"));
        assert!(tokenize("a + 1 > 2").unwrap_err().message.contains("arithmetic"));
        assert!(tokenize("a && b").is_err());
        assert!(tokenize("'open").unwrap_err().message.contains("unterminated"));
        assert!(tokenize("a. == 1").is_err());
        assert!(tokenize("3abc").is_err());
    }
}
