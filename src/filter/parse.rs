//! Recursive-descent parser for filter expressions.
//!
//! Precedence, loosest first: `|`, `&`, `!`, atoms. Whitespace between
//! tokens is ignored. The parser never panics on malformed input; every
//! failure carries the byte offset it occurred at.

use super::{Expr, ParseError};

/// Parse a non-empty expression, requiring the whole input to be consumed.
pub(super) fn parse(input: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser { input, pos: 0 };
    let expr = parser.parse_or()?;
    parser.skip_ws();
    if parser.pos < parser.input.len() {
        return Err(parser.error(format!(
            "unexpected token {:?}",
            &parser.input[parser.pos..]
        )));
    }
    Ok(expr)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn skip_ws(&mut self) {
        while matches!(self.input.as_bytes().get(self.pos), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.input.as_bytes().get(self.pos).copied()
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            position: self.pos,
            message: message.into(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(b'|') {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(b'&') {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(b'!') {
            self.pos += 1;
            let inner = self.parse_atom()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            None => Err(self.error("unexpected end of expression")),
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(b')') {
                    return Err(self.error("expected closing ')'"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(_) => self.parse_primitive(),
        }
    }

    fn parse_primitive(&mut self) -> Result<Expr, ParseError> {
        if self.peek() != Some(b'~') {
            return Err(self.error("expected filter expression starting with '~'"));
        }
        self.pos += 1;
        let Some(kind) = self.input.as_bytes().get(self.pos).copied() else {
            return Err(self.error("expected filter type after '~'"));
        };
        let kind_pos = self.pos;
        self.pos += 1;

        let arg = self.parse_arg()?;
        match kind {
            b'm' => Ok(Expr::Method(arg.to_uppercase())),
            b's' => Ok(Expr::Status(arg)),
            b'p' => Ok(Expr::Path(arg.to_lowercase())),
            b'h' => {
                let (key, value) = match arg.split_once(':') {
                    Some((key, value)) if !value.is_empty() => {
                        (key.to_lowercase(), Some(value.to_lowercase()))
                    }
                    Some((key, _)) => (key.to_lowercase(), None),
                    None => (arg.to_lowercase(), None),
                };
                Ok(Expr::Header { key, value })
            }
            b'b' => Ok(Expr::Body(arg.to_lowercase())),
            b'u' => Ok(Expr::UpstreamName(arg.to_lowercase())),
            other => Err(ParseError {
                position: kind_pos,
                message: format!("unknown filter type {:?}", char::from(other)),
            }),
        }
    }

    /// Read the next whitespace-delimited token or quoted string.
    fn parse_arg(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            None => Err(self.error("expected argument")),
            Some(b'"') => self.parse_quoted(),
            Some(_) => {
                let start = self.pos;
                while let Some(&c) = self.input.as_bytes().get(self.pos) {
                    if matches!(c, b' ' | b'\t' | b'&' | b'|' | b')') {
                        break;
                    }
                    self.pos += 1;
                }
                if self.pos == start {
                    return Err(self.error("empty argument"));
                }
                Ok(self.input[start..self.pos].to_string())
            }
        }
    }

    fn parse_quoted(&mut self) -> Result<String, ParseError> {
        self.pos += 1; // opening quote
        let start = self.pos;
        while let Some(&c) = self.input.as_bytes().get(self.pos) {
            if c == b'"' {
                let arg = self.input[start..self.pos].to_string();
                self.pos += 1;
                return Ok(arg);
            }
            self.pos += 1;
        }
        Err(ParseError {
            position: start,
            message: "unterminated quoted string".to_string(),
        })
    }
}
