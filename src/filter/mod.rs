//! Flow filter expression language.
//!
//! A small predicate grammar for narrowing captured flows:
//!
//! ```text
//! ~m METHOD   match HTTP method (substring)
//! ~s CODE     match response status code (prefix, e.g. "5" matches 5xx)
//! ~p PATH     match URL path (substring)
//! ~h KEY:VAL  match header key containing KEY, value containing VAL
//! ~b TEXT     match request or response body (substring)
//! ~u NAME     match upstream name (substring)
//! !EXPR       negate
//! A & B       AND
//! A | B       OR
//! (EXPR)      grouping
//! ```
//!
//! Arguments are bare tokens or quoted strings; comparisons are
//! case-insensitive. Parsing is pure: a compiled [`Filter`] always yields
//! the same verdict for the same flow.

mod parse;

use http::HeaderMap;

use crate::proxy::flow::{Flow, FlowData};

/// Error produced for a malformed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    /// Byte offset into the input where parsing failed.
    pub position: usize,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at position {}", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

/// Parsed filter expression tree. Primitive arguments are normalized at
/// parse time (method uppercased, the rest lowercased).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Method(String),
    Status(String),
    Path(String),
    Header { key: String, value: Option<String> },
    Body(String),
    UpstreamName(String),
}

/// A compiled predicate over flows.
#[derive(Debug, Clone)]
pub struct Filter {
    expr: Option<Expr>,
}

impl Filter {
    /// The always-true predicate.
    pub fn match_all() -> Filter {
        Filter { expr: None }
    }

    /// Compile an expression. Empty input compiles to [`Filter::match_all`].
    pub fn parse(input: &str) -> Result<Filter, ParseError> {
        if input.trim().is_empty() {
            return Ok(Filter::match_all());
        }
        let expr = parse::parse(input)?;
        Ok(Filter { expr: Some(expr) })
    }

    /// Evaluate the predicate against one flow.
    pub fn matches(&self, flow: &Flow) -> bool {
        match &self.expr {
            None => true,
            Some(expr) => {
                let data = flow.read();
                eval(expr, flow, &data)
            }
        }
    }
}

fn eval(expr: &Expr, flow: &Flow, data: &FlowData) -> bool {
    match expr {
        Expr::Or(left, right) => eval(left, flow, data) || eval(right, flow, data),
        Expr::And(left, right) => eval(left, flow, data) && eval(right, flow, data),
        Expr::Not(inner) => !eval(inner, flow, data),
        Expr::Method(arg) => data.request.method.to_uppercase().contains(arg),
        Expr::Status(arg) => match &data.response {
            Some(response) => response.status_code.to_string().starts_with(arg),
            None => false,
        },
        Expr::Path(arg) => data.request.path.to_lowercase().contains(arg),
        Expr::Header { key, value } => {
            headers_match(&data.request.headers, key, value)
                || data
                    .response
                    .as_ref()
                    .is_some_and(|r| headers_match(&r.headers, key, value))
        }
        Expr::Body(arg) => {
            body_contains(&data.request.body, arg)
                || data.response.as_ref().is_some_and(|r| body_contains(&r.body, arg))
        }
        Expr::UpstreamName(arg) => flow.upstream.to_lowercase().contains(arg),
    }
}

fn headers_match(headers: &HeaderMap, key: &str, value: &Option<String>) -> bool {
    for (name, header_value) in headers.iter() {
        // Header names are already lowercase in the map.
        if !name.as_str().contains(key) {
            continue;
        }
        match value {
            None => return true,
            Some(want) => {
                let have = String::from_utf8_lossy(header_value.as_bytes()).to_lowercase();
                if have.contains(want) {
                    return true;
                }
            }
        }
    }
    false
}

fn body_contains(body: &[u8], arg: &str) -> bool {
    String::from_utf8_lossy(body).to_lowercase().contains(arg)
}
