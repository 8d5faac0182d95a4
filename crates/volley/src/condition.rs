//! Trigger conditions.
//!
//! A [`Condition`] decides whether a registered trigger is eligible for a
//! firing, looking at the request's fields as JSON. Two kinds exist:
//! - [`Expression`], a small boolean language compiled once at registration
//! - any closure `Fn(&Value) -> bool`
//!
//! Expression scope:
//! - Field access: dot notation (`user.tier`, `kind`)
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Logical: `&&`, `||`, `!`, parentheses
//! - Literals: string (single or double quoted), number, bool, null
//! - Numeric comparison uses f64 coercion, so `1` and `1.0` are equal
//!
//! Missing fields resolve to null and type mismatches compare false, so a
//! condition over a field the request does not carry simply does not match.

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// Errors from compiling an expression.
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConditionError {
    #[error("parse error: {message}")]
    Parse { message: String },
}

impl ConditionError {
    fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}

/// Predicate over a request's fields.
pub trait Condition: Send + Sync + 'static {
    fn matches(&self, fields: &Value) -> bool;

    /// Human readable form, used in logs.
    fn describe(&self) -> String {
        "<predicate>".to_string()
    }
}

impl<F> Condition for F
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    fn matches(&self, fields: &Value) -> bool {
        self(fields)
    }
}

/// A compiled boolean expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Compile an expression. The result is evaluated without re-parsing.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ConditionError::parse("empty expression"));
        }
        let (root, rest) = parse_or(&tokens)?;
        if let Some(token) = rest.first() {
            return Err(ConditionError::parse(format!(
                "unexpected token: {token:?}"
            )));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, fields: &Value) -> bool {
        eval(&self.root, fields).truthy()
    }
}

impl Condition for Expression {
    fn matches(&self, fields: &Value) -> bool {
        self.evaluate(fields)
    }

    fn describe(&self) -> String {
        self.source.clone()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Expression {
    type Err = ConditionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Token
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let next = chars.get(i + 1).copied();
        match chars[i] {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            quote @ ('"' | '\'') => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ConditionError::parse("unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                i += 1;
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text
                    .parse()
                    .map_err(|_| ConditionError::parse(format!("invalid number: {text}")))?;
                tokens.push(Token::Num(num));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push(match ident.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(ConditionError::parse(format!(
                    "unexpected character: {other}"
                )));
            }
        }
    }
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST and parser. Precedence: ! > comparison > && > ||
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(Literal),
    Field(Vec<String>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(Box<Node>, CompOp, Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

type ParseResult<'a> = Result<(Node, &'a [Token]), ConditionError>;

fn parse_or(tokens: &[Token]) -> ParseResult<'_> {
    let (mut left, mut rest) = parse_and(tokens)?;
    while rest.first() == Some(&Token::Or) {
        let (right, r) = parse_and(&rest[1..])?;
        left = Node::Or(Box::new(left), Box::new(right));
        rest = r;
    }
    Ok((left, rest))
}

fn parse_and(tokens: &[Token]) -> ParseResult<'_> {
    let (mut left, mut rest) = parse_not(tokens)?;
    while rest.first() == Some(&Token::And) {
        let (right, r) = parse_not(&rest[1..])?;
        left = Node::And(Box::new(left), Box::new(right));
        rest = r;
    }
    Ok((left, rest))
}

fn parse_not(tokens: &[Token]) -> ParseResult<'_> {
    if tokens.first() == Some(&Token::Not) {
        let (inner, rest) = parse_not(&tokens[1..])?;
        return Ok((Node::Not(Box::new(inner)), rest));
    }
    parse_comparison(tokens)
}

fn parse_comparison(tokens: &[Token]) -> ParseResult<'_> {
    let (left, rest) = parse_primary(tokens)?;
    let op = match rest.first() {
        Some(Token::Eq) => CompOp::Eq,
        Some(Token::Ne) => CompOp::Ne,
        Some(Token::Gt) => CompOp::Gt,
        Some(Token::Lt) => CompOp::Lt,
        Some(Token::Ge) => CompOp::Ge,
        Some(Token::Le) => CompOp::Le,
        _ => return Ok((left, rest)),
    };
    let (right, rest) = parse_primary(&rest[1..])?;
    Ok((Node::Compare(Box::new(left), op, Box::new(right)), rest))
}

fn parse_primary(tokens: &[Token]) -> ParseResult<'_> {
    let Some(first) = tokens.first() else {
        return Err(ConditionError::parse("unexpected end of expression"));
    };
    let rest = &tokens[1..];
    match first {
        Token::Str(s) => Ok((Node::Literal(Literal::Str(s.clone())), rest)),
        Token::Num(n) => Ok((Node::Literal(Literal::Num(*n)), rest)),
        Token::Bool(b) => Ok((Node::Literal(Literal::Bool(*b)), rest)),
        Token::Null => Ok((Node::Literal(Literal::Null), rest)),
        Token::Ident(path) => Ok((
            Node::Field(path.split('.').map(str::to_string).collect()),
            rest,
        )),
        Token::LParen => {
            let (inner, rest) = parse_or(rest)?;
            match rest.first() {
                Some(Token::RParen) => Ok((inner, &rest[1..])),
                _ => Err(ConditionError::parse("missing closing parenthesis")),
            }
        }
        other => Err(ConditionError::parse(format!(
            "expected value, got {other:?}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

enum EvalValue<'a> {
    Bool(bool),
    Num(f64),
    Str(&'a str),
    Null,
    Json(&'a Value),
}

impl EvalValue<'_> {
    fn truthy(&self) -> bool {
        match self {
            Self::Bool(b) => *b,
            Self::Null => false,
            Self::Num(n) => *n != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Json(_) => true,
        }
    }

    fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

fn eval<'a>(node: &'a Node, fields: &'a Value) -> EvalValue<'a> {
    match node {
        Node::Literal(Literal::Str(s)) => EvalValue::Str(s),
        Node::Literal(Literal::Num(n)) => EvalValue::Num(*n),
        Node::Literal(Literal::Bool(b)) => EvalValue::Bool(*b),
        Node::Literal(Literal::Null) => EvalValue::Null,
        Node::Field(path) => resolve_path(fields, path),
        Node::Not(inner) => EvalValue::Bool(!eval(inner, fields).truthy()),
        Node::And(l, r) => EvalValue::Bool(eval(l, fields).truthy() && eval(r, fields).truthy()),
        Node::Or(l, r) => EvalValue::Bool(eval(l, fields).truthy() || eval(r, fields).truthy()),
        Node::Compare(l, op, r) => {
            EvalValue::Bool(compare(&eval(l, fields), &eval(r, fields), *op))
        }
    }
}

fn resolve_path<'a>(fields: &'a Value, path: &[String]) -> EvalValue<'a> {
    let mut current = fields;
    for segment in path {
        match current.get(segment) {
            Some(v) => current = v,
            None => return EvalValue::Null,
        }
    }
    match current {
        Value::Null => EvalValue::Null,
        Value::Bool(b) => EvalValue::Bool(*b),
        Value::Number(n) => n.as_f64().map_or(EvalValue::Null, EvalValue::Num),
        Value::String(s) => EvalValue::Str(s),
        other => EvalValue::Json(other),
    }
}

fn compare(left: &EvalValue<'_>, right: &EvalValue<'_>, op: CompOp) -> bool {
    if left.is_null() || right.is_null() {
        let both_null = left.is_null() && right.is_null();
        return match op {
            CompOp::Eq => both_null,
            CompOp::Ne => !both_null,
            _ => false,
        };
    }

    match (left, right) {
        (EvalValue::Num(l), EvalValue::Num(r)) => {
            match op {
                CompOp::Eq => l == r,
                CompOp::Ne => l != r,
                CompOp::Gt => l > r,
                CompOp::Lt => l < r,
                CompOp::Ge => l >= r,
                CompOp::Le => l <= r,
            }
        }
        (EvalValue::Str(l), EvalValue::Str(r)) => match op {
            CompOp::Eq => l == r,
            CompOp::Ne => l != r,
            CompOp::Gt => l > r,
            CompOp::Lt => l < r,
            CompOp::Ge => l >= r,
            CompOp::Le => l <= r,
        },
        (EvalValue::Bool(l), EvalValue::Bool(r)) => match op {
            CompOp::Eq => l == r,
            CompOp::Ne => l != r,
            _ => false,
        },
        (EvalValue::Json(l), EvalValue::Json(r)) => match op {
            CompOp::Eq => l == r,
            CompOp::Ne => l != r,
            _ => false,
        },
        _ => matches!(op, CompOp::Ne),
    }
}
