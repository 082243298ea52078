//! Allow-condition expressions evaluated against verified claim sets.
//!
//! Conditions are small boolean expressions over claim paths rooted at
//! `payload`, in the dialect policy authors already use elsewhere:
//!
//! ```text
//! has(payload.email) && payload.email.endswith("@corp.com")
//! "admin" in payload.roles || payload.ctx.org.id == 7
//! ```
//!
//! Supported forms: `has(path)` presence checks, `==`/`!=` against string,
//! number, and boolean literals, the string methods `startswith`,
//! `endswith`, and `contains`, `<literal> in <path>` list membership, bare
//! paths as truthiness checks, and `&&`/`||`/`!` with parentheses.
//!
//! Expressions are parsed once at configuration load ([`Condition::parse`]
//! fails fast on malformed input) and evaluated infallibly per request:
//! a subexpression that touches an absent claim path is `false`, never an
//! error, so policy authors do not have to presence-check every field.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claims::ClaimSet;

/// A condition expression failed to parse. Startup-fatal, never seen at
/// request time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed condition at offset {offset}: {message}")]
pub struct ConditionParseError {
    /// Byte offset into the expression where parsing stopped.
    pub offset: usize,
    /// What the parser expected or rejected.
    pub message: String,
}

impl ConditionParseError {
    fn new(offset: usize, message: impl Into<String>) -> Self {
        Self {
            offset,
            message: message.into(),
        }
    }
}

/// A parsed allow-condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parse an expression, rejecting malformed input.
    pub fn parse(source: &str) -> Result<Self, ConditionParseError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        parser.expect_end()?;
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    /// Evaluate against a claim set. Absent paths make the touching
    /// subexpression false.
    pub fn evaluate(&self, claims: &ClaimSet) -> bool {
        eval(&self.expr, claims)
    }

    /// The original expression text.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// How an ordered list of conditions combines into one verdict.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combine {
    /// Every condition must hold.
    #[default]
    All,
    /// At least one condition must hold.
    Any,
}

/// An ordered set of conditions with a combinator.
///
/// An empty set always allows, under either combinator. Deployments that
/// want a closed gate must configure at least one condition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConditionSet {
    conditions: Vec<Condition>,
    combine: Combine,
}

impl ConditionSet {
    /// Build from already-parsed conditions.
    pub fn new(conditions: Vec<Condition>, combine: Combine) -> Self {
        Self {
            conditions,
            combine,
        }
    }

    /// Parse every expression, failing fast on the first malformed one.
    pub fn parse<S: AsRef<str>>(
        expressions: &[S],
        combine: Combine,
    ) -> Result<Self, ConditionParseError> {
        let conditions = expressions
            .iter()
            .map(|e| Condition::parse(e.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(conditions, combine))
    }

    /// Whether the claim set satisfies this condition set.
    pub fn allows(&self, claims: &ClaimSet) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.combine {
            Combine::All => self.conditions.iter().all(|c| c.evaluate(claims)),
            Combine::Any => self.conditions.iter().any(|c| c.evaluate(claims)),
        }
    }

    /// The first condition that does not hold, for server-side diagnostics.
    pub fn first_failing(&self, claims: &ClaimSet) -> Option<&Condition> {
        self.conditions.iter().find(|c| !c.evaluate(claims))
    }

    /// Number of configured conditions.
    pub fn len(&self) -> usize {
        self.conditions.len()
    }

    /// Whether no conditions are configured.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Literal(bool),
    Has(Path),
    Truthy(Path),
    Compare {
        lhs: Operand,
        op: CmpOp,
        rhs: Operand,
    },
    In {
        needle: Operand,
        haystack: Path,
    },
    Method {
        path: Path,
        method: StrMethod,
        arg: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StrMethod {
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Path(Path),
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Path {
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Not,
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ConditionParseError> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '(' => {
                tokens.push((Token::LParen, start));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                i += 1;
            }
            '[' => {
                tokens.push((Token::LBracket, start));
                i += 1;
            }
            ']' => {
                tokens.push((Token::RBracket, start));
                i += 1;
            }
            '.' => {
                tokens.push((Token::Dot, start));
                i += 1;
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::EqEq, start));
                    i += 2;
                } else {
                    return Err(ConditionParseError::new(start, "expected `==`"));
                }
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    tokens.push((Token::NotEq, start));
                    i += 2;
                } else {
                    tokens.push((Token::Not, start));
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    tokens.push((Token::AndAnd, start));
                    i += 2;
                } else {
                    return Err(ConditionParseError::new(start, "expected `&&`"));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    tokens.push((Token::OrOr, start));
                    i += 2;
                } else {
                    return Err(ConditionParseError::new(start, "expected `||`"));
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => {
                            return Err(ConditionParseError::new(start, "unterminated string"));
                        }
                        Some(&b) if b as char == quote => {
                            i += 1;
                            break;
                        }
                        Some(&b'\\') => {
                            match bytes.get(i + 1) {
                                Some(&e) if matches!(e, b'\\' | b'"' | b'\'') => {
                                    value.push(e as char);
                                }
                                _ => {
                                    return Err(ConditionParseError::new(
                                        i,
                                        "unsupported escape sequence",
                                    ));
                                }
                            }
                            i += 2;
                        }
                        Some(&b) => {
                            // multi-byte chars pass through untouched
                            let ch_len = utf8_len(b);
                            value.push_str(&source[i..i + ch_len]);
                            i += ch_len;
                        }
                    }
                }
                tokens.push((Token::Str(value), start));
            }
            '0'..='9' | '-' => {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end].is_ascii_digit() || bytes[end] == b'.')
                    && !(bytes[end] == b'.' && !bytes.get(end + 1).is_some_and(u8::is_ascii_digit))
                {
                    end += 1;
                }
                let text = &source[i..end];
                let num: f64 = text.parse().map_err(|_| {
                    ConditionParseError::new(start, format!("invalid number {text:?}"))
                })?;
                tokens.push((Token::Num(num), start));
                i = end;
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let mut end = i + 1;
                while end < bytes.len()
                    && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                tokens.push((Token::Ident(source[i..end].to_string()), start));
                i = end;
            }
            other => {
                return Err(ConditionParseError::new(
                    start,
                    format!("unexpected character {other:?}"),
                ));
            }
        }
    }

    Ok(tokens)
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        b if b < 0x80 => 1,
        b if b >= 0xF0 => 4,
        b if b >= 0xE0 => 3,
        _ => 2,
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Either a plain operand or a terminal string-method call.
enum OperandOrMethod {
    Operand(Operand),
    Method {
        path: Path,
        method: StrMethod,
        arg: String,
    },
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, o)| *o)
            .unwrap_or_else(|| {
                self.tokens
                    .last()
                    .map(|(_, o)| o + 1)
                    .unwrap_or_default()
            })
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ConditionParseError> {
        let offset = self.offset();
        match self.advance() {
            Some(t) if t == expected => Ok(()),
            _ => Err(ConditionParseError::new(offset, format!("expected {what}"))),
        }
    }

    fn expect_end(&self) -> Result<(), ConditionParseError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ConditionParseError::new(
                self.offset(),
                "unexpected trailing input",
            ))
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionParseError> {
        let mut expr = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let rhs = self.parse_and()?;
            expr = Expr::Or(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionParseError> {
        let mut expr = self.parse_unary()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let rhs = self.parse_unary()?;
            expr = Expr::And(Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ConditionParseError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionParseError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_or()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(expr)
            }
            Some(Token::Ident(name)) if name == "has" => {
                self.advance();
                self.expect(Token::LParen, "`(` after `has`")?;
                let path = self.parse_payload_path()?;
                self.expect(Token::RParen, "`)` after claim path")?;
                Ok(Expr::Has(path))
            }
            _ => self.parse_operand_expr(),
        }
    }

    /// Comparison, membership, method call, bare truthiness, or a boolean
    /// literal.
    fn parse_operand_expr(&mut self) -> Result<Expr, ConditionParseError> {
        let offset = self.offset();
        let lhs = self.parse_operand()?;

        match self.peek() {
            Some(Token::EqEq) | Some(Token::NotEq) => {
                let op = if self.advance() == Some(Token::EqEq) {
                    CmpOp::Eq
                } else {
                    CmpOp::Ne
                };
                let lhs = match lhs {
                    OperandOrMethod::Operand(op) => op,
                    OperandOrMethod::Method { .. } => {
                        return Err(ConditionParseError::new(
                            offset,
                            "string methods are boolean tests and cannot be compared",
                        ));
                    }
                };
                let rhs = match self.parse_operand()? {
                    OperandOrMethod::Operand(op) => op,
                    OperandOrMethod::Method { .. } => {
                        return Err(ConditionParseError::new(
                            offset,
                            "string methods are boolean tests and cannot be compared",
                        ));
                    }
                };
                Ok(Expr::Compare { lhs, op, rhs })
            }
            Some(Token::Ident(kw)) if kw == "in" => {
                self.advance();
                let needle = match lhs {
                    OperandOrMethod::Operand(op) => op,
                    OperandOrMethod::Method { .. } => {
                        return Err(ConditionParseError::new(
                            offset,
                            "string methods cannot appear left of `in`",
                        ));
                    }
                };
                let haystack = self.parse_payload_path()?;
                Ok(Expr::In { needle, haystack })
            }
            _ => match lhs {
                OperandOrMethod::Method { path, method, arg } => {
                    Ok(Expr::Method { path, method, arg })
                }
                OperandOrMethod::Operand(Operand::Path(path)) => Ok(Expr::Truthy(path)),
                OperandOrMethod::Operand(Operand::Bool(b)) => Ok(Expr::Literal(b)),
                OperandOrMethod::Operand(_) => Err(ConditionParseError::new(
                    offset,
                    "literal must be part of a comparison or membership test",
                )),
            },
        }
    }

    fn parse_operand(&mut self) -> Result<OperandOrMethod, ConditionParseError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Str(s)) => Ok(OperandOrMethod::Operand(Operand::Str(s))),
            Some(Token::Num(n)) => Ok(OperandOrMethod::Operand(Operand::Num(n))),
            Some(Token::Ident(name)) if name == "true" => {
                Ok(OperandOrMethod::Operand(Operand::Bool(true)))
            }
            Some(Token::Ident(name)) if name == "false" => {
                Ok(OperandOrMethod::Operand(Operand::Bool(false)))
            }
            Some(Token::Ident(name)) if name == "payload" => self.parse_path_rest(),
            Some(Token::Ident(name)) => Err(ConditionParseError::new(
                offset,
                format!("claim paths are rooted at `payload`, got `{name}`"),
            )),
            _ => Err(ConditionParseError::new(
                offset,
                "expected a literal or claim path",
            )),
        }
    }

    /// Path rooted at `payload`, with no trailing method call allowed.
    fn parse_payload_path(&mut self) -> Result<Path, ConditionParseError> {
        let offset = self.offset();
        match self.advance() {
            Some(Token::Ident(name)) if name == "payload" => match self.parse_path_rest()? {
                OperandOrMethod::Operand(Operand::Path(path)) => Ok(path),
                OperandOrMethod::Method { .. } => Err(ConditionParseError::new(
                    offset,
                    "method call not allowed here",
                )),
                _ => unreachable!("parse_path_rest only yields paths or methods"),
            },
            _ => Err(ConditionParseError::new(
                offset,
                "expected a claim path rooted at `payload`",
            )),
        }
    }

    /// Segments after the `payload` root, terminating on a string-method
    /// call when one is present.
    fn parse_path_rest(&mut self) -> Result<OperandOrMethod, ConditionParseError> {
        let mut segments = Vec::new();

        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let offset = self.offset();
                    let Some(Token::Ident(name)) = self.advance() else {
                        return Err(ConditionParseError::new(
                            offset,
                            "expected a claim name after `.`",
                        ));
                    };
                    let method = match name.as_str() {
                        "startswith" => Some(StrMethod::StartsWith),
                        "endswith" => Some(StrMethod::EndsWith),
                        "contains" => Some(StrMethod::Contains),
                        _ => None,
                    };
                    if let Some(method) = method
                        && self.peek() == Some(&Token::LParen)
                    {
                        self.advance();
                        let arg_offset = self.offset();
                        let Some(Token::Str(arg)) = self.advance() else {
                            return Err(ConditionParseError::new(
                                arg_offset,
                                format!("`{name}` takes a single string argument"),
                            ));
                        };
                        self.expect(Token::RParen, "`)` after method argument")?;
                        if segments.is_empty() {
                            return Err(ConditionParseError::new(
                                offset,
                                "string methods apply to a claim path, not `payload` itself",
                            ));
                        }
                        return Ok(OperandOrMethod::Method {
                            path: Path { segments },
                            method,
                            arg,
                        });
                    }
                    segments.push(Segment::Key(name));
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let offset = self.offset();
                    let Some(Token::Num(n)) = self.advance() else {
                        return Err(ConditionParseError::new(offset, "expected a list index"));
                    };
                    if n < 0.0 || n.fract() != 0.0 {
                        return Err(ConditionParseError::new(
                            offset,
                            "list indices are non-negative integers",
                        ));
                    }
                    self.expect(Token::RBracket, "`]` after list index")?;
                    segments.push(Segment::Index(n as usize));
                }
                _ => break,
            }
        }

        if segments.is_empty() {
            return Err(ConditionParseError::new(
                self.offset(),
                "`payload` alone is not a claim path",
            ));
        }
        Ok(OperandOrMethod::Operand(Operand::Path(Path { segments })))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, claims: &ClaimSet) -> bool {
    match expr {
        Expr::Or(a, b) => eval(a, claims) || eval(b, claims),
        Expr::And(a, b) => eval(a, claims) && eval(b, claims),
        Expr::Not(e) => !eval(e, claims),
        Expr::Literal(b) => *b,
        Expr::Has(path) => lookup(claims, path).is_some_and(|v| !v.is_null()),
        Expr::Truthy(path) => lookup(claims, path).is_some_and(truthy),
        Expr::Compare { lhs, op, rhs } => {
            let (Some(l), Some(r)) = (resolve(lhs, claims), resolve(rhs, claims)) else {
                return false;
            };
            let eq = values_equal(&l, &r);
            match op {
                CmpOp::Eq => eq,
                CmpOp::Ne => !eq,
            }
        }
        Expr::In { needle, haystack } => {
            let Some(Value::Array(items)) = lookup(claims, haystack) else {
                return false;
            };
            let Some(n) = resolve(needle, claims) else {
                return false;
            };
            items.iter().any(|v| values_equal(v, &n))
        }
        Expr::Method { path, method, arg } => {
            let Some(Value::String(s)) = lookup(claims, path) else {
                return false;
            };
            match method {
                StrMethod::StartsWith => s.starts_with(arg.as_str()),
                StrMethod::EndsWith => s.ends_with(arg.as_str()),
                StrMethod::Contains => s.contains(arg.as_str()),
            }
        }
    }
}

fn lookup<'a>(claims: &'a ClaimSet, path: &Path) -> Option<&'a Value> {
    let mut current: Option<&Value> = None;
    for (i, segment) in path.segments.iter().enumerate() {
        current = match (segment, current) {
            (Segment::Key(k), _) if i == 0 => claims.get(k),
            (Segment::Key(k), Some(Value::Object(map))) => map.get(k),
            (Segment::Index(ix), Some(Value::Array(items))) => items.get(*ix),
            _ => None,
        };
        current?;
    }
    current
}

fn resolve(operand: &Operand, claims: &ClaimSet) -> Option<Value> {
    match operand {
        Operand::Path(path) => lookup(claims, path).cloned(),
        Operand::Str(s) => Some(Value::String(s.clone())),
        Operand::Num(n) => serde_json::Number::from_f64(*n).map(Value::Number),
        Operand::Bool(b) => Some(Value::Bool(*b)),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        // compare across integer/float representations
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
