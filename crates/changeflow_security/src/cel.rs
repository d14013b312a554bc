//! Condition expressions: a small subset of CEL.
//!
//! Used for IAM binding conditions, approval rule and risk conditions,
//! database group membership and the list filters of the API layer.
//!
//! ```text
//! expr     := or
//! or       := and ( "||" and )*
//! and      := relation ( "&&" relation )*
//! relation := unary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" | "in" ) unary )*
//! unary    := ( "!" | "-" ) unary | postfix
//! postfix  := primary ( "." IDENT [ "(" args ")" ] | "[" expr "]" )*
//! primary  := INT | STRING | "true" | "false" | "null"
//!           | IDENT [ "(" args ")" ] | "(" expr ")" | "[" args "]"
//! ```
//!
//! Functions: `size(x)`, `timestamp(s)`. Methods on strings:
//! `startsWith`, `endsWith`, `contains`, `matches`.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CelError {
    #[error("syntax error at {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("undeclared reference to '{0}'")]
    UndeclaredReference(String),

    #[error("no such key: {0}")]
    NoSuchKey(String),

    #[error("no matching overload for '{op}' applied to ({args})")]
    NoOverload { op: String, args: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CelError {
    fn syntax(pos: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            pos,
            message: message.into(),
        }
    }

    fn no_overload(op: &str, args: &[&Value]) -> Self {
        Self::NoOverload {
            op: op.to_string(),
            args: args
                .iter()
                .map(|v| v.type_name())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

pub type Result<T> = std::result::Result<T, CelError>;

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::String(_) => "string",
            Value::Timestamp(_) => "timestamp",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn string_list<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::List(items.into_iter().map(|s| Value::String(s.into())).collect())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Timestamp(t) => write!(f, "timestamp({:?})", t.to_rfc3339()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(map) => write!(f, "{{{} keys}}", map.len()),
        }
    }
}

/// Variable bindings for evaluation.
#[derive(Debug, Clone, Default)]
pub struct Activation {
    vars: BTreeMap<String, Value>,
}

impl Activation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a dotted path such as `resource.database_name`, creating the
    /// intermediate maps.
    pub fn insert(&mut self, path: &str, value: impl Into<Value>) -> &mut Self {
        let segments: Vec<&str> = path.split('.').collect();
        insert_path(&mut self.vars, &segments, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Copies every top-level binding of `other` over this one.
    pub fn merge(&mut self, other: &Activation) -> &mut Self {
        for (name, value) in &other.vars {
            self.vars.insert(name.clone(), value.clone());
        }
        self
    }
}

fn insert_path(map: &mut BTreeMap<String, Value>, segments: &[&str], value: Value) {
    match segments {
        [] => {}
        [last] => {
            map.insert(last.to_string(), value);
        }
        [head, rest @ ..] => {
            let slot = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            if !matches!(slot, Value::Map(_)) {
                *slot = Value::Map(BTreeMap::new());
            }
            if let Value::Map(inner) = slot {
                insert_path(inner, rest, value);
            }
        }
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    AndAnd,
    OrOr,
    Bang,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minus,
    Eof,
}

fn lex(src: &str) -> Result<Vec<(Tok, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();
    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let two = |chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>, next: char| {
            chars.next();
            if chars.peek().map(|&(_, c)| c) == Some(next) {
                chars.next();
                true
            } else {
                false
            }
        };
        let tok = match c {
            '(' => {
                chars.next();
                Tok::LParen
            }
            ')' => {
                chars.next();
                Tok::RParen
            }
            '[' => {
                chars.next();
                Tok::LBracket
            }
            ']' => {
                chars.next();
                Tok::RBracket
            }
            ',' => {
                chars.next();
                Tok::Comma
            }
            '.' => {
                chars.next();
                Tok::Dot
            }
            '-' => {
                chars.next();
                Tok::Minus
            }
            '&' => {
                if !two(&mut chars, '&') {
                    return Err(CelError::syntax(pos, "expected '&&'"));
                }
                Tok::AndAnd
            }
            '|' => {
                if !two(&mut chars, '|') {
                    return Err(CelError::syntax(pos, "expected '||'"));
                }
                Tok::OrOr
            }
            '=' => {
                if !two(&mut chars, '=') {
                    return Err(CelError::syntax(pos, "expected '=='"));
                }
                Tok::EqEq
            }
            '!' => {
                if two(&mut chars, '=') {
                    Tok::Ne
                } else {
                    Tok::Bang
                }
            }
            '<' => {
                if two(&mut chars, '=') {
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            '>' => {
                if two(&mut chars, '=') {
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut out = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, 'n')) => out.push('\n'),
                            Some((_, 't')) => out.push('\t'),
                            Some((_, 'r')) => out.push('\r'),
                            Some((_, other)) => out.push(other),
                            None => break,
                        },
                        ch if ch == c => {
                            closed = true;
                            break;
                        }
                        ch => out.push(ch),
                    }
                }
                if !closed {
                    return Err(CelError::syntax(pos, "unterminated string literal"));
                }
                Tok::Str(out)
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    digits.push(d);
                    chars.next();
                }
                let n = digits
                    .parse()
                    .map_err(|_| CelError::syntax(pos, format!("integer out of range: {}", digits)))?;
                Tok::Int(n)
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, d)) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_') {
                        break;
                    }
                    ident.push(d);
                    chars.next();
                }
                Tok::Ident(ident)
            }
            other => return Err(CelError::syntax(pos, format!("unexpected character '{}'", other))),
        };
        tokens.push((tok, pos));
    }
    tokens.push((Tok::Eof, src.len()));
    Ok(tokens)
}

// ============================================================================
// Syntax tree
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::In => "in",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Select(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call {
        target: Option<Box<Expr>>,
        function: String,
        args: Vec<Expr>,
    },
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Dotted path of an identifier or a field selection chain over one.
    pub fn ident_path(&self) -> Option<String> {
        match self {
            Expr::Ident(name) => Some(name.clone()),
            Expr::Select(target, field) => target.ident_path().map(|p| format!("{}.{}", p, field)),
            _ => None,
        }
    }

    /// Splits a conjunction into its operands, left to right.
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                let mut out = lhs.conjuncts();
                out.extend(rhs.conjuncts());
                out
            }
            other => vec![other],
        }
    }

    fn visit_paths(&self, out: &mut Vec<String>) {
        if let Some(path) = self.ident_path() {
            out.push(path);
            return;
        }
        match self {
            Expr::Literal(_) | Expr::Ident(_) => {}
            Expr::Select(target, _) => target.visit_paths(out),
            Expr::Index(target, index) => {
                target.visit_paths(out);
                index.visit_paths(out);
            }
            Expr::Call { target, args, .. } => {
                if let Some(target) = target {
                    target.visit_paths(out);
                }
                for arg in args {
                    arg.visit_paths(out);
                }
            }
            Expr::List(items) => {
                for item in items {
                    item.visit_paths(out);
                }
            }
            Expr::Unary(_, inner) => inner.visit_paths(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.visit_paths(out);
                rhs.visit_paths(out);
            }
        }
    }
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    idx: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.idx.min(self.tokens.len() - 1)].0
    }

    fn pos(&self) -> usize {
        self.tokens[self.idx.min(self.tokens.len() - 1)].1
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.idx < self.tokens.len() - 1 {
            self.idx += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok, what: &str) -> Result<()> {
        if *self.peek() == want {
            self.bump();
            Ok(())
        } else {
            Err(CelError::syntax(
                self.pos(),
                format!("expected {}, found {:?}", what, self.peek()),
            ))
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut lhs = self.and()?;
        while *self.peek() == Tok::OrOr {
            self.bump();
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut lhs = self.relation()?;
        while *self.peek() == Tok::AndAnd {
            self.bump();
            let rhs = self.relation()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn relation(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::EqEq => BinaryOp::Eq,
                Tok::Ne => BinaryOp::Ne,
                Tok::Lt => BinaryOp::Lt,
                Tok::Le => BinaryOp::Le,
                Tok::Gt => BinaryOp::Gt,
                Tok::Ge => BinaryOp::Ge,
                Tok::Ident(word) if word == "in" => BinaryOp::In,
                _ => return Ok(lhs),
            };
            self.bump();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Tok::Bang => {
                self.bump();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            Tok::Minus => {
                self.bump();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.bump();
                    let pos = self.pos();
                    let Tok::Ident(field) = self.bump() else {
                        return Err(CelError::syntax(pos, "expected field name after '.'"));
                    };
                    if *self.peek() == Tok::LParen {
                        self.bump();
                        let args = self.args(Tok::RParen, "')'")?;
                        expr = Expr::Call {
                            target: Some(Box::new(expr)),
                            function: field,
                            args,
                        };
                    } else {
                        expr = Expr::Select(Box::new(expr), field);
                    }
                }
                Tok::LBracket => {
                    self.bump();
                    let index = self.or()?;
                    self.expect(Tok::RBracket, "']'")?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn args(&mut self, close: Tok, what: &str) -> Result<Vec<Expr>> {
        let mut args = Vec::new();
        if *self.peek() == close {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            if *self.peek() == Tok::Comma {
                self.bump();
                continue;
            }
            self.expect(close, what)?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let pos = self.pos();
        match self.bump() {
            Tok::Int(n) => Ok(Expr::Literal(Value::Int(n))),
            Tok::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Tok::Ident(word) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "in" => Err(CelError::syntax(pos, "unexpected 'in'")),
                _ if *self.peek() == Tok::LParen => {
                    self.bump();
                    let args = self.args(Tok::RParen, "')'")?;
                    Ok(Expr::Call {
                        target: None,
                        function: word,
                        args,
                    })
                }
                _ => Ok(Expr::Ident(word)),
            },
            Tok::LParen => {
                let inner = self.or()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(inner)
            }
            Tok::LBracket => Ok(Expr::List(self.args(Tok::RBracket, "']'")?)),
            Tok::Eof => Err(CelError::syntax(pos, "unexpected end of expression")),
            other => Err(CelError::syntax(pos, format!("unexpected token {:?}", other))),
        }
    }
}

/// Parses an expression without checking its references.
pub fn parse(src: &str) -> Result<Expr> {
    if src.trim().is_empty() {
        return Err(CelError::syntax(0, "empty expression"));
    }
    let tokens = lex(src)?;
    let mut parser = Parser { tokens, idx: 0 };
    let expr = parser.or()?;
    if *parser.peek() != Tok::Eof {
        return Err(CelError::syntax(
            parser.pos(),
            format!("unexpected token {:?}", parser.peek()),
        ));
    }
    Ok(expr)
}

// ============================================================================
// Checking
// ============================================================================

const FUNCTIONS: &[&str] = &["size", "timestamp"];
const METHODS: &[&str] = &["startsWith", "endsWith", "contains", "matches"];

/// Declared variables of an expression environment, as dotted paths.
///
/// A path like `resource.labels` also admits deeper selections such as
/// `resource.labels.tier`, since map contents are only known at runtime.
#[derive(Debug, Clone)]
pub struct Environment {
    declarations: Vec<String>,
}

impl Environment {
    pub fn new<I, S>(declarations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            declarations: declarations.into_iter().map(Into::into).collect(),
        }
    }

    fn declares(&self, path: &str) -> bool {
        self.declarations.iter().any(|d| {
            d == path
                || d.strip_prefix(path).is_some_and(|rest| rest.starts_with('.'))
                || path.strip_prefix(d.as_str()).is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Parses `src` and verifies every reference, function and literal
    /// regex against this environment.
    pub fn compile(&self, src: &str) -> Result<Program> {
        let expr = parse(src)?;
        let mut paths = Vec::new();
        expr.visit_paths(&mut paths);
        for path in paths {
            if !self.declares(&path) {
                return Err(CelError::UndeclaredReference(path));
            }
        }
        check_calls(&expr)?;
        Ok(Program {
            source: src.to_string(),
            expr,
        })
    }
}

fn check_calls(expr: &Expr) -> Result<()> {
    match expr {
        Expr::Call {
            target,
            function,
            args,
        } => {
            let known = if target.is_some() { METHODS } else { FUNCTIONS };
            if !known.contains(&function.as_str()) {
                return Err(CelError::UndeclaredReference(format!("{}()", function)));
            }
            if args.len() != 1 {
                return Err(CelError::InvalidArgument(format!(
                    "{}() takes exactly one argument",
                    function
                )));
            }
            if function == "matches" {
                if let Expr::Literal(Value::String(pattern)) = &args[0] {
                    Regex::new(pattern).map_err(|e| CelError::InvalidArgument(e.to_string()))?;
                }
            }
            if let Some(target) = target {
                check_calls(target)?;
            }
            args.iter().try_for_each(check_calls)
        }
        Expr::Literal(_) | Expr::Ident(_) => Ok(()),
        Expr::Select(target, _) => check_calls(target),
        Expr::Index(target, index) => {
            check_calls(target)?;
            check_calls(index)
        }
        Expr::List(items) => items.iter().try_for_each(check_calls),
        Expr::Unary(_, inner) => check_calls(inner),
        Expr::Binary(_, lhs, rhs) => {
            check_calls(lhs)?;
            check_calls(rhs)
        }
    }
}

/// A checked expression ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    source: String,
    expr: Expr,
}

impl Program {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn eval(&self, activation: &Activation) -> Result<Value> {
        eval(&self.expr, activation)
    }

    /// Evaluates to a boolean; any other result type is an error.
    pub fn eval_bool(&self, activation: &Activation) -> Result<bool> {
        match self.eval(activation)? {
            Value::Bool(b) => Ok(b),
            other => Err(CelError::InvalidArgument(format!(
                "expression must evaluate to bool, got {}",
                other.type_name()
            ))),
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

pub fn eval(expr: &Expr, activation: &Activation) -> Result<Value> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Ident(name) => activation
            .get(name)
            .cloned()
            .ok_or_else(|| CelError::UndeclaredReference(name.clone())),
        Expr::Select(target, field) => match eval(target, activation)? {
            Value::Map(map) => map
                .get(field)
                .cloned()
                .ok_or_else(|| CelError::NoSuchKey(field.clone())),
            other => Err(CelError::no_overload(".", &[&other])),
        },
        Expr::Index(target, index) => {
            let target = eval(target, activation)?;
            let index = eval(index, activation)?;
            match (&target, &index) {
                (Value::Map(map), Value::String(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| CelError::NoSuchKey(key.clone())),
                (Value::List(items), Value::Int(i)) => usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or_else(|| CelError::InvalidArgument(format!("index out of range: {}", i))),
                _ => Err(CelError::no_overload("[]", &[&target, &index])),
            }
        }
        Expr::List(items) => Ok(Value::List(
            items
                .iter()
                .map(|item| eval(item, activation))
                .collect::<Result<_>>()?,
        )),
        Expr::Unary(op, inner) => {
            let value = eval(inner, activation)?;
            match (op, &value) {
                (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
                (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
                (UnaryOp::Not, _) => Err(CelError::no_overload("!", &[&value])),
                (UnaryOp::Neg, _) => Err(CelError::no_overload("-", &[&value])),
            }
        }
        Expr::Binary(BinaryOp::And, lhs, rhs) => match eval(lhs, activation)? {
            Value::Bool(false) => Ok(Value::Bool(false)),
            Value::Bool(true) => expect_bool("&&", eval(rhs, activation)?),
            other => Err(CelError::no_overload("&&", &[&other])),
        },
        Expr::Binary(BinaryOp::Or, lhs, rhs) => match eval(lhs, activation)? {
            Value::Bool(true) => Ok(Value::Bool(true)),
            Value::Bool(false) => expect_bool("||", eval(rhs, activation)?),
            other => Err(CelError::no_overload("||", &[&other])),
        },
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval(lhs, activation)?;
            let rhs = eval(rhs, activation)?;
            binary(*op, &lhs, &rhs)
        }
        Expr::Call {
            target,
            function,
            args,
        } => {
            let args = args
                .iter()
                .map(|a| eval(a, activation))
                .collect::<Result<Vec<_>>>()?;
            match target {
                Some(target) => method(function, &eval(target, activation)?, &args),
                None => call(function, &args),
            }
        }
    }
}

fn expect_bool(op: &str, value: Value) -> Result<Value> {
    match value {
        Value::Bool(_) => Ok(value),
        other => Err(CelError::no_overload(op, &[&other])),
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    use std::cmp::Ordering;

    let ordering = |lhs: &Value, rhs: &Value| -> Option<Ordering> {
        match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            _ => None,
        }
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(lhs == rhs)),
        BinaryOp::Ne => Ok(Value::Bool(lhs != rhs)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = ordering(lhs, rhs)
                .ok_or_else(|| CelError::no_overload(op.as_str(), &[lhs, rhs]))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            }))
        }
        BinaryOp::In => match rhs {
            Value::List(items) => Ok(Value::Bool(items.contains(lhs))),
            Value::Map(map) => match lhs {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(CelError::no_overload("in", &[lhs, rhs])),
            },
            _ => Err(CelError::no_overload("in", &[lhs, rhs])),
        },
        BinaryOp::And | BinaryOp::Or => match (lhs, rhs) {
            (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if op == BinaryOp::And {
                *a && *b
            } else {
                *a || *b
            })),
            _ => Err(CelError::no_overload(op.as_str(), &[lhs, rhs])),
        },
    }
}

fn call(function: &str, args: &[Value]) -> Result<Value> {
    match (function, args) {
        ("size", [Value::String(s)]) => Ok(Value::Int(s.chars().count() as i64)),
        ("size", [Value::List(items)]) => Ok(Value::Int(items.len() as i64)),
        ("size", [Value::Map(map)]) => Ok(Value::Int(map.len() as i64)),
        ("timestamp", [Value::String(s)]) => DateTime::parse_from_rfc3339(s)
            .map(|t| Value::Timestamp(t.with_timezone(&Utc)))
            .map_err(|e| CelError::InvalidArgument(format!("timestamp({:?}): {}", s, e))),
        ("timestamp", [Value::Timestamp(t)]) => Ok(Value::Timestamp(*t)),
        ("size" | "timestamp", _) => Err(CelError::no_overload(
            function,
            &args.iter().collect::<Vec<_>>(),
        )),
        _ => Err(CelError::UndeclaredReference(format!("{}()", function))),
    }
}

fn method(function: &str, target: &Value, args: &[Value]) -> Result<Value> {
    let (Value::String(s), [Value::String(arg)]) = (target, args) else {
        let mut all = vec![target];
        all.extend(args.iter());
        return Err(CelError::no_overload(function, &all));
    };
    match function {
        "startsWith" => Ok(Value::Bool(s.starts_with(arg.as_str()))),
        "endsWith" => Ok(Value::Bool(s.ends_with(arg.as_str()))),
        "contains" => Ok(Value::Bool(s.contains(arg.as_str()))),
        "matches" => {
            let re = Regex::new(arg).map_err(|e| CelError::InvalidArgument(e.to_string()))?;
            Ok(Value::Bool(re.is_match(s)))
        }
        _ => Err(CelError::UndeclaredReference(format!("{}()", function))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Environment {
        Environment::new([
            "level",
            "source",
            "project_id",
            "resource.database_name",
            "resource.labels",
            "request.time",
        ])
    }

    fn activation() -> Activation {
        let mut act = Activation::new();
        act.insert("level", 300i64)
            .insert("source", "DDL")
            .insert("project_id", "p1")
            .insert("resource.database_name", "orders")
            .insert(
                "resource.labels",
                Value::Map(BTreeMap::from([("tier".to_string(), Value::from("gold"))])),
            )
            .insert(
                "request.time",
                DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            );
        act
    }

    fn eval_str(src: &str) -> Result<bool> {
        env().compile(src)?.eval_bool(&activation())
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert!(eval_str("level >= 200 && source == \"DDL\"").unwrap());
        assert!(!eval_str("level < 200 || project_id != 'p1'").unwrap());
        assert!(eval_str("!(level == 100)").unwrap());
        assert!(eval_str("source in [\"DML\", \"DDL\"]").unwrap());
        assert!(eval_str("level > -1").unwrap());
    }

    #[test]
    fn test_fields_functions_and_methods() {
        assert!(eval_str("resource.database_name.startsWith('ord')").unwrap());
        assert!(eval_str("resource.labels.tier == 'gold'").unwrap());
        assert!(eval_str("resource.labels['tier'] == 'gold'").unwrap());
        assert!(eval_str("'tier' in resource.labels").unwrap());
        assert!(eval_str("size(resource.database_name) == 6").unwrap());
        assert!(eval_str("resource.database_name.matches('^or.*s$')").unwrap());
        assert!(eval_str("request.time < timestamp('2024-07-01T00:00:00Z')").unwrap());
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        assert!(!eval_str("level == 1 && resource.labels.missing == 'x'").unwrap());
        assert!(matches!(
            eval_str("level == 300 && resource.labels.missing == 'x'"),
            Err(CelError::NoSuchKey(_))
        ));
    }

    #[test]
    fn test_compile_rejects_unknown_references() {
        assert!(matches!(
            env().compile("unknown == 1"),
            Err(CelError::UndeclaredReference(_))
        ));
        assert!(matches!(
            env().compile("resource.table_name == 'x'"),
            Err(CelError::UndeclaredReference(_))
        ));
        assert!(matches!(
            env().compile("now() == 1"),
            Err(CelError::UndeclaredReference(_))
        ));
        assert!(matches!(
            env().compile("source.matches('(')"),
            Err(CelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_syntax_errors_carry_position() {
        assert!(matches!(parse(""), Err(CelError::Syntax { .. })));
        assert!(matches!(parse("a == "), Err(CelError::Syntax { .. })));
        assert!(matches!(parse("a = 1"), Err(CelError::Syntax { pos: 2, .. })));
        assert!(matches!(parse("'open"), Err(CelError::Syntax { .. })));
        assert!(matches!(parse("a b"), Err(CelError::Syntax { .. })));
    }

    #[test]
    fn test_type_mismatch_is_no_overload() {
        assert!(matches!(
            eval_str("level < 'x'"),
            Err(CelError::NoOverload { .. })
        ));
        assert!(matches!(eval_str("level"), Err(CelError::InvalidArgument(_))));
    }

    #[test]
    fn test_conjuncts_and_paths() {
        let expr = parse("a == 1 && b.c >= 2 && d in ['x']").unwrap();
        let parts = expr.conjuncts();
        assert_eq!(parts.len(), 3);
        let Expr::Binary(BinaryOp::Ge, lhs, _) = parts[1] else {
            panic!("expected >=");
        };
        assert_eq!(lhs.ident_path().as_deref(), Some("b.c"));
    }
}
