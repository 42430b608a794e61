// Match expressions decide which targets a rule applies to.
//
// Expressions are written in a small, statically checked predicate language:
//
//   target.alias == 'foo' && target.labels['env'] != 'dev'
//   !(target.annotations.runtime.PORT < 9000) || target.connectUrl == 'x'
//
// Grammar (lowest to highest precedence):
//
//   or         := and ( '||' and )*
//   and        := unary ( '&&' unary )*
//   unary      := '!' unary | comparison
//   comparison := primary ( ( '==' | '!=' | '<' | '<=' | '>' | '>=' ) primary )?
//   primary    := '(' or ')' | attribute | string | number | true | false | null
//   attribute  := 'target' '.' ( 'alias' | 'connectUrl'
//                              | 'labels' key
//                              | 'annotations' '.' ( 'platform' | 'runtime' ) key )
//   key        := '.' identifier | '[' string ']'
//
// Everything outside this grammar is rejected while compiling: loops,
// statement separators, blocks, assignments, function definitions and
// calls, and references to anything other than the `target` namespace.
// A compiled expression is a finite tree, so evaluation always terminates
// and has no side effects.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::target::Target;

/// Deepest allowed nesting of parentheses and negations.
const MAX_NESTING_DEPTH: usize = 64;

// ============================================================================
// ERRORS
// ============================================================================

/// A match expression was refused by static validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("matchExpression rejected, illegal {kind} at offset {offset}: {detail}")]
pub struct IllegalMatchExpression {
    kind: String,
    offset: usize,
    detail: String,
}

impl IllegalMatchExpression {
    fn new(kind: impl Into<String>, offset: usize, detail: impl Into<String>) -> Self {
        IllegalMatchExpression {
            kind: kind.into(),
            offset,
            detail: detail.into(),
        }
    }

    /// Category of the rejected construct, e.g. "loop construct".
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Byte offset into the expression where the problem starts.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

// ============================================================================
// COMPILED EXPRESSION TREE
// ============================================================================

/// Compiled boolean predicate over a target's attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MatchExpression {
    /// Always matches (`true`)
    Always,

    /// Never matches (`false`)
    Never,

    /// Compare two operands
    Compare(FieldComparison),

    /// Logical AND: all sub-expressions must match.
    And(Vec<MatchExpression>),

    /// Logical OR: at least one sub-expression must match.
    Or(Vec<MatchExpression>),

    /// Logical NOT: inverts the result.
    Not(Box<MatchExpression>),
}

impl MatchExpression {
    /// Parses and statically validates an expression.
    pub fn compile(source: &str) -> Result<Self, IllegalMatchExpression> {
        let tokens = tokenize(source)?;
        reject_forbidden(&tokens)?;

        let mut parser = Parser {
            tokens,
            pos: 0,
            end: source.len(),
            depth: 0,
        };
        let expression = parser.parse_or()?;
        if let Some(extra) = parser.peek() {
            return Err(IllegalMatchExpression::new(
                "trailing input",
                extra.offset,
                format!("unexpected {}", extra.token.describe()),
            ));
        }
        Ok(expression)
    }

    /// Evaluates the predicate against a target.
    pub fn evaluate(&self, target: &Target) -> bool {
        match self {
            MatchExpression::Always => true,
            MatchExpression::Never => false,
            MatchExpression::Compare(comparison) => comparison.evaluate(target),
            MatchExpression::And(exprs) => exprs.iter().all(|expr| expr.evaluate(target)),
            MatchExpression::Or(exprs) => exprs.iter().any(|expr| expr.evaluate(target)),
            MatchExpression::Not(expr) => !expr.evaluate(target),
        }
    }
}

/// `left <op> right`, where each side is an attribute or a literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldComparison {
    pub left: Operand,
    pub operator: ComparisonOp,
    pub right: Operand,
}

impl FieldComparison {
    pub fn evaluate(&self, target: &Target) -> bool {
        let left = self.left.resolve(target);
        let right = self.right.resolve(target);
        match self.operator {
            ComparisonOp::Equal => left.loosely_equals(&right),
            ComparisonOp::NotEqual => !left.loosely_equals(&right),
            ComparisonOp::LessThan => left.order(&right).map_or(false, |o| o.is_lt()),
            ComparisonOp::LessThanOrEqual => left.order(&right).map_or(false, |o| o.is_le()),
            ComparisonOp::GreaterThan => left.order(&right).map_or(false, |o| o.is_gt()),
            ComparisonOp::GreaterThanOrEqual => left.order(&right).map_or(false, |o| o.is_ge()),
        }
    }
}

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Attribute(Attribute),
    Value(FieldValue),
}

impl Operand {
    fn resolve(&self, target: &Target) -> FieldValue {
        match self {
            Operand::Attribute(attribute) => attribute.resolve(target),
            Operand::Value(value) => value.clone(),
        }
    }
}

/// The fixed attribute namespace exposed to expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attribute {
    Alias,
    ConnectUrl,
    Label(String),
    PlatformAnnotation(String),
    RuntimeAnnotation(String),
}

impl Attribute {
    /// Looks the attribute up on a target. Missing keys resolve to `Null`.
    pub fn resolve(&self, target: &Target) -> FieldValue {
        let found = match self {
            Attribute::Alias => Some(target.alias()),
            Attribute::ConnectUrl => Some(target.id().as_str()),
            Attribute::Label(key) => target.labels().get(key).map(String::as_str),
            Attribute::PlatformAnnotation(key) => {
                target.platform_annotations().get(key).map(String::as_str)
            }
            Attribute::RuntimeAnnotation(key) => {
                target.runtime_annotations().get(key).map(String::as_str)
            }
        };
        found.map_or(FieldValue::Null, FieldValue::from)
    }
}

/// Runtime values flowing through a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Null,
}

impl FieldValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    // Strings that look like numbers compare equal to those numbers, since
    // every discovered attribute arrives as a string.
    fn loosely_equals(&self, other: &FieldValue) -> bool {
        match (self, other) {
            (FieldValue::Number(_), FieldValue::String(_))
            | (FieldValue::String(_), FieldValue::Number(_)) => {
                match (self.as_number(), other.as_number()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                }
            }
            _ => self == other,
        }
    }

    fn order(&self, other: &FieldValue) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (FieldValue::String(a), FieldValue::String(b)) => Some(a.cmp(b)),
            (FieldValue::Null, _) | (_, FieldValue::Null) => None,
            (FieldValue::Boolean(_), _) | (_, FieldValue::Boolean(_)) => None,
            _ => self.as_number()?.partial_cmp(&other.as_number()?),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::String(s.to_string())
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Boolean(b)
    }
}

// ============================================================================
// EVALUATOR CONTRACT
// ============================================================================

/// Validates and evaluates match expressions.
///
/// Rule construction only depends on this contract; the automation engine
/// evaluates through it so alternative evaluators can be injected.
pub trait MatchExpressionEvaluator: Send + Sync {
    /// Statically checks an expression without evaluating it.
    fn validate(&self, expression: &str) -> Result<(), IllegalMatchExpression>;

    /// Evaluates an expression against a target's attributes.
    fn evaluate(&self, expression: &str, target: &Target) -> Result<bool, IllegalMatchExpression>;

    /// Drops any state kept for an expression no rule uses anymore.
    fn forget(&self, _expression: &str) {}
}

/// Default number of compiled expressions kept by `CompiledEvaluator`.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Default evaluator: compiles each distinct expression once and caches the
/// compiled tree, holding at most `capacity` entries.
#[derive(Debug)]
pub struct CompiledEvaluator {
    cache: RwLock<HashMap<String, Arc<MatchExpression>>>,
    capacity: usize,
}

impl Default for CompiledEvaluator {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CACHE_CAPACITY)
    }
}

impl CompiledEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns the compiled form of an expression, compiling on first use.
    pub fn compiled(&self, expression: &str) -> Result<Arc<MatchExpression>, IllegalMatchExpression> {
        if let Some(hit) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(expression)
        {
            return Ok(Arc::clone(hit));
        }

        let compiled = Arc::new(MatchExpression::compile(expression)?);
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        if cache.len() >= self.capacity && !cache.contains_key(expression) {
            // Full: make room by dropping an arbitrary entry.
            if let Some(victim) = cache.keys().next().cloned() {
                cache.remove(&victim);
            }
        }
        cache.insert(expression.to_string(), Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Number of distinct expressions compiled so far.
    pub fn cached_len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl MatchExpressionEvaluator for CompiledEvaluator {
    fn validate(&self, expression: &str) -> Result<(), IllegalMatchExpression> {
        self.compiled(expression).map(|_| ())
    }

    fn evaluate(&self, expression: &str, target: &Target) -> Result<bool, IllegalMatchExpression> {
        Ok(self.compiled(expression)?.evaluate(target))
    }

    fn forget(&self, expression: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(expression);
    }
}

// ============================================================================
// LEXER
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    AndAnd,
    OrOr,
    Bang,
    Op(ComparisonOp),
    // Lexed only so they can be rejected with a precise message
    Semicolon,
    LBrace,
    RBrace,
    Assign,
    Arrow,
    Comma,
    Other(char),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("identifier '{}'", name),
            Token::Str(s) => format!("string '{}'", s),
            Token::Number(n) => format!("number {}", n),
            Token::Dot => "'.'".to_string(),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::AndAnd => "'&&'".to_string(),
            Token::OrOr => "'||'".to_string(),
            Token::Bang => "'!'".to_string(),
            Token::Op(op) => format!("operator {:?}", op),
            Token::Semicolon => "';'".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::Assign => "'='".to_string(),
            Token::Arrow => "'=>'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Other(c) => format!("'{}'", c),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    offset: usize,
}

fn tokenize(source: &str) -> Result<Vec<Spanned>, IllegalMatchExpression> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let token = if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let mut ident = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_ascii_alphanumeric() || c == '_' || c == '$' {
                    ident.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            Token::Ident(ident)
        } else if c.is_ascii_digit() {
            let mut literal = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if c.is_ascii_digit() || c == '.' {
                    literal.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            let number = literal.parse::<f64>().map_err(|_| {
                IllegalMatchExpression::new("number literal", offset, literal.clone())
            })?;
            Token::Number(number)
        } else if c == '\'' || c == '"' {
            chars.next();
            Token::Str(lex_string(&mut chars, c, offset)?)
        } else {
            chars.next();
            let next = chars.peek().map(|&(_, n)| n);
            match (c, next) {
                ('=', Some('=')) => {
                    chars.next();
                    if chars.peek().map(|&(_, n)| n) == Some('=') {
                        chars.next();
                    }
                    Token::Op(ComparisonOp::Equal)
                }
                ('=', Some('>')) => {
                    chars.next();
                    Token::Arrow
                }
                ('=', _) => Token::Assign,
                ('!', Some('=')) => {
                    chars.next();
                    if chars.peek().map(|&(_, n)| n) == Some('=') {
                        chars.next();
                    }
                    Token::Op(ComparisonOp::NotEqual)
                }
                ('!', _) => Token::Bang,
                ('<', Some('=')) => {
                    chars.next();
                    Token::Op(ComparisonOp::LessThanOrEqual)
                }
                ('<', _) => Token::Op(ComparisonOp::LessThan),
                ('>', Some('=')) => {
                    chars.next();
                    Token::Op(ComparisonOp::GreaterThanOrEqual)
                }
                ('>', _) => Token::Op(ComparisonOp::GreaterThan),
                ('&', Some('&')) => {
                    chars.next();
                    Token::AndAnd
                }
                ('|', Some('|')) => {
                    chars.next();
                    Token::OrOr
                }
                ('-', Some(d)) if d.is_ascii_digit() => {
                    let mut literal = String::from("-");
                    while let Some(&(_, c)) = chars.peek() {
                        if c.is_ascii_digit() || c == '.' {
                            literal.push(c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let number = literal.parse::<f64>().map_err(|_| {
                        IllegalMatchExpression::new("number literal", offset, literal.clone())
                    })?;
                    Token::Number(number)
                }
                ('.', _) => Token::Dot,
                ('[', _) => Token::LBracket,
                (']', _) => Token::RBracket,
                ('(', _) => Token::LParen,
                (')', _) => Token::RParen,
                (';', _) => Token::Semicolon,
                ('{', _) => Token::LBrace,
                ('}', _) => Token::RBrace,
                (',', _) => Token::Comma,
                (other, _) => Token::Other(other),
            }
        };

        tokens.push(Spanned { token, offset });
    }

    Ok(tokens)
}

fn lex_string(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    quote: char,
    offset: usize,
) -> Result<String, IllegalMatchExpression> {
    let mut value = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped)) => value.push(escaped),
                None => break,
            },
            c if c == quote => return Ok(value),
            c => value.push(c),
        }
    }
    Err(IllegalMatchExpression::new(
        "string literal",
        offset,
        "unterminated string",
    ))
}

/// Classifies identifiers that may never appear in an expression.
fn forbidden_identifier(name: &str) -> Option<&'static str> {
    match name {
        "while" | "for" | "do" | "continue" | "break" | "goto" | "loop" => Some("loop construct"),
        "function" | "class" | "return" | "var" | "let" | "const" | "new" | "eval" | "import"
        | "require" | "yield" | "async" | "await" => Some("function or script definition"),
        "exit" | "quit" | "halt" | "abort" | "kill" => Some("process exit call"),
        "System" | "java" | "Java" | "javax" | "process" | "Runtime" | "globalThis"
        | "window" | "this" | "Packages" => Some("host reference"),
        _ => None,
    }
}

// Reject by token before parsing so that, for example, `while (true) ...`
// reports the loop rather than a generic syntax error.
fn reject_forbidden(tokens: &[Spanned]) -> Result<(), IllegalMatchExpression> {
    for spanned in tokens {
        let kind = match &spanned.token {
            Token::Ident(name) => match forbidden_identifier(name) {
                Some(kind) => kind,
                None => continue,
            },
            Token::Semicolon => "statement separator",
            Token::LBrace | Token::RBrace => "block",
            Token::Assign => "assignment",
            Token::Arrow => "function or script definition",
            _ => continue,
        };
        return Err(IllegalMatchExpression::new(
            kind,
            spanned.offset,
            spanned.token.describe(),
        ));
    }
    Ok(())
}

// ============================================================================
// PARSER
// ============================================================================

// The parser distinguishes boolean-valued nodes from plain operands so that
// `target.alias` on its own, or `'a' && 'b'`, is rejected statically.
enum Parsed {
    Bool(MatchExpression),
    Operand(Operand, usize),
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Spanned> {
        let spanned = self.tokens.get(self.pos).cloned();
        if spanned.is_some() {
            self.pos += 1;
        }
        spanned
    }

    fn offset(&self) -> usize {
        self.peek().map_or(self.end, |s| s.offset)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().map(|s| &s.token) == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn unexpected(&self, expected: &str) -> IllegalMatchExpression {
        match self.peek() {
            Some(spanned) => IllegalMatchExpression::new(
                "syntax",
                spanned.offset,
                format!("expected {}, found {}", expected, spanned.token.describe()),
            ),
            None => IllegalMatchExpression::new(
                "syntax",
                self.end,
                format!("expected {}, found end of expression", expected),
            ),
        }
    }

    fn enter(&mut self) -> Result<(), IllegalMatchExpression> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(IllegalMatchExpression::new(
                "nesting depth",
                self.offset(),
                format!("more than {} nested groups", MAX_NESTING_DEPTH),
            ));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<MatchExpression, IllegalMatchExpression> {
        let mut terms = vec![self.parse_and()?];
        while self.eat(&Token::OrOr) {
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            MatchExpression::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<MatchExpression, IllegalMatchExpression> {
        let mut terms = vec![self.parse_unary()?];
        while self.eat(&Token::AndAnd) {
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            MatchExpression::And(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<MatchExpression, IllegalMatchExpression> {
        if self.eat(&Token::Bang) {
            self.enter()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(MatchExpression::Not(Box::new(inner)));
        }
        match self.parse_comparison()? {
            Parsed::Bool(expr) => Ok(expr),
            Parsed::Operand(Operand::Value(FieldValue::Boolean(true)), _) => {
                Ok(MatchExpression::Always)
            }
            Parsed::Operand(Operand::Value(FieldValue::Boolean(false)), _) => {
                Ok(MatchExpression::Never)
            }
            Parsed::Operand(_, offset) => Err(IllegalMatchExpression::new(
                "non-boolean expression",
                offset,
                "a bare attribute or literal is not a predicate; compare it with a value",
            )),
        }
    }

    fn parse_comparison(&mut self) -> Result<Parsed, IllegalMatchExpression> {
        let left = self.parse_primary()?;
        let operator = match self.peek().map(|s| &s.token) {
            Some(Token::Op(op)) => *op,
            _ => return Ok(left),
        };
        let operator_offset = self.offset();
        self.pos += 1;
        let right = self.parse_primary()?;

        match (left, right) {
            (Parsed::Operand(left, _), Parsed::Operand(right, _)) => {
                Ok(Parsed::Bool(MatchExpression::Compare(FieldComparison {
                    left,
                    operator,
                    right,
                })))
            }
            _ => Err(IllegalMatchExpression::new(
                "comparison operand",
                operator_offset,
                "only attributes and literals can be compared",
            )),
        }
    }

    fn parse_primary(&mut self) -> Result<Parsed, IllegalMatchExpression> {
        let Some(spanned) = self.next() else {
            return Err(self.unexpected("an attribute, literal or '('"));
        };
        let offset = spanned.offset;

        match spanned.token {
            Token::LParen => {
                self.enter()?;
                let inner = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.unexpected("')'"));
                }
                self.depth -= 1;
                Ok(Parsed::Bool(inner))
            }
            Token::Str(s) => Ok(Parsed::Operand(Operand::Value(FieldValue::String(s)), offset)),
            Token::Number(n) => Ok(Parsed::Operand(Operand::Value(FieldValue::Number(n)), offset)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Parsed::Operand(Operand::Value(FieldValue::Boolean(true)), offset)),
                "false" => Ok(Parsed::Operand(Operand::Value(FieldValue::Boolean(false)), offset)),
                "null" | "undefined" => Ok(Parsed::Operand(Operand::Value(FieldValue::Null), offset)),
                "target" => {
                    let attribute = self.parse_attribute(offset)?;
                    if self.peek().map(|s| &s.token) == Some(&Token::LParen) {
                        return Err(IllegalMatchExpression::new(
                            "function call",
                            self.offset(),
                            "attributes cannot be called",
                        ));
                    }
                    Ok(Parsed::Operand(Operand::Attribute(attribute), offset))
                }
                _ => Err(IllegalMatchExpression::new(
                    "reference",
                    offset,
                    format!("unknown name '{}', only 'target' is in scope", name),
                )),
            },
            other => {
                self.pos -= 1;
                Err(self.unexpected(&format!(
                    "an attribute, literal or '(' instead of {}",
                    other.describe()
                )))
            }
        }
    }

    fn parse_attribute(&mut self, start: usize) -> Result<Attribute, IllegalMatchExpression> {
        let member = self.member_name()?;
        match member.as_str() {
            "alias" => Ok(Attribute::Alias),
            "connectUrl" => Ok(Attribute::ConnectUrl),
            "labels" => Ok(Attribute::Label(self.key()?)),
            "annotations" => {
                let group = self.member_name()?;
                match group.as_str() {
                    "platform" => Ok(Attribute::PlatformAnnotation(self.key()?)),
                    "runtime" => Ok(Attribute::RuntimeAnnotation(self.key()?)),
                    other => Err(IllegalMatchExpression::new(
                        "attribute reference",
                        start,
                        format!("target.annotations.{} does not exist", other),
                    )),
                }
            }
            other => Err(IllegalMatchExpression::new(
                "attribute reference",
                start,
                format!("target.{} does not exist", other),
            )),
        }
    }

    /// `.name`
    fn member_name(&mut self) -> Result<String, IllegalMatchExpression> {
        if !self.eat(&Token::Dot) {
            return Err(self.unexpected("'.'"));
        }
        match self.next() {
            Some(Spanned {
                token: Token::Ident(name),
                ..
            }) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(self.unexpected("a member name"))
            }
        }
    }

    /// `.key` or `['key']`
    fn key(&mut self) -> Result<String, IllegalMatchExpression> {
        if self.peek().map(|s| &s.token) == Some(&Token::Dot) {
            return self.member_name();
        }
        if !self.eat(&Token::LBracket) {
            return Err(self.unexpected("'.' or '['"));
        }
        let key = match self.next() {
            Some(Spanned {
                token: Token::Str(key),
                ..
            }) => key,
            _ => {
                self.pos -= 1;
                return Err(self.unexpected("a quoted key"));
            }
        };
        if !self.eat(&Token::RBracket) {
            return Err(self.unexpected("']'"));
        }
        Ok(key)
    }
}
