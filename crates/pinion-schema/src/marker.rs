//! Environment markers.
//!
//! Markers are boolean conditions over interpreter/platform attributes
//! that gate whether a requirement applies, e.g.
//! `python_version < "3.9" and sys_platform == "linux"`. They are parsed
//! into a small typed expression tree and evaluated by an explicit
//! interpreter over a fixed attribute set; the textual form round-trips
//! through `Display` so lock artifacts carry markers unevaluated.

use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use thiserror::Error;

/// Error produced when a marker expression cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MarkerError {
    /// Unexpected token or end of input.
    #[error("invalid marker '{0}': syntax error near '{1}'")]
    Syntax(String, String),
    /// An attribute name outside the fixed set.
    #[error("invalid marker '{0}': unknown attribute '{1}'")]
    UnknownKey(String, String),
}

/// The closed set of attributes a marker may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKey {
    /// `python_version`: `major.minor`, compared as a version.
    PythonVersion,
    /// `python_full_version`: full interpreter version.
    PythonFullVersion,
    /// `sys_platform`: e.g. `linux`, `darwin`, `win32`.
    SysPlatform,
    /// `os_name`: e.g. `posix`, `nt`.
    OsName,
    /// `platform_machine`: e.g. `x86_64`, `arm64`.
    PlatformMachine,
    /// `platform_system`: e.g. `Linux`, `Darwin`, `Windows`.
    PlatformSystem,
    /// `implementation_name`: e.g. `cpython`.
    ImplementationName,
    /// `extra`: set during extras expansion, empty otherwise.
    Extra,
}

impl MarkerKey {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "python_version" => Self::PythonVersion,
            "python_full_version" => Self::PythonFullVersion,
            "sys_platform" => Self::SysPlatform,
            "os_name" => Self::OsName,
            "platform_machine" => Self::PlatformMachine,
            "platform_system" => Self::PlatformSystem,
            "implementation_name" => Self::ImplementationName,
            "extra" => Self::Extra,
            _ => return None,
        })
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::PythonVersion => "python_version",
            Self::PythonFullVersion => "python_full_version",
            Self::SysPlatform => "sys_platform",
            Self::OsName => "os_name",
            Self::PlatformMachine => "platform_machine",
            Self::PlatformSystem => "platform_system",
            Self::ImplementationName => "implementation_name",
            Self::Extra => "extra",
        }
    }

    /// Keys whose values compare as versions rather than strings.
    fn is_version_valued(self) -> bool {
        matches!(self, Self::PythonVersion | Self::PythonFullVersion)
    }
}

/// Comparison operator inside a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerOp {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `in`: substring containment.
    In,
    /// `not in`
    NotIn,
}

impl MarkerOp {
    fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

/// One side of a marker comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerOperand {
    /// An environment attribute.
    Key(MarkerKey),
    /// A quoted literal.
    Literal(String),
}

/// A parsed marker expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarkerExpr {
    /// `lhs op rhs`
    Comparison {
        /// Left operand.
        lhs: MarkerOperand,
        /// Comparison operator.
        op: MarkerOp,
        /// Right operand.
        rhs: MarkerOperand,
    },
    /// Conjunction.
    And(Box<MarkerExpr>, Box<MarkerExpr>),
    /// Disjunction.
    Or(Box<MarkerExpr>, Box<MarkerExpr>),
}

/// Attribute values for one target interpreter/platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerEnvironment(BTreeMap<MarkerKey, String>);

impl MarkerEnvironment {
    /// Build an environment from attribute pairs; missing keys evaluate
    /// as the empty string.
    pub fn new(attrs: impl IntoIterator<Item = (MarkerKey, String)>) -> Self {
        Self(attrs.into_iter().collect())
    }

    /// Set one attribute, returning the previous value if any.
    pub fn set(&mut self, key: MarkerKey, value: impl Into<String>) -> Option<String> {
        self.0.insert(key, value.into())
    }

    /// Look up an attribute; absent keys read as empty.
    pub fn get(&self, key: MarkerKey) -> &str {
        self.0.get(&key).map_or("", String::as_str)
    }

    /// A CPython-on-Linux environment used as a test baseline.
    pub fn linux_cpython(python_version: &str) -> Self {
        let full = format!("{python_version}.0");
        Self::new([
            (MarkerKey::PythonVersion, python_version.to_string()),
            (MarkerKey::PythonFullVersion, full),
            (MarkerKey::SysPlatform, "linux".to_string()),
            (MarkerKey::OsName, "posix".to_string()),
            (MarkerKey::PlatformMachine, "x86_64".to_string()),
            (MarkerKey::PlatformSystem, "Linux".to_string()),
            (MarkerKey::ImplementationName, "cpython".to_string()),
        ])
    }
}

impl MarkerExpr {
    /// Parse a marker expression.
    ///
    /// # Errors
    ///
    /// Returns [`MarkerError`] on malformed syntax or an attribute name
    /// outside the fixed set.
    pub fn parse(s: &str) -> Result<Self, MarkerError> {
        let tokens = tokenize(s).ok_or_else(|| MarkerError::Syntax(s.to_string(), s.to_string()))?;
        let mut parser = Parser {
            source: s,
            tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(MarkerError::Syntax(
                s.to_string(),
                parser.tokens[parser.pos].text(),
            ));
        }
        Ok(expr)
    }

    /// Evaluate against a target environment.
    ///
    /// Version-valued attributes compare as versions when both sides
    /// parse; everything else compares as strings.
    pub fn evaluate(&self, env: &MarkerEnvironment) -> bool {
        match self {
            Self::And(a, b) => a.evaluate(env) && b.evaluate(env),
            Self::Or(a, b) => a.evaluate(env) || b.evaluate(env),
            Self::Comparison { lhs, op, rhs } => {
                let resolve = |operand: &MarkerOperand| -> (String, bool) {
                    match operand {
                        MarkerOperand::Key(k) => (env.get(*k).to_string(), k.is_version_valued()),
                        MarkerOperand::Literal(v) => (v.clone(), false),
                    }
                };
                let (left, left_ver) = resolve(lhs);
                let (right, right_ver) = resolve(rhs);
                compare(&left, *op, &right, left_ver || right_ver)
            }
        }
    }
}

fn compare(left: &str, op: MarkerOp, right: &str, as_version: bool) -> bool {
    if as_version {
        if let (Ok(l), Ok(r)) = (Version::parse(left), Version::parse(right)) {
            return match op {
                MarkerOp::Eq => l == r,
                MarkerOp::Ne => l != r,
                MarkerOp::Ge => l >= r,
                MarkerOp::Le => l <= r,
                MarkerOp::Gt => l > r,
                MarkerOp::Lt => l < r,
                MarkerOp::In => right.contains(left),
                MarkerOp::NotIn => !right.contains(left),
            };
        }
    }
    match op {
        MarkerOp::Eq => left == right,
        MarkerOp::Ne => left != right,
        MarkerOp::Ge => left >= right,
        MarkerOp::Le => left <= right,
        MarkerOp::Gt => left > right,
        MarkerOp::Lt => left < right,
        MarkerOp::In => right.contains(left),
        MarkerOp::NotIn => !right.contains(left),
    }
}

impl std::fmt::Display for MarkerExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::And(a, b) => {
                write_operand_expr(f, a)?;
                write!(f, " and ")?;
                write_operand_expr(f, b)
            }
            Self::Or(a, b) => {
                write_operand_expr(f, a)?;
                write!(f, " or ")?;
                write_operand_expr(f, b)
            }
            Self::Comparison { lhs, op, rhs } => {
                write_operand(f, lhs)?;
                write!(f, " {} ", op.as_str())?;
                write_operand(f, rhs)
            }
        }
    }
}

fn write_operand_expr(f: &mut std::fmt::Formatter<'_>, e: &MarkerExpr) -> std::fmt::Result {
    // Parenthesize nested or-groups so precedence survives the round trip
    if matches!(e, MarkerExpr::Or(..)) {
        write!(f, "({e})")
    } else {
        write!(f, "{e}")
    }
}

fn write_operand(f: &mut std::fmt::Formatter<'_>, o: &MarkerOperand) -> std::fmt::Result {
    match o {
        MarkerOperand::Key(k) => write!(f, "{}", k.as_str()),
        MarkerOperand::Literal(v) => write!(f, "'{v}'"),
    }
}

impl FromStr for MarkerExpr {
    type Err = MarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Literal(String),
    Symbol(String),
    Open,
    Close,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Self::Word(s) | Self::Literal(s) | Self::Symbol(s) => s.clone(),
            Self::Open => "(".to_string(),
            Self::Close => ")".to_string(),
        }
    }
}

fn tokenize(s: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut lit = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => lit.push(ch),
                        None => return None,
                    }
                }
                tokens.push(Token::Literal(lit));
            }
            '=' | '!' | '<' | '>' | '~' => {
                let mut sym = String::new();
                sym.push(c);
                chars.next();
                if chars.peek() == Some(&'=') {
                    sym.push('=');
                    chars.next();
                }
                tokens.push(Token::Symbol(sym));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if word.is_empty() {
                    return None;
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Some(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn syntax_error(&self) -> MarkerError {
        let near = self
            .peek()
            .map_or_else(|| "end of input".to_string(), Token::text);
        MarkerError::Syntax(self.source.to_string(), near)
    }

    fn parse_or(&mut self) -> Result<MarkerExpr, MarkerError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Word(w)) if w == "or") {
            self.next();
            let right = self.parse_and()?;
            left = MarkerExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<MarkerExpr, MarkerError> {
        let mut left = self.parse_atom()?;
        while matches!(self.peek(), Some(Token::Word(w)) if w == "and") {
            self.next();
            let right = self.parse_atom()?;
            left = MarkerExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<MarkerExpr, MarkerError> {
        if matches!(self.peek(), Some(Token::Open)) {
            self.next();
            let inner = self.parse_or()?;
            match self.next() {
                Some(Token::Close) => Ok(inner),
                _ => Err(self.syntax_error()),
            }
        } else {
            self.parse_comparison()
        }
    }

    fn parse_comparison(&mut self) -> Result<MarkerExpr, MarkerError> {
        let lhs = self.parse_operand()?;
        let op = self.parse_op()?;
        let rhs = self.parse_operand()?;
        Ok(MarkerExpr::Comparison { lhs, op, rhs })
    }

    fn parse_operand(&mut self) -> Result<MarkerOperand, MarkerError> {
        match self.next() {
            Some(Token::Literal(v)) => Ok(MarkerOperand::Literal(v)),
            Some(Token::Word(w)) => MarkerKey::parse(&w)
                .map(MarkerOperand::Key)
                .ok_or_else(|| MarkerError::UnknownKey(self.source.to_string(), w)),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.syntax_error())
            }
        }
    }

    fn parse_op(&mut self) -> Result<MarkerOp, MarkerError> {
        match self.next() {
            Some(Token::Symbol(sym)) => match sym.as_str() {
                "==" => Ok(MarkerOp::Eq),
                "!=" => Ok(MarkerOp::Ne),
                ">=" => Ok(MarkerOp::Ge),
                "<=" => Ok(MarkerOp::Le),
                ">" => Ok(MarkerOp::Gt),
                "<" => Ok(MarkerOp::Lt),
                _ => {
                    self.pos -= 1;
                    Err(self.syntax_error())
                }
            },
            Some(Token::Word(w)) if w == "in" => Ok(MarkerOp::In),
            Some(Token::Word(w)) if w == "not" => match self.next() {
                Some(Token::Word(w2)) if w2 == "in" => Ok(MarkerOp::NotIn),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    Err(self.syntax_error())
                }
            },
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.syntax_error())
            }
        }
    }
}
