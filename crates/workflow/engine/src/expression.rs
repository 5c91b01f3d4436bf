//! Condition expressions on gateway flows
//!
//! A small expression language evaluated against an instance's data bag:
//!
//! ```text
//! score >= 50 and not flagged
//! status == "approved" || retries < 3
//! applicant.country in ["IN", "NP"]
//! ```
//!
//! Supported: `or`/`||`, `and`/`&&`, `not`/`!`, comparisons
//! (`== != < <= > >=`), `in` / `not in`, unary minus, parentheses, list
//! literals, numbers, quoted strings, `true`/`false` (also `True`/`False`),
//! `null`/`None`, and dotted paths into nested objects and arrays.
//!
//! The result of a condition is the truthiness of its value. Referencing
//! a variable that is not in the data bag is an error, as is comparing
//! values of incompatible types.

use procflow_types::DataBag;
use serde_json::Value;

/// Errors raised while parsing or evaluating an expression
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("Syntax error at column {col}: {message}")]
    Syntax { col: usize, message: String },

    #[error("Unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("Cannot apply '{op}' to {lhs} and {rhs}")]
    TypeMismatch {
        op: &'static str,
        lhs: &'static str,
        rhs: &'static str,
    },
}

/// Parse and evaluate `input`, returning its truthiness
pub fn evaluate(input: &str, data: &DataBag) -> Result<bool, EvalError> {
    let expr = parse(input)?;
    Ok(truthy(&expr.eval(data)?))
}

/// Parse an expression without evaluating it
pub fn parse(input: &str) -> Result<Expr, EvalError> {
    let tokens = Lexer::new(input).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_or()?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(parser.error(format!("unexpected '{}'", other))),
    }
}

// ── Lexer ────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64, bool),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minus,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Eof,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n, _) => write!(f, "{}", n),
            Self::Str(s) => write!(f, "\"{}\"", s),
            Self::Ident(s) => write!(f, "{}", s),
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::Null => write!(f, "null"),
            Self::And => write!(f, "and"),
            Self::Or => write!(f, "or"),
            Self::Not => write!(f, "not"),
            Self::In => write!(f, "in"),
            Self::Eq => write!(f, "=="),
            Self::Ne => write!(f, "!="),
            Self::Lt => write!(f, "<"),
            Self::Le => write!(f, "<="),
            Self::Gt => write!(f, ">"),
            Self::Ge => write!(f, ">="),
            Self::Minus => write!(f, "-"),
            Self::Dot => write!(f, "."),
            Self::Comma => write!(f, ","),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

struct Lexer {
    input: Vec<char>,
    pos: usize,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            input: input.chars().collect(),
            pos: 0,
        }
    }

    /// Tokens paired with their 1-based column
    fn tokenize(&mut self) -> Result<Vec<(Token, usize)>, EvalError> {
        let mut tokens = Vec::new();
        loop {
            while self.peek_at(0).is_some_and(char::is_whitespace) {
                self.pos += 1;
            }
            let col = self.pos + 1;
            let Some(ch) = self.peek_at(0) else {
                tokens.push((Token::Eof, col));
                return Ok(tokens);
            };

            let token = match ch {
                '(' => self.single(Token::LParen),
                ')' => self.single(Token::RParen),
                '[' => self.single(Token::LBracket),
                ']' => self.single(Token::RBracket),
                ',' => self.single(Token::Comma),
                '.' => self.single(Token::Dot),
                '-' => self.single(Token::Minus),
                '=' if self.peek_at(1) == Some('=') => self.double(Token::Eq),
                '!' if self.peek_at(1) == Some('=') => self.double(Token::Ne),
                '!' => self.single(Token::Not),
                '<' if self.peek_at(1) == Some('=') => self.double(Token::Le),
                '<' => self.single(Token::Lt),
                '>' if self.peek_at(1) == Some('=') => self.double(Token::Ge),
                '>' => self.single(Token::Gt),
                '&' if self.peek_at(1) == Some('&') => self.double(Token::And),
                '|' if self.peek_at(1) == Some('|') => self.double(Token::Or),
                '"' | '\'' => self.read_string(ch, col)?,
                c if c.is_ascii_digit() => self.read_number(col)?,
                c if c.is_alphabetic() || c == '_' => self.read_word(),
                _ => {
                    return Err(EvalError::Syntax {
                        col,
                        message: format!("unexpected character '{}'", ch),
                    })
                }
            };
            tokens.push((token, col));
        }
    }

    fn single(&mut self, token: Token) -> Token {
        self.pos += 1;
        token
    }

    fn double(&mut self, token: Token) -> Token {
        self.pos += 2;
        token
    }

    fn read_string(&mut self, quote: char, col: usize) -> Result<Token, EvalError> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek_at(0) {
                None => {
                    return Err(EvalError::Syntax {
                        col,
                        message: "unterminated string literal".into(),
                    })
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(Token::Str(text));
                }
                Some('\\') => {
                    let escaped = match self.peek_at(1) {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some(other) => other,
                        None => '\\',
                    };
                    text.push(escaped);
                    self.pos += 2;
                }
                Some(c) => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn read_number(&mut self, col: usize) -> Result<Token, EvalError> {
        let start = self.pos;
        while self.peek_at(0).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        let mut integer = true;
        if self.peek_at(0) == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            integer = false;
            self.pos += 1;
            while self.peek_at(0).is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.input[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(|n| Token::Number(n, integer))
            .map_err(|_| EvalError::Syntax {
                col,
                message: format!("invalid number '{}'", text),
            })
    }

    fn read_word(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek_at(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        let word: String = self.input[start..self.pos].iter().collect();
        match word.as_str() {
            "and" => Token::And,
            "or" => Token::Or,
            "not" => Token::Not,
            "in" => Token::In,
            "true" | "True" => Token::True,
            "false" | "False" => Token::False,
            "null" | "None" => Token::Null,
            _ => Token::Ident(word),
        }
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.input.get(self.pos + offset).copied()
    }
}

// ── Syntax Tree ──────────────────────────────────────────────────────

/// A parsed condition expression
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted variable path, e.g. `applicant.scores.0`
    Path(Vec<String>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "in",
            Self::NotIn => "not in",
        }
    }
}

// ── Parser ───────────────────────────────────────────────────────────

/// Deepest nesting of groups, lists, prefix operators and operator chains
pub const MAX_DEPTH: usize = 64;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn peek_next(&self) -> &Token {
        self.tokens
            .get(self.pos + 1)
            .map(|(t, _)| t)
            .unwrap_or(&Token::Eof)
    }

    fn bump(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<(), EvalError> {
        if *self.peek() == expected {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found '{}'", expected, self.peek())))
        }
    }

    fn error(&self, message: String) -> EvalError {
        let col = self
            .tokens
            .get(self.pos)
            .or(self.tokens.last())
            .map(|(_, c)| *c)
            .unwrap_or(1);
        EvalError::Syntax { col, message }
    }

    /// Enter one nesting level; the caller leaves it once its node is built
    fn descend(&mut self) -> Result<(), EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!(
                "expression nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_and()?;
        let mut chained = 0;
        while *self.peek() == Token::Or {
            self.pos += 1;
            self.descend()?;
            chained += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.parse_not()?;
        let mut chained = 0;
        while *self.peek() == Token::And {
            self.pos += 1;
            self.descend()?;
            chained += 1;
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        self.depth -= chained;
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, EvalError> {
        if *self.peek() == Token::Not {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, EvalError> {
        let lhs = self.parse_unary()?;
        let (op, width) = match (self.peek(), self.peek_next()) {
            (Token::Eq, _) => (CompareOp::Eq, 1),
            (Token::Ne, _) => (CompareOp::Ne, 1),
            (Token::Lt, _) => (CompareOp::Lt, 1),
            (Token::Le, _) => (CompareOp::Le, 1),
            (Token::Gt, _) => (CompareOp::Gt, 1),
            (Token::Ge, _) => (CompareOp::Ge, 1),
            (Token::In, _) => (CompareOp::In, 1),
            (Token::Not, Token::In) => (CompareOp::NotIn, 2),
            _ => return Ok(lhs),
        };
        self.pos += width;
        let rhs = self.parse_unary()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if *self.peek() == Token::Minus {
            self.pos += 1;
            self.descend()?;
            let inner = self.parse_unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.bump() {
            Token::Number(n, integer) => Ok(Expr::Literal(number_value(n, integer))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Ident(first) => {
                let mut path = vec![first];
                while *self.peek() == Token::Dot {
                    self.pos += 1;
                    match self.bump() {
                        Token::Ident(segment) => path.push(segment),
                        Token::Number(n, true) => path.push(format!("{}", n as u64)),
                        other => {
                            self.pos = self.pos.saturating_sub(1);
                            return Err(self.error(format!("expected field name, found '{}'", other)));
                        }
                    }
                }
                Ok(Expr::Path(path))
            }
            Token::LParen => {
                self.descend()?;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Token::LBracket => {
                self.descend()?;
                let mut items = Vec::new();
                if *self.peek() != Token::RBracket {
                    loop {
                        items.push(self.parse_or()?);
                        if *self.peek() == Token::Comma {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket)?;
                self.depth -= 1;
                Ok(Expr::List(items))
            }
            other => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error(format!("unexpected '{}'", other)))
            }
        }
    }
}

fn number_value(n: f64, integer: bool) -> Value {
    if integer && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

// ── Evaluation ───────────────────────────────────────────────────────

impl Expr {
    /// Evaluate against `data`
    pub fn eval(&self, data: &DataBag) -> Result<Value, EvalError> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Path(path) => lookup(path, data).cloned(),
            Self::List(items) => items
                .iter()
                .map(|e| e.eval(data))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Not(inner) => Ok(Value::Bool(!truthy(&inner.eval(data)?))),
            Self::Neg(inner) => match inner.eval(data)? {
                Value::Number(n) => Ok(n
                    .as_i64()
                    .and_then(i64::checked_neg)
                    .map(Value::from)
                    .unwrap_or_else(|| number_value(-n.as_f64().unwrap_or(0.0), false))),
                other => Err(EvalError::TypeMismatch {
                    op: "-",
                    lhs: type_name(&other),
                    rhs: type_name(&other),
                }),
            },
            Self::And(lhs, rhs) => {
                if !truthy(&lhs.eval(data)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(truthy(&rhs.eval(data)?)))
            }
            Self::Or(lhs, rhs) => {
                if truthy(&lhs.eval(data)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(truthy(&rhs.eval(data)?)))
            }
            Self::Compare(op, lhs, rhs) => {
                let lhs = lhs.eval(data)?;
                let rhs = rhs.eval(data)?;
                compare(*op, &lhs, &rhs).map(Value::Bool)
            }
        }
    }
}

fn lookup<'a>(path: &[String], data: &'a DataBag) -> Result<&'a Value, EvalError> {
    let unknown = || EvalError::UnknownVariable(path.join("."));
    let (first, rest) = path.split_first().ok_or_else(unknown)?;
    let mut current = data.get(first).ok_or_else(unknown)?;
    for segment in rest {
        current = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
        .ok_or_else(unknown)?;
    }
    Ok(current)
}

fn compare(op: CompareOp, lhs: &Value, rhs: &Value) -> Result<bool, EvalError> {
    let mismatch = || EvalError::TypeMismatch {
        op: op.symbol(),
        lhs: type_name(lhs),
        rhs: type_name(rhs),
    };

    match op {
        CompareOp::Eq => Ok(loose_eq(lhs, rhs)),
        CompareOp::Ne => Ok(!loose_eq(lhs, rhs)),
        CompareOp::In | CompareOp::NotIn => {
            let found = match (lhs, rhs) {
                (_, Value::Array(items)) => items.iter().any(|item| loose_eq(lhs, item)),
                (Value::String(needle), Value::String(haystack)) => haystack.contains(needle.as_str()),
                (Value::String(key), Value::Object(map)) => map.contains_key(key),
                _ => return Err(mismatch()),
            };
            Ok(found == (op == CompareOp::In))
        }
        CompareOp::Lt | CompareOp::Le | CompareOp::Gt | CompareOp::Ge => {
            let ordering = match (lhs, rhs) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .zip(b.as_f64())
                    .and_then(|(a, b)| a.partial_cmp(&b)),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            }
            .ok_or_else(mismatch)?;
            Ok(match op {
                CompareOp::Lt => ordering.is_lt(),
                CompareOp::Le => ordering.is_le(),
                CompareOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            })
        }
    }
}

/// Equality that treats `1` and `1.0` as equal
fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => lhs == rhs,
    }
}

/// Truthiness: null, false, zero, and empty strings, arrays and objects
/// are false
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
