//! `installable_condition` / `condition` expression evaluator.
//!
//! Written in the same unadorned, hand-rolled-parser style as
//! `store_config::ConfigPath`'s string parsing: a recursive-descent
//! parser over `AND`/`OR`/`NOT`, comparisons, `IN`, and the substring
//! operators, evaluated against an untyped JSON-ish fact map.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// Host facts exposed to predicates, keyed by attribute name (e.g.
/// `machine_model`, `os_vers`, `arch`, `hostname`). Built from
/// [`crate::host_facts::HostFacts`].
pub type FactMap = HashMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    StringLit(String),
    NumberLit(f64),
    LParen,
    RParen,
    Comma,
    And,
    Or,
    Not,
    In,
    Contains,
    BeginsWith,
    EndsWith,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub struct PredicateError(String);

impl fmt::Display for PredicateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "predicate error: {}", self.0)
    }
}

impl std::error::Error for PredicateError {}

fn tokenize(input: &str) -> Result<Vec<Token>, PredicateError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(PredicateError("unterminated string literal".into()));
                }
                tokens.push(Token::StringLit(chars[start..j].iter().collect()));
                i = j + 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |d| d.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| PredicateError(format!("invalid number literal: {}", text)))?;
                tokens.push(Token::NumberLit(n));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IN" => Token::In,
                    "CONTAINS" => Token::Contains,
                    "BEGINSWITH" => Token::BeginsWith,
                    "ENDSWITH" => Token::EndsWith,
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(PredicateError(format!("unexpected character: {}", c))),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Atom, CompareOp, Atom),
    In(Atom, Vec<Atom>),
    Substring(Atom, SubstringOp, Atom),
    Call(String, Vec<Atom>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum SubstringOp {
    Contains,
    BeginsWith,
    EndsWith,
}

#[derive(Debug, Clone)]
enum Atom {
    Ident(String),
    StringLit(String),
    NumberLit(f64),
    Call(String, Vec<Atom>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, tok: &Token) -> Result<(), PredicateError> {
        match self.next() {
            Some(ref t) if t == tok => Ok(()),
            other => Err(PredicateError(format!("expected {:?}, got {:?}", tok, other))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, PredicateError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, PredicateError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, PredicateError> {
        let mut left = self.parse_unary()?;
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, PredicateError> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, PredicateError> {
        if matches!(self.peek(), Some(Token::LParen)) {
            self.next();
            let inner = self.parse_expr()?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }

        let lhs = self.parse_atom()?;

        match self.peek() {
            Some(Token::Eq) => {
                self.next();
                Ok(Expr::Compare(lhs, CompareOp::Eq, self.parse_atom()?))
            }
            Some(Token::Ne) => {
                self.next();
                Ok(Expr::Compare(lhs, CompareOp::Ne, self.parse_atom()?))
            }
            Some(Token::Lt) => {
                self.next();
                Ok(Expr::Compare(lhs, CompareOp::Lt, self.parse_atom()?))
            }
            Some(Token::Le) => {
                self.next();
                Ok(Expr::Compare(lhs, CompareOp::Le, self.parse_atom()?))
            }
            Some(Token::Gt) => {
                self.next();
                Ok(Expr::Compare(lhs, CompareOp::Gt, self.parse_atom()?))
            }
            Some(Token::Ge) => {
                self.next();
                Ok(Expr::Compare(lhs, CompareOp::Ge, self.parse_atom()?))
            }
            Some(Token::In) => {
                self.next();
                self.expect(&Token::LParen)?;
                let mut items = vec![self.parse_atom()?];
                while matches!(self.peek(), Some(Token::Comma)) {
                    self.next();
                    items.push(self.parse_atom()?);
                }
                self.expect(&Token::RParen)?;
                Ok(Expr::In(lhs, items))
            }
            Some(Token::Contains) => {
                self.next();
                Ok(Expr::Substring(lhs, SubstringOp::Contains, self.parse_atom()?))
            }
            Some(Token::BeginsWith) => {
                self.next();
                Ok(Expr::Substring(lhs, SubstringOp::BeginsWith, self.parse_atom()?))
            }
            Some(Token::EndsWith) => {
                self.next();
                Ok(Expr::Substring(lhs, SubstringOp::EndsWith, self.parse_atom()?))
            }
            _ => match lhs {
                Atom::Call(name, args) => Ok(Expr::Call(name, args)),
                _ => Err(PredicateError("expected an operator after atom".into())),
            },
        }
    }

    fn parse_atom(&mut self) -> Result<Atom, PredicateError> {
        match self.next() {
            Some(Token::Ident(name)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Token::RParen)) {
                        args.push(self.parse_atom()?);
                        while matches!(self.peek(), Some(Token::Comma)) {
                            self.next();
                            args.push(self.parse_atom()?);
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Atom::Call(name, args))
                } else {
                    Ok(Atom::Ident(name))
                }
            }
            Some(Token::StringLit(s)) => Ok(Atom::StringLit(s)),
            Some(Token::NumberLit(n)) => Ok(Atom::NumberLit(n)),
            other => Err(PredicateError(format!("expected an atom, got {:?}", other))),
        }
    }
}

fn parse(input: &str) -> Result<Expr, PredicateError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(PredicateError("trailing tokens after expression".into()));
    }
    Ok(expr)
}

/// Functions permitted inside predicate expressions. This crate permits
/// only `date()`, returning the current session date as an ISO-8601
/// string for comparison against a string literal.
fn call_date(facts: &FactMap) -> Value {
    facts
        .get("date")
        .cloned()
        .unwrap_or_else(|| Value::String(String::new()))
}

fn resolve_atom(atom: &Atom, facts: &FactMap) -> Result<Value, PredicateError> {
    match atom {
        Atom::StringLit(s) => Ok(Value::String(s.clone())),
        Atom::NumberLit(n) => Ok(Value::from(*n)),
        Atom::Ident(name) => Ok(facts.get(name).cloned().unwrap_or(Value::Null)),
        Atom::Call(name, _args) if name == "date" => Ok(call_date(facts)),
        Atom::Call(name, _) => Err(PredicateError(format!("unknown function: {}", name))),
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn as_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn values_eq(a: &Value, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_f64(a), as_f64(b)) {
        if (a - b).abs() < f64::EPSILON {
            return true;
        }
    }
    as_str(a) == as_str(b)
}

fn compare_values(op: CompareOp, a: &Value, b: &Value) -> bool {
    match op {
        CompareOp::Eq => values_eq(a, b),
        CompareOp::Ne => !values_eq(a, b),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(a), Some(b)) => match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                _ => unreachable!(),
            },
            _ => match (as_str(a), as_str(b)) {
                (Some(a), Some(b)) => match op {
                    CompareOp::Lt => a < b,
                    CompareOp::Le => a <= b,
                    CompareOp::Gt => a > b,
                    CompareOp::Ge => a >= b,
                    _ => unreachable!(),
                },
                _ => false,
            },
        },
    }
}

fn eval(expr: &Expr, facts: &FactMap) -> Result<bool, PredicateError> {
    match expr {
        Expr::And(a, b) => Ok(eval(a, facts)? && eval(b, facts)?),
        Expr::Or(a, b) => Ok(eval(a, facts)? || eval(b, facts)?),
        Expr::Not(a) => Ok(!eval(a, facts)?),
        Expr::Compare(a, op, b) => {
            let a = resolve_atom(a, facts)?;
            let b = resolve_atom(b, facts)?;
            Ok(compare_values(*op, &a, &b))
        }
        Expr::In(needle, haystack) => {
            let needle = resolve_atom(needle, facts)?;
            for item in haystack {
                let item = resolve_atom(item, facts)?;
                if values_eq(&needle, &item) {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Expr::Substring(a, op, b) => {
            let a = as_str(&resolve_atom(a, facts)?).unwrap_or_default();
            let b = as_str(&resolve_atom(b, facts)?).unwrap_or_default();
            Ok(match op {
                SubstringOp::Contains => a.contains(&b),
                SubstringOp::BeginsWith => a.starts_with(&b),
                SubstringOp::EndsWith => a.ends_with(&b),
            })
        }
        Expr::Call(name, _) => Err(PredicateError(format!("function '{}' is not a boolean expression", name))),
    }
}

/// Evaluate a predicate string against host facts. Any parse or
/// evaluation error is logged and treated as `false`.
pub fn evaluate(predicate: &str, facts: &FactMap) -> bool {
    match parse(predicate).and_then(|expr| eval(&expr, facts)) {
        Ok(result) => result,
        Err(e) => {
            log::warn!("predicate evaluation failed for `{}`: {}", predicate, e);
            false
        }
    }
}
