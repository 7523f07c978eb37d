//! Counters, statistics and the small arithmetic expression language shared
//! with expression triggers.
//!
//! Expressions support numeric literals, dotted node paths (resolved once at
//! compile time), the keyword `tick`, `+ - * /`, comparisons, `!`, `&&`, `||`
//! and parentheses. Booleans are represented as `1.0`/`0.0`.

use crate::common::Tick;
use crate::error::{SimError, SimResult};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// A shared, monotonically updated event counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Rc<Cell<u64>>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.value.get()
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.set(self.value.get().saturating_add(n));
    }

    pub fn set(&self, n: u64) {
        self.value.set(n);
    }

    /// True if both handles observe the same underlying cell.
    pub fn same_as(&self, other: &Counter) -> bool {
        Rc::ptr_eq(&self.value, &other.value)
    }
}

/// A derived value computed from counters on demand.
#[derive(Debug, Clone)]
pub struct Statistic {
    expr: Rc<Expression>,
}

impl Statistic {
    pub fn new(expr: Expression) -> Self {
        Self { expr: Rc::new(expr) }
    }

    pub fn expression(&self) -> &Expression {
        &self.expr
    }

    pub fn value(&self, tick: Tick) -> f64 {
        self.expr.evaluate(tick)
    }
}

/// A variable an expression reads at evaluation time.
#[derive(Debug, Clone)]
pub enum Variable {
    Counter(Counter),
    Statistic(Statistic),
}

impl Variable {
    fn value(&self, tick: Tick) -> f64 {
        match self {
            Variable::Counter(c) => c.get() as f64,
            Variable::Statistic(s) => s.value(tick),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Tick,
    Var(usize),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    const OPS: [&str; 14] = [
        ">=", "<=", "==", "!=", "&&", "||", ">", "<", "+", "-", "*", "/", "!", "=",
    ];
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    'outer: while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == '(' {
            tokens.push(Token::LParen);
            i += 1;
            continue;
        }
        if c == ')' {
            tokens.push(Token::RParen);
            i += 1;
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
            let lit = &text[start..i];
            let value = if let Some(hex) = lit.strip_prefix("0x") {
                u64::from_str_radix(hex, 16).map(|v| v as f64).ok()
            } else {
                lit.parse::<f64>().ok()
            };
            tokens.push(Token::Num(value.ok_or_else(|| format!("bad number '{lit}'"))?));
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(text[start..i].to_string()));
            continue;
        }
        for op in OPS {
            if text[i..].starts_with(op) {
                if op == "=" {
                    return Err("use '==' for equality".into());
                }
                tokens.push(Token::Op(op));
                i += op.len();
                continue 'outer;
            }
        }
        return Err(format!("unexpected character '{c}'"));
    }
    Ok(tokens)
}

struct Parser<'r> {
    tokens: Vec<Token>,
    pos: usize,
    vars: Vec<Variable>,
    resolve: &'r mut dyn FnMut(&str) -> SimResult<Variable>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        let current = match self.peek() {
            Some(Token::Op(op)) => *op,
            _ => return None,
        };
        let found = ops.iter().copied().find(|o| *o == current)?;
        self.pos += 1;
        Some(found)
    }

    fn or(&mut self) -> SimResult<Expr> {
        let mut lhs = self.and()?;
        while self.eat_op(&["||"]).is_some() {
            let rhs = self.and()?;
            lhs = Expr::Bin(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> SimResult<Expr> {
        let mut lhs = self.comparison()?;
        while self.eat_op(&["&&"]).is_some() {
            let rhs = self.comparison()?;
            lhs = Expr::Bin(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> SimResult<Expr> {
        let lhs = self.sum()?;
        let op = match self.eat_op(&[">=", "<=", "==", "!=", ">", "<"]) {
            Some(">=") => BinOp::Ge,
            Some("<=") => BinOp::Le,
            Some("==") => BinOp::Eq,
            Some("!=") => BinOp::Ne,
            Some(">") => BinOp::Gt,
            Some("<") => BinOp::Lt,
            _ => return Ok(lhs),
        };
        let rhs = self.sum()?;
        Ok(Expr::Bin(op, Box::new(lhs), Box::new(rhs)))
    }

    fn sum(&mut self) -> SimResult<Expr> {
        let mut lhs = self.product()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.product()?;
            let op = if op == "+" { BinOp::Add } else { BinOp::Sub };
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn product(&mut self) -> SimResult<Expr> {
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/"]) {
            let rhs = self.unary()?;
            let op = if op == "*" { BinOp::Mul } else { BinOp::Div };
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> SimResult<Expr> {
        if self.eat_op(&["-"]).is_some() {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        if self.eat_op(&["!"]).is_some() {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> SimResult<Expr> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(Token::Num(v)) => Ok(Expr::Num(v)),
            Some(Token::Ident(name)) if name == "tick" => Ok(Expr::Tick),
            Some(Token::Ident(name)) => {
                let var = (self.resolve)(&name)?;
                self.vars.push(var);
                Ok(Expr::Var(self.vars.len() - 1))
            }
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(syntax("expected ')'")),
                }
            }
            other => Err(syntax(&format!("unexpected token {other:?}"))),
        }
    }
}

fn syntax(reason: &str) -> SimError {
    SimError::InvalidPath {
        path: "<expression>".into(),
        reason: reason.to_string(),
    }
}

/// A compiled expression with its variables resolved.
#[derive(Clone)]
pub struct Expression {
    text: String,
    root: Expr,
    vars: Vec<Variable>,
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression").field("text", &self.text).finish()
    }
}

impl Expression {
    /// Parses `text`, resolving every path through `resolve`.
    pub fn compile(
        text: &str,
        resolve: &mut dyn FnMut(&str) -> SimResult<Variable>,
    ) -> SimResult<Self> {
        let tokens = tokenize(text).map_err(|reason| SimError::InvalidPath {
            path: text.to_string(),
            reason,
        })?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            vars: Vec::new(),
            resolve,
        };
        let root = parser.or().map_err(|e| match e {
            SimError::InvalidPath { reason, .. } => SimError::InvalidPath {
                path: text.to_string(),
                reason,
            },
            other => other,
        })?;
        if parser.pos != parser.tokens.len() {
            return Err(SimError::InvalidPath {
                path: text.to_string(),
                reason: "trailing input".into(),
            });
        }
        Ok(Self {
            text: text.to_string(),
            root,
            vars: parser.vars,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn evaluate(&self, tick: Tick) -> f64 {
        self.eval(&self.root, tick)
    }

    pub fn is_true(&self, tick: Tick) -> bool {
        self.evaluate(tick) != 0.0
    }

    fn eval(&self, expr: &Expr, tick: Tick) -> f64 {
        let flag = |b: bool| if b { 1.0 } else { 0.0 };
        match expr {
            Expr::Num(v) => *v,
            Expr::Tick => tick as f64,
            Expr::Var(i) => self.vars[*i].value(tick),
            Expr::Neg(inner) => -self.eval(inner, tick),
            Expr::Not(inner) => flag(self.eval(inner, tick) == 0.0),
            Expr::Bin(op, lhs, rhs) => {
                let a = self.eval(lhs, tick);
                // short-circuit before evaluating the right side
                match op {
                    BinOp::And if a == 0.0 => return 0.0,
                    BinOp::Or if a != 0.0 => return 1.0,
                    _ => {}
                }
                let b = self.eval(rhs, tick);
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div if b == 0.0 => 0.0,
                    BinOp::Div => a / b,
                    BinOp::Lt => flag(a < b),
                    BinOp::Le => flag(a <= b),
                    BinOp::Gt => flag(a > b),
                    BinOp::Ge => flag(a >= b),
                    BinOp::Eq => flag(a == b),
                    BinOp::Ne => flag(a != b),
                    BinOp::And | BinOp::Or => flag(b != 0.0),
                }
            }
        }
    }
}
