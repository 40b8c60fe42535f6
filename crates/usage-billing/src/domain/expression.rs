//! Organization-supplied custom aggregation expressions.
//!
//! Expressions are pure arithmetic over event properties:
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := NUMBER | IDENT | IDENT '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Identifiers name event properties, either bare (`tokens`) or fully
//! qualified (`event.properties.tokens`). Functions: `round(x[, dp])`,
//! `ceil(x)`, `floor(x)`, `min(a, b)`, `max(a, b)`.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

use crate::domain::events::EventProperties;
use crate::error::{BillingError, Result};

const PROPERTY_PREFIX: &str = "event.properties.";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Round,
    Ceil,
    Floor,
    Min,
    Max,
}

impl Function {
    fn lookup(name: &str) -> Option<Self> {
        match name {
            "round" => Some(Function::Round),
            "ceil" => Some(Function::Ceil),
            "floor" => Some(Function::Floor),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            _ => None,
        }
    }

    fn accepts(&self, arity: usize) -> bool {
        match self {
            Function::Round => arity == 1 || arity == 2,
            Function::Ceil | Function::Floor => arity == 1,
            Function::Min | Function::Max => arity == 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Number(Decimal),
    Property(String),
    Negate(Box<Node>),
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Call {
        function: Function,
        args: Vec<Node>,
    },
}

/// Parsed, validated custom expression
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push((i, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((i, Token::Minus));
                i += 1;
            }
            '*' => {
                tokens.push((i, Token::Star));
                i += 1;
            }
            '/' => {
                tokens.push((i, Token::Slash));
                i += 1;
            }
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Comma));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value =
                    Decimal::from_str(&literal).map_err(|_| BillingError::InvalidExpression {
                        position: start,
                        message: format!("invalid number literal '{}'", literal),
                    })?;
                tokens.push((start, Token::Number(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                tokens.push((start, Token::Ident(ident)));
            }
            other => {
                return Err(BillingError::InvalidExpression {
                    position: i,
                    message: format!("unexpected character '{}'", other),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    position: usize,
    end: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.position)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).map(|(_, t)| t.clone());
        self.position += 1;
        token
    }

    fn error(&self, message: impl Into<String>) -> BillingError {
        BillingError::InvalidExpression {
            position: self.offset(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        if self.peek() == Some(&expected) {
            self.position += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {:?}", expected)))
        }
    }

    fn expression(&mut self) -> Result<Node> {
        let mut node = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(node),
            };
            self.position += 1;
            let rhs = self.term()?;
            node = Node::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Node> {
        let mut node = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(node),
            };
            self.position += 1;
            let rhs = self.unary()?;
            node = Node::Binary {
                op,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Node> {
        if self.peek() == Some(&Token::Minus) {
            self.position += 1;
            return Ok(Node::Negate(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Node> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(value)) => Ok(Node::Number(value)),
            Some(Token::LParen) => {
                let node = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(node)
            }
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    let function =
                        Function::lookup(&name).ok_or_else(|| BillingError::InvalidExpression {
                            position: offset,
                            message: format!("unknown function '{}'", name),
                        })?;
                    self.position += 1;
                    let mut args = vec![self.expression()?];
                    while self.peek() == Some(&Token::Comma) {
                        self.position += 1;
                        args.push(self.expression()?);
                    }
                    self.expect(Token::RParen)?;
                    if !function.accepts(args.len()) {
                        return Err(BillingError::InvalidExpression {
                            position: offset,
                            message: format!("wrong number of arguments for '{}'", name),
                        });
                    }
                    Ok(Node::Call { function, args })
                } else {
                    let key = name.strip_prefix(PROPERTY_PREFIX).unwrap_or(&name);
                    if key.is_empty() || key.contains('.') {
                        return Err(BillingError::InvalidExpression {
                            position: offset,
                            message: format!("invalid property reference '{}'", name),
                        });
                    }
                    Ok(Node::Property(key.to_string()))
                }
            }
            Some(other) => Err(BillingError::InvalidExpression {
                position: offset,
                message: format!("unexpected token {:?}", other),
            }),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

fn arithmetic(op: BinaryOp, lhs: Decimal, rhs: Decimal) -> Result<Decimal> {
    let result = match op {
        BinaryOp::Add => lhs.checked_add(rhs),
        BinaryOp::Sub => lhs.checked_sub(rhs),
        BinaryOp::Mul => lhs.checked_mul(rhs),
        BinaryOp::Div => {
            if rhs.is_zero() {
                return Err(BillingError::ExpressionEvaluation {
                    message: "division by zero".to_string(),
                });
            }
            lhs.checked_div(rhs)
        }
    };
    result.ok_or_else(|| BillingError::ExpressionEvaluation {
        message: "arithmetic overflow".to_string(),
    })
}

fn evaluate(node: &Node, properties: &EventProperties) -> Result<Decimal> {
    match node {
        Node::Number(value) => Ok(*value),
        Node::Property(key) => properties
            .get(key)
            .and_then(|v| v.as_decimal())
            .ok_or_else(|| BillingError::ExpressionEvaluation {
                message: format!("property '{}' is missing or not numeric", key),
            }),
        Node::Negate(inner) => Ok(-evaluate(inner, properties)?),
        Node::Binary { op, lhs, rhs } => arithmetic(
            *op,
            evaluate(lhs, properties)?,
            evaluate(rhs, properties)?,
        ),
        Node::Call { function, args } => {
            let values = args
                .iter()
                .map(|arg| evaluate(arg, properties))
                .collect::<Result<Vec<_>>>()?;
            Ok(match function {
                Function::Round => {
                    let dp = match values.get(1) {
                        Some(dp) if dp.is_sign_negative() || dp.fract() != Decimal::ZERO => {
                            return Err(BillingError::ExpressionEvaluation {
                                message: "round precision must be a non-negative integer"
                                    .to_string(),
                            })
                        }
                        Some(dp) => dp.mantissa() as u32 / 10u32.pow(dp.scale()),
                        None => 0,
                    };
                    values[0].round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero)
                }
                Function::Ceil => values[0].ceil(),
                Function::Floor => values[0].floor(),
                Function::Min => values[0].min(values[1]),
                Function::Max => values[0].max(values[1]),
            })
        }
    }
}

fn collect_properties<'a>(node: &'a Node, out: &mut Vec<&'a str>) {
    match node {
        Node::Number(_) => {}
        Node::Property(key) => {
            if !out.contains(&key.as_str()) {
                out.push(key);
            }
        }
        Node::Negate(inner) => collect_properties(inner, out),
        Node::Binary { lhs, rhs, .. } => {
            collect_properties(lhs, out);
            collect_properties(rhs, out);
        }
        Node::Call { args, .. } => args.iter().for_each(|arg| collect_properties(arg, out)),
    }
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(BillingError::InvalidExpression {
                position: 0,
                message: "expression is empty".to_string(),
            });
        }
        let mut parser = Parser {
            tokens,
            position: 0,
            end: source.len(),
        };
        let root = parser.expression()?;
        if parser.peek().is_some() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, properties: &EventProperties) -> Result<Decimal> {
        evaluate(&self.root, properties)
    }

    pub fn referenced_properties(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_properties(&self.root, &mut out);
        out
    }
}

impl Serialize for Expression {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Expression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Expression::parse(&source).map_err(serde::de::Error::custom)
    }
}
