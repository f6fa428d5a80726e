//! Per-record boolean predicate.
//!
//! The expression grammar is deliberately small: comparisons between a
//! dotted path and a literal, combined with `and`/`or`/`not` and
//! parentheses. Expressions are compiled once at startup; per-record
//! evaluation allocates nothing.
//!
//! ```text
//! expr       := or
//! or         := and ( "or" and )*
//! and        := unary ( "and" unary )*
//! unary      := "not" unary | primary
//! primary    := "(" expr ")" | comparison
//! comparison := path op literal
//! op         := == | != | < | <= | > | >=
//! literal    := string | number | true | false | null
//! ```

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{PipelineError, Result};
use crate::pipeline::path::JsonPath;
use crate::pipeline::processor::{Outcome, Processor};

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Literal operand of a comparison.
#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

/// Compiled predicate tree.
#[derive(Debug, Clone)]
enum Expr {
    Cmp {
        path: JsonPath,
        op: CmpOp,
        literal: Literal,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
}

/// A compiled filter predicate.
#[derive(Debug, Clone)]
pub struct Predicate {
    expr: Expr,
    strict: bool,
}

impl Predicate {
    /// Compile an expression. Syntax errors are `ConfigInvalid`.
    pub fn compile(expression: &str, strict: bool) -> Result<Self> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(PipelineError::ConfigInvalid(format!(
                "trailing input in filter expression at token {}",
                parser.pos
            )));
        }
        Ok(Self { expr, strict })
    }

    /// Evaluate against a record. In strict mode a missing path is an
    /// evaluation error; otherwise the comparison is false.
    pub fn evaluate(&self, record: &Value) -> Result<bool> {
        self.eval_expr(&self.expr, record)
    }

    fn eval_expr(&self, expr: &Expr, record: &Value) -> Result<bool> {
        match expr {
            Expr::And(children) => {
                for child in children {
                    if !self.eval_expr(child, record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Expr::Or(children) => {
                for child in children {
                    if self.eval_expr(child, record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Expr::Not(child) => Ok(!self.eval_expr(child, record)?),
            Expr::Cmp { path, op, literal } => self.eval_cmp(path, *op, literal, record),
        }
    }

    fn eval_cmp(&self, path: &JsonPath, op: CmpOp, literal: &Literal, record: &Value) -> Result<bool> {
        let value = match path.lookup(record) {
            Some(value) => value,
            None if self.strict => {
                return Err(PipelineError::FilterEval(format!(
                    "path `{}` missing from record",
                    path.raw()
                )));
            }
            None => return Ok(false),
        };

        let result = match (value, literal) {
            (Value::Null, Literal::Null) => cmp_matches(op, std::cmp::Ordering::Equal),
            (Value::Bool(actual), Literal::Bool(expected)) => match op {
                CmpOp::Eq => actual == expected,
                CmpOp::Ne => actual != expected,
                _ => return self.type_error(path, "bool supports only == and !="),
            },
            (Value::Number(actual), Literal::Num(expected)) => {
                let actual = actual.as_f64().unwrap_or(f64::NAN);
                match actual.partial_cmp(expected) {
                    Some(ordering) => cmp_matches(op, ordering),
                    None => false,
                }
            }
            (Value::String(actual), Literal::Str(expected)) => {
                cmp_matches(op, actual.as_str().cmp(expected.as_str()))
            }
            // Null on either side never matches except the `path == null` /
            // `path != null` forms handled above.
            (Value::Null, _) => matches!(op, CmpOp::Ne),
            (_, Literal::Null) => matches!(op, CmpOp::Ne),
            _ => return self.type_error(path, "operand types do not match"),
        };

        Ok(result)
    }

    fn type_error(&self, path: &JsonPath, message: &str) -> Result<bool> {
        if self.strict {
            Err(PipelineError::FilterEval(format!(
                "path `{}`: {message}",
                path.raw()
            )))
        } else {
            Ok(false)
        }
    }
}

fn cmp_matches(op: CmpOp, ordering: std::cmp::Ordering) -> bool {
    use std::cmp::Ordering::*;
    match op {
        CmpOp::Eq => ordering == Equal,
        CmpOp::Ne => ordering != Equal,
        CmpOp::Lt => ordering == Less,
        CmpOp::Le => ordering != Greater,
        CmpOp::Gt => ordering == Greater,
        CmpOp::Ge => ordering != Less,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    And,
    Or,
    Not,
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let (op, len) = match two.as_str() {
                    "==" => (CmpOp::Eq, 2),
                    "!=" => (CmpOp::Ne, 2),
                    "<=" => (CmpOp::Le, 2),
                    ">=" => (CmpOp::Ge, 2),
                    _ if c == '<' => (CmpOp::Lt, 1),
                    _ if c == '>' => (CmpOp::Gt, 1),
                    _ => {
                        return Err(PipelineError::ConfigInvalid(format!(
                            "unexpected character `{c}` in filter expression"
                        )));
                    }
                };
                tokens.push(Token::Op(op));
                i += len;
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(PipelineError::ConfigInvalid(
                        "unterminated string in filter expression".to_string(),
                    ));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            _ if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = text.parse::<f64>().map_err(|_| {
                    PipelineError::ConfigInvalid(format!("bad number `{text}` in filter expression"))
                })?;
                tokens.push(Token::Num(num));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Path(word),
                });
            }
            _ => {
                return Err(PipelineError::ConfigInvalid(format!(
                    "unexpected character `{c}` in filter expression"
                )));
            }
        }
    }

    Ok(tokens)
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
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut children = vec![self.parse_and()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.next();
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut children = vec![self.parse_unary()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            children.push(self.parse_unary()?);
        }
        Ok(if children.len() == 1 {
            children.pop().unwrap()
        } else {
            Expr::And(children)
        })
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Some(Token::Not)) {
            self.next();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(PipelineError::ConfigInvalid(
                        "missing `)` in filter expression".to_string(),
                    )),
                }
            }
            Some(Token::Path(raw)) => {
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    other => {
                        return Err(PipelineError::ConfigInvalid(format!(
                            "expected comparison operator after `{raw}`, got {other:?}"
                        )));
                    }
                };
                let literal = match self.next() {
                    Some(Token::Str(s)) => Literal::Str(s),
                    Some(Token::Num(n)) => Literal::Num(n),
                    Some(Token::Bool(b)) => Literal::Bool(b),
                    Some(Token::Null) => Literal::Null,
                    other => {
                        return Err(PipelineError::ConfigInvalid(format!(
                            "expected literal after operator, got {other:?}"
                        )));
                    }
                };
                Ok(Expr::Cmp {
                    path: JsonPath::compile(&raw)?,
                    op,
                    literal,
                })
            }
            other => Err(PipelineError::ConfigInvalid(format!(
                "unexpected token {other:?} in filter expression"
            ))),
        }
    }
}

/// Processor wrapper around a compiled predicate.
pub struct FilterProcessor {
    predicate: Predicate,
}

impl FilterProcessor {
    pub fn new(predicate: Predicate) -> Self {
        Self { predicate }
    }

    pub fn from_spec(spec: &crate::models::FilterSpec) -> Result<Self> {
        Ok(Self::new(Predicate::compile(&spec.expression, spec.strict)?))
    }
}

#[async_trait]
impl Processor for FilterProcessor {
    fn name(&self) -> &'static str {
        "filter"
    }

    async fn process(&self, record: Value) -> Outcome {
        match self.predicate.evaluate(&record) {
            Ok(true) => Outcome::Emit(record),
            Ok(false) => Outcome::Drop,
            Err(e) => Outcome::Fail(e),
        }
    }
}
