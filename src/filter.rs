// SPDX-License-Identifier: Apache-2.0 OR MIT
// Per-sink filter expressions
//
// A small boolean language over record attributes, compiled to a
// predicate closure at configuration load:
//
//   severity >= WARNING and not logger = "net.http"
//   component(1) >= 100 or has(2)
//   my_filter("arg", 3)
//
// Attributes: `severity` (alias `level`), `logger`, `component(i)`,
// `has(i)`. Operators: `>=`, `<=`, `=`, `/=`, `and`, `or`, `not`,
// parentheses. Bare calls resolve against the registered filter
// functions.

use crate::component::Component;
use crate::decorator::Composed;
use crate::severity::Severity;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected token '{found}' at offset {at}")]
    UnexpectedToken { found: String, at: usize },

    #[error("unexpected end of filter expression")]
    UnexpectedEnd,

    #[error("unknown attribute '{0}'")]
    UnknownAttribute(String),

    #[error("unknown filter function '{0}'")]
    UnknownFunction(String),

    #[error("unknown severity '{0}'")]
    UnknownSeverity(String),

    #[error("operator '{op}' cannot compare {what}")]
    BadComparison { op: &'static str, what: &'static str },

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("trailing input at offset {0}")]
    TrailingInput(usize),
}

/// A literal argument passed to a registered filter function.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterArg {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A registered user predicate, callable from filter expressions.
pub type FilterFn = Arc<dyn Fn(&Composed, &[FilterArg]) -> bool + Send + Sync>;

static FUNCTIONS: Mutex<Vec<(String, FilterFn)>> = Mutex::new(Vec::new());

/// Register a filter function under `name`. Later registrations under
/// the same name win, so tests and reloads can replace predicates.
pub fn register_filter_fn(name: &str, function: FilterFn) {
    let mut functions = FUNCTIONS.lock().unwrap_or_else(|e| e.into_inner());
    functions.retain(|(existing, _)| existing != name);
    functions.push((name.to_string(), function));
}

fn lookup_function(name: &str) -> Option<FilterFn> {
    let functions = FUNCTIONS.lock().unwrap_or_else(|e| e.into_inner());
    functions
        .iter()
        .find(|(existing, _)| existing == name)
        .map(|(_, function)| function.clone())
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),
    Ge,
    Le,
    Eq,
    Ne,
    LParen,
    RParen,
    Comma,
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, FilterError> {
    let mut tokens = Vec::new();
    let bytes = text.as_bytes();
    let mut at = 0;
    while at < bytes.len() {
        let c = bytes[at] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => at += 1,
            '(' => {
                tokens.push((Token::LParen, at));
                at += 1;
            }
            ')' => {
                tokens.push((Token::RParen, at));
                at += 1;
            }
            ',' => {
                tokens.push((Token::Comma, at));
                at += 1;
            }
            '=' => {
                tokens.push((Token::Eq, at));
                at += 1;
            }
            '>' if bytes.get(at + 1) == Some(&b'=') => {
                tokens.push((Token::Ge, at));
                at += 2;
            }
            '<' if bytes.get(at + 1) == Some(&b'=') => {
                tokens.push((Token::Le, at));
                at += 2;
            }
            '/' if bytes.get(at + 1) == Some(&b'=') => {
                tokens.push((Token::Ne, at));
                at += 2;
            }
            '"' => {
                let start = at;
                at += 1;
                let mut value = String::new();
                loop {
                    match bytes.get(at) {
                        Some(b'"') => {
                            at += 1;
                            break;
                        }
                        Some(b'\\') => {
                            match bytes.get(at + 1) {
                                Some(b'"') => value.push('"'),
                                Some(b'\\') => value.push('\\'),
                                Some(&other) => value.push(other as char),
                                None => return Err(FilterError::UnterminatedString),
                            }
                            at += 2;
                        }
                        Some(&other) => {
                            value.push(other as char);
                            at += 1;
                        }
                        None => return Err(FilterError::UnterminatedString),
                    }
                }
                tokens.push((Token::Str(value), start));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = at;
                at += 1;
                let mut is_float = false;
                while at < bytes.len() {
                    let d = bytes[at] as char;
                    if d.is_ascii_digit() {
                        at += 1;
                    } else if d == '.' && !is_float {
                        is_float = true;
                        at += 1;
                    } else {
                        break;
                    }
                }
                let text = &text[start..at];
                let token = if is_float {
                    Token::Float(
                        text.parse()
                            .map_err(|_| FilterError::UnexpectedChar(c, start))?,
                    )
                } else {
                    Token::Int(
                        text.parse()
                            .map_err(|_| FilterError::UnexpectedChar(c, start))?,
                    )
                };
                tokens.push((token, start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = at;
                while at < bytes.len() {
                    let d = bytes[at] as char;
                    if d.is_ascii_alphanumeric() || d == '_' || d == '.' {
                        at += 1;
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(text[start..at].to_string()), start));
            }
            other => return Err(FilterError::UnexpectedChar(other, at)),
        }
    }
    Ok(tokens)
}

type Predicate = Box<dyn Fn(&Composed) -> bool + Send + Sync>;

/// A filter expression compiled to a predicate over the composed record.
pub struct CompiledFilter {
    predicate: Predicate,
}

impl CompiledFilter {
    pub fn compile(text: &str) -> Result<CompiledFilter, FilterError> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, at: 0 };
        let predicate = parser.parse_or()?;
        if let Some((token, at)) = parser.peek() {
            let _ = token;
            return Err(FilterError::TrailingInput(at));
        }
        Ok(CompiledFilter { predicate })
    }

    #[inline]
    pub fn accepts(&self, view: &Composed) -> bool {
        (self.predicate)(view)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Ge,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    fn name(self) -> &'static str {
        match self {
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::Eq => "=",
            CompareOp::Ne => "/=",
        }
    }

    fn apply<T: PartialOrd>(self, left: T, right: T) -> bool {
        match self {
            CompareOp::Ge => left >= right,
            CompareOp::Le => left <= right,
            CompareOp::Eq => left == right,
            CompareOp::Ne => left != right,
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    at: usize,
}

impl Parser {
    fn peek(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.at).map(|(token, at)| (token, *at))
    }

    fn next(&mut self) -> Result<(Token, usize), FilterError> {
        let token = self
            .tokens
            .get(self.at)
            .cloned()
            .ok_or(FilterError::UnexpectedEnd)?;
        self.at += 1;
        Ok(token)
    }

    fn expect(&mut self, expected: &Token) -> Result<(), FilterError> {
        let (token, at) = self.next()?;
        if token == *expected {
            Ok(())
        } else {
            Err(FilterError::UnexpectedToken {
                found: format!("{:?}", token),
                at,
            })
        }
    }

    fn parse_or(&mut self) -> Result<Predicate, FilterError> {
        let mut left = self.parse_and()?;
        while self.peek_keyword("or") {
            self.at += 1;
            let right = self.parse_and()?;
            left = Box::new(move |view| left(view) || right(view));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Predicate, FilterError> {
        let mut left = self.parse_not()?;
        while self.peek_keyword("and") {
            self.at += 1;
            let right = self.parse_not()?;
            left = Box::new(move |view| left(view) && right(view));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Predicate, FilterError> {
        if self.peek_keyword("not") {
            self.at += 1;
            let inner = self.parse_not()?;
            return Ok(Box::new(move |view| !inner(view)));
        }
        self.parse_primary()
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some((Token::Ident(word), _)) if word == keyword)
    }

    fn parse_primary(&mut self) -> Result<Predicate, FilterError> {
        match self.next()? {
            (Token::LParen, _) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            (Token::Ident(word), at) => self.parse_term(word, at),
            (token, at) => Err(FilterError::UnexpectedToken {
                found: format!("{:?}", token),
                at,
            }),
        }
    }

    fn parse_term(&mut self, word: String, at: usize) -> Result<Predicate, FilterError> {
        match word.as_str() {
            "severity" | "level" => self.parse_severity_comparison(),
            "logger" => self.parse_logger_comparison(),
            "has" => {
                let index = self.parse_index_call()?;
                Ok(Box::new(move |view| index < view.components().len()))
            }
            "component" => {
                let index = self.parse_index_call()?;
                let op = self.parse_compare_op()?;
                let literal = self.next()?;
                compile_component_comparison(index, op, literal)
            }
            _ => {
                if matches!(self.peek(), Some((Token::LParen, _))) {
                    let function = lookup_function(&word)
                        .ok_or(FilterError::UnknownFunction(word))?;
                    let args = self.parse_args()?;
                    Ok(Box::new(move |view| function(view, &args)))
                } else {
                    let _ = at;
                    Err(FilterError::UnknownAttribute(word))
                }
            }
        }
    }

    fn parse_compare_op(&mut self) -> Result<CompareOp, FilterError> {
        match self.next()? {
            (Token::Ge, _) => Ok(CompareOp::Ge),
            (Token::Le, _) => Ok(CompareOp::Le),
            (Token::Eq, _) => Ok(CompareOp::Eq),
            (Token::Ne, _) => Ok(CompareOp::Ne),
            (token, at) => Err(FilterError::UnexpectedToken {
                found: format!("{:?}", token),
                at,
            }),
        }
    }

    fn parse_severity_comparison(&mut self) -> Result<Predicate, FilterError> {
        let op = self.parse_compare_op()?;
        let rank = match self.next()? {
            (Token::Ident(name), _) => Severity::from_name(&name)
                .ok_or(FilterError::UnknownSeverity(name))?
                .rank(),
            (Token::Int(value), _) => u8::try_from(value).map_err(|_| {
                FilterError::BadComparison {
                    op: op.name(),
                    what: "severity rank out of range",
                }
            })?,
            (token, at) => {
                return Err(FilterError::UnexpectedToken {
                    found: format!("{:?}", token),
                    at,
                })
            }
        };
        Ok(Box::new(move |view| op.apply(view.severity.rank(), rank)))
    }

    fn parse_logger_comparison(&mut self) -> Result<Predicate, FilterError> {
        let op = self.parse_compare_op()?;
        if op != CompareOp::Eq && op != CompareOp::Ne {
            return Err(FilterError::BadComparison {
                op: op.name(),
                what: "logger names",
            });
        }
        let name = match self.next()? {
            (Token::Str(value), _) => value,
            (Token::Ident(value), _) => value,
            (token, at) => {
                return Err(FilterError::UnexpectedToken {
                    found: format!("{:?}", token),
                    at,
                })
            }
        };
        // Matches the named logger and its descendants.
        let matches = move |view: &Composed| {
            let candidate = view.logger_name;
            name.is_empty()
                || candidate == name
                || (candidate.len() > name.len()
                    && candidate.starts_with(name.as_str())
                    && candidate.as_bytes()[name.len()] == b'.')
        };
        match op {
            CompareOp::Eq => Ok(Box::new(move |view| matches(view))),
            _ => Ok(Box::new(move |view| !matches(view))),
        }
    }

    fn parse_index_call(&mut self) -> Result<usize, FilterError> {
        self.expect(&Token::LParen)?;
        let index = match self.next()? {
            (Token::Int(value), at) => usize::try_from(value).map_err(|_| {
                FilterError::UnexpectedToken {
                    found: value.to_string(),
                    at,
                }
            })?,
            (token, at) => {
                return Err(FilterError::UnexpectedToken {
                    found: format!("{:?}", token),
                    at,
                })
            }
        };
        self.expect(&Token::RParen)?;
        Ok(index)
    }

    fn parse_args(&mut self) -> Result<Vec<FilterArg>, FilterError> {
        self.expect(&Token::LParen)?;
        let mut args = Vec::new();
        if matches!(self.peek(), Some((Token::RParen, _))) {
            self.at += 1;
            return Ok(args);
        }
        loop {
            match self.next()? {
                (Token::Int(value), _) => args.push(FilterArg::Int(value)),
                (Token::Float(value), _) => args.push(FilterArg::Float(value)),
                (Token::Str(value), _) => args.push(FilterArg::Str(value)),
                (Token::Ident(value), _) => args.push(FilterArg::Str(value)),
                (token, at) => {
                    return Err(FilterError::UnexpectedToken {
                        found: format!("{:?}", token),
                        at,
                    })
                }
            }
            match self.next()? {
                (Token::Comma, _) => continue,
                (Token::RParen, _) => break,
                (token, at) => {
                    return Err(FilterError::UnexpectedToken {
                        found: format!("{:?}", token),
                        at,
                    })
                }
            }
        }
        Ok(args)
    }
}

fn compile_component_comparison(
    index: usize,
    op: CompareOp,
    literal: (Token, usize),
) -> Result<Predicate, FilterError> {
    match literal {
        (Token::Int(value), _) => Ok(Box::new(move |view| {
            match view.components().get(index) {
                Some(Component::I64(v)) => op.apply(*v, value),
                Some(Component::F64(v)) => op.apply(*v, value as f64),
                _ => false,
            }
        })),
        (Token::Float(value), _) => Ok(Box::new(move |view| {
            match view.components().get(index) {
                Some(Component::F64(v)) => op.apply(*v, value),
                Some(Component::I64(v)) => op.apply(*v as f64, value),
                _ => false,
            }
        })),
        (Token::Str(value), _) => {
            if op != CompareOp::Eq && op != CompareOp::Ne {
                return Err(FilterError::BadComparison {
                    op: op.name(),
                    what: "string components",
                });
            }
            Ok(Box::new(move |view| {
                match view.components().get(index) {
                    Some(Component::Str(v)) => op.apply(*v, value.as_str()),
                    _ => false,
                }
            }))
        }
        (token, at) => Err(FilterError::UnexpectedToken {
            found: format!("{:?}", token),
            at,
        }),
    }
}
