//! Textual form of condition expressions.
//!
//! `(== (field "married") "yes")` reads to `["==", ["field", "married"], "yes"]`.
//! Bare symbols outside the head position become state lookups
//! (`formStates.total` reads to `["var", "formStates.total"]`), and
//! `true`/`false`/`null` are literals. `#` starts a line comment.

use serde_json::{Map, Value, json};
use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReaderError {
    #[error("unexpected character `{0}`")]
    UnexpectedChar(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unbalanced parenthesis")]
    UnbalancedParenthesis,
    #[error("invalid number `{0}`")]
    InvalidNumber(String),
    #[error("empty expression")]
    Empty,
    #[error("invalid json expression: {0}")]
    Json(String),
}

#[derive(Debug, Clone)]
enum Val {
    Literal(Value),
    Symbol(String),
}

/// Turns a stored condition or rule body into an evaluable expression.
///
/// Strings starting with `[` or `{` are JSON; other strings use the textual
/// form. Non-string bodies are already expressions.
pub fn read_body(body: &Value) -> Result<Value, ReaderError> {
    match body {
        Value::String(source) => {
            let trimmed = source.trim();
            if trimmed.is_empty() {
                return Err(ReaderError::Empty);
            }
            if trimmed.starts_with('[') || trimmed.starts_with('{') {
                return serde_json::from_str(trimmed).map_err(|e| ReaderError::Json(e.to_string()));
            }
            read(trimmed)
        }
        other => Ok(other.clone()),
    }
}

/// Reads one or more forms; several top-level forms are wrapped in `do`.
pub fn read(input: &str) -> Result<Value, ReaderError> {
    let mut tokens = Tokenizer::new(input);
    let mut results = Vec::new();

    while let Some(token) = tokens.next_token()? {
        results.push(symbol_to_expr(parse_token(token, &mut tokens)?));
    }

    match results.len() {
        0 => Err(ReaderError::Empty),
        1 => Ok(results.remove(0)),
        _ => {
            let mut do_block = vec![json!("do")];
            do_block.extend(results);
            Ok(Value::Array(do_block))
        }
    }
}

fn keyword(s: &str) -> Option<Value> {
    match s {
        "true" => Some(json!(true)),
        "false" => Some(json!(false)),
        "null" | "nil" => Some(Value::Null),
        _ => None,
    }
}

fn symbol_to_expr(v: Val) -> Value {
    match v {
        Val::Literal(v) => v,
        Val::Symbol(s) => keyword(&s).unwrap_or_else(|| json!(["var", s])),
    }
}

fn next_required(tokens: &mut Tokenizer) -> Result<Token, ReaderError> {
    tokens.next_token()?.ok_or(ReaderError::UnbalancedParenthesis)
}

fn parse_token(first: Token, tokens: &mut Tokenizer) -> Result<Val, ReaderError> {
    match first {
        Token::LParen => {
            let mut list = Vec::new();
            while let Some(t) = tokens.peek_token()? {
                if t == Token::RParen {
                    tokens.next_token()?;
                    return Ok(Val::Literal(Value::Array(list)));
                }
                let next = next_required(tokens)?;
                let val = match parse_token(next, tokens)? {
                    Val::Symbol(s) if list.is_empty() => json!(s),
                    other => symbol_to_expr(other),
                };
                list.push(val);
            }
            Err(ReaderError::UnbalancedParenthesis)
        }
        Token::RParen | Token::RBracket => Err(ReaderError::UnbalancedParenthesis),
        Token::LBracket => {
            let mut list = Vec::new();
            while let Some(t) = tokens.peek_token()? {
                if t == Token::RBracket {
                    tokens.next_token()?;
                    return Ok(Val::Literal(Value::Array(list)));
                }
                let next = next_required(tokens)?;
                list.push(symbol_to_expr(parse_token(next, tokens)?));
            }
            Err(ReaderError::UnbalancedParenthesis)
        }
        Token::LBrace => {
            let mut map = Map::new();
            while let Some(t) = tokens.next_token()? {
                match t {
                    Token::RBrace => return Ok(Val::Literal(Value::Object(map))),
                    Token::Symbol(key) | Token::String(key) => {
                        let val_token = tokens
                            .next_token()?
                            .ok_or(ReaderError::UnexpectedChar('}'))?;
                        map.insert(key, symbol_to_expr(parse_token(val_token, tokens)?));
                    }
                    _ => return Err(ReaderError::UnexpectedChar('{')),
                }
            }
            Err(ReaderError::UnexpectedChar('}'))
        }
        Token::RBrace => Err(ReaderError::UnexpectedChar('}')),
        Token::String(s) => Ok(Val::Literal(json!(s))),
        Token::Number(n) => Ok(Val::Literal(n)),
        Token::Symbol(s) => Ok(Val::Symbol(s)),
    }
}

#[derive(Debug, PartialEq, Clone)]
enum Token {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    String(String),
    Number(Value),
    Symbol(String),
}

struct Tokenizer<'a> {
    chars: Peekable<Chars<'a>>,
    peeked: Option<Token>,
}

impl<'a> Tokenizer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            peeked: None,
        }
    }

    fn peek_token(&mut self) -> Result<Option<Token>, ReaderError> {
        if self.peeked.is_none() {
            self.peeked = self.next_token_inner()?;
        }
        Ok(self.peeked.clone())
    }

    fn next_token(&mut self) -> Result<Option<Token>, ReaderError> {
        if let Some(t) = self.peeked.take() {
            return Ok(Some(t));
        }
        self.next_token_inner()
    }

    fn skip_trivia(&mut self) {
        loop {
            while let Some(&c) = self.chars.peek() {
                if c.is_whitespace() || c == ',' || c == ':' {
                    self.chars.next();
                    continue;
                }
                break;
            }
            if let Some(&'#') = self.chars.peek() {
                for c in self.chars.by_ref() {
                    if c == '\n' {
                        break;
                    }
                }
                continue;
            }
            break;
        }
    }

    fn next_token_inner(&mut self) -> Result<Option<Token>, ReaderError> {
        self.skip_trivia();

        let Some(c) = self.chars.next() else {
            return Ok(None);
        };

        match c {
            '(' => Ok(Some(Token::LParen)),
            ')' => Ok(Some(Token::RParen)),
            '{' => Ok(Some(Token::LBrace)),
            '}' => Ok(Some(Token::RBrace)),
            '[' => Ok(Some(Token::LBracket)),
            ']' => Ok(Some(Token::RBracket)),
            '\'' | '"' => self.read_string(c).map(Some),
            _ if c.is_ascii_digit()
                || (c == '-' && self.chars.peek().is_some_and(|nc| nc.is_ascii_digit())) =>
            {
                self.read_number(c).map(Some)
            }
            _ => {
                let mut s = c.to_string();
                while let Some(&nc) = self.chars.peek() {
                    if nc.is_whitespace() || "(){}[],:".contains(nc) {
                        break;
                    }
                    s.push(nc);
                    self.chars.next();
                }
                Ok(Some(Token::Symbol(s)))
            }
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, ReaderError> {
        let mut s = String::new();
        let mut escaped = false;
        for nc in self.chars.by_ref() {
            if escaped {
                s.push(match nc {
                    'n' => '\n',
                    't' => '\t',
                    other => other,
                });
                escaped = false;
            } else if nc == '\\' {
                escaped = true;
            } else if nc == quote {
                return Ok(Token::String(s));
            } else {
                s.push(nc);
            }
        }
        Err(ReaderError::UnterminatedString)
    }

    fn read_number(&mut self, first: char) -> Result<Token, ReaderError> {
        let mut s = first.to_string();
        while let Some(&nc) = self.chars.peek() {
            if nc.is_ascii_digit() || nc == '.' {
                s.push(nc);
                self.chars.next();
            } else {
                break;
            }
        }
        if let Ok(n) = s.parse::<i64>() {
            return Ok(Token::Number(json!(n)));
        }
        let n = s.parse::<f64>().map_err(|_| ReaderError::InvalidNumber(s))?;
        Ok(Token::Number(json!(n)))
    }
}
