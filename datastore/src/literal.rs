//! Parser for the literal dictionaries devices embed in their `values`
//! field, e.g. `{'values':[{'name':'SHT25-Top','type':'float','value':24.0}]}`.
//!
//! Strings may use single or double quotes and `True`/`False`/`None` are
//! accepted. Numbers keep their source text so `24.0` stays `24.0`.

use std::fmt::Write as _;

/// Deepest list/dict nesting accepted before parsing gives up.
pub const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(String),
    Bool(bool),
    None,
    List(Vec<Literal>),
    Dict(Vec<(String, Literal)>),
}

impl Literal {
    pub fn get(&self, key: &str) -> Option<&Literal> {
        match self {
            Literal::Dict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn first(&self) -> Option<&Literal> {
        match self {
            Literal::List(items) => items.first(),
            _ => None,
        }
    }

    /// Text form used when storing a value: strings unquoted, everything
    /// else as JSON.
    pub fn render(&self) -> String {
        match self {
            Literal::Str(s) => s.clone(),
            other => {
                let mut out = String::new();
                other.write_json(&mut out);
                out
            }
        }
    }

    fn write_json(&self, out: &mut String) {
        match self {
            Literal::Str(s) => {
                // serde_json handles escaping
                out.push_str(&serde_json::Value::String(s.clone()).to_string());
            }
            Literal::Num(n) => out.push_str(n),
            Literal::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            Literal::None => out.push_str("null"),
            Literal::List(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    item.write_json(out);
                }
                out.push(']');
            }
            Literal::Dict(entries) => {
                out.push('{');
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    Literal::Str(k.clone()).write_json(out);
                    out.push_str(": ");
                    v.write_json(out);
                }
                out.push('}');
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub pos: usize,
    pub msg: &'static str,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at byte {}", self.msg, self.pos)
    }
}

impl std::error::Error for ParseError {}

pub fn parse(input: &str) -> Result<Literal, ParseError> {
    let mut parser = Parser {
        src: input.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.err("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: &'static str) -> ParseError {
        ParseError { pos: self.pos, msg }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.err("nesting too deep"));
        }
        self.depth += 1;
        self.pos += 1;
        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8, msg: &'static str) -> Result<(), ParseError> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.err(msg))
        }
    }

    fn value(&mut self) -> Result<Literal, ParseError> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') => self.dict(),
            Some(b'[') => self.list(),
            Some(q @ (b'\'' | b'"')) => self.string(q).map(Literal::Str),
            Some(b'-' | b'+' | b'.' | b'0'..=b'9') => self.number(),
            Some(b'A'..=b'Z' | b'a'..=b'z') => self.keyword(),
            Some(_) => Err(self.err("unexpected character")),
            None => Err(self.err("unexpected end of input")),
        }
    }

    fn dict(&mut self) -> Result<Literal, ParseError> {
        self.enter()?;
        let mut entries = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b'}') {
                self.pos += 1;
                self.depth -= 1;
                return Ok(Literal::Dict(entries));
            }
            let key = match self.value()? {
                Literal::Str(s) | Literal::Num(s) => s,
                _ => return Err(self.err("unsupported dictionary key")),
            };
            self.expect(b':', "expected ':'")?;
            let value = self.value()?;
            entries.push((key, value));
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b'}') => {}
                _ => return Err(self.err("expected ',' or '}'")),
            }
        }
    }

    fn list(&mut self) -> Result<Literal, ParseError> {
        self.enter()?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b']') {
                self.pos += 1;
                self.depth -= 1;
                return Ok(Literal::List(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.peek() {
                Some(b',') => self.pos += 1,
                Some(b']') => {}
                _ => return Err(self.err("expected ',' or ']'")),
            }
        }
    }

    fn string(&mut self, quote: u8) -> Result<String, ParseError> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err(self.err("unterminated string")),
                Some(b) if b == quote => {
                    self.pos += 1;
                    return String::from_utf8(out).map_err(|_| self.err("invalid utf-8"));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    let escaped = match self.peek() {
                        Some(b'n') => b'\n',
                        Some(b't') => b'\t',
                        Some(b'r') => b'\r',
                        Some(b) => b,
                        None => return Err(self.err("unterminated escape")),
                    };
                    out.push(escaped);
                    self.pos += 1;
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn number(&mut self) -> Result<Literal, ParseError> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'-' | b'+' | b'.' | b'e' | b'E' | b'0'..=b'9')
        ) {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.err("invalid number"))?;
        if text.parse::<f64>().is_err() {
            return Err(ParseError {
                pos: start,
                msg: "invalid number",
            });
        }
        Ok(Literal::Num(text.trim_start_matches('+').to_string()))
    }

    fn keyword(&mut self) -> Result<Literal, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(b'A'..=b'Z' | b'a'..=b'z')) {
            self.pos += 1;
        }
        match &self.src[start..self.pos] {
            b"True" | b"true" => Ok(Literal::Bool(true)),
            b"False" | b"false" => Ok(Literal::Bool(false)),
            b"None" | b"null" => Ok(Literal::None),
            _ => Err(ParseError {
                pos: start,
                msg: "unknown keyword",
            }),
        }
    }
}
