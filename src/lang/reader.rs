//! Reader for the printed form of [`Literal`] values.
//!
//! This is not the language reader. It only accepts the subset of syntax that
//! `Literal`'s `Display` impl produces, which is what the pack format stores
//! for constants.

use super::literal::{Literal, char_name};
use super::symbol::Symbol;

#[derive(Debug, Clone, PartialEq)]
pub struct ReadError {
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

impl std::error::Error for ReadError {}

/// Deepest collection nesting the reader accepts.
pub const MAX_DEPTH: usize = 128;

/// Parse exactly one literal from `source`. Trailing non-whitespace is an error.
pub fn read_literal(source: &str) -> Result<Literal, ReadError> {
    let mut reader = Reader::new(source);
    let lit = reader.read()?;
    reader.skip_whitespace();
    if reader.current().is_some() {
        return Err(reader.error("unexpected trailing input after literal"));
    }
    Ok(lit)
}

/// Whether a quoted symbol prints as text that reads back as the same symbol.
/// Names like `nil`, `12` or `a b` do not.
pub fn reads_as_symbol(sym: &Symbol) -> bool {
    let text = sym.to_string();
    let mut chars = text.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let numeric = first.is_ascii_digit()
        || (matches!(first, '-' | '+') && chars.next().is_some_and(|c| c.is_ascii_digit()));
    !numeric
        && !matches!(first, ':' | '#' | '\\')
        && !matches!(text.as_str(), "nil" | "true" | "false")
        && !text.contains(is_delimiter)
        && Symbol::parse(&text) == *sym
}

/// Same check for a keyword; everything after the colon is one token.
pub fn reads_as_keyword(sym: &Symbol) -> bool {
    let text = sym.to_string();
    !text.is_empty() && !text.contains(is_delimiter) && Symbol::parse(&text) == *sym
}

struct Reader {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    depth: usize,
}

fn is_delimiter(ch: char) -> bool {
    ch.is_whitespace() || matches!(ch, ',' | '(' | ')' | '[' | ']' | '{' | '}' | '"' | ';')
}

impl Reader {
    fn new(source: &str) -> Self {
        Reader {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            depth: 0,
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn error(&self, message: impl Into<String>) -> ReadError {
        ReadError {
            message: message.into(),
            line: self.line,
            col: self.col,
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current() {
            if ch.is_whitespace() || ch == ',' {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_token(&mut self) -> String {
        let mut token = String::new();
        while let Some(ch) = self.current() {
            if is_delimiter(ch) {
                break;
            }
            token.push(ch);
            self.advance();
        }
        token
    }

    fn read(&mut self) -> Result<Literal, ReadError> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("literal nested too deeply"));
        }
        self.depth += 1;
        let result = self.read_form();
        self.depth -= 1;
        result
    }

    fn read_form(&mut self) -> Result<Literal, ReadError> {
        self.skip_whitespace();
        match self.current() {
            None => Err(self.error("unexpected end of input")),
            Some('(') => {
                self.advance();
                Ok(Literal::List(self.read_seq(')')?))
            }
            Some('[') => {
                self.advance();
                Ok(Literal::Vector(self.read_seq(']')?))
            }
            Some('{') => {
                self.advance();
                self.read_map()
            }
            Some('#') => self.read_dispatch(),
            Some('"') => self.read_string(),
            Some('\\') => self.read_char(),
            Some(':') => {
                self.advance();
                let token = self.read_token();
                if token.is_empty() {
                    return Err(self.error("empty keyword"));
                }
                Ok(Literal::Keyword(Symbol::parse(&token)))
            }
            Some(ch @ (')' | ']' | '}')) => Err(self.error(format!("unexpected '{}'", ch))),
            Some(ch) if ch.is_ascii_digit() => self.read_number(),
            Some('-' | '+') if self.peek().is_some_and(|c| c.is_ascii_digit()) => {
                self.read_number()
            }
            Some(_) => {
                let token = self.read_token();
                Ok(match token.as_str() {
                    "nil" => Literal::Nil,
                    "true" => Literal::Bool(true),
                    "false" => Literal::Bool(false),
                    _ => Literal::Symbol(Symbol::parse(&token)),
                })
            }
        }
    }

    fn read_seq(&mut self, close: char) -> Result<Vec<Literal>, ReadError> {
        let mut items = Vec::new();
        loop {
            self.skip_whitespace();
            match self.current() {
                Some(ch) if ch == close => {
                    self.advance();
                    return Ok(items);
                }
                None => return Err(self.error(format!("unterminated collection, expected '{}'", close))),
                Some(_) => items.push(self.read()?),
            }
        }
    }

    fn read_map(&mut self) -> Result<Literal, ReadError> {
        let items = self.read_seq('}')?;
        if items.len() % 2 != 0 {
            return Err(self.error("map literal must contain an even number of forms"));
        }
        let mut entries = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            entries.push((k, v));
        }
        Ok(Literal::Map(entries))
    }

    fn read_dispatch(&mut self) -> Result<Literal, ReadError> {
        self.advance();
        match self.current() {
            Some('{') => {
                self.advance();
                Ok(Literal::Set(self.read_seq('}')?))
            }
            Some('#') => {
                self.advance();
                let token = self.read_token();
                match token.as_str() {
                    "Inf" => Ok(Literal::Float(f64::INFINITY)),
                    "-Inf" => Ok(Literal::Float(f64::NEG_INFINITY)),
                    "NaN" => Ok(Literal::Float(f64::NAN)),
                    _ => Err(self.error(format!("unknown symbolic value ##{}", token))),
                }
            }
            Some(ch) => Err(self.error(format!("unsupported dispatch macro #{}", ch))),
            None => Err(self.error("unexpected end of input after '#'")),
        }
    }

    fn read_string(&mut self) -> Result<Literal, ReadError> {
        let start_line = self.line;
        let start_col = self.col;
        self.advance();

        let mut string = String::new();
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return Ok(Literal::Str(string));
                }
                Some('\\') => {
                    self.advance();
                    match self.current() {
                        Some('n') => string.push('\n'),
                        Some('t') => string.push('\t'),
                        Some('r') => string.push('\r'),
                        Some('\\') => string.push('\\'),
                        Some('"') => string.push('"'),
                        Some('0') => string.push('\0'),
                        Some(ch) => {
                            return Err(self.error(format!("unknown escape sequence: \\{}", ch)));
                        }
                        None => return Err(self.error("unexpected EOF in escape sequence")),
                    }
                    self.advance();
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
                None => {
                    return Err(ReadError {
                        message: "unterminated string literal".to_string(),
                        line: start_line,
                        col: start_col,
                    });
                }
            }
        }
    }

    fn read_char(&mut self) -> Result<Literal, ReadError> {
        self.advance();
        let first = self
            .advance()
            .ok_or_else(|| self.error("unexpected end of input after '\\'"))?;
        if !first.is_alphanumeric() {
            return Ok(Literal::Char(first));
        }

        let mut name = String::from(first);
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() {
                name.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        if name.chars().count() == 1 {
            return Ok(Literal::Char(first));
        }

        ['\n', ' ', '\t', '\r', '\u{8}', '\u{c}']
            .into_iter()
            .find(|c| char_name(*c) == Some(name.as_str()))
            .map(Literal::Char)
            .ok_or_else(|| self.error(format!("unknown character name \\{}", name)))
    }

    fn read_number(&mut self) -> Result<Literal, ReadError> {
        let start_line = self.line;
        let start_col = self.col;
        let token = self.read_token();
        let invalid = || ReadError {
            message: format!("invalid number: {}", token),
            line: start_line,
            col: start_col,
        };

        if token.contains(['.', 'e', 'E']) {
            token.parse::<f64>().map(Literal::Float).map_err(|_| invalid())
        } else {
            token.parse::<i64>().map(Literal::Int).map_err(|_| invalid())
        }
    }
}
