use std::fmt;

use serde_json::{Map, Number, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralError {
    pub position: usize,
    pub message: String,
}

impl fmt::Display for LiteralError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at byte {}", self.message, self.position)
    }
}

impl std::error::Error for LiteralError {}

/// Parses exactly one literal; trailing whitespace, comments and a single `;`
/// are allowed after it. Identifiers, calls and operators are errors.
pub fn parse_literal(source: &str) -> Result<Value, LiteralError> {
    let mut parser = Parser { source, pos: 0 };
    let value = parser.value()?;
    parser.skip_trivia();
    if parser.peek() == Some(';') {
        parser.bump();
        parser.skip_trivia();
    }
    if parser.pos != source.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(value)
}

/// Parses one literal at the start of `source` and returns it with the byte
/// offset just past it. Whatever follows is left to the caller.
pub fn parse_literal_prefix(source: &str) -> Result<(Value, usize), LiteralError> {
    let mut parser = Parser { source, pos: 0 };
    let value = parser.value()?;
    Ok((value, parser.pos))
}

struct Parser<'a> {
    source: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> LiteralError {
        LiteralError {
            position: self.pos,
            message: message.to_string(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.source[self.pos..].chars().nth(offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, expected: char) -> Result<(), LiteralError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected `{expected}`"))),
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    self.pos += 2;
                    match self.source[self.pos..].find("*/") {
                        Some(end) => self.pos += end + 2,
                        None => self.pos = self.source.len(),
                    }
                }
                _ => return,
            }
        }
    }

    fn value(&mut self) -> Result<Value, LiteralError> {
        self.skip_trivia();
        match self.peek() {
            Some('{') => self.object(),
            Some('[') => self.array(),
            Some(quote @ ('"' | '\'')) => self.string(quote).map(Value::String),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.number(),
            Some(c) if is_identifier_start(c) => {
                let start = self.pos;
                let word = self.identifier();
                match word {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    "null" | "undefined" => Ok(Value::Null),
                    _ => Err(LiteralError {
                        position: start,
                        message: format!("`{word}` is not a literal"),
                    }),
                }
            }
            Some(_) => Err(self.error("unexpected character")),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn object(&mut self) -> Result<Value, LiteralError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_trivia();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Object(map));
            }
            let key = self.key()?;
            self.skip_trivia();
            self.expect(':')?;
            let value = self.value()?;
            map.insert(key, value);
            self.skip_trivia();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                _ => return Err(self.error("expected `,` or `}`")),
            }
        }
    }

    fn key(&mut self) -> Result<String, LiteralError> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => self.string(quote),
            Some(c) if is_identifier_start(c) => Ok(self.identifier().to_string()),
            Some(c) if c.is_ascii_digit() => match self.number()? {
                Value::Number(number) => Ok(number.to_string()),
                _ => Err(self.error("bad numeric key")),
            },
            _ => Err(self.error("expected a property name")),
        }
    }

    fn array(&mut self) -> Result<Value, LiteralError> {
        self.expect('[')?;
        let mut items = vec![];
        loop {
            self.skip_trivia();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_trivia();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(Value::Array(items)),
                _ => return Err(self.error("expected `,` or `]`")),
            }
        }
    }

    fn identifier(&mut self) -> &'a str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_identifier_start(c) || c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }
        &self.source[start..self.pos]
    }

    fn string(&mut self, quote: char) -> Result<String, LiteralError> {
        self.expect(quote)?;
        let mut out = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('v') => out.push('\u{b}'),
                    Some('0') => out.push('\0'),
                    Some('x') => out.push(self.hex_escape(2)?),
                    Some('u') => out.push(self.unicode_escape()?),
                    // Line continuation.
                    Some('\n') => {}
                    Some('\r') => {
                        if self.peek() == Some('\n') {
                            self.bump();
                        }
                    }
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn hex_code(&mut self, digits: usize) -> Result<u32, LiteralError> {
        let end = self.pos + digits;
        let hex = self
            .source
            .get(self.pos..end)
            .ok_or_else(|| self.error("short escape"))?;
        let code = u32::from_str_radix(hex, 16).map_err(|_| self.error("bad escape"))?;
        self.pos = end;
        Ok(code)
    }

    fn hex_escape(&mut self, digits: usize) -> Result<char, LiteralError> {
        let code = self.hex_code(digits)?;
        char::from_u32(code).ok_or_else(|| self.error("bad escape"))
    }

    fn unicode_escape(&mut self) -> Result<char, LiteralError> {
        let high = self.hex_code(4)?;
        if (0xD800..0xDC00).contains(&high) && self.source[self.pos..].starts_with("\\u") {
            self.pos += 2;
            let low = self.hex_code(4)?;
            let code = 0x10000 + ((high - 0xD800) << 10) + (low.wrapping_sub(0xDC00) & 0x3FF);
            return char::from_u32(code).ok_or_else(|| self.error("bad surrogate pair"));
        }
        Ok(char::from_u32(high).unwrap_or('\u{FFFD}'))
    }

    fn number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        let negative = match self.peek() {
            Some('-') => {
                self.bump();
                true
            }
            Some('+') => {
                self.bump();
                false
            }
            _ => false,
        };

        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.bump();
            }
            let value = i64::from_str_radix(&self.source[digits_start..self.pos], 16)
                .map_err(|_| self.error("bad hex number"))?;
            return Ok(Value::from(if negative { -value } else { value }));
        }

        let digits_start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E'))
        {
            let c = self.bump();
            if matches!(c, Some('e' | 'E')) && matches!(self.peek(), Some('+' | '-')) {
                self.bump();
            }
        }
        let digits = &self.source[digits_start..self.pos];
        if digits.is_empty() || digits == "." {
            return Err(LiteralError {
                position: start,
                message: "expected a number".to_string(),
            });
        }

        let is_integer = digits.bytes().all(|b| b.is_ascii_digit());
        if is_integer {
            if let Ok(value) = digits.parse::<i64>() {
                return Ok(Value::from(if negative { -value } else { value }));
            }
        }
        let value: f64 = digits.parse().map_err(|_| LiteralError {
            position: start,
            message: format!("bad number `{digits}`"),
        })?;
        let value = if negative { -value } else { value };
        Number::from_f64(value)
            .map(Value::Number)
            .ok_or_else(|| self.error("number out of range"))
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}
