// src/expression/lexer.rs

use super::EvalError;

/// Statement keywords have no place in an expression; meeting one is treated
/// as an injection attempt rather than a typo.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "import", "from", "exec", "def", "class", "del", "global", "nonlocal", "yield", "await", "async",
    "return", "raise", "try", "except", "finally", "while", "with", "assert", "pass", "break",
    "continue",
];

// Longest first, so that maximal munch works by scanning in order.
const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "**", "//", "==", "!=", "<=", ">=", "<<", ">>", ":=", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "@=", "->", "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[",
    "]", "{", "}", ",", ":", ".", "~", "&", "|", "^", ";", "@",
];

// A bare `=` is lexed: keyword arguments and lambda defaults need it. The
// parser rejects it everywhere else.
const ASSIGNMENT_OPERATORS: &[&str] = &[
    ":=", "+=", "-=", "*=", "/=", "//=", "%=", "**=", ">>=", "<<=", "&=", "|=", "^=", "@=",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Name(String),
    Op(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

/// Splits an expression into tokens, rejecting forbidden constructs on sight.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, EvalError> {
    let mut lexer = Lexer { src: source, pos: 0 };
    let mut tokens = Vec::new();
    loop {
        lexer.skip_blanks();
        let offset = lexer.pos;
        let Some(c) = lexer.peek() else {
            tokens.push(Spanned { token: Token::Eof, offset });
            return Ok(tokens);
        };
        let token = if c.is_ascii_digit() || (c == '.' && lexer.peek_nth(1).is_some_and(|n| n.is_ascii_digit())) {
            lexer.number()?
        } else if c == '\'' || c == '"' {
            lexer.string(false, false)?
        } else if c.is_alphabetic() || c == '_' {
            lexer.word()?
        } else {
            lexer.operator()?
        };
        tokens.push(Spanned { token, offset });
    }
}

struct Lexer<'a> {
    src: &'a str,
    pos: usize,
}

impl Lexer<'_> {
    fn rest(&self) -> &str {
        self.src.get(self.pos..).unwrap_or("")
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn peek_nth(&self, n: usize) -> Option<char> {
        self.rest().chars().nth(n)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> EvalError {
        EvalError::Syntax {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn skip_blanks(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() || (c == '\\' && self.peek_nth(1) == Some('\n')) {
                self.bump();
            } else if c == '#' {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.bump();
                }
            } else {
                break;
            }
        }
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek().filter(|c| pred(*c)) {
            out.push(c);
            self.bump();
        }
        out
    }

    fn word(&mut self) -> Result<Token, EvalError> {
        let start = self.pos;
        let word = self.take_while(|c| c.is_alphanumeric() || c == '_');
        let quoted = matches!(self.peek(), Some('\'' | '"'));
        if quoted {
            match word.to_ascii_lowercase().as_str() {
                "b" => return self.string(false, true),
                "r" => return self.string(true, false),
                "u" => return self.string(false, false),
                "rb" | "br" => return self.string(true, true),
                "f" | "rf" | "fr" => {
                    return Err(EvalError::Syntax {
                        offset: start,
                        message: "formatted string literals are not supported".into(),
                    });
                }
                _ => {}
            }
        }
        if word.starts_with("__") {
            return Err(EvalError::Forbidden(format!("dunder name '{}'", word)));
        }
        if FORBIDDEN_KEYWORDS.contains(&word.as_str()) {
            return Err(EvalError::Forbidden(format!("statement keyword '{}'", word)));
        }
        Ok(Token::Name(word))
    }

    fn number(&mut self) -> Result<Token, EvalError> {
        let start = self.pos;
        let radix = match (self.peek(), self.peek_nth(1).map(|c| c.to_ascii_lowercase())) {
            (Some('0'), Some('x')) => Some(16),
            (Some('0'), Some('o')) => Some(8),
            (Some('0'), Some('b')) => Some(2),
            _ => None,
        };
        if let Some(radix) = radix {
            self.bump();
            self.bump();
            let digits = self.take_while(|c| c.is_ascii_alphanumeric() || c == '_').replace('_', "");
            return i64::from_str_radix(&digits, radix)
                .map(Token::Int)
                .map_err(|_| self.error(format!("invalid integer literal '{}'", self.src.get(start..self.pos).unwrap_or(""))));
        }

        let mut text = self.take_while(|c| c.is_ascii_digit() || c == '_');
        let mut is_float = false;
        if self.peek() == Some('.') && !self.peek_nth(1).is_some_and(|c| c.is_alphabetic() || c == '_') {
            is_float = true;
            self.bump();
            text.push('.');
            text.push_str(&self.take_while(|c| c.is_ascii_digit() || c == '_'));
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let sign = self.peek_nth(1);
            let digit_at = if matches!(sign, Some('+' | '-')) { 2 } else { 1 };
            if self.peek_nth(digit_at).is_some_and(|c| c.is_ascii_digit()) {
                is_float = true;
                for _ in 0..digit_at {
                    if let Some(c) = self.bump() {
                        text.push(c);
                    }
                }
                text.push_str(&self.take_while(|c| c.is_ascii_digit()));
            }
        }
        if matches!(self.peek(), Some('j' | 'J')) {
            return Err(self.error("complex literals are not supported"));
        }
        if self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            return Err(self.error("invalid numeric literal"));
        }

        let text = text.replace('_', "");
        if is_float {
            text.parse::<f64>()
                .map(Token::Float)
                .map_err(|_| self.error(format!("invalid float literal '{}'", text)))
        } else {
            text.parse::<i64>()
                .map(Token::Int)
                .map_err(|_| self.error(format!("integer literal '{}' is too large", text)))
        }
    }

    fn string(&mut self, raw: bool, bytes: bool) -> Result<Token, EvalError> {
        let start = self.pos;
        let Some(quote) = self.bump() else {
            return Err(self.error("expected a string literal"));
        };
        let triple = self.peek() == Some(quote) && self.peek_nth(1) == Some(quote);
        if triple {
            self.bump();
            self.bump();
        }

        let mut units: Vec<u32> = Vec::new();
        let unterminated = || EvalError::Syntax {
            offset: start,
            message: "unterminated string literal".into(),
        };
        loop {
            let c = self.bump().ok_or_else(unterminated)?;
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_nth(1) == Some(quote) {
                    self.bump();
                    self.bump();
                    break;
                }
                units.push(u32::from(c));
            } else if c == '\n' && !triple {
                return Err(unterminated());
            } else if c == '\\' {
                let escaped = self.bump().ok_or_else(unterminated)?;
                if raw {
                    units.push(u32::from('\\'));
                    units.push(u32::from(escaped));
                    continue;
                }
                match escaped {
                    '\n' => {}
                    'n' => units.push(0x0a),
                    't' => units.push(0x09),
                    'r' => units.push(0x0d),
                    '0' => units.push(0x00),
                    'a' => units.push(0x07),
                    'b' => units.push(0x08),
                    'f' => units.push(0x0c),
                    'v' => units.push(0x0b),
                    '\\' | '\'' | '"' => units.push(u32::from(escaped)),
                    'x' => units.push(self.hex_escape(2)?),
                    'u' if !bytes => units.push(self.hex_escape(4)?),
                    'U' if !bytes => units.push(self.hex_escape(8)?),
                    other => {
                        units.push(u32::from('\\'));
                        units.push(u32::from(other));
                    }
                }
            } else {
                if bytes && !c.is_ascii() {
                    return Err(self.error("bytes can only contain ASCII literal characters"));
                }
                units.push(u32::from(c));
            }
        }

        if bytes {
            units
                .into_iter()
                .map(|u| u8::try_from(u).map_err(|_| self.error("byte value out of range")))
                .collect::<Result<Vec<u8>, _>>()
                .map(Token::Bytes)
        } else {
            units
                .into_iter()
                .map(|u| char::from_u32(u).ok_or_else(|| self.error("invalid unicode escape")))
                .collect::<Result<String, _>>()
                .map(Token::Str)
        }
    }

    fn hex_escape(&mut self, len: usize) -> Result<u32, EvalError> {
        let mut digits = String::with_capacity(len);
        for _ in 0..len {
            match self.bump() {
                Some(c) if c.is_ascii_hexdigit() => digits.push(c),
                _ => return Err(self.error("truncated escape sequence")),
            }
        }
        u32::from_str_radix(&digits, 16).map_err(|_| self.error("invalid escape sequence"))
    }

    fn operator(&mut self) -> Result<Token, EvalError> {
        let rest = self.rest();
        let Some(op) = OPERATORS.iter().copied().find(|op| rest.starts_with(op)) else {
            let c = self.peek().unwrap_or(' ');
            return Err(self.error(format!("unexpected character '{}'", c)));
        };
        if ASSIGNMENT_OPERATORS.contains(&op) {
            return Err(EvalError::Forbidden(format!("assignment operator '{}'", op)));
        }
        if op == ";" {
            return Err(EvalError::Forbidden("statement separator ';'".into()));
        }
        if op == "@" || op == "->" {
            return Err(self.error(format!("unsupported operator '{}'", op)));
        }
        self.pos += op.len();
        Ok(Token::Op(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_numbers_in_every_base() {
        assert_eq!(
            tokens("0x1F 0o17 0b101 1_000 2.5 .5 1e3"),
            vec![
                Token::Int(31),
                Token::Int(15),
                Token::Int(5),
                Token::Int(1000),
                Token::Float(2.5),
                Token::Float(0.5),
                Token::Float(1000.0),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_string_prefixes_and_escapes() {
        assert_eq!(
            tokens(r#"'a\tb' b"\x00\xff" r"\n""#),
            vec![
                Token::Str("a\tb".into()),
                Token::Bytes(vec![0, 255]),
                Token::Str("\\n".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_two_char_operators_win() {
        assert_eq!(
            tokens("a // b ** c != d"),
            vec![
                Token::Name("a".into()),
                Token::Op("//"),
                Token::Name("b".into()),
                Token::Op("**"),
                Token::Name("c".into()),
                Token::Op("!="),
                Token::Name("d".into()),
                Token::Eof
            ]
        );
    }

    #[test]
    fn test_forbidden_tokens() {
        for source in ["__import__('os')", "x += 1", "(y := 2)", "a; b", "import os", "obj.__class__"] {
            assert!(
                matches!(tokenize(source), Err(EvalError::Forbidden(_))),
                "'{}' should be forbidden",
                source
            );
        }
    }

    #[test]
    fn test_unterminated_string() {
        assert!(matches!(tokenize("'abc"), Err(EvalError::Syntax { .. })));
    }
}
