use crate::error::{SyntaxError, SyntaxErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    Void,
    Double,
    Return,
    Identifier,
    Integer,
    Real,
    Unknown,
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    LeftBracket,
    RightBracket,
    Comma,
    Semicolon,
    Asterisk,
    Slash,
    Percent,
    Plus,
    Minus,
    Equals,
    EqualEqual,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Bang,
    AndAnd,
    OrOr,
    Caret,
    Question,
    Colon,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    /// How the token is quoted in error messages.
    pub fn describe(&self) -> String {
        match self.kind {
            TokenKind::Eof => "the end of the code".to_string(),
            _ => format!("`{}`", self.text),
        }
    }
}

/// Splits source text into tokens, ending with an `Eof` token.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut scanner = Scanner {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();

    loop {
        let token = scanner.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
}

impl Scanner {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.advance();
                }
                (Some('/'), Some('/')) => {
                    while let Some(c) = self.advance() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    self.advance();
                    self.advance();
                    while self.peek().is_some() {
                        if self.peek() == Some('*') && self.peek_at(1) == Some('/') {
                            self.advance();
                            self.advance();
                            break;
                        }
                        self.advance();
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        self.skip_trivia();

        let line = self.line;
        let column = self.column;
        let make = |kind: TokenKind, text: String| Token {
            kind,
            text,
            line,
            column,
        };

        let Some(c) = self.peek() else {
            return Ok(make(TokenKind::Eof, String::new()));
        };

        if c.is_ascii_alphabetic() || c == '_' {
            let mut word = String::new();
            while let Some(d) = self.peek() {
                if d.is_ascii_alphanumeric() || d == '_' {
                    word.push(d);
                    self.advance();
                } else {
                    break;
                }
            }
            let kind = match word.as_str() {
                "void" => TokenKind::Void,
                "double" => TokenKind::Double,
                "return" => TokenKind::Return,
                _ if word.chars().all(|ch| ch == '_') => TokenKind::Unknown,
                _ => TokenKind::Identifier,
            };
            return Ok(make(kind, word));
        }

        let starts_number = c.is_ascii_digit()
            || (c == '.' && self.peek_at(1).is_some_and(|d| d.is_ascii_digit()));
        if starts_number {
            return self.number(line, column);
        }

        self.advance();
        let two = |scanner: &mut Scanner, next: char, double: TokenKind, single: TokenKind| {
            if scanner.peek() == Some(next) {
                scanner.advance();
                (double, format!("{c}{next}"))
            } else {
                (single, c.to_string())
            }
        };

        let (kind, text) = match c {
            '(' => (TokenKind::LeftParen, c.to_string()),
            ')' => (TokenKind::RightParen, c.to_string()),
            '{' => (TokenKind::LeftBrace, c.to_string()),
            '}' => (TokenKind::RightBrace, c.to_string()),
            '[' => (TokenKind::LeftBracket, c.to_string()),
            ']' => (TokenKind::RightBracket, c.to_string()),
            ',' => (TokenKind::Comma, c.to_string()),
            ';' => (TokenKind::Semicolon, c.to_string()),
            '*' => (TokenKind::Asterisk, c.to_string()),
            '/' => (TokenKind::Slash, c.to_string()),
            '%' => (TokenKind::Percent, c.to_string()),
            '+' => (TokenKind::Plus, c.to_string()),
            '-' => (TokenKind::Minus, c.to_string()),
            '^' => (TokenKind::Caret, c.to_string()),
            '?' => (TokenKind::Question, c.to_string()),
            ':' => (TokenKind::Colon, c.to_string()),
            '=' => two(self, '=', TokenKind::EqualEqual, TokenKind::Equals),
            '!' => two(self, '=', TokenKind::NotEqual, TokenKind::Bang),
            '<' => two(self, '=', TokenKind::LessEqual, TokenKind::Less),
            '>' => two(self, '=', TokenKind::GreaterEqual, TokenKind::Greater),
            '&' => two(self, '&', TokenKind::AndAnd, TokenKind::Unknown),
            '|' => two(self, '|', TokenKind::OrOr, TokenKind::Unknown),
            _ => (TokenKind::Unknown, c.to_string()),
        };
        Ok(make(kind, text))
    }

    fn digits(&mut self, literal: &mut String) -> usize {
        let mut count = 0;
        while let Some(d) = self.peek().filter(|d| d.is_ascii_digit()) {
            literal.push(d);
            self.advance();
            count += 1;
        }
        count
    }

    fn number(&mut self, line: usize, column: usize) -> Result<Token, SyntaxError> {
        let mut literal = String::new();
        let mut kind = TokenKind::Integer;

        self.digits(&mut literal);

        if self.peek() == Some('.') {
            kind = TokenKind::Real;
            literal.push('.');
            self.advance();
            self.digits(&mut literal);
        }

        if matches!(self.peek(), Some('e') | Some('E')) {
            kind = TokenKind::Real;
            literal.push('e');
            self.advance();
            if let Some(sign) = self.peek().filter(|s| *s == '+' || *s == '-') {
                literal.push(sign);
                self.advance();
            }
            if self.digits(&mut literal) == 0 {
                return Err(SyntaxError {
                    line,
                    column,
                    kind: SyntaxErrorKind::MalformedNumber {
                        literal,
                        reason: "the exponent has no digits".to_string(),
                    },
                });
            }
        }

        check_magnitude(&literal, line, column)?;

        Ok(Token {
            kind,
            text: literal,
            line,
            column,
        })
    }
}

fn check_magnitude(literal: &str, line: usize, column: usize) -> Result<(), SyntaxError> {
    let out_of_range = || SyntaxError {
        line,
        column,
        kind: SyntaxErrorKind::NumberOutOfRange {
            literal: literal.to_string(),
        },
    };

    let value: f64 = literal.parse().map_err(|_| out_of_range())?;
    let mantissa = literal.split('e').next().unwrap_or(literal);
    let mantissa_is_zero = mantissa.chars().all(|c| c == '0' || c == '.');

    if value.is_infinite() || (value == 0.0 && !mantissa_is_zero) {
        return Err(out_of_range());
    }
    Ok(())
}
