//! Tokenizer for rule scripts.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

/// Token categories of the rule language
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    // Keywords
    Rule,
    Let,
    When,
    Then,
    Set,
    Unset,
    If,
    Else,
    And,
    Or,
    Not,
    In,
    True,
    False,
    Null,

    // Literals and identifiers
    Ident(String),
    Str(String),
    Int(i64),
    Float(f64),

    // Punctuation
    LeftBrace,
    RightBrace,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    Comma,
    Colon,
    Semicolon,
    Dot,

    // Operators
    Assign,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Bang,

    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier `{}`", name),
            TokenKind::Str(value) => write!(f, "string {:?}", value),
            TokenKind::Int(value) => write!(f, "number {}", value),
            TokenKind::Float(value) => write!(f, "number {}", value),
            TokenKind::Eof => f.write_str("end of script"),
            other => {
                let text = match other {
                    TokenKind::Rule => "rule",
                    TokenKind::Let => "let",
                    TokenKind::When => "when",
                    TokenKind::Then => "then",
                    TokenKind::Set => "set",
                    TokenKind::Unset => "unset",
                    TokenKind::If => "if",
                    TokenKind::Else => "else",
                    TokenKind::And => "and",
                    TokenKind::Or => "or",
                    TokenKind::Not => "not",
                    TokenKind::In => "in",
                    TokenKind::True => "true",
                    TokenKind::False => "false",
                    TokenKind::Null => "null",
                    TokenKind::LeftBrace => "{",
                    TokenKind::RightBrace => "}",
                    TokenKind::LeftParen => "(",
                    TokenKind::RightParen => ")",
                    TokenKind::LeftBracket => "[",
                    TokenKind::RightBracket => "]",
                    TokenKind::Comma => ",",
                    TokenKind::Colon => ":",
                    TokenKind::Semicolon => ";",
                    TokenKind::Dot => ".",
                    TokenKind::Assign => "=",
                    TokenKind::Equal => "==",
                    TokenKind::NotEqual => "!=",
                    TokenKind::Less => "<",
                    TokenKind::LessEqual => "<=",
                    TokenKind::Greater => ">",
                    TokenKind::GreaterEqual => ">=",
                    TokenKind::Plus => "+",
                    TokenKind::Minus => "-",
                    TokenKind::Star => "*",
                    TokenKind::Slash => "/",
                    TokenKind::Percent => "%",
                    TokenKind::AndAnd => "&&",
                    TokenKind::OrOr => "||",
                    TokenKind::Bang => "!",
                    _ => "?",
                };
                write!(f, "`{}`", text)
            }
        }
    }
}

/// A token with its 1-based source position
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

/// Lexing or parsing failure at a source position
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SyntaxError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}: {}", self.line, self.column, self.message)
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    let kind = match word {
        "rule" => TokenKind::Rule,
        "let" => TokenKind::Let,
        "when" => TokenKind::When,
        "then" => TokenKind::Then,
        "set" => TokenKind::Set,
        "unset" => TokenKind::Unset,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "in" => TokenKind::In,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "null" => TokenKind::Null,
        _ => return None,
    };
    Some(kind)
}

struct Lexer<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek() == Some(&expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_line(&mut self) {
        while let Some(&ch) = self.chars.peek() {
            if ch == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('#') => self.skip_line(),
                Some('/') => {
                    let mut lookahead = self.chars.clone();
                    lookahead.next();
                    if lookahead.peek() == Some(&'/') {
                        self.skip_line();
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        self.skip_trivia();
        let (line, column) = (self.line, self.column);
        let token = |kind| Token { kind, line, column };

        let ch = match self.bump() {
            Some(ch) => ch,
            None => return Ok(token(TokenKind::Eof)),
        };

        let kind = match ch {
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '=' if self.eat('=') => TokenKind::Equal,
            '=' => TokenKind::Assign,
            '!' if self.eat('=') => TokenKind::NotEqual,
            '!' => TokenKind::Bang,
            '<' if self.eat('=') => TokenKind::LessEqual,
            '<' => TokenKind::Less,
            '>' if self.eat('=') => TokenKind::GreaterEqual,
            '>' => TokenKind::Greater,
            '&' if self.eat('&') => TokenKind::AndAnd,
            '|' if self.eat('|') => TokenKind::OrOr,
            '"' | '\'' => TokenKind::Str(self.string(ch, line, column)?),
            c if c.is_ascii_digit() => self.number(c, line, column)?,
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = self.chars.peek() {
                    if next.is_alphanumeric() || next == '_' {
                        word.push(next);
                        self.bump();
                    } else {
                        break;
                    }
                }
                keyword(&word).unwrap_or(TokenKind::Ident(word))
            }
            other => {
                let message = format!("unexpected character {:?}", other);
                return Err(SyntaxError::new(line, column, message));
            }
        };
        Ok(token(kind))
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> Result<String, SyntaxError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(SyntaxError::new(line, column, "unterminated string")),
                Some(c) if c == quote => return Ok(value),
                Some('\\') => {
                    let escaped = match self.bump() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        Some('\'') => '\'',
                        Some(other) => {
                            return Err(SyntaxError::new(
                                self.line,
                                self.column,
                                format!("unknown escape \\{}", other),
                            ))
                        }
                        None => return Err(SyntaxError::new(line, column, "unterminated string")),
                    };
                    value.push(escaped);
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn number(
        &mut self,
        first: char,
        line: usize,
        column: usize,
    ) -> Result<TokenKind, SyntaxError> {
        let mut text = String::from(first);
        let mut fractional = false;
        while let Some(&next) = self.chars.peek() {
            if next.is_ascii_digit() {
                text.push(next);
                self.bump();
            } else if next == '.' && !fractional {
                // `1.5` is a number, `a.1` never lexes here
                let mut lookahead = self.chars.clone();
                lookahead.next();
                match lookahead.peek() {
                    Some(d) if d.is_ascii_digit() => {
                        fractional = true;
                        text.push('.');
                        self.bump();
                    }
                    _ => break,
                }
            } else {
                break;
            }
        }

        if fractional {
            text.parse::<f64>()
                .map(TokenKind::Float)
                .map_err(|e| {
                    SyntaxError::new(line, column, format!("invalid number {}: {}", text, e))
                })
        } else {
            text.parse::<i64>()
                .map(TokenKind::Int)
                .map_err(|_| {
                    SyntaxError::new(line, column, format!("integer {} out of range", text))
                })
        }
    }
}

/// Split `source` into tokens, ending with `Eof`
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, SyntaxError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let done = token.kind == TokenKind::Eof;
        tokens.push(token);
        if done {
            return Ok(tokens);
        }
    }
}
