//! Lexical analysis (tokenization)
//!
//! The lexer converts Nova source code into a stream of tokens with line
//! numbers. The compiler pulls tokens on demand through [`Lexer::scan_token`];
//! there is no separate token buffer, matching the single-pass design.

use crate::diagnostic::Diagnostic;
use crate::span::Span;
use crate::token::{Token, TokenKind};

/// Lexer state for tokenizing source code
pub struct Lexer {
    /// Characters of source code
    chars: Vec<char>,
    /// Lines of the original source (for diagnostic snippets)
    lines: Vec<String>,
    /// Current position in chars
    current: usize,
    /// Current line number (1-indexed)
    line: u32,
    /// Start position of current token
    start: usize,
    /// Start line of current token
    start_line: u32,
    /// Collected diagnostics
    diagnostics: Vec<Diagnostic>,
}

impl Lexer {
    /// Create a new lexer for the given source code
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            lines: source.lines().map(|l| l.to_string()).collect(),
            current: 0,
            line: 1,
            start: 0,
            start_line: 1,
            diagnostics: Vec::new(),
        }
    }

    /// Scan the next token
    pub fn scan_token(&mut self) -> Token {
        self.skip_whitespace_and_comments();

        self.start = self.current;
        self.start_line = self.line;

        if self.is_at_end() {
            return self.make_token(TokenKind::Eof);
        }

        let c = self.advance();
        match c {
            '(' => self.make_token(TokenKind::LeftParen),
            ')' => self.make_token(TokenKind::RightParen),
            '{' => self.make_token(TokenKind::LeftBrace),
            '}' => self.make_token(TokenKind::RightBrace),
            '[' => self.make_token(TokenKind::LeftBracket),
            ']' => self.make_token(TokenKind::RightBracket),
            ',' => self.make_token(TokenKind::Comma),
            ';' => self.make_token(TokenKind::Semicolon),
            ':' => self.make_token(TokenKind::Colon),
            '*' => self.make_token(TokenKind::Star),
            '/' => self.make_token(TokenKind::Slash),
            '%' => self.make_token(TokenKind::Percent),
            '#' => self.make_token(TokenKind::Hash),

            '.' => {
                if self.match_char('.') {
                    if self.match_char('.') {
                        self.make_token(TokenKind::Ellipsis)
                    } else {
                        self.make_token(TokenKind::DotDot)
                    }
                } else {
                    self.make_token(TokenKind::Dot)
                }
            }
            '+' => {
                if self.match_char('+') {
                    self.make_token(TokenKind::PlusPlus)
                } else {
                    self.make_token(TokenKind::Plus)
                }
            }
            '-' => {
                if self.match_char('-') {
                    self.make_token(TokenKind::MinusMinus)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }
            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::EqualEqual)
                } else {
                    self.make_token(TokenKind::Equal)
                }
            }
            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::BangEqual)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }
            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::LessEqual)
                } else {
                    self.make_token(TokenKind::Less)
                }
            }
            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::GreaterEqual)
                } else {
                    self.make_token(TokenKind::Greater)
                }
            }

            '"' => self.string(),
            c if c.is_ascii_digit() => self.number(),
            c if c.is_alphabetic() || c == '_' => self.identifier(),

            _ => self.error_token("NV1001", &format!("unexpected character '{}'", c)),
        }
    }

    /// Drain the diagnostics collected so far
    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Get the source text of a line, for diagnostic snippets
    pub fn line_snippet(&self, line: u32) -> String {
        self.lines
            .get((line.saturating_sub(1)) as usize)
            .cloned()
            .unwrap_or_default()
    }

    /// Skip whitespace, `//` comments and `/* */` comments
    fn skip_whitespace_and_comments(&mut self) {
        loop {
            if self.is_at_end() {
                return;
            }
            match self.peek() {
                ' ' | '\r' | '\t' => {
                    self.advance();
                }
                '\n' => {
                    self.advance();
                    self.line += 1;
                }
                '/' => {
                    if self.peek_next() == Some('/') {
                        while !self.is_at_end() && self.peek() != '\n' {
                            self.advance();
                        }
                    } else if self.peek_next() == Some('*') {
                        let open_line = self.line;
                        self.advance(); // /
                        self.advance(); // *
                        let mut terminated = false;
                        while !self.is_at_end() {
                            if self.peek() == '*' && self.peek_next() == Some('/') {
                                self.advance();
                                self.advance();
                                terminated = true;
                                break;
                            }
                            if self.peek() == '\n' {
                                self.line += 1;
                            }
                            self.advance();
                        }
                        if !terminated {
                            self.diagnostics.push(
                                Diagnostic::error("NV1004", "unterminated block comment")
                                    .with_line(open_line)
                                    .with_snippet(self.line_snippet(open_line))
                                    .with_label("comment starts here")
                                    .with_help("add '*/' to close the comment"),
                            );
                        }
                    } else {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Scan a string literal, processing escape sequences
    fn string(&mut self) -> Token {
        let mut value = String::new();
        while !self.is_at_end() && self.peek() != '"' && self.peek() != '\n' {
            let c = self.advance();
            if c == '\\' {
                if self.is_at_end() {
                    break;
                }
                let escape = self.advance();
                match escape {
                    'n' => value.push('\n'),
                    't' => value.push('\t'),
                    'r' => value.push('\r'),
                    '\\' => value.push('\\'),
                    '"' => value.push('"'),
                    '0' => value.push('\0'),
                    other => {
                        return self.error_token(
                            "NV1003",
                            &format!("invalid escape sequence '\\{}'", other),
                        );
                    }
                }
            } else {
                value.push(c);
            }
        }

        if self.is_at_end() || self.peek() == '\n' {
            return self.error_token("NV1002", "unterminated string literal");
        }
        self.advance(); // closing quote
        self.make_token(TokenKind::String(value))
    }

    /// Scan a number literal: decimal digits, optional fraction and exponent
    fn number(&mut self) -> Token {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance(); // .
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if matches!(self.peek(), 'e' | 'E') {
            let mut lookahead = self.current + 1;
            if matches!(self.chars.get(lookahead), Some('+') | Some('-')) {
                lookahead += 1;
            }
            if self.chars.get(lookahead).is_some_and(|c| c.is_ascii_digit()) {
                self.advance(); // e
                if matches!(self.peek(), '+' | '-') {
                    self.advance();
                }
                while self.peek().is_ascii_digit() {
                    self.advance();
                }
            }
        }

        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        match lexeme.parse::<f64>() {
            Ok(n) => self.make_token(TokenKind::Number(n)),
            Err(_) => self.error_token("NV1005", &format!("malformed number '{}'", lexeme)),
        }
    }

    /// Scan an identifier or keyword
    fn identifier(&mut self) -> Token {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let name: String = self.chars[self.start..self.current].iter().collect();
        match TokenKind::keyword(&name) {
            Some(kind) => self.make_token(kind),
            None => self.make_token(TokenKind::Ident(name)),
        }
    }

    // === Character navigation ===

    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.chars[self.current]
        }
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.current + 1).copied()
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.chars[self.current] != expected {
            false
        } else {
            self.current += 1;
            true
        }
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    // === Token creation ===

    fn make_token(&self, kind: TokenKind) -> Token {
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        Token::new(
            kind,
            lexeme,
            self.start_line,
            Span::new(self.start, self.current),
        )
    }

    /// Create an error token and record the matching diagnostic
    ///
    /// The compiler treats Error tokens as already-reported: it enters panic
    /// mode without emitting a second diagnostic.
    fn error_token(&mut self, code: &str, message: &str) -> Token {
        self.diagnostics.push(
            Diagnostic::error(code, message)
                .with_line(self.start_line)
                .with_snippet(self.line_snippet(self.start_line))
                .with_label("lexical error"),
        );
        Token::new(
            TokenKind::Error,
            message,
            self.start_line,
            Span::new(self.start, self.current.max(self.start + 1)),
        )
    }
}
