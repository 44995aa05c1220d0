// bog-parser - Tokenizer for the Bog scripting language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Tokenizer for Bog source code.
//!
//! A single-pass scanner over the UTF-8 source. Tokens carry their byte range
//! so diagnostics and tooling can slice the original text. The tokenizer is
//! non-recovering: on invalid input it records one diagnostic in the shared
//! [`Errors`] sink and returns [`TokenizeFailed`].

use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use crate::errors::Errors;

/// A token produced by the tokenizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first byte of the token.
    pub start: u32,
    /// Byte offset one past the last byte of the token.
    pub end: u32,
}

/// The kind of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Eof,
    /// A significant newline (statement terminator).
    Nl,
    /// An identifier; the text is the token's source slice.
    Ident,
    /// A string literal with escapes already processed.
    Str(String),
    Int(i64),
    Num(f64),

    // Keywords
    Not,
    And,
    Or,
    Let,
    Continue,
    Break,
    Return,
    If,
    Else,
    False,
    True,
    For,
    While,
    Match,
    Catch,
    Try,
    Error,
    Import,
    Is,
    As,
    In,
    Fn,
    /// `_`, the discard pattern.
    Underscore,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Period,
    Ellipsis,
    Colon,

    // Operators
    Eq,
    EqEq,
    BangEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    LShift,
    LShiftEq,
    RShift,
    RShiftEq,
    Plus,
    PlusEq,
    Minus,
    MinusEq,
    Asterisk,
    AsteriskEq,
    AsteriskAsterisk,
    AsteriskAsteriskEq,
    Slash,
    SlashEq,
    SlashSlash,
    SlashSlashEq,
    Percent,
    PercentEq,
    Ampersand,
    AmpersandEq,
    Pipe,
    PipeEq,
    Caret,
    CaretEq,
    Tilde,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::Eof => "<eof>",
            TokenKind::Nl => "<newline>",
            TokenKind::Ident => "identifier",
            TokenKind::Str(_) => "string literal",
            TokenKind::Int(_) => "number literal",
            TokenKind::Num(_) => "number literal",
            TokenKind::Not => "not",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Let => "let",
            TokenKind::Continue => "continue",
            TokenKind::Break => "break",
            TokenKind::Return => "return",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::False => "false",
            TokenKind::True => "true",
            TokenKind::For => "for",
            TokenKind::While => "while",
            TokenKind::Match => "match",
            TokenKind::Catch => "catch",
            TokenKind::Try => "try",
            TokenKind::Error => "error",
            TokenKind::Import => "import",
            TokenKind::Is => "is",
            TokenKind::As => "as",
            TokenKind::In => "in",
            TokenKind::Fn => "fn",
            TokenKind::Underscore => "_",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Period => ".",
            TokenKind::Ellipsis => "...",
            TokenKind::Colon => ":",
            TokenKind::Eq => "=",
            TokenKind::EqEq => "==",
            TokenKind::BangEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::LtEq => "<=",
            TokenKind::Gt => ">",
            TokenKind::GtEq => ">=",
            TokenKind::LShift => "<<",
            TokenKind::LShiftEq => "<<=",
            TokenKind::RShift => ">>",
            TokenKind::RShiftEq => ">>=",
            TokenKind::Plus => "+",
            TokenKind::PlusEq => "+=",
            TokenKind::Minus => "-",
            TokenKind::MinusEq => "-=",
            TokenKind::Asterisk => "*",
            TokenKind::AsteriskEq => "*=",
            TokenKind::AsteriskAsterisk => "**",
            TokenKind::AsteriskAsteriskEq => "**=",
            TokenKind::Slash => "/",
            TokenKind::SlashEq => "/=",
            TokenKind::SlashSlash => "//",
            TokenKind::SlashSlashEq => "//=",
            TokenKind::Percent => "%",
            TokenKind::PercentEq => "%=",
            TokenKind::Ampersand => "&",
            TokenKind::AmpersandEq => "&=",
            TokenKind::Pipe => "|",
            TokenKind::PipeEq => "|=",
            TokenKind::Caret => "^",
            TokenKind::CaretEq => "^=",
            TokenKind::Tilde => "~",
        };
        write!(f, "{}", s)
    }
}

/// Marker returned when tokenizing fails; the diagnostic is in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizeFailed;

impl fmt::Display for TokenizeFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tokenize error")
    }
}

impl std::error::Error for TokenizeFailed {}

/// Horizontal whitespace outside strings. Covers ASCII plus the fixed set of
/// Unicode space code points the language accepts between tokens.
fn is_horizontal_space(c: char) -> bool {
    matches!(
        c,
        ' ' | '\t'
            | '\u{00A0}'
            | '\u{1680}'
            | '\u{180E}'
            | '\u{2000}'..='\u{200A}'
            | '\u{202F}'
            | '\u{205F}'
            | '\u{3000}'
            | '\u{FEFF}'
            | '\u{FFA0}'
    )
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Look up a completed identifier against the keyword table.
fn keyword(text: &str) -> Option<TokenKind> {
    Some(match text {
        "not" => TokenKind::Not,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "let" => TokenKind::Let,
        "continue" => TokenKind::Continue,
        "break" => TokenKind::Break,
        "return" => TokenKind::Return,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "false" => TokenKind::False,
        "true" => TokenKind::True,
        "for" => TokenKind::For,
        "while" => TokenKind::While,
        "match" => TokenKind::Match,
        "catch" => TokenKind::Catch,
        "try" => TokenKind::Try,
        "error" => TokenKind::Error,
        "import" => TokenKind::Import,
        "is" => TokenKind::Is,
        "as" => TokenKind::As,
        "in" => TokenKind::In,
        "fn" => TokenKind::Fn,
        "_" => TokenKind::Underscore,
        _ => return None,
    })
}

/// The tokenizer converts source code into tokens.
pub struct Tokenizer<'s, 'e> {
    source: &'s str,
    chars: Peekable<CharIndices<'s>>,
    errors: &'e mut Errors,
}

type Result<T> = std::result::Result<T, TokenizeFailed>;

impl<'s, 'e> Tokenizer<'s, 'e> {
    /// Create a tokenizer over `source`, recording failures into `errors`.
    pub fn new(source: &'s str, errors: &'e mut Errors) -> Self {
        Tokenizer {
            source,
            chars: source.char_indices().peekable(),
            errors,
        }
    }

    /// Get the next token. At the end of input this yields `Eof` forever.
    pub fn next_token(&mut self) -> Result<Token> {
        loop {
            self.skip_horizontal_space();

            let start = self.pos();
            let c = match self.peek() {
                Some(c) => c,
                None => return Ok(self.token(TokenKind::Eof, start)),
            };

            match c {
                '#' => {
                    // Comment runs to end of line; the newline itself is
                    // still significant and produced on the next iteration.
                    while let Some(c) = self.peek() {
                        if c == '\n' || c == '\r' {
                            break;
                        }
                        self.advance();
                    }
                }
                '\n' => {
                    self.advance();
                    return Ok(self.token(TokenKind::Nl, start));
                }
                '\r' => {
                    self.advance();
                    if self.peek() != Some('\n') {
                        return Err(self.fail("expected a newline after '\\r'", start));
                    }
                    self.advance();
                    return Ok(self.token(TokenKind::Nl, start));
                }
                '\\' => {
                    self.advance();
                    self.expect_line_continuation(start)?;
                }
                '\'' | '"' => return self.string(start),
                '0'..='9' => return self.number(start),
                c if is_ident_start(c) => return Ok(self.identifier(start)),
                _ => return self.operator(start),
            }
        }
    }

    /// Collect every token including the trailing `Eof`.
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn advance(&mut self) -> Option<char> {
        self.chars.next().map(|(_, c)| c)
    }

    /// Byte offset of the next unread character.
    fn pos(&mut self) -> u32 {
        match self.chars.peek() {
            Some(&(i, _)) => i as u32,
            None => self.source.len() as u32,
        }
    }

    fn token(&mut self, kind: TokenKind, start: u32) -> Token {
        Token {
            kind,
            start,
            end: self.pos(),
        }
    }

    fn fail(&mut self, message: &'static str, offset: u32) -> TokenizeFailed {
        self.errors.push_error(message, offset);
        TokenizeFailed
    }

    fn skip_horizontal_space(&mut self) {
        while let Some(c) = self.peek() {
            if is_horizontal_space(c) {
                self.advance();
            } else {
                break;
            }
        }
    }

    /// A backslash outside a string must be followed by a newline.
    fn expect_line_continuation(&mut self, start: u32) -> Result<()> {
        match self.peek() {
            Some('\n') => {
                self.advance();
                Ok(())
            }
            Some('\r') => {
                self.advance();
                if self.peek() == Some('\n') {
                    self.advance();
                    Ok(())
                } else {
                    Err(self.fail("expected a newline after '\\r'", start))
                }
            }
            _ => Err(self.fail("expected a newline after '\\'", start)),
        }
    }

    fn identifier(&mut self, start: u32) -> Token {
        while let Some(c) = self.peek() {
            if is_ident_char(c) {
                self.advance();
            } else {
                break;
            }
        }
        let end = self.pos();
        let text = &self.source[start as usize..end as usize];
        let kind = keyword(text).unwrap_or(TokenKind::Ident);
        Token { kind, start, end }
    }

    // ========================================================================
    // Strings
    // ========================================================================

    fn string(&mut self, start: u32) -> Result<Token> {
        let quote = self.advance().unwrap();
        let mut value = String::new();

        loop {
            let at = self.pos();
            match self.advance() {
                None => return Err(self.fail("unterminated string literal", start)),
                Some(c) if c == quote => break,
                Some('\n') | Some('\r') => {
                    return Err(self.fail("newline in string literal", at));
                }
                Some('\\') => self.string_escape(&mut value, at)?,
                Some(c) => value.push(c),
            }
        }

        Ok(self.token(TokenKind::Str(value), start))
    }

    fn string_escape(&mut self, value: &mut String, at: u32) -> Result<()> {
        match self.advance() {
            Some('\'') => value.push('\''),
            Some('"') => value.push('"'),
            Some('\\') => value.push('\\'),
            Some('n') => value.push('\n'),
            Some('r') => value.push('\r'),
            Some('t') => value.push('\t'),
            // Explicit line continuation inside a string.
            Some('\n') => {}
            Some('\r') => {
                if self.peek() == Some('\n') {
                    self.advance();
                } else {
                    return Err(self.fail("expected a newline after '\\r'", at));
                }
            }
            Some('x') => {
                let mut code = 0u32;
                let mut digits = 0;
                while digits < 2 {
                    match self.peek() {
                        Some(c) if c.is_ascii_hexdigit() => {
                            self.advance();
                            code = code * 16 + c.to_digit(16).unwrap();
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                if digits == 0 {
                    return Err(self.fail("expected hex digits after '\\x'", at));
                }
                match char::from_u32(code) {
                    Some(c) => value.push(c),
                    None => return Err(self.fail("invalid escape code point", at)),
                }
            }
            Some('u') => {
                if self.peek() != Some('{') {
                    return Err(self.fail("expected '{' after '\\u'", at));
                }
                self.advance();
                let mut code = 0u32;
                let mut digits = 0;
                while let Some(c) = self.peek() {
                    if !c.is_ascii_hexdigit() {
                        break;
                    }
                    self.advance();
                    code = code.saturating_mul(16) + c.to_digit(16).unwrap();
                    digits += 1;
                }
                if digits == 0 || digits > 6 {
                    return Err(self.fail("expected 1 to 6 hex digits in '\\u{...}'", at));
                }
                if self.peek() != Some('}') {
                    return Err(self.fail("expected '}' after '\\u{...'", at));
                }
                self.advance();
                match char::from_u32(code) {
                    Some(c) => value.push(c),
                    None => return Err(self.fail("invalid escape code point", at)),
                }
            }
            _ => return Err(self.fail("invalid escape sequence", at)),
        }
        Ok(())
    }

    // ========================================================================
    // Numbers
    // ========================================================================

    fn number(&mut self, start: u32) -> Result<Token> {
        let first = self.advance().unwrap();

        if first == '0' {
            match self.peek() {
                Some('b') => {
                    self.advance();
                    return self.radix_int(start, 2);
                }
                Some('o') => {
                    self.advance();
                    return self.radix_int(start, 8);
                }
                Some('x') => {
                    self.advance();
                    return self.hex_number(start);
                }
                Some('0'..='9') => {
                    // Reserve `0o` for octal.
                    return Err(self.fail("octal literals start with '0o'", start));
                }
                _ => {}
            }
        }

        let mut digits = String::new();
        digits.push(first);
        self.collect_digits(&mut digits, 10);

        // Fractional part, then optional exponent.
        let mut is_num = false;
        let mut fraction = String::new();
        if self.peek() == Some('.') {
            // Distinguish `1.5` from `1...2` and `x.y`.
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if matches!(lookahead.peek(), Some(&(_, '0'..='9'))) {
                self.advance();
                is_num = true;
                self.collect_digits(&mut fraction, 10);
            }
        }

        let mut exponent = String::new();
        if is_num && matches!(self.peek(), Some('e') | Some('E')) {
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                exponent.push(self.advance().unwrap());
            }
            let before = exponent.len();
            self.collect_digits(&mut exponent, 10);
            if exponent.len() == before {
                return Err(self.fail("expected digits in exponent", start));
            }
        }

        if is_num {
            let mut text = digits;
            text.push('.');
            text.push_str(&fraction);
            if !exponent.is_empty() {
                text.push('e');
                text.push_str(&exponent);
            }
            let value: f64 = match text.parse() {
                Ok(v) => v,
                Err(_) => return Err(self.fail("invalid number literal", start)),
            };
            Ok(self.token(TokenKind::Num(value), start))
        } else {
            match i64::from_str_radix(&digits, 10) {
                Ok(v) => Ok(self.token(TokenKind::Int(v), start)),
                Err(_) => Err(self.fail("number literal does not fit in 64 bits", start)),
            }
        }
    }

    fn collect_digits(&mut self, out: &mut String, radix: u32) {
        while let Some(c) = self.peek() {
            if c == '_' {
                self.advance();
            } else if c.is_digit(radix) {
                out.push(c);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn radix_int(&mut self, start: u32, radix: u32) -> Result<Token> {
        let mut digits = String::new();
        self.collect_digits(&mut digits, radix);
        if digits.is_empty() {
            return Err(self.fail("expected digits after integer base prefix", start));
        }
        match i64::from_str_radix(&digits, radix) {
            Ok(v) => Ok(self.token(TokenKind::Int(v), start)),
            Err(_) => Err(self.fail("number literal does not fit in 64 bits", start)),
        }
    }

    /// Hex literals: integer, or a float with an optional fractional part and
    /// a `p` power-of-two exponent (`0xdeadP2`, `0x1.8p-3`).
    fn hex_number(&mut self, start: u32) -> Result<Token> {
        let mut digits = String::new();
        self.collect_digits(&mut digits, 16);
        if digits.is_empty() {
            return Err(self.fail("expected digits after integer base prefix", start));
        }

        let mut fraction = String::new();
        let mut is_num = false;
        if self.peek() == Some('.') {
            let mut lookahead = self.chars.clone();
            lookahead.next();
            if matches!(lookahead.peek(), Some(&(_, c)) if c.is_ascii_hexdigit()) {
                self.advance();
                is_num = true;
                self.collect_digits(&mut fraction, 16);
            }
        }

        let mut exp_neg = false;
        let mut exponent = String::new();
        if matches!(self.peek(), Some('p') | Some('P')) {
            self.advance();
            is_num = true;
            if matches!(self.peek(), Some('+') | Some('-')) {
                exp_neg = self.advance() == Some('-');
            }
            self.collect_digits(&mut exponent, 10);
            if exponent.is_empty() {
                return Err(self.fail("expected digits in exponent", start));
            }
        }

        if is_num {
            let mut value = 0.0f64;
            for c in digits.chars() {
                value = value * 16.0 + c.to_digit(16).unwrap() as f64;
            }
            let mut scale = 1.0 / 16.0;
            for c in fraction.chars() {
                value += c.to_digit(16).unwrap() as f64 * scale;
                scale /= 16.0;
            }
            if !exponent.is_empty() {
                let exp: i32 = match exponent.parse() {
                    Ok(e) => e,
                    Err(_) => return Err(self.fail("invalid number literal", start)),
                };
                value *= 2.0f64.powi(if exp_neg { -exp } else { exp });
            }
            Ok(self.token(TokenKind::Num(value), start))
        } else {
            match i64::from_str_radix(&digits, 16) {
                Ok(v) => Ok(self.token(TokenKind::Int(v), start)),
                Err(_) => Err(self.fail("number literal does not fit in 64 bits", start)),
            }
        }
    }

    // ========================================================================
    // Operators
    // ========================================================================

    fn operator(&mut self, start: u32) -> Result<Token> {
        let c = self.advance().unwrap();
        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            '~' => TokenKind::Tilde,
            '.' => {
                if self.peek() == Some('.') {
                    self.advance();
                    if self.peek() == Some('.') {
                        self.advance();
                        TokenKind::Ellipsis
                    } else {
                        return Err(self.fail("invalid character '..'", start));
                    }
                } else {
                    TokenKind::Period
                }
            }
            '=' => self.with_eq(TokenKind::EqEq, TokenKind::Eq),
            '!' => {
                if self.peek() == Some('=') {
                    self.advance();
                    TokenKind::BangEq
                } else {
                    return Err(self.fail("invalid character '!'", start));
                }
            }
            '<' => {
                if self.peek() == Some('<') {
                    self.advance();
                    self.with_eq(TokenKind::LShiftEq, TokenKind::LShift)
                } else {
                    self.with_eq(TokenKind::LtEq, TokenKind::Lt)
                }
            }
            '>' => {
                if self.peek() == Some('>') {
                    self.advance();
                    self.with_eq(TokenKind::RShiftEq, TokenKind::RShift)
                } else {
                    self.with_eq(TokenKind::GtEq, TokenKind::Gt)
                }
            }
            '+' => self.with_eq(TokenKind::PlusEq, TokenKind::Plus),
            '-' => self.with_eq(TokenKind::MinusEq, TokenKind::Minus),
            '*' => {
                if self.peek() == Some('*') {
                    self.advance();
                    self.with_eq(TokenKind::AsteriskAsteriskEq, TokenKind::AsteriskAsterisk)
                } else {
                    self.with_eq(TokenKind::AsteriskEq, TokenKind::Asterisk)
                }
            }
            '/' => {
                if self.peek() == Some('/') {
                    self.advance();
                    self.with_eq(TokenKind::SlashSlashEq, TokenKind::SlashSlash)
                } else {
                    self.with_eq(TokenKind::SlashEq, TokenKind::Slash)
                }
            }
            '%' => self.with_eq(TokenKind::PercentEq, TokenKind::Percent),
            '&' => self.with_eq(TokenKind::AmpersandEq, TokenKind::Ampersand),
            '|' => self.with_eq(TokenKind::PipeEq, TokenKind::Pipe),
            '^' => self.with_eq(TokenKind::CaretEq, TokenKind::Caret),
            _ => return Err(self.fail("unexpected character", start)),
        };
        Ok(self.token(kind, start))
    }

    fn with_eq(&mut self, with: TokenKind, without: TokenKind) -> TokenKind {
        if self.peek() == Some('=') {
            self.advance();
            with
        } else {
            without
        }
    }
}

/// Tokenize a whole source buffer, including the trailing `Eof` token.
pub fn tokenize(source: &str, errors: &mut Errors) -> std::result::Result<Vec<Token>, TokenizeFailed> {
    Tokenizer::new(source, errors).tokenize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut errors = Errors::new();
        tokenize(source, &mut errors)
            .unwrap_or_else(|_| panic!("tokenize failed: {:?}", errors.last()))
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    fn fails(source: &str) -> String {
        let mut errors = Errors::new();
        assert!(tokenize(source, &mut errors).is_err(), "expected failure");
        errors.last().unwrap().message.to_string()
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("let foo = not bar"),
            vec![
                TokenKind::Let,
                TokenKind::Ident,
                TokenKind::Eq,
                TokenKind::Not,
                TokenKind::Ident,
                TokenKind::Eof,
            ]
        );
        assert_eq!(kinds("_")[0], TokenKind::Underscore);
        assert_eq!(kinds("_foo")[0], TokenKind::Ident);
    }

    #[test]
    fn operator_munching() {
        assert_eq!(
            kinds("** **= << <<= // //= ... != <="),
            vec![
                TokenKind::AsteriskAsterisk,
                TokenKind::AsteriskAsteriskEq,
                TokenKind::LShift,
                TokenKind::LShiftEq,
                TokenKind::SlashSlash,
                TokenKind::SlashSlashEq,
                TokenKind::Ellipsis,
                TokenKind::BangEq,
                TokenKind::LtEq,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn integers_by_base() {
        assert_eq!(kinds("0b101")[0], TokenKind::Int(5));
        assert_eq!(kinds("0o17")[0], TokenKind::Int(15));
        assert_eq!(kinds("0xff")[0], TokenKind::Int(255));
        assert_eq!(kinds("1_000_000")[0], TokenKind::Int(1_000_000));
        assert_eq!(kinds("0")[0], TokenKind::Int(0));
    }

    #[test]
    fn floats() {
        assert_eq!(kinds("1.5")[0], TokenKind::Num(1.5));
        assert_eq!(kinds("1.5e3")[0], TokenKind::Num(1500.0));
        assert_eq!(kinds("2.5e-1")[0], TokenKind::Num(0.25));
        assert_eq!(kinds("0x1.8p1")[0], TokenKind::Num(3.0));
    }

    #[test]
    fn hex_float_with_exponent_is_one_token() {
        let toks = kinds("0xdeadP2");
        assert_eq!(toks.len(), 2);
        assert_eq!(toks[0], TokenKind::Num((0xdead as f64) * 4.0));
    }

    #[test]
    fn leading_zero_decimal_is_an_error() {
        assert_eq!(fails("09"), "octal literals start with '0o'");
    }

    #[test]
    fn int_literal_overflow_is_an_error() {
        assert_eq!(
            fails("99999999999999999999"),
            "number literal does not fit in 64 bits"
        );
    }

    #[test]
    fn range_does_not_eat_a_fraction() {
        assert_eq!(
            kinds("1...2"),
            vec![
                TokenKind::Int(1),
                TokenKind::Ellipsis,
                TokenKind::Int(2),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(kinds("'abc'")[0], TokenKind::Str("abc".into()));
        assert_eq!(kinds("\"a\\tb\"")[0], TokenKind::Str("a\tb".into()));
        assert_eq!(kinds("'\\x41'")[0], TokenKind::Str("A".into()));
        assert_eq!(kinds("'\\u{1F600}'")[0], TokenKind::Str("\u{1F600}".into()));
        assert_eq!(kinds("'it\\'s'")[0], TokenKind::Str("it's".into()));
        assert_eq!(kinds("'a\\\nb'")[0], TokenKind::Str("ab".into()));
    }

    #[test]
    fn raw_newline_in_string_is_an_error() {
        assert_eq!(fails("'a\nb'"), "newline in string literal");
        assert_eq!(fails("'abc"), "unterminated string literal");
    }

    #[test]
    fn newline_policy() {
        assert_eq!(
            kinds("a\nb"),
            vec![TokenKind::Ident, TokenKind::Nl, TokenKind::Ident, TokenKind::Eof]
        );
        assert_eq!(
            kinds("a\r\nb"),
            vec![TokenKind::Ident, TokenKind::Nl, TokenKind::Ident, TokenKind::Eof]
        );
        assert_eq!(fails("a\rb"), "expected a newline after '\\r'");
    }

    #[test]
    fn line_continuation_produces_no_token() {
        assert_eq!(
            kinds("a \\\n b"),
            vec![TokenKind::Ident, TokenKind::Ident, TokenKind::Eof]
        );
    }

    #[test]
    fn unicode_horizontal_space_is_skipped() {
        assert_eq!(
            kinds("a\u{00A0}\u{3000}\u{2003}b"),
            vec![TokenKind::Ident, TokenKind::Ident, TokenKind::Eof]
        );
    }

    #[test]
    fn comments_run_to_end_of_line() {
        assert_eq!(
            kinds("a # comment ### more\nb"),
            vec![TokenKind::Ident, TokenKind::Nl, TokenKind::Ident, TokenKind::Eof]
        );
        assert_eq!(kinds("# just a comment"), vec![TokenKind::Eof]);
    }

    #[test]
    fn token_spans_slice_the_source() {
        let src = "let x = 'hi'";
        let mut errors = Errors::new();
        let tokens = tokenize(src, &mut errors).unwrap();
        assert_eq!(&src[tokens[0].start as usize..tokens[0].end as usize], "let");
        assert_eq!(&src[tokens[3].start as usize..tokens[3].end as usize], "'hi'");
    }
}
