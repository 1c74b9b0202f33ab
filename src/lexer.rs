//! Token recognition: identifiers, keywords, numeric/string/char literals
//! with escapes, multi-character operators, and `//` line comments.

use crate::cursor::Cursor;
use crate::error::{CompileError, Position};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    UintLiteral(u64),
    /// Raw bit pattern of an IEEE-754 binary64 value, per the wire contract.
    DoubleLiteral(u64),
    /// Code point of a char literal, stored as a 64-bit integer.
    CharLiteral(u64),
    StringLiteral(String),
    Ident(String),

    KwFn,
    KwLet,
    KwConst,
    KwAs,
    KwWhile,
    KwIf,
    KwElse,
    KwReturn,
    KwBreak,
    KwContinue,

    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    EqEq,
    NotEq,
    Lt,
    Gt,
    Le,
    Ge,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Arrow,

    Eof,
}

/// Keywords recognized by the lexer, in declaration order, matched
/// case-sensitively (a deliberate deviation from the case-insensitive
/// matching of the behavior this compiler was modeled on; see DESIGN.md).
const KEYWORDS: &[(&str, TokenKind)] = &[
    ("fn", TokenKind::KwFn),
    ("let", TokenKind::KwLet),
    ("const", TokenKind::KwConst),
    ("as", TokenKind::KwAs),
    ("while", TokenKind::KwWhile),
    ("if", TokenKind::KwIf),
    ("else", TokenKind::KwElse),
    ("return", TokenKind::KwReturn),
    ("break", TokenKind::KwBreak),
    ("continue", TokenKind::KwContinue),
];

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: Position,
    pub end: Position,
}

impl Token {
    pub fn new(kind: TokenKind, start: Position, end: Position) -> Self {
        Token { kind, start, end }
    }
}

pub struct Lexer<'src> {
    cursor: Cursor,
    _source: &'src str,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Lexer {
            cursor: Cursor::new(source),
            _source: source,
        }
    }

    pub fn next_token(&mut self) -> Result<Token, CompileError> {
        loop {
            self.skip_whitespace();

            if self.cursor.is_eof() {
                let pos = self.cursor.current_pos();
                return Ok(Token::new(TokenKind::Eof, pos, pos));
            }

            let start = self.cursor.current_pos();
            let c = self.cursor.peek_char().expect("checked not eof");

            if c == '/' && self.cursor.peek_char_at(1) == Some('/') {
                self.skip_line_comment();
                continue;
            }

            if c.is_ascii_digit() {
                return self.lex_number(start);
            }
            if c.is_alphabetic() || c == '_' {
                return self.lex_ident_or_keyword(start);
            }
            if c == '"' {
                return self.lex_string(start);
            }
            if c == '\'' {
                return self.lex_char(start);
            }
            return self.lex_operator(start);
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.cursor.peek_char() {
            if c.is_whitespace() {
                self.cursor.next_char();
            } else {
                break;
            }
        }
    }

    fn skip_line_comment(&mut self) {
        while let Some(c) = self.cursor.peek_char() {
            if c == '\n' {
                break;
            }
            self.cursor.next_char();
        }
    }

    fn lex_number(&mut self, start: Position) -> Result<Token, CompileError> {
        let mut buf = String::new();
        while let Some(c) = self.cursor.peek_char() {
            if c.is_ascii_digit() {
                buf.push(c);
                self.cursor.next_char();
            } else {
                break;
            }
        }

        let mut is_double = false;
        if self.cursor.peek_char() == Some('.') {
            is_double = true;
            buf.push('.');
            self.cursor.next_char();
            if !matches!(self.cursor.peek_char(), Some(c) if c.is_ascii_digit()) {
                return Err(CompileError::InvalidInput(start));
            }
            while let Some(c) = self.cursor.peek_char() {
                if c.is_ascii_digit() {
                    buf.push(c);
                    self.cursor.next_char();
                } else {
                    break;
                }
            }
        }

        if matches!(self.cursor.peek_char(), Some('e') | Some('E')) {
            is_double = true;
            buf.push(self.cursor.next_char().unwrap());
            if matches!(self.cursor.peek_char(), Some('+') | Some('-')) {
                buf.push(self.cursor.next_char().unwrap());
            }
            if !matches!(self.cursor.peek_char(), Some(c) if c.is_ascii_digit()) {
                return Err(CompileError::InvalidInput(start));
            }
            while let Some(c) = self.cursor.peek_char() {
                if c.is_ascii_digit() {
                    buf.push(c);
                    self.cursor.next_char();
                } else {
                    break;
                }
            }
        }

        let end = self.cursor.previous_pos();
        if is_double {
            let value: f64 = buf.parse().map_err(|_| CompileError::InvalidInput(start))?;
            Ok(Token::new(TokenKind::DoubleLiteral(value.to_bits()), start, end))
        } else {
            let value: u64 = buf.parse().map_err(|_| CompileError::InvalidInput(start))?;
            Ok(Token::new(TokenKind::UintLiteral(value), start, end))
        }
    }

    fn lex_ident_or_keyword(&mut self, start: Position) -> Result<Token, CompileError> {
        let mut buf = String::new();
        while let Some(c) = self.cursor.peek_char() {
            if c.is_alphanumeric() || c == '_' {
                buf.push(c);
                self.cursor.next_char();
            } else {
                break;
            }
        }
        let end = self.cursor.previous_pos();
        for (kw, kind) in KEYWORDS {
            if *kw == buf {
                return Ok(Token::new(kind.clone(), start, end));
            }
        }
        Ok(Token::new(TokenKind::Ident(buf), start, end))
    }

    fn lex_escape(&mut self, start: Position) -> Result<char, CompileError> {
        match self.cursor.next_char() {
            Some('\\') => Ok('\\'),
            Some('\'') => Ok('\''),
            Some('"') => Ok('"'),
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('t') => Ok('\t'),
            _ => Err(CompileError::InvalidInput(start)),
        }
    }

    fn lex_string(&mut self, start: Position) -> Result<Token, CompileError> {
        self.cursor.next_char(); // opening quote
        let mut value = String::new();
        loop {
            match self.cursor.peek_char() {
                None => return Err(CompileError::InvalidInput(self.cursor.current_pos())),
                Some('"') => {
                    self.cursor.next_char();
                    break;
                }
                Some('\\') => {
                    self.cursor.next_char();
                    value.push(self.lex_escape(start)?);
                }
                Some(c) => {
                    self.cursor.next_char();
                    value.push(c);
                }
            }
        }
        let end = self.cursor.previous_pos();
        Ok(Token::new(TokenKind::StringLiteral(value), start, end))
    }

    fn lex_char(&mut self, start: Position) -> Result<Token, CompileError> {
        self.cursor.next_char(); // opening quote
        let c = match self.cursor.peek_char() {
            None => return Err(CompileError::InvalidInput(self.cursor.current_pos())),
            Some('\\') => {
                self.cursor.next_char();
                self.lex_escape(start)?
            }
            Some(c) => {
                self.cursor.next_char();
                c
            }
        };
        if self.cursor.peek_char() != Some('\'') {
            return Err(CompileError::InvalidInput(start));
        }
        self.cursor.next_char();
        let end = self.cursor.previous_pos();
        Ok(Token::new(TokenKind::CharLiteral(c as u64), start, end))
    }

    fn lex_operator(&mut self, start: Position) -> Result<Token, CompileError> {
        let c = self.cursor.next_char().expect("checked not eof");
        let two = self.cursor.peek_char();

        macro_rules! two_char {
            ($second:expr, $kind:expr) => {
                if two == Some($second) {
                    self.cursor.next_char();
                    let end = self.cursor.previous_pos();
                    return Ok(Token::new($kind, start, end));
                }
            };
        }

        match c {
            '-' => two_char!('>', TokenKind::Arrow),
            '=' => two_char!('=', TokenKind::EqEq),
            '!' => two_char!('=', TokenKind::NotEq),
            '<' => two_char!('=', TokenKind::Le),
            '>' => two_char!('=', TokenKind::Ge),
            _ => {}
        }

        let end = self.cursor.previous_pos();
        let kind = match c {
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '=' => TokenKind::Eq,
            '<' => TokenKind::Lt,
            '>' => TokenKind::Gt,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semi,
            '!' => return Err(CompileError::InvalidInput(start)),
            _ => return Err(CompileError::InvalidInput(start)),
        };
        Ok(Token::new(kind, start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(src);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token().expect("lex error");
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn identifier_round_trip() {
        assert_eq!(
            kinds("hello_world1"),
            vec![TokenKind::Ident("hello_world1".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn keywords_are_case_sensitive() {
        assert_eq!(kinds("fn"), vec![TokenKind::KwFn, TokenKind::Eof]);
        assert_eq!(
            kinds("FN"),
            vec![TokenKind::Ident("FN".to_string()), TokenKind::Eof]
        );
    }

    #[test]
    fn uint_literal() {
        assert_eq!(kinds("12345"), vec![TokenKind::UintLiteral(12345), TokenKind::Eof]);
    }

    #[test]
    fn double_literal_bit_pattern() {
        let expected = 3.5f64.to_bits();
        assert_eq!(
            kinds("3.5"),
            vec![TokenKind::DoubleLiteral(expected), TokenKind::Eof]
        );
    }

    #[test]
    fn double_literal_with_exponent() {
        let expected = 1.5e10f64.to_bits();
        assert_eq!(
            kinds("1.5e10"),
            vec![TokenKind::DoubleLiteral(expected), TokenKind::Eof]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            kinds(r#""a\nb\"c""#),
            vec![
                TokenKind::StringLiteral("a\nb\"c".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn unterminated_string_errors() {
        let mut lexer = Lexer::new("\"abc");
        assert!(matches!(
            lexer.next_token(),
            Err(CompileError::InvalidInput(_))
        ));
    }

    #[test]
    fn char_literal() {
        assert_eq!(kinds("'a'"), vec![TokenKind::CharLiteral('a' as u64), TokenKind::Eof]);
    }

    #[test]
    fn line_comment_is_skipped() {
        assert_eq!(
            kinds("1 // two\n2"),
            vec![
                TokenKind::UintLiteral(1),
                TokenKind::UintLiteral(2),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            kinds("-> == != <= >="),
            vec![
                TokenKind::Arrow,
                TokenKind::EqEq,
                TokenKind::NotEq,
                TokenKind::Le,
                TokenKind::Ge,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn bare_bang_is_invalid() {
        let mut lexer = Lexer::new("!");
        assert!(matches!(
            lexer.next_token(),
            Err(CompileError::InvalidInput(_))
        ));
    }
}
