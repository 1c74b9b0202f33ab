//! One-token lookahead over the lexer.

use std::mem::discriminant;

use crate::error::CompileError;
use crate::lexer::{Lexer, Token, TokenKind};

pub struct TokenBuffer<'src> {
    lexer: Lexer<'src>,
    lookahead: Option<Token>,
}

impl<'src> TokenBuffer<'src> {
    pub fn new(source: &'src str) -> Self {
        TokenBuffer {
            lexer: Lexer::new(source),
            lookahead: None,
        }
    }

    pub fn peek(&mut self) -> Result<&Token, CompileError> {
        if self.lookahead.is_none() {
            self.lookahead = Some(self.lexer.next_token()?);
        }
        Ok(self.lookahead.as_ref().expect("just filled"))
    }

    pub fn next(&mut self) -> Result<Token, CompileError> {
        match self.lookahead.take() {
            Some(tok) => Ok(tok),
            None => self.lexer.next_token(),
        }
    }

    pub fn check(&mut self, kind: &TokenKind) -> Result<bool, CompileError> {
        Ok(discriminant(&self.peek()?.kind) == discriminant(kind))
    }

    pub fn accept(&mut self, kind: &TokenKind) -> Result<Option<Token>, CompileError> {
        if self.check(kind)? {
            Ok(Some(self.next()?))
        } else {
            Ok(None)
        }
    }

    pub fn expect(&mut self, kind: &TokenKind) -> Result<Token, CompileError> {
        if self.check(kind)? {
            self.next()
        } else {
            let tok = self.peek()?.clone();
            Err(CompileError::ExpectedToken {
                expected: kind.clone(),
                got: tok.kind,
                pos: tok.start,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_then_next_return_same_token() {
        let mut buf = TokenBuffer::new("foo");
        let peeked = buf.peek().unwrap().clone();
        let next = buf.next().unwrap();
        assert_eq!(peeked, next);
    }

    #[test]
    fn expect_mismatched_kind_errors() {
        let mut buf = TokenBuffer::new("foo");
        let err = buf.expect(&TokenKind::KwFn).unwrap_err();
        assert!(matches!(err, CompileError::ExpectedToken { .. }));
    }

    #[test]
    fn accept_consumes_on_match() {
        let mut buf = TokenBuffer::new("fn");
        assert!(buf.accept(&TokenKind::KwFn).unwrap().is_some());
        assert!(buf.check(&TokenKind::Eof).unwrap());
    }
}
