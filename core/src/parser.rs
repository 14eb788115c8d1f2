/*
 * Copyright (c) 2026 Mohamad Al-Zawahreh (dba Sovereign Systems).
 *
 * This file is part of the Sprig Lisp Compiler.
 *
 * LICENSE: DUAL-LICENSED (AGPLv3 or COMMERCIAL).
 *
 * 1. OPEN SOURCE: You may use this file under the terms of the GNU Affero
 * General Public License v3.0. If you link to this code, your ENTIRE
 * application must be open-sourced under AGPLv3.
 *
 * 2. COMMERCIAL: For proprietary use, you must obtain a Commercial License
 * from Sovereign Systems.
 *
 * PATENT NOTICE: Protected by US Patent App #63/935,467.
 * NO IMPLIED LICENSE to rights of Mohamad Al-Zawahreh or Sovereign Systems.
 */

//! Source Lexer and Parser — Recursive Descent
//!
//! Turns source text into a flat token sequence and the token sequence into
//! one `Form` tree. A program is a single top-level expression; the grammar
//! is `form := atom | '(' form* ')'` with one token of lookahead.

use crate::ast::{reserved_word, Form, Token, TokenKind};
use crate::CompileError;
use thiserror::Error;

// ─── Error Types ─────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("unexpected character '{ch}' at byte {pos}")]
    UnexpectedChar { ch: char, pos: usize },
    #[error("malformed hex literal at byte {pos}: a leading 0 must start '0x' followed by hex digits")]
    MalformedHex { pos: usize },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected end of input: missing ')'")]
    UnexpectedEof,
    #[error("unmatched ')' at token {pos}")]
    UnmatchedCloseParen { pos: usize },
    #[error("empty program")]
    EmptyProgram,
    #[error("trailing tokens after the top-level expression, at token {pos}")]
    TrailingTokens { pos: usize },
}

// ─── Lexer ───────────────────────────────────────────────────────────────────

pub struct Lexer {
    source: Vec<char>,
    pos: usize,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.pos += 1;
                continue;
            }
            let start = self.pos;

            // A leading 0 always starts a hex literal; bare 0 and 0-prefixed
            // decimals are lexical errors.
            if ch == '0' {
                tokens.push(self.hex_literal(start)?);
                continue;
            }

            if ch.is_ascii_digit() {
                tokens.push(self.decimal_literal(start));
                continue;
            }

            // Identifier or reserved word. `?` continues an identifier so
            // predicate names like `fixnum?` lex as one token.
            if ch.is_ascii_alphabetic() {
                let mut lexeme = String::new();
                while let Some(c) = self.peek() {
                    if c.is_ascii_alphanumeric() || c == '?' {
                        lexeme.push(c);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let kind = reserved_word(&lexeme).unwrap_or(TokenKind::Id(lexeme));
                tokens.push(Token::new(kind, start));
                continue;
            }

            let kind = match ch {
                '(' => TokenKind::OpenParen,
                ')' => TokenKind::CloseParen,
                '+' => TokenKind::Plus,
                '-' => TokenKind::Minus,
                _ => return Err(LexError::UnexpectedChar { ch, pos: start }),
            };
            self.pos += 1;
            tokens.push(Token::new(kind, start));
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn hex_literal(&mut self, start: usize) -> Result<Token, LexError> {
        self.pos += 1; // consume '0'
        if self.peek() != Some('x') {
            return Err(LexError::MalformedHex { pos: start });
        }
        self.pos += 1;
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_hexdigit() {
                digits.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return Err(LexError::MalformedHex { pos: start });
        }
        let value =
            i64::from_str_radix(&digits, 16).map_err(|_| LexError::MalformedHex { pos: start })?;
        Ok(Token::new(TokenKind::Integer(value as i32), start))
    }

    fn decimal_literal(&mut self, start: usize) -> Token {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        let value: i32 = digits.parse().unwrap_or(0);
        Token::new(TokenKind::Integer(value), start)
    }
}

pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(source).tokenize()
}

// ─── Parser ──────────────────────────────────────────────────────────────────

/// Parse a whole token sequence as one program form.
pub fn parse(tokens: &[Token]) -> Result<Form, ParseError> {
    if tokens.is_empty() {
        return Err(ParseError::EmptyProgram);
    }
    let (form, next) = parse_form(tokens, 0)?;
    if next != tokens.len() {
        return Err(ParseError::TrailingTokens { pos: next });
    }
    Ok(form)
}

/// One recursive-descent rule with an explicit cursor. Returns the parsed
/// form together with the cursor position just past it, so recursive calls
/// can resume where a nested form ended.
fn parse_form(tokens: &[Token], pos: usize) -> Result<(Form, usize), ParseError> {
    let token = match tokens.get(pos) {
        Some(token) => token,
        None => return Err(ParseError::UnexpectedEof),
    };
    match token.kind {
        TokenKind::CloseParen => Err(ParseError::UnmatchedCloseParen { pos }),
        TokenKind::OpenParen => {
            let mut items = Vec::new();
            let mut cursor = pos + 1;
            loop {
                match tokens.get(cursor) {
                    None => return Err(ParseError::UnexpectedEof),
                    Some(token) if token.kind == TokenKind::CloseParen => {
                        return Ok((Form::List(items), cursor + 1));
                    }
                    Some(_) => {
                        let (item, next) = parse_form(tokens, cursor)?;
                        items.push(item);
                        cursor = next;
                    }
                }
            }
        }
        _ => Ok((Form::Atom(token.clone()), pos + 1)),
    }
}

/// Convenience: lex and parse in one step.
pub fn parse_source(source: &str) -> Result<Form, CompileError> {
    let tokens = tokenize(source)?;
    Ok(parse(&tokens)?)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
