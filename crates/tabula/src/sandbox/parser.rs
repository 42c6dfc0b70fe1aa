// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2024 Jonathan Lee
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License version 3
// as published by the Free Software Foundation.
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU Affero General Public License for more details.
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see https://www.gnu.org/licenses/.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Num(f64),
    Ident(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let { name: String, value: Expr },
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("script contains no statements")]
    Empty,
    #[error("line {line}: unexpected end of statement")]
    UnexpectedEnd { line: usize },
    #[error("line {line}: unexpected `{found}`")]
    UnexpectedToken { line: usize, found: String },
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },
    #[error("line {line}: invalid number `{text}`")]
    InvalidNumber { line: usize, text: String },
    #[error("line {line}: invalid character `{ch}`")]
    InvalidCharacter { line: usize, ch: char },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Let,
    Ident(String),
    Num(f64),
    Str(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Assign,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Let => f.write_str("let"),
            Token::Ident(name) => f.write_str(name),
            Token::Num(n) => write!(f, "{n}"),
            Token::Str(_) => f.write_str("string literal"),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Comma => f.write_str(","),
            Token::Assign => f.write_str("="),
        }
    }
}

/// Parses a whole script: one statement per line, `#` comments, optional
/// trailing semicolons. Used both for pre-execution syntax validation and by
/// the interpreter itself.
pub fn parse(source: &str) -> Result<Script, ParseError> {
    let mut statements = Vec::new();
    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        let mut line = raw_line.trim();
        if let Some(stripped) = line.strip_suffix(';') {
            line = stripped.trim_end();
        }
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let tokens = tokenize(line, line_no)?;
        let mut parser = LineParser {
            tokens,
            pos: 0,
            line: line_no,
        };
        statements.push(parser.statement()?);
    }
    if statements.is_empty() {
        return Err(ParseError::Empty);
    }
    Ok(Script { statements })
}

fn tokenize(line: &str, line_no: usize) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&ch) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(if ident == "let" {
                    Token::Let
                } else {
                    Token::Ident(ident)
                });
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = text.parse::<f64>().map_err(|_| ParseError::InvalidNumber {
                    line: line_no,
                    text: text.clone(),
                })?;
                tokens.push(Token::Num(value));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some(other) => text.push(other),
                            None => break,
                        },
                        other => text.push(other),
                    }
                }
                if !closed {
                    return Err(ParseError::UnterminatedString { line: line_no });
                }
                tokens.push(Token::Str(text));
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Assign);
            }
            other => return Err(ParseError::InvalidCharacter { line: line_no, ch: other }),
        }
    }
    Ok(tokens)
}

struct LineParser {
    tokens: Vec<Token>,
    pos: usize,
    line: usize,
}

impl LineParser {
    fn statement(&mut self) -> Result<Stmt, ParseError> {
        let stmt = if self.peek() == Some(&Token::Let) {
            self.advance();
            let name = self.expect_ident()?;
            self.expect(&Token::Assign)?;
            let value = self.expression()?;
            Stmt::Let { name, value }
        } else {
            Stmt::Expr(self.expression()?)
        };
        match self.peek() {
            None => Ok(stmt),
            Some(tok) => Err(ParseError::UnexpectedToken {
                line: self.line,
                found: tok.to_string(),
            }),
        }
    }

    fn expression(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.factor()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, ParseError> {
        match self.peek().cloned() {
            None => Err(ParseError::UnexpectedEnd { line: self.line }),
            Some(Token::Num(n)) => {
                self.advance();
                Ok(Expr::Num(n))
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Neg(Box::new(self.factor()?)))
            }
            Some(Token::LParen) => {
                self.advance();
                let inner = self.expression()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(name)) => {
                self.advance();
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Call { name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(tok) => Err(ParseError::UnexpectedToken {
                line: self.line,
                found: tok.to_string(),
            }),
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ParseError> {
        match self.peek() {
            Some(tok) if tok == expected => {
                self.advance();
                Ok(())
            }
            Some(tok) => Err(ParseError::UnexpectedToken {
                line: self.line,
                found: tok.to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd { line: self.line }),
        }
    }

    fn expect_ident(&mut self) -> Result<String, ParseError> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            Some(tok) => Err(ParseError::UnexpectedToken {
                line: self.line,
                found: tok.to_string(),
            }),
            None => Err(ParseError::UnexpectedEnd { line: self.line }),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_let_and_call_statements() {
        let script = parse(
            "# headcount per department\nlet t = sql(\"SELECT * FROM employees\")\nprint(count(t))",
        )
        .unwrap();
        assert_eq!(script.statements.len(), 2);
        assert!(matches!(script.statements[0], Stmt::Let { .. }));
    }

    #[test]
    fn parses_arithmetic_with_precedence() {
        let script = parse("print(1 + 2 * 3)").unwrap();
        let Stmt::Expr(Expr::Call { args, .. }) = &script.statements[0] else {
            panic!("expected call");
        };
        let Expr::Binary { op, rhs, .. } = &args[0] else {
            panic!("expected binary");
        };
        assert_eq!(*op, BinOp::Add);
        assert!(matches!(
            rhs.as_ref(),
            Expr::Binary { op: BinOp::Mul, .. }
        ));
    }

    #[test]
    fn rejects_empty_scripts() {
        assert!(matches!(parse(""), Err(ParseError::Empty)));
        assert!(matches!(parse("# only a comment"), Err(ParseError::Empty)));
    }

    #[test]
    fn rejects_unterminated_strings_with_line_number() {
        let err = parse("print(\"open").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedString { line: 1 }));
    }

    #[test]
    fn rejects_prose_masquerading_as_code() {
        assert!(parse("Here is the script you asked for:").is_err());
    }

    #[test]
    fn trailing_semicolons_are_tolerated() {
        assert!(parse("print(\"ok\");").is_ok());
    }

    #[test]
    fn string_escapes_are_decoded() {
        let script = parse(r#"print("a\nb")"#).unwrap();
        let Stmt::Expr(Expr::Call { args, .. }) = &script.statements[0] else {
            panic!("expected call");
        };
        assert_eq!(args[0], Expr::Str("a\nb".to_string()));
    }
}
