//! Hand-written lexer. Produces one token at a time with its position.

use crate::Position;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Colon,
    Comma,
    Assign,
    AppendAssign,
    Plus,
    Eof,
}

impl Tok {
    pub(crate) fn describe(&self) -> String {
        match self {
            Tok::Ident(s) => format!("identifier {:?}", s),
            Tok::Str(_) => "string".to_string(),
            Tok::Int(_) => "integer".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::Colon => "':'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Assign => "'='".to_string(),
            Tok::AppendAssign => "'+='".to_string(),
            Tok::Plus => "'+'".to_string(),
            Tok::Eof => "end of file".to_string(),
        }
    }
}

pub(crate) struct Lexer<'a> {
    file: &'a str,
    src: &'a [u8],
    off: usize,
    line: u32,
    col: u32,
}

#[derive(Debug)]
pub(crate) struct LexError {
    pub pos: Position,
    pub message: String,
}

impl<'a> Lexer<'a> {
    pub(crate) fn new(file: &'a str, src: &'a str) -> Lexer<'a> {
        Lexer { file, src: src.as_bytes(), off: 0, line: 1, col: 1 }
    }

    pub(crate) fn pos(&self) -> Position {
        Position::new(self.file, self.line, self.col)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.off).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.off + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.off += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some(b'/') if self.peek2() == Some(b'*') => {
                    let start = self.pos();
                    self.bump();
                    self.bump();
                    loop {
                        match self.peek() {
                            Some(b'*') if self.peek2() == Some(b'/') => {
                                self.bump();
                                self.bump();
                                break;
                            }
                            Some(_) => {
                                self.bump();
                            }
                            None => {
                                return Err(LexError {
                                    pos: start,
                                    message: "unterminated comment".to_string(),
                                })
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Returns the next token and the position of its first byte.
    pub(crate) fn next(&mut self) -> Result<(Position, Tok), LexError> {
        self.skip_trivia()?;
        let pos = self.pos();
        let c = match self.peek() {
            Some(c) => c,
            None => return Ok((pos, Tok::Eof)),
        };
        let tok = match c {
            b'{' => {
                self.bump();
                Tok::LBrace
            }
            b'}' => {
                self.bump();
                Tok::RBrace
            }
            b'[' => {
                self.bump();
                Tok::LBracket
            }
            b']' => {
                self.bump();
                Tok::RBracket
            }
            b'(' => {
                self.bump();
                Tok::LParen
            }
            b')' => {
                self.bump();
                Tok::RParen
            }
            b':' => {
                self.bump();
                Tok::Colon
            }
            b',' => {
                self.bump();
                Tok::Comma
            }
            b'=' => {
                self.bump();
                Tok::Assign
            }
            b'+' => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::AppendAssign
                } else {
                    Tok::Plus
                }
            }
            b'"' => self.lex_string(pos.clone())?,
            b'-' | b'0'..=b'9' => self.lex_int(pos.clone())?,
            c if c == b'_' || c.is_ascii_alphabetic() => {
                let mut s = String::new();
                while let Some(c) = self.peek() {
                    if c == b'_' || c.is_ascii_alphanumeric() {
                        s.push(c as char);
                        self.bump();
                    } else {
                        break;
                    }
                }
                Tok::Ident(s)
            }
            c => {
                return Err(LexError {
                    pos,
                    message: format!("unexpected character {:?}", c as char),
                })
            }
        };
        Ok((pos, tok))
    }

    fn lex_string(&mut self, start: Position) -> Result<Tok, LexError> {
        self.bump(); // opening quote
        let mut s = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(Tok::Str(s)),
                Some(b'\\') => match self.bump() {
                    Some(b'n') => s.push('\n'),
                    Some(b't') => s.push('\t'),
                    Some(b'"') => s.push('"'),
                    Some(b'\\') => s.push('\\'),
                    Some(c) => {
                        return Err(LexError {
                            pos: self.pos(),
                            message: format!("invalid escape \\{}", c as char),
                        })
                    }
                    None => {
                        return Err(LexError { pos: start, message: "unterminated string".into() })
                    }
                },
                Some(b'\n') | None => {
                    return Err(LexError { pos: start, message: "unterminated string".into() })
                }
                Some(c) => s.push(c as char),
            }
        }
    }

    fn lex_int(&mut self, start: Position) -> Result<Tok, LexError> {
        let mut s = String::new();
        if self.peek() == Some(b'-') {
            s.push('-');
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                s.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        s.parse::<i64>().map(Tok::Int).map_err(|_| LexError {
            pos: start,
            message: format!("invalid integer literal {:?}", s),
        })
    }
}
