use super::token::Token;
use anyhow::anyhow;
use std::str;

pub struct Lexer<'a> {
    program: &'a str,
    cursor: usize,
    line: usize,
}

type LResult<'a> = anyhow::Result<Option<Token<'a>>>;

impl<'a> Lexer<'a> {
    pub fn new(program: &'a str) -> Self {
        Lexer {
            program,
            cursor: 0,
            line: 1,
        }
    }

    /// Line of the last token read, starting from 1
    pub fn line(&self) -> usize {
        self.line
    }

    /// Get the next token. This consumes the tokens.
    pub fn next_token(&mut self) -> LResult<'a> {
        self.trim();

        match self.next_char(false) {
            Some(b'\'') => self.read_str_literal(),
            Some(b':') => Ok(Some(Token::Colon)),
            Some(b'\n') => {
                self.line += 1;
                Ok(Some(Token::Newline))
            }
            Some(ch) => {
                if ch.is_ascii_digit() || ch == b'-' {
                    self.read_number()
                } else if ch.is_ascii_alphabetic() || ch == b'_' {
                    self.read_token()
                } else {
                    Err(anyhow!("Unexpected character {:?}", ch as char))
                }
            }

            None => Ok(None),
        }
    }

    /// Get the next token without consuming it
    pub fn peek_token(&mut self) -> LResult<'a> {
        let (cursor, line) = (self.cursor, self.line);
        let token = self.next_token();
        self.cursor = cursor;
        self.line = line;
        token
    }

    /// Trim whitespaces, tabs, carriage returns, control chars and comments
    fn trim(&mut self) {
        while let Some(ch) = self.next_char(true) {
            if ch == b'#' {
                // Comments run until the end of the line
                while !matches!(self.next_char(true), Some(b'\n') | None) {
                    self.cursor += 1;
                }
                continue;
            }
            if ch != b'\t' && ch != b'\r' && ch != b'\x0C' && ch != b' ' {
                break;
            }
            self.cursor += 1;
        }
    }

    /// Read a decimal number
    fn read_number(&mut self) -> LResult<'a> {
        let start_pos = self.cursor - 1;
        while let Some(ch) = self.next_char(true) {
            if !ch.is_ascii_digit() {
                break;
            }
            self.cursor += 1;
        }

        let literal = str::from_utf8(&self.program.as_bytes()[start_pos..self.cursor])?;
        let number = literal
            .parse::<i32>()
            .map_err(|err| anyhow!("Invalid number {:?}: {}", literal, err))?;

        Ok(Some(Token::Number(number)))
    }

    /// Read a string literal that starts and ends with "'"
    fn read_str_literal(&mut self) -> LResult<'a> {
        let start_pos = self.cursor;
        while let Some(ch) = self.next_char(false) {
            if ch == b'\n' {
                // Strings cannot continue from next line
                break;
            } else if ch == b'\'' {
                let str_lit = str::from_utf8(&self.program.as_bytes()[start_pos..self.cursor - 1])?;
                return Ok(Some(Token::StringLiteral(str_lit)));
            }
        }

        Err(anyhow!("String literal is not finished properly."))
    }

    /// Read any other token
    fn read_token(&mut self) -> LResult<'a> {
        let start_pos = self.cursor - 1;
        while let Some(ch) = self.next_char(true) {
            // Only alphanumberic characters and '_'
            if !ch.is_ascii_alphanumeric() && ch != b'_' {
                break;
            }
            self.cursor += 1;
        }

        let token_str = str::from_utf8(&self.program.as_bytes()[start_pos..self.cursor])?;
        Ok(Some(Token::new(token_str)))
    }

    /// Get the next char and increase the cursor if `peek` is false
    fn next_char(&mut self, peek: bool) -> Option<u8> {
        let ch = *self.program.as_bytes().get(self.cursor)?;
        if !peek {
            self.cursor += 1;
        }
        Some(ch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::Opcode;
    use crate::token::Directive;

    #[test]
    fn trim() {
        let program = "\t\r\x0C # note\n LIT 1";
        let mut lexer = Lexer::new(program);
        lexer.trim();
        assert_eq!(&lexer.program[lexer.cursor..], "\n LIT 1");
    }

    #[test]
    fn read_str_literal() {
        let program = "'hi there'";
        let mut lexer = Lexer::new(program);
        assert_eq!(
            Token::StringLiteral("hi there"),
            lexer.next_token().unwrap().unwrap()
        );
    }

    #[test]
    fn unfinished_str_literal() {
        let mut lexer = Lexer::new("'oops\n'");
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn read_number() {
        let program = "123 -456";
        let mut lexer = Lexer::new(program);
        assert_eq!(Token::Number(123), lexer.next_token().unwrap().unwrap());
        assert_eq!(Token::Number(-456), lexer.next_token().unwrap().unwrap());
        assert!(Lexer::new("-").next_token().is_err());
    }

    #[test]
    fn read_token() {
        let program = "main:\nMUL\n";
        let mut lexer = Lexer::new(program);
        assert_eq!(Token::Name("main"), lexer.next_token().unwrap().unwrap());
        assert_eq!(Token::Colon, lexer.next_token().unwrap().unwrap());
        assert_eq!(Token::Newline, lexer.next_token().unwrap().unwrap());
        assert_eq!(
            Token::Instruction(Opcode::Mul),
            lexer.next_token().unwrap().unwrap()
        );
        assert_eq!(lexer.line(), 2);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("square\nDUP");
        let _ = lexer.next_token().unwrap();
        assert_eq!(lexer.peek_token().unwrap(), Some(Token::Newline));
        assert_eq!(lexer.line(), 1);
        assert_eq!(lexer.next_token().unwrap(), Some(Token::Newline));
        assert_eq!(lexer.line(), 2);
    }

    #[test]
    fn rejects_stray_characters() {
        assert!(Lexer::new("LIT $1").next_token().is_ok());
        let mut lexer = Lexer::new("LIT $1");
        let _ = lexer.next_token().unwrap();
        assert!(lexer.next_token().is_err());
    }

    #[test]
    fn read_program() {
        let program = r"
            # square the top of stack
            square: DUP
            MUL
            RETURN

            main:
            LIT 6   # six
            square
            JUMP 0
            msg: STRING 'ok'
            DATA main
        ";

        let mut lexer = Lexer::new(program);

        let tokens = vec![
            Token::Newline,
            Token::Newline,
            Token::Name("square"),
            Token::Colon,
            Token::Instruction(Opcode::Dup),
            Token::Newline,
            Token::Instruction(Opcode::Mul),
            Token::Newline,
            Token::Instruction(Opcode::Return),
            Token::Newline,
            Token::Newline,
            Token::Name("main"),
            Token::Colon,
            Token::Newline,
            Token::Instruction(Opcode::Lit),
            Token::Number(6),
            Token::Newline,
            Token::Name("square"),
            Token::Newline,
            Token::Instruction(Opcode::Jump),
            Token::Number(0),
            Token::Newline,
            Token::Name("msg"),
            Token::Colon,
            Token::Directive(Directive::String),
            Token::StringLiteral("ok"),
            Token::Newline,
            Token::Directive(Directive::Data),
            Token::Name("main"),
            Token::Newline,
        ];

        for token in tokens {
            assert_eq!(token, lexer.next_token().unwrap().unwrap());
        }

        // No tokens left
        assert_eq!(lexer.next_token().unwrap(), None);
    }
}
