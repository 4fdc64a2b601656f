use crate::opcode::Opcode;

/// Assembler directives. They emit raw cells rather than instructions.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Directive {
    /// `DATA 12` or `DATA label`
    Data,
    /// `STRING 'text'`, one character per cell followed by a zero
    String,
}

#[derive(Debug, Eq, PartialEq)]
pub enum Token<'a> {
    Instruction(Opcode),
    Directive(Directive),

    Newline,
    Colon,

    StringLiteral(&'a str),
    Name(&'a str),

    Number(i32),
}

impl<'a> Token<'a> {
    pub fn new(token_str: &'a str) -> Self {
        if let Some(op) = Opcode::from_mnemonic(token_str) {
            return Token::Instruction(op);
        }
        match token_str {
            "DATA" => Token::Directive(Directive::Data),
            "STRING" => Token::Directive(Directive::String),
            _ => Token::Name(token_str),
        }
    }
}
