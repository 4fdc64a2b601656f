//! Assembler that turns program text into image cells
//!
//! One statement per line. A statement is an instruction with its operand, a directive, or
//! the name of a label, which compiles to an implicit call. Labels are defined with
//! `name:` and may be followed by a statement on the same line. `#` starts a comment.
//!
//! ```text
//!         JUMP main
//! square: DUP
//!         MUL
//!         RETURN
//! main:   LIT 6
//!         square
//!         JUMP 0      # halt
//! ```

use anyhow::{anyhow, bail, Context};
use std::collections::HashMap;

use crate::{
    lexer::Lexer,
    opcode::{Opcode, OPCODE_COUNT},
    token::{Directive, Token},
    Cell,
};

/// Output of the assembler
#[derive(Debug)]
pub struct Assembly<'a> {
    /// Image cells from address 0
    pub cells: Vec<Cell>,
    /// Label table which maps a label to its address
    pub labels: HashMap<&'a str, Cell>,
}

/// A cell whose value may depend on a label defined later
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Slot<'a> {
    Value(Cell),
    /// Address of a label
    Label { name: &'a str, line: usize },
    /// Implicit call; the label must not fall among the reserved opcodes
    Call { name: &'a str, line: usize },
}

type ParseRes = anyhow::Result<()>;
type ParseFn<'a> = fn(&mut Parser<'a>) -> ParseRes;

/// Parser to generate image cells from text
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    slots: Vec<Slot<'a>>,
    labels: HashMap<&'a str, Cell>,
    parse_fns: HashMap<Directive, ParseFn<'a>>,
}

/// Assemble `program` into the cells of an image.
pub fn assemble(program: &str) -> anyhow::Result<Vec<Cell>> {
    Ok(Parser::new(program).parse()?.cells)
}

fn to_cell(number: i32) -> anyhow::Result<Cell> {
    Cell::try_from(number).map_err(|_| anyhow!("Number {} does not fit in a cell", number))
}

impl<'a> Parser<'a> {
    /// Initialize the parser and prepare the directive parsers
    ///
    /// * `program` program to parse
    pub fn new(program: &'a str) -> Self {
        let mut parse_fns: HashMap<Directive, ParseFn> = HashMap::new();
        parse_fns.insert(Directive::Data, Self::parse_data);
        parse_fns.insert(Directive::String, Self::parse_string);

        Parser {
            lexer: Lexer::new(program),
            slots: Vec::new(),
            labels: HashMap::new(),
            parse_fns,
        }
    }

    /// Parse the program and resolve every label
    pub fn parse(mut self) -> anyhow::Result<Assembly<'a>> {
        loop {
            let line = self.lexer.line();
            match self.parse_statement() {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => return Err(err.context(format!("line {}", line))),
            }
        }

        if self.slots.len() > Cell::MAX as usize {
            bail!("Program does not fit in the image ({} cells)", self.slots.len());
        }

        let cells = self
            .slots
            .iter()
            .map(|slot| self.resolve(*slot))
            .collect::<anyhow::Result<Vec<Cell>>>()?;

        Ok(Assembly {
            cells,
            labels: self.labels,
        })
    }

    /// Parse one statement. Returns `false` at the end of the program.
    fn parse_statement(&mut self) -> anyhow::Result<bool> {
        let Some(token) = self.lexer.next_token()? else {
            return Ok(false);
        };

        match token {
            Token::Instruction(op) => self.parse_instruction(op)?,
            Token::Directive(directive) => {
                let parse_fn = self.parse_fns[&directive];
                parse_fn(self)?
            }
            Token::Name(name) => {
                if self.lexer.peek_token()? == Some(Token::Colon) {
                    let _ = self.lexer.next_token()?;
                    // A statement may follow on the same line
                    return self.define_label(name).map(|_| true);
                }
                let line = self.lexer.line();
                self.slots.push(Slot::Call { name, line });
            }
            Token::Newline => return Ok(true),
            token => bail!("Expected instruction or label, got {:?}", token),
        }

        // This statement is finished so we expect a newline
        match self.lexer.next_token()? {
            Some(Token::Newline) => Ok(true),
            None => Ok(false),
            Some(token) => Err(anyhow!("Expected '\\n', got {:?}", token)),
        }
    }

    fn define_label(&mut self, name: &'a str) -> ParseRes {
        if self.labels.contains_key(name) {
            bail!("Label {} is already defined.", name);
        }
        let address = Cell::try_from(self.slots.len())
            .with_context(|| format!("Label {} is past the end of the image", name))?;
        self.labels.insert(name, address);
        Ok(())
    }

    fn parse_instruction(&mut self, op: Opcode) -> ParseRes {
        self.slots.push(Slot::Value(op.into()));
        if op.has_operand() {
            self.parse_operand()
                .with_context(|| format!("{} needs an operand", op.mnemonic()))?;
        }
        Ok(())
    }

    /// A number or a label
    fn parse_operand(&mut self) -> ParseRes {
        let slot = match self.lexer.next_token()? {
            Some(Token::Number(number)) => Slot::Value(to_cell(number)?),
            Some(Token::Name(name)) => Slot::Label {
                name,
                line: self.lexer.line(),
            },
            token => bail!("Expected number or label, got {:?}", token),
        };
        self.slots.push(slot);
        Ok(())
    }

    fn parse_data(&mut self) -> ParseRes {
        self.parse_operand()
    }

    fn parse_string(&mut self) -> ParseRes {
        match self.lexer.next_token()? {
            Some(Token::StringLiteral(text)) => {
                self.slots
                    .extend(text.bytes().map(|byte| Slot::Value(Cell::from(byte))));
                self.slots.push(Slot::Value(0));
                Ok(())
            }
            token => Err(anyhow!("Expected string literal, got {:?}", token)),
        }
    }

    fn resolve(&self, slot: Slot<'a>) -> anyhow::Result<Cell> {
        match slot {
            Slot::Value(value) => Ok(value),
            Slot::Label { name, line } => self.address_of(name, line),
            Slot::Call { name, line } => {
                let address = self.address_of(name, line)?;
                if address < OPCODE_COUNT {
                    bail!(
                        "line {}: cannot call {} at address {}, it is a reserved opcode",
                        line,
                        name,
                        address
                    );
                }
                Ok(address)
            }
        }
    }

    fn address_of(&self, name: &str, line: usize) -> anyhow::Result<Cell> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("line {}: undefined label {}", line, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(op: Opcode) -> Cell {
        op.into()
    }

    #[test]
    fn instructions_and_operands() {
        let cells = assemble("LIT -5\nDUP\nLOOP 3\n").unwrap();
        assert_eq!(
            cells,
            vec![op(Opcode::Lit), -5, op(Opcode::Dup), op(Opcode::Loop), 3]
        );
    }

    #[test]
    fn resolves_labels_both_ways() {
        let program = "
            JUMP main
        back:
            RETURN
        main: LIT 1
            EQ_JUMP back
        ";
        let assembly = Parser::new(program).parse().unwrap();
        assert_eq!(assembly.labels["back"], 2);
        assert_eq!(assembly.labels["main"], 3);
        assert_eq!(
            assembly.cells,
            vec![
                op(Opcode::Jump),
                3,
                op(Opcode::Return),
                op(Opcode::Lit),
                1,
                op(Opcode::EqJump),
                2
            ]
        );
    }

    #[test]
    fn bare_names_are_calls() {
        let mut program = String::from("JUMP main\n");
        for _ in 0..40 {
            program.push_str("NOP\n");
        }
        program.push_str("double: DUP\nADD\nRETURN\nmain: LIT 2\ndouble\nJUMP 0\n");

        let cells = assemble(&program).unwrap();
        assert_eq!(cells[42], op(Opcode::Dup));
        assert_eq!(&cells[45..], &[op(Opcode::Lit), 2, 42, op(Opcode::Jump), 0]);
    }

    #[test]
    fn calls_into_reserved_range_fail() {
        let err = assemble("helper: RETURN\nhelper\n").unwrap_err();
        assert!(format!("{:#}", err).contains("reserved opcode"));
    }

    #[test]
    fn directives() {
        let cells = assemble("DATA 7\nDATA end\nSTRING 'Hi'\nend:\n").unwrap();
        assert_eq!(cells, vec![7, 5, 72, 105, 0]);
    }

    #[test]
    fn comments_and_blank_lines() {
        let cells = assemble("# header\n\n  NOP # pass\n\nWAIT\n").unwrap();
        assert_eq!(cells, vec![op(Opcode::Nop), op(Opcode::Wait)]);
    }

    #[test]
    fn errors_mention_the_line() {
        let err = assemble("NOP\nLIT\n").unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("line 2"), "{}", message);
        assert!(message.contains("LIT needs an operand"), "{}", message);
    }

    #[test]
    fn rejects_bad_programs() {
        assert!(assemble("LIT 40000\n").is_err());
        assert!(assemble("JUMP nowhere\n").is_err());
        assert!(assemble("a: NOP\na: NOP\n").is_err());
        assert!(assemble("DUP DROP\n").is_err());
        assert!(assemble("STRING 5\n").is_err());
        assert!(assemble("12\n").is_err());
    }
}
