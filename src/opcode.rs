//! Reserved opcodes of the instruction set

use crate::Cell;

/// Number of reserved opcodes. Any cell value outside `0..OPCODE_COUNT` is a call target.
pub const OPCODE_COUNT: Cell = 31;

/// Reserved instructions. The discriminant is the cell value stored in the image.
#[repr(i16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Opcode {
    /// Pass
    Nop = 0,
    /// Push the following cell
    Lit,
    /// Duplicate the top of stack
    Dup,
    /// Discard the top of stack
    Drop,
    /// Exchange the two topmost values
    Swap,
    /// Move the top of stack to the address stack
    Push,
    /// Move the top of the address stack to the data stack
    Pop,
    /// Decrement the counter and branch while it stays positive
    Loop,
    /// Unconditionally jump to the address in the following cell
    Jump,
    /// Return to the address on the address stack
    Return,
    /// Jump if next-on-stack is greater than top-of-stack
    GtJump,
    /// Jump if next-on-stack is less than top-of-stack
    LtJump,
    /// Jump if the two topmost values differ
    NeJump,
    /// Jump if the two topmost values are equal
    EqJump,
    /// Replace an address with the cell it points to
    Fetch,
    /// Store next-on-stack at the address on top of stack
    Store,
    Add,
    Sub,
    Mul,
    /// Quotient on top, remainder below it
    DivMod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    /// Return if the top of stack is zero
    ZeroExit,
    Inc,
    Dec,
    /// Read and clear a port
    In,
    /// Write to a port
    Out,
    /// Let the devices serve pending port requests
    Wait,
}

const OPCODES: [Opcode; OPCODE_COUNT as usize] = [
    Opcode::Nop,
    Opcode::Lit,
    Opcode::Dup,
    Opcode::Drop,
    Opcode::Swap,
    Opcode::Push,
    Opcode::Pop,
    Opcode::Loop,
    Opcode::Jump,
    Opcode::Return,
    Opcode::GtJump,
    Opcode::LtJump,
    Opcode::NeJump,
    Opcode::EqJump,
    Opcode::Fetch,
    Opcode::Store,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Mul,
    Opcode::DivMod,
    Opcode::And,
    Opcode::Or,
    Opcode::Xor,
    Opcode::Shl,
    Opcode::Shr,
    Opcode::ZeroExit,
    Opcode::Inc,
    Opcode::Dec,
    Opcode::In,
    Opcode::Out,
    Opcode::Wait,
];

impl Opcode {
    /// Whether the opcode reads the cell that follows it
    pub fn has_operand(self) -> bool {
        matches!(
            self,
            Opcode::Lit
                | Opcode::Loop
                | Opcode::Jump
                | Opcode::GtJump
                | Opcode::LtJump
                | Opcode::NeJump
                | Opcode::EqJump
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Lit => "LIT",
            Opcode::Dup => "DUP",
            Opcode::Drop => "DROP",
            Opcode::Swap => "SWAP",
            Opcode::Push => "PUSH",
            Opcode::Pop => "POP",
            Opcode::Loop => "LOOP",
            Opcode::Jump => "JUMP",
            Opcode::Return => "RETURN",
            Opcode::GtJump => "GT_JUMP",
            Opcode::LtJump => "LT_JUMP",
            Opcode::NeJump => "NE_JUMP",
            Opcode::EqJump => "EQ_JUMP",
            Opcode::Fetch => "FETCH",
            Opcode::Store => "STORE",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::DivMod => "DIVMOD",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Shl => "SHL",
            Opcode::Shr => "SHR",
            Opcode::ZeroExit => "ZERO_EXIT",
            Opcode::Inc => "INC",
            Opcode::Dec => "DEC",
            Opcode::In => "IN",
            Opcode::Out => "OUT",
            Opcode::Wait => "WAIT",
        }
    }

    pub fn from_mnemonic(name: &str) -> Option<Self> {
        OPCODES.iter().copied().find(|op| op.mnemonic() == name)
    }
}

impl From<Opcode> for Cell {
    fn from(op: Opcode) -> Cell {
        op as Cell
    }
}

impl TryFrom<Cell> for Opcode {
    /// The value is not reserved, so it is the address of a routine to call.
    type Error = Cell;

    fn try_from(value: Cell) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| OPCODES.get(index).copied())
            .ok_or(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_discriminants() {
        for (index, op) in OPCODES.iter().enumerate() {
            assert_eq!(*op as usize, index);
        }
        assert_eq!(Opcode::Wait as Cell, OPCODE_COUNT - 1);
    }

    #[test]
    fn decode() {
        assert_eq!(Opcode::try_from(0), Ok(Opcode::Nop));
        assert_eq!(Opcode::try_from(19), Ok(Opcode::DivMod));
        assert_eq!(Opcode::try_from(30), Ok(Opcode::Wait));
        assert_eq!(Opcode::try_from(31), Err(31));
        assert_eq!(Opcode::try_from(-4), Err(-4));
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::from_mnemonic("GT_JUMP"), Some(Opcode::GtJump));
        assert_eq!(Opcode::from_mnemonic("ZERO_EXIT"), Some(Opcode::ZeroExit));
        assert_eq!(Opcode::from_mnemonic("gt_jump"), None);
        assert!(Opcode::Lit.has_operand());
        assert!(!Opcode::Return.has_operand());
    }
}
