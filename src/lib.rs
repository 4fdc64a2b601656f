//! Ngaro is a small stack-based virtual machine with a 16 bit cell.
//!
//! The image is a flat array of cells holding both code and data. It is not kept in RAM:
//! every access goes through a small LRU cell cache that writes dirty cells back to a
//! sector-addressed block device (an SD card, or a plain file on native builds).
//!
//! # Example
//!
//! ```text
//!         JUMP main
//! square: DUP
//!         MUL
//!         RETURN
//! main:   LIT 7
//!         square
//!         LIT 900
//!         STORE
//!         JUMP 0
//! ```
//!
//! Jumping to address 0 (or anywhere below it) halts the machine, as does running off the
//! end of the image or dropping from an empty stack.
//!
//! # Instructions
//!
//! | Code | Instruction | Usage             | Brief   |
//! |------|-------------|-------------------|---------|
//! | 0    | Nop         | NOP               | Do nothing. |
//! | 1    | Lit         | LIT _number_      | Push `number`. |
//! | 2    | Dup         | DUP               | Duplicate the top of stack. |
//! | 3    | Drop        | DROP              | Discard the top of stack. |
//! | 4    | Swap        | SWAP              | Exchange the two topmost values. |
//! | 5    | Push        | PUSH              | Move the top of stack to the address stack. |
//! | 6    | Pop         | POP               | Move the top of the address stack to the data stack. |
//! | 7    | Loop        | LOOP _address_    | Decrement the top of stack and jump while it is positive, else drop it. |
//! | 8    | Jump        | JUMP _address_    | Jump to `address`. |
//! | 9    | Return      | RETURN            | Jump to the address popped from the address stack. |
//! | 10   | GtJump      | GT_JUMP _address_ | Pop two values and jump if `nos > tos`. |
//! | 11   | LtJump      | LT_JUMP _address_ | Pop two values and jump if `nos < tos`. |
//! | 12   | NeJump      | NE_JUMP _address_ | Pop two values and jump if they differ. |
//! | 13   | EqJump      | EQ_JUMP _address_ | Pop two values and jump if they are equal. |
//! | 14   | Fetch       | FETCH             | Replace an address with the cell it points to. |
//! | 15   | Store       | STORE             | Store `nos` at the address `tos`, pop both. |
//! | 16   | Add         | ADD               | `nos + tos` |
//! | 17   | Sub         | SUB               | `nos - tos` |
//! | 18   | Mul         | MUL               | `nos * tos` |
//! | 19   | DivMod      | DIVMOD            | Quotient on top, remainder below it. |
//! | 20   | And         | AND               | `nos & tos` |
//! | 21   | Or          | OR                | `nos \| tos` |
//! | 22   | Xor         | XOR               | `nos ^ tos` |
//! | 23   | Shl         | SHL               | `nos << tos` |
//! | 24   | Shr         | SHR               | `nos >> tos` |
//! | 25   | ZeroExit    | ZERO_EXIT         | If the top of stack is zero, drop it and return. |
//! | 26   | Inc         | INC               | Increment the top of stack. |
//! | 27   | Dec         | DEC               | Decrement the top of stack. |
//! | 28   | In          | IN                | Replace a port number with the port's value and clear the port. |
//! | 29   | Out         | OUT               | Write `nos` to the port `tos`, clear port 0. |
//! | 30   | Wait        | WAIT              | Let the devices serve pending requests. |
//!
//! Arithmetic wraps around. Dividing by zero yields a quotient of -1 and keeps the dividend
//! as the remainder. Any other cell value is the address of a routine: executing it pushes
//! the return address and jumps there.
//!
//! # Ports
//!
//! | Port | Device       | Requests |
//! |------|--------------|----------|
//! | 0    | Ready flag   | Set by a device after serving a request. `WAIT` does nothing while it is set. |
//! | 1    | Keyboard     | `1`: read a character, `-1` at the end of input. |
//! | 2    | Character    | `1`: print the character on top of stack. Negative characters clear the console. |
//! | 3    | Heartbeat    | Set to `1` after every instruction. |
//! | 4    | Persistence  | `1`: save the image, `2`: load it. Answers `1` on success, `-1` on failure, `0` when unsupported. |
//! | 5    | Capabilities | `-1` image size, `-5` data depth, `-6` address depth, `-9` halt, `-10` empty environment query, `-11`/`-12` terminal size, `-13` bits per cell, `-14` endianness. |
//! | 13   | Hardware     | `-1`/`-2` read/write a register, `-3`/`-4` test/change a bit, `-5` delay, `-6`/`-7` SPI master/slave, `-8`/`-9` SPI byte/cell transfer. |
//! | 14   | Display      | `-1` character, `-2` string, `-3` cursor, `-4` clear, `-5`/`-6` width/height. |
//!
//! Unknown requests answer `0`.

pub mod assembler;
pub mod cache;
pub mod config;
pub mod device;
pub mod image;
mod lexer;
pub mod log;
pub mod opcode;
pub mod ports;
pub mod storage;
pub mod token;
pub mod vm;

/// The machine word
pub type Cell = i16;

pub use assembler::{assemble, Assembly};
pub use cache::{CacheError, CacheStats, CellCache};
pub use config::VmConfig;
pub use device::{
    BufferConsole, Devices, EmulatedRegisters, FilePersistence, LoopbackBoard, StdConsole,
    TextDisplay,
};
pub use image::{decode_cells, encode_cells, ImageStore, RomImage, SectorImage};
pub use opcode::Opcode;
pub use ports::Ports;
pub use storage::{BlockStorage, FileStorage, MemoryStorage, StorageError};
pub use vm::{Vm, VmError};
