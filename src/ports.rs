//! Port register file and the device protocol served by `WAIT`
//!
//! A program requests a device action by writing a command or a negative selector into the
//! device's port and executing `WAIT`. The device answers in the same port and raises the
//! ready flag in port 0. Devices are polled in port order.

use crate::cache::CacheError;
use crate::device::CellAccess;
use crate::image::ImageStore;
use crate::vm::Vm;
use crate::{warn, Cell};

/// Something has been served; `WAIT` is a no-op until the program clears it.
pub const READY: Cell = 0;
/// Console input request, answered with the character read
pub const KEYBOARD: Cell = 1;
/// Console output request, the character is taken from the stack
pub const CHARACTER: Cell = 2;
/// Set after every executed instruction
pub const HEARTBEAT: Cell = 3;
/// Image save (1) and load (2)
pub const PERSISTENCE: Cell = 4;
/// Capability queries
pub const CAPABILITIES: Cell = 5;
/// Hardware registers, timing and SPI
pub const HARDWARE: Cell = 13;
/// Character display
pub const DISPLAY: Cell = 14;

/// Fixed-size register file shared by the program and the devices.
/// Accesses outside the file read as zero and are otherwise ignored.
#[derive(Debug, Clone)]
pub struct Ports {
    ports: Box<[Cell]>,
}

impl Ports {
    pub fn new(count: usize) -> Self {
        Ports {
            ports: vec![0; count].into_boxed_slice(),
        }
    }

    fn index(&self, port: Cell) -> Option<usize> {
        usize::try_from(port)
            .ok()
            .filter(|index| *index < self.ports.len())
    }

    pub fn get(&self, port: Cell) -> Cell {
        self.index(port).map_or(0, |index| self.ports[index])
    }

    pub fn set(&mut self, port: Cell, value: Cell) {
        if let Some(index) = self.index(port) {
            self.ports[index] = value;
        }
    }

    /// Read a port and clear it
    pub fn take(&mut self, port: Cell) -> Cell {
        let value = self.get(port);
        self.set(port, 0);
        value
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn as_slice(&self) -> &[Cell] {
        &self.ports
    }
}

/// `1 << bit` for an 8 bit register, empty when the bit is out of range
fn bit_mask(bit: Cell) -> u8 {
    u32::try_from(bit)
        .ok()
        .and_then(|bit| 1u8.checked_shl(bit))
        .unwrap_or(0)
}

impl<S: ImageStore> Vm<S> {
    /// Serve every pending device request.
    pub(crate) fn wait(&mut self) -> anyhow::Result<()> {
        if self.ports.get(READY) != 0 {
            return Ok(());
        }

        if self.ports.get(KEYBOARD) == 1 {
            let ch = self.devices.console.get_char().map_or(-1, Cell::from);
            self.ports.set(KEYBOARD, ch);
            self.ports.set(READY, 1);
        }

        if self.ports.get(CHARACTER) == 1 {
            let ch = self.tos();
            if ch < 0 {
                self.devices.console.clear();
            } else {
                self.devices.console.put_char(ch as u8);
            }
            self.drop_cell();
            self.ports.set(CHARACTER, 0);
            self.ports.set(READY, 1);
        }

        if self.ports.get(PERSISTENCE) != 0 {
            self.ports.set(READY, 1);
            let status = self.persistence(self.ports.get(PERSISTENCE))?;
            self.ports.set(PERSISTENCE, status);
        }

        if self.ports.get(CAPABILITIES) != 0 {
            self.ports.set(READY, 1);
            let answer = self.capability(self.ports.get(CAPABILITIES))?;
            self.ports.set(CAPABILITIES, answer);
        }

        if self.ports.get(HARDWARE) != 0 {
            self.ports.set(READY, 1);
            let answer = self.hardware(self.ports.get(HARDWARE));
            self.ports.set(HARDWARE, answer);
        }

        if self.ports.get(DISPLAY) != 0 {
            self.ports.set(READY, 1);
            let answer = self.display(self.ports.get(DISPLAY))?;
            self.ports.set(DISPLAY, answer);
        }

        Ok(())
    }

    fn persistence(&mut self, command: Cell) -> Result<Cell, CacheError> {
        let size = self.config.image_size;
        let Some(persistence) = self.devices.persistence.as_mut() else {
            return Ok(0);
        };
        let image: &mut dyn CellAccess = &mut self.cache;
        match command {
            1 => persistence.save(image, size),
            2 => persistence.load(image, size),
            _ => Ok(0),
        }
    }

    fn capability(&mut self, selector: Cell) -> anyhow::Result<Cell> {
        let answer = match selector {
            -1 => self.config.image_size,
            -5 => self.sp as Cell,
            -6 => self.rsp as Cell,
            -9 => {
                self.ip = self.config.image_size;
                0
            }
            -10 => {
                // clear the environment query buffer; no environment exists here
                self.drop_cell();
                if self.sp >= 0 {
                    self.cache.put(self.tos(), 0)?;
                }
                self.drop_cell();
                0
            }
            -11 => self.config.terminal_width,
            -12 => self.config.terminal_height,
            -13 => Cell::BITS as Cell,
            // little endian
            -14 => 0,
            _ => 0,
        };
        Ok(answer)
    }

    fn hardware(&mut self, selector: Cell) -> Cell {
        let (tos, nos) = (self.tos(), self.nos());
        match selector {
            -1 => {
                let value = self.devices.registers.read(tos);
                self.drop_cell();
                Cell::from(value)
            }
            -2 => {
                self.devices.registers.write(tos, nos as u8);
                self.drop_cell();
                self.drop_cell();
                0
            }
            -3 => {
                self.drop_cell();
                self.drop_cell();
                Cell::from(self.devices.registers.read(tos) & bit_mask(nos) != 0)
            }
            -4 => {
                self.drop_cell();
                self.drop_cell();
                let value = self.devices.registers.read(tos);
                let value = if self.tos() != 0 {
                    value | bit_mask(nos)
                } else {
                    value & !bit_mask(nos)
                };
                self.devices.registers.write(tos, value);
                self.drop_cell();
                0
            }
            -9..=-5 => self.board(selector),
            _ => 0,
        }
    }

    fn board(&mut self, selector: Cell) -> Cell {
        let tos = self.tos();
        let Some(board) = self.devices.board.as_mut() else {
            warn!("hardware selector {} needs a board", selector);
            return 0;
        };
        let answer = match selector {
            -5 => {
                board.delay_ms(tos as u16);
                0
            }
            -6 => {
                board.spi_master_init();
                0
            }
            -7 => {
                board.spi_slave_init();
                0
            }
            -8 => Cell::from(board.spi_transfer(tos as u8)),
            -9 => {
                // high byte goes out first
                let [high, low] = tos.to_be_bytes();
                let high = board.spi_transfer(high);
                let low = board.spi_transfer(low);
                Cell::from_be_bytes([high, low])
            }
            _ => 0,
        };
        if matches!(selector, -5 | -8 | -9) {
            self.drop_cell();
        }
        answer
    }

    fn display(&mut self, selector: Cell) -> anyhow::Result<Cell> {
        if self.devices.display.is_none() {
            if (-3..=-1).contains(&selector) {
                self.drop_cell();
                self.drop_cell();
            }
            return Ok(0);
        }

        let text = if selector == -2 {
            self.read_string(self.tos())?
        } else {
            String::new()
        };
        let (tos, nos) = (self.tos(), self.nos());

        let Some(display) = self.devices.display.as_mut() else {
            return Ok(0);
        };
        let answer = match selector {
            -1 => {
                display.write_char(tos, nos);
                0
            }
            -2 => {
                display.write_string(&text, nos);
                0
            }
            -3 => {
                display.set_cursor(nos, tos);
                0
            }
            -4 => {
                display.clear();
                0
            }
            -5 => display.width(),
            -6 => display.height(),
            _ => 0,
        };
        if (-3..=-1).contains(&selector) {
            self.drop_cell();
            self.drop_cell();
        }
        Ok(answer)
    }

    /// Zero-terminated string stored one character per cell
    fn read_string(&mut self, start: Cell) -> anyhow::Result<String> {
        let mut text = String::new();
        let mut address = start;
        while text.len() + 1 < self.config.string_buffer_size {
            let ch = self.cache.get(address)?;
            if ch == 0 {
                break;
            }
            text.push(char::from(ch as u8));
            address = address.wrapping_add(1);
        }
        Ok(text)
    }
}
