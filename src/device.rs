//! Devices reachable through the port protocol
//!
//! The engine only talks to these traits. Native builds use the standard streams for the
//! console and emulate the I/O register file; the buffer console, text display and loopback
//! board are handy for tests and headless runs.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use crate::cache::CacheError;
use crate::image::{decode_cells, encode_cells};
use crate::{error, Cell};

/// Character console
pub trait Console {
    fn prepare(&mut self) {}

    /// Block until a character is available. `None` once input is exhausted.
    fn get_char(&mut self) -> Option<u8>;

    fn put_char(&mut self, ch: u8);

    fn clear(&mut self) {
        self.puts("\x1b[2J\x1b[1;1H");
    }

    fn finish(&mut self) {}

    fn puts(&mut self, text: &str) {
        for byte in text.bytes() {
            self.put_char(byte);
        }
    }
}

/// Optional character display
pub trait Display {
    fn init(&mut self) {}
    fn clear(&mut self);
    fn set_cursor(&mut self, x: Cell, y: Cell);
    fn write_char(&mut self, code: Cell, attr: Cell);
    fn write_string(&mut self, text: &str, attr: Cell);
    fn width(&self) -> Cell;
    fn height(&self) -> Cell;
}

/// Memory-mapped 8 bit I/O registers of the board
pub trait Registers {
    fn read(&mut self, register: Cell) -> u8;
    fn write(&mut self, register: Cell, value: u8);
}

/// Timing and SPI primitives. Absent on native builds.
pub trait Board {
    fn delay_ms(&mut self, ms: u16);
    fn spi_master_init(&mut self);
    fn spi_slave_init(&mut self);
    fn spi_transfer(&mut self, byte: u8) -> u8;
}

/// Cell access handed to persistence routines
pub trait CellAccess {
    fn fetch(&mut self, address: Cell) -> Result<Cell, CacheError>;
    fn store(&mut self, address: Cell, value: Cell) -> Result<(), CacheError>;
}

/// Port 4 status codes
pub const PERSIST_OK: Cell = 1;
pub const PERSIST_FAILED: Cell = -1;

/// Save and restore the image to a secondary medium
///
/// Both return the port 4 status code. A failing medium is a status; a cache that runs out
/// of entries is an error, which stops the VM.
pub trait Persistence {
    fn save(&mut self, image: &mut dyn CellAccess, size: Cell) -> Result<Cell, CacheError>;
    fn load(&mut self, image: &mut dyn CellAccess, size: Cell) -> Result<Cell, CacheError>;
}

/// Everything the port dispatcher can reach
pub struct Devices {
    pub console: Box<dyn Console>,
    pub display: Option<Box<dyn Display>>,
    pub registers: Box<dyn Registers>,
    pub board: Option<Box<dyn Board>>,
    pub persistence: Option<Box<dyn Persistence>>,
}

impl Devices {
    /// A console and emulated registers; no display, board or persistence.
    pub fn new<C: Console + 'static>(console: C) -> Self {
        Devices {
            console: Box::new(console),
            display: None,
            registers: Box::new(EmulatedRegisters::default()),
            board: None,
            persistence: None,
        }
    }

    pub fn with_display<D: Display + 'static>(mut self, display: D) -> Self {
        self.display = Some(Box::new(display));
        self
    }

    pub fn with_registers<R: Registers + 'static>(mut self, registers: R) -> Self {
        self.registers = Box::new(registers);
        self
    }

    pub fn with_board<B: Board + 'static>(mut self, board: B) -> Self {
        self.board = Some(Box::new(board));
        self
    }

    pub fn with_persistence<P: Persistence + 'static>(mut self, persistence: P) -> Self {
        self.persistence = Some(Box::new(persistence));
        self
    }
}

/// Console on stdin/stdout
#[derive(Debug, Default)]
pub struct StdConsole;

impl Console for StdConsole {
    fn get_char(&mut self) -> Option<u8> {
        let _ = io::stdout().flush();
        let mut byte = [0u8; 1];
        match io::stdin().read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    fn put_char(&mut self, ch: u8) {
        let mut out = io::stdout();
        let _ = out.write_all(&[ch]);
        if ch == b'\n' {
            let _ = out.flush();
        }
    }

    fn finish(&mut self) {
        let _ = io::stdout().flush();
    }
}

#[derive(Debug, Default)]
struct Buffers {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

/// Console fed from and printing to memory. Clones share the same buffers.
#[derive(Debug, Default, Clone)]
pub struct BufferConsole {
    buffers: Rc<RefCell<Buffers>>,
}

impl BufferConsole {
    pub fn new(input: &str) -> Self {
        let console = Self::default();
        console.push_input(input);
        console
    }

    pub fn push_input(&self, input: &str) {
        self.buffers.borrow_mut().input.extend(input.bytes());
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffers.borrow().output).into_owned()
    }
}

impl Console for BufferConsole {
    fn get_char(&mut self) -> Option<u8> {
        self.buffers.borrow_mut().input.pop_front()
    }

    fn put_char(&mut self, ch: u8) {
        self.buffers.borrow_mut().output.push(ch);
    }

    fn clear(&mut self) {
        self.buffers.borrow_mut().output.clear();
    }
}

pub const REGISTER_COUNT: usize = 64;

/// Register file of the native build. Out of range registers read as zero.
#[derive(Debug, Clone)]
pub struct EmulatedRegisters {
    registers: [u8; REGISTER_COUNT],
}

impl Default for EmulatedRegisters {
    fn default() -> Self {
        EmulatedRegisters {
            registers: [0; REGISTER_COUNT],
        }
    }
}

impl EmulatedRegisters {
    fn slot(&mut self, register: Cell) -> Option<&mut u8> {
        usize::try_from(register)
            .ok()
            .and_then(|index| self.registers.get_mut(index))
    }
}

impl Registers for EmulatedRegisters {
    fn read(&mut self, register: Cell) -> u8 {
        self.slot(register).map_or(0, |value| *value)
    }

    fn write(&mut self, register: Cell, value: u8) {
        if let Some(slot) = self.slot(register) {
            *slot = value;
        }
    }
}

#[derive(Debug)]
struct Grid {
    width: Cell,
    height: Cell,
    cells: Vec<u8>,
    x: Cell,
    y: Cell,
}

impl Grid {
    fn put(&mut self, ch: u8) {
        if (0..self.width).contains(&self.x) && (0..self.height).contains(&self.y) {
            let index = self.y as usize * self.width as usize + self.x as usize;
            self.cells[index] = ch;
        }
        // the cursor may be anywhere a program puts it
        self.x = self.x.saturating_add(1);
        if self.x >= self.width {
            self.x = 0;
            self.y = self.y.saturating_add(1);
        }
    }
}

/// Character grid display kept in memory. Clones share the same grid.
#[derive(Debug, Clone)]
pub struct TextDisplay {
    grid: Rc<RefCell<Grid>>,
}

impl TextDisplay {
    pub fn new(width: Cell, height: Cell) -> Self {
        let size = width.max(0) as usize * height.max(0) as usize;
        TextDisplay {
            grid: Rc::new(RefCell::new(Grid {
                width,
                height,
                cells: vec![b' '; size],
                x: 0,
                y: 0,
            })),
        }
    }

    /// Text of row `y` with trailing blanks removed
    pub fn row(&self, y: Cell) -> String {
        let grid = self.grid.borrow();
        if !(0..grid.height).contains(&y) {
            return String::new();
        }
        let start = y as usize * grid.width as usize;
        let row = &grid.cells[start..start + grid.width as usize];
        String::from_utf8_lossy(row).trim_end().to_string()
    }

    pub fn cursor(&self) -> (Cell, Cell) {
        let grid = self.grid.borrow();
        (grid.x, grid.y)
    }
}

impl Display for TextDisplay {
    fn clear(&mut self) {
        let mut grid = self.grid.borrow_mut();
        grid.cells.fill(b' ');
        grid.x = 0;
        grid.y = 0;
    }

    fn set_cursor(&mut self, x: Cell, y: Cell) {
        let mut grid = self.grid.borrow_mut();
        grid.x = x;
        grid.y = y;
    }

    fn write_char(&mut self, code: Cell, _attr: Cell) {
        self.grid.borrow_mut().put(code as u8);
    }

    fn write_string(&mut self, text: &str, _attr: Cell) {
        let mut grid = self.grid.borrow_mut();
        for byte in text.bytes() {
            grid.put(byte);
        }
    }

    fn width(&self) -> Cell {
        self.grid.borrow().width
    }

    fn height(&self) -> Cell {
        self.grid.borrow().height
    }
}

/// Board whose SPI bus echoes every byte and whose delays sleep.
#[derive(Debug, Default, Clone)]
pub struct LoopbackBoard {
    pub master: Option<bool>,
}

impl Board for LoopbackBoard {
    fn delay_ms(&mut self, ms: u16) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn spi_master_init(&mut self) {
        self.master = Some(true);
    }

    fn spi_slave_init(&mut self) {
        self.master = Some(false);
    }

    fn spi_transfer(&mut self, byte: u8) -> u8 {
        byte
    }
}

/// Saves the first `size` cells of the image to a file and loads them back.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FilePersistence {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn write_cells(&self, cells: &[Cell]) -> anyhow::Result<()> {
        let mut bytes = Vec::with_capacity(cells.len() * 2);
        encode_cells(cells, &mut bytes)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }

    fn read_cells(&self) -> anyhow::Result<Vec<Cell>> {
        Ok(decode_cells(&fs::read(&self.path)?))
    }
}

impl Persistence for FilePersistence {
    fn save(&mut self, image: &mut dyn CellAccess, size: Cell) -> Result<Cell, CacheError> {
        let mut cells = Vec::with_capacity(size.max(0) as usize);
        for address in 0..size.max(0) {
            cells.push(image.fetch(address)?);
        }
        match self.write_cells(&cells) {
            Ok(()) => Ok(PERSIST_OK),
            Err(err) => {
                error!("failed to save image to {}: {:#}", self.path.display(), err);
                Ok(PERSIST_FAILED)
            }
        }
    }

    fn load(&mut self, image: &mut dyn CellAccess, size: Cell) -> Result<Cell, CacheError> {
        let cells = match self.read_cells() {
            Ok(cells) => cells,
            Err(err) => {
                error!("failed to load image from {}: {:#}", self.path.display(), err);
                return Ok(PERSIST_FAILED);
            }
        };
        for (address, value) in (0..size.max(0)).zip(cells) {
            image.store(address, value)?;
        }
        Ok(PERSIST_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MapImage(HashMap<Cell, Cell>);

    impl CellAccess for MapImage {
        fn fetch(&mut self, address: Cell) -> Result<Cell, CacheError> {
            Ok(self.0.get(&address).copied().unwrap_or(0))
        }

        fn store(&mut self, address: Cell, value: Cell) -> Result<(), CacheError> {
            self.0.insert(address, value);
            Ok(())
        }
    }

    #[test]
    fn buffer_console_shares_buffers() {
        let console = BufferConsole::new("ab");
        let mut handle: Box<dyn Console> = Box::new(console.clone());
        assert_eq!(handle.get_char(), Some(b'a'));
        assert_eq!(handle.get_char(), Some(b'b'));
        assert_eq!(handle.get_char(), None);
        handle.puts("ok");
        assert_eq!(console.output(), "ok");
        handle.clear();
        assert_eq!(console.output(), "");
    }

    #[test]
    fn registers_ignore_out_of_range() {
        let mut registers = EmulatedRegisters::default();
        registers.write(5, 0x81);
        registers.write(64, 1);
        registers.write(-1, 1);
        assert_eq!(registers.read(5), 0x81);
        assert_eq!(registers.read(64), 0);
        assert_eq!(registers.read(-1), 0);
    }

    #[test]
    fn text_display_wraps() {
        let mut display = TextDisplay::new(4, 2);
        let view = display.clone();
        display.set_cursor(2, 0);
        display.write_string("abcd", 0);
        assert_eq!(view.row(0), "  ab");
        assert_eq!(view.row(1), "cd");
        assert_eq!(view.cursor(), (2, 1));
        display.clear();
        assert_eq!(view.row(0), "");
        assert_eq!(view.cursor(), (0, 0));
    }

    #[test]
    fn text_display_cursor_off_grid() {
        let mut display = TextDisplay::new(4, 2);
        let view = display.clone();
        display.set_cursor(Cell::MAX, Cell::MAX);
        display.write_string("ab", 0);
        assert_eq!(view.cursor(), (1, Cell::MAX));
        assert_eq!(view.row(0), "");

        let mut empty = TextDisplay::new(0, 0);
        empty.write_string("abc", 0);
        assert_eq!(empty.cursor(), (0, 3));
    }

    #[test]
    fn file_persistence_round_trip() {
        let path = std::env::temp_dir().join(format!("ngaro-persist-{}", std::process::id()));
        let mut persistence = FilePersistence::new(&path);

        let mut image = MapImage::default();
        image.store(0, 4).unwrap();
        image.store(2, -9).unwrap();
        assert_eq!(persistence.save(&mut image, 3), Ok(PERSIST_OK));
        assert_eq!(fs::metadata(&path).unwrap().len(), 6);

        let mut restored = MapImage::default();
        assert_eq!(persistence.load(&mut restored, 3), Ok(PERSIST_OK));
        assert_eq!(restored.fetch(0).unwrap(), 4);
        assert_eq!(restored.fetch(2).unwrap(), -9);

        fs::remove_file(&path).unwrap();
        assert_eq!(persistence.load(&mut restored, 3), Ok(PERSIST_FAILED));
    }
}
