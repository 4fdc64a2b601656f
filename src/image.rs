//! Cell-level access to the image backing store
//!
//! The cache sees the image through [`ImageStore`]. A read-write image keeps exactly one
//! sector of the block device resident ([`SectorImage`]); a read-only image lives in
//! program memory ([`RomImage`]) and silently drops writes.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Write};
use std::mem::size_of;
use std::thread;
use std::time::Duration;

use crate::storage::{BlockStorage, Sector, StorageError, SECTOR_SIZE};
use crate::{error, Cell};

/// Cells that fit in one sector
pub const CELLS_PER_SECTOR: u32 = (SECTOR_SIZE / size_of::<Cell>()) as u32;

/// Backing store of the cell cache
pub trait ImageStore {
    fn cell_get(&mut self, address: Cell) -> Cell;

    /// Returns `false` when the store cannot persist the cell, which leaves the cache entry dirty.
    fn cell_put(&mut self, address: Cell, value: Cell) -> bool;

    fn sync(&mut self);
}

/// Addresses are unsigned on the storage side
fn locate(address: Cell) -> (u32, usize) {
    let address = u32::from(address as u16);
    (
        address / CELLS_PER_SECTOR,
        (address % CELLS_PER_SECTOR) as usize * size_of::<Cell>(),
    )
}

/// Read-write image with a single resident sector
pub struct SectorImage<B> {
    storage: B,
    sector: Option<u32>,
    dirty: bool,
    data: Box<Sector>,
    retry_delay: Duration,
}

impl<B: BlockStorage> SectorImage<B> {
    /// Initialize the device and make sector 0 resident.
    pub fn open(mut storage: B, retry_delay: Duration) -> Result<Self, StorageError> {
        storage.init()?;
        let mut image = SectorImage {
            storage,
            sector: None,
            dirty: false,
            data: Box::new([0; SECTOR_SIZE]),
            retry_delay,
        };
        image.load(0);
        Ok(image)
    }

    pub fn storage(&self) -> &B {
        &self.storage
    }

    /// Give the device back. Unsynced changes in the resident sector are lost.
    pub fn into_storage(self) -> B {
        self.storage
    }

    /// Sector currently held in the buffer
    pub fn resident_sector(&self) -> Option<u32> {
        self.sector
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Make `sector` resident, writing the previous one back first.
    ///
    /// Transfers are retried until they succeed; a device that never recovers stalls the VM.
    fn load(&mut self, sector: u32) {
        if self.sector == Some(sector) {
            return;
        }
        if let (Some(previous), true) = (self.sector, self.dirty) {
            while let Err(err) = self.storage.write_sector(&self.data, previous) {
                error!("failed to write sector {}: {}", previous, err);
                thread::sleep(self.retry_delay);
            }
            self.dirty = false;
        }
        while let Err(err) = self.storage.read_sector(&mut self.data, sector) {
            error!("failed to read sector {}: {}", sector, err);
            thread::sleep(self.retry_delay);
        }
        self.sector = Some(sector);
    }
}

impl<B: BlockStorage> ImageStore for SectorImage<B> {
    fn cell_get(&mut self, address: Cell) -> Cell {
        let (sector, offset) = locate(address);
        self.load(sector);
        LittleEndian::read_i16(&self.data[offset..offset + size_of::<Cell>()])
    }

    fn cell_put(&mut self, address: Cell, value: Cell) -> bool {
        let (sector, offset) = locate(address);
        self.load(sector);
        LittleEndian::write_i16(&mut self.data[offset..offset + size_of::<Cell>()], value);
        self.dirty = true;
        true
    }

    fn sync(&mut self) {
        let Some(sector) = self.sector else {
            return;
        };
        if !self.dirty {
            return;
        }
        match self.storage.write_sector(&self.data, sector) {
            Ok(()) => self.dirty = false,
            Err(err) => error!("failed to write sector {}: {}", sector, err),
        }
    }
}

/// Read-only image baked into memory. Cells past the end read as zero.
#[derive(Debug, Clone, Default)]
pub struct RomImage {
    cells: Box<[Cell]>,
}

impl RomImage {
    pub fn new(cells: Vec<Cell>) -> Self {
        RomImage {
            cells: cells.into_boxed_slice(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::new(decode_cells(bytes))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl ImageStore for RomImage {
    fn cell_get(&mut self, address: Cell) -> Cell {
        self.cells
            .get(usize::from(address as u16))
            .copied()
            .unwrap_or(0)
    }

    fn cell_put(&mut self, _address: Cell, _value: Cell) -> bool {
        false
    }

    fn sync(&mut self) {}
}

/// Decode an image file of little-endian cells. A trailing odd byte is ignored.
pub fn decode_cells(bytes: &[u8]) -> Vec<Cell> {
    let mut cursor = Cursor::new(bytes);
    let mut cells = Vec::with_capacity(bytes.len() / size_of::<Cell>());
    while let Ok(cell) = cursor.read_i16::<LittleEndian>() {
        cells.push(cell);
    }
    cells
}

/// Encode cells in image file order.
pub fn encode_cells<W: Write>(cells: &[Cell], mut out: W) -> io::Result<()> {
    for cell in cells {
        out.write_i16::<LittleEndian>(*cell)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn memory_image(cells: &[Cell]) -> SectorImage<MemoryStorage> {
        let mut bytes = Vec::new();
        encode_cells(cells, &mut bytes).unwrap();
        SectorImage::open(MemoryStorage::from_bytes(bytes), Duration::ZERO).unwrap()
    }

    /// Fails the first `failures` transfers, then behaves like memory.
    struct FlakyStorage {
        inner: MemoryStorage,
        failures: usize,
    }

    impl FlakyStorage {
        fn fail(&mut self) -> Result<(), StorageError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(StorageError::NotReady);
            }
            Ok(())
        }
    }

    impl BlockStorage for FlakyStorage {
        fn read_sector(&mut self, buffer: &mut Sector, sector: u32) -> Result<(), StorageError> {
            self.fail()?;
            self.inner.read_sector(buffer, sector)
        }

        fn write_sector(&mut self, buffer: &Sector, sector: u32) -> Result<(), StorageError> {
            self.fail()?;
            self.inner.write_sector(buffer, sector)
        }
    }

    #[test]
    fn address_translation() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(255), (0, 510));
        assert_eq!(locate(256), (1, 0));
        assert_eq!(locate(15999), (62, 2 * 127));
        assert_eq!(locate(-1), (255, 510));
    }

    #[test]
    fn opens_with_sector_zero_resident() {
        let image = memory_image(&[1, 2, 3]);
        assert_eq!(image.resident_sector(), Some(0));
        assert_eq!(image.storage().reads(), 1);
    }

    #[test]
    fn reads_cells_across_sectors() {
        let cells: Vec<Cell> = (0..600).collect();
        let mut image = memory_image(&cells);
        assert_eq!(image.cell_get(2), 2);
        assert_eq!(image.cell_get(300), 300);
        assert_eq!(image.resident_sector(), Some(1));
        assert_eq!(image.cell_get(599), 599);
        assert_eq!(image.resident_sector(), Some(2));
        assert_eq!(image.cell_get(4000), 0);
    }

    #[test]
    fn switching_sectors_flushes_dirty_one() {
        let mut image = memory_image(&[]);
        assert!(image.cell_put(10, -42));
        assert!(image.is_dirty());
        assert_eq!(image.storage().writes(), 0);

        assert_eq!(image.cell_get(CELLS_PER_SECTOR as Cell), 0);
        assert!(!image.is_dirty());
        assert_eq!(image.storage().writes(), 1);
        assert_eq!(image.cell_get(10), -42);
    }

    #[test]
    fn sync_writes_once() {
        let mut image = memory_image(&[5; 4]);
        image.cell_put(3, 6);
        image.sync();
        image.sync();
        let storage = image.into_storage();
        assert_eq!(storage.writes(), 1);
        assert_eq!(decode_cells(storage.bytes())[..4], [5, 5, 5, 6]);
    }

    #[test]
    fn clean_sector_is_not_written() {
        let mut image = memory_image(&[1; 300]);
        image.cell_get(299);
        image.cell_get(0);
        image.sync();
        assert_eq!(image.storage().writes(), 0);
    }

    #[test]
    fn retries_failed_transfers() {
        let storage = FlakyStorage {
            inner: MemoryStorage::new(),
            failures: 2,
        };
        let mut image = SectorImage::open(storage, Duration::ZERO).unwrap();
        image.cell_put(700, 12);

        image.storage.failures = 3;
        assert_eq!(image.cell_get(1), 0);
        assert_eq!(image.storage.failures, 0);
        assert_eq!(image.cell_get(700), 12);
    }

    #[test]
    fn rom_drops_writes() {
        let mut rom = RomImage::new(vec![1, 2, 3]);
        assert_eq!(rom.cell_get(1), 2);
        assert_eq!(rom.cell_get(3), 0);
        assert!(!rom.cell_put(1, 9));
        assert_eq!(rom.cell_get(1), 2);
    }

    #[test]
    fn cell_codec() {
        let mut bytes = Vec::new();
        encode_cells(&[1, -2, 0x1234], &mut bytes).unwrap();
        assert_eq!(bytes, vec![1, 0, 0xFE, 0xFF, 0x34, 0x12]);
        bytes.push(0x77);
        assert_eq!(decode_cells(&bytes), vec![1, -2, 0x1234]);
        assert_eq!(RomImage::from_bytes(&bytes).len(), 3);
    }
}
