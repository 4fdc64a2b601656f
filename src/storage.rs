//! Sector-addressed block storage
//!
//! The VM never talks to a device directly: the image adapter moves whole sectors in and
//! out of a `BlockStorage`. Two backends are provided, a growable in-memory device and a
//! file that stands in for the SD card on native builds.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const SECTOR_SIZE: usize = 512;

pub type Sector = [u8; SECTOR_SIZE];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage is not initialized")]
    NotReady,
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// A block device with fixed 512 byte sectors
pub trait BlockStorage {
    /// Prepare the device. Called once before the first transfer.
    fn init(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn read_sector(&mut self, buffer: &mut Sector, sector: u32) -> Result<(), StorageError>;

    fn write_sector(&mut self, buffer: &Sector, sector: u32) -> Result<(), StorageError>;
}

fn sector_offset(sector: u32) -> usize {
    sector as usize * SECTOR_SIZE
}

/// Storage kept in RAM. Reads past the end see zeros, writes past the end grow the device.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    bytes: Vec<u8>,
    reads: usize,
    writes: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        MemoryStorage {
            bytes,
            ..Self::default()
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of sector reads served so far
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Number of sector writes served so far
    pub fn writes(&self) -> usize {
        self.writes
    }
}

impl BlockStorage for MemoryStorage {
    fn read_sector(&mut self, buffer: &mut Sector, sector: u32) -> Result<(), StorageError> {
        let start = sector_offset(sector);
        buffer.fill(0);
        if let Some(stored) = self.bytes.get(start..) {
            let len = stored.len().min(SECTOR_SIZE);
            buffer[..len].copy_from_slice(&stored[..len]);
        }
        self.reads += 1;
        Ok(())
    }

    fn write_sector(&mut self, buffer: &Sector, sector: u32) -> Result<(), StorageError> {
        let start = sector_offset(sector);
        let end = start + SECTOR_SIZE;
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(buffer);
        self.writes += 1;
        Ok(())
    }
}

/// An image file used as a block device. The file must exist; `init` opens it.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: Option<File>,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorage {
            path: path.as_ref().to_path_buf(),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self, sector: u32) -> Result<&mut File, StorageError> {
        let file = self.file.as_mut().ok_or(StorageError::NotReady)?;
        file.seek(SeekFrom::Start(sector_offset(sector) as u64))?;
        Ok(file)
    }
}

impl BlockStorage for FileStorage {
    fn init(&mut self) -> Result<(), StorageError> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    fn read_sector(&mut self, buffer: &mut Sector, sector: u32) -> Result<(), StorageError> {
        let file = self.file(sector)?;
        buffer.fill(0);
        // the tail of the file may be shorter than a sector
        let mut filled = 0;
        while filled < SECTOR_SIZE {
            match file.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_sector(&mut self, buffer: &Sector, sector: u32) -> Result<(), StorageError> {
        let file = self.file(sector)?;
        file.write_all(buffer)?;
        file.sync_data()?;
        Ok(())
    }
}
