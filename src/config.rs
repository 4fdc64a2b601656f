//! Runtime limits of the VM.
//!
//! The defaults match the sizes the microcontroller build is tuned for. Native builds
//! usually raise `cache_size` from the command line.

use anyhow::{anyhow, ensure};
use std::time::Duration;

use crate::Cell;

pub const IMAGE_SIZE: Cell = 16000;
pub const IMAGE_CACHE_SIZE: usize = 3;
pub const STACK_DEPTH: usize = 32;
pub const ADDRESSES: usize = 32;
pub const PORTS: usize = 15;
pub const STRING_BUFFER_SIZE: usize = 32;

/// VM configuration
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Number of addressable cells; reaching it halts the program
    pub image_size: Cell,
    /// Entries in the cell cache
    pub cache_size: usize,
    /// Data stack slots, including the bottom sentinel
    pub stack_depth: usize,
    /// Address stack slots, including the bottom sentinel
    pub address_depth: usize,
    /// Size of the port register file
    pub ports: usize,
    /// Longest string the display can receive in one request
    pub string_buffer_size: usize,
    pub terminal_width: Cell,
    pub terminal_height: Cell,
    /// Delay between retries of a failed sector transfer
    pub retry_delay: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            image_size: IMAGE_SIZE,
            cache_size: IMAGE_CACHE_SIZE,
            stack_depth: STACK_DEPTH,
            address_depth: ADDRESSES,
            ports: PORTS,
            string_buffer_size: STRING_BUFFER_SIZE,
            terminal_width: 80,
            terminal_height: 25,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl VmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject limits the engine cannot work with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.image_size > 0, "image size must be positive");
        ensure!(self.cache_size > 0, "cache needs at least one entry");
        // the last index is the end-of-list sentinel
        if self.cache_size >= u16::MAX as usize {
            return Err(anyhow!(
                "cache size {} exceeds the maximum of {}",
                self.cache_size,
                u16::MAX - 1
            ));
        }
        ensure!(self.stack_depth >= 2, "data stack needs at least two slots");
        ensure!(self.address_depth >= 2, "address stack needs at least two slots");
        ensure!(
            self.ports >= PORTS,
            "at least {} ports are required, got {}",
            PORTS,
            self.ports
        );
        Ok(())
    }
}
