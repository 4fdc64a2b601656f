//! Virtual machine that runs the image

use anyhow::Context;
use thiserror::Error;

use crate::cache::{CacheError, CellCache};
use crate::config::VmConfig;
use crate::device::{CellAccess, Devices};
use crate::image::ImageStore;
use crate::opcode::Opcode;
use crate::ports::{Ports, HEARTBEAT, READY};
use crate::{error, info, Cell};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VmError {
    #[error("data stack overflow (depth {depth})")]
    DataStackOverflow { depth: usize },
    #[error("address stack overflow (depth {depth})")]
    AddressStackOverflow { depth: usize },
}

/// Virtual machine representation
///
/// Slot 0 of both stacks is a sentinel: an empty stack has its pointer at 0 and a drop
/// below it ends the program.
pub struct Vm<S> {
    pub(crate) config: VmConfig,
    pub(crate) cache: CellCache<S>,   // image cells
    pub(crate) data: Box<[Cell]>,     // data stack
    pub(crate) sp: isize,             // data stack pointer
    pub(crate) address: Box<[Cell]>,  // address stack
    pub(crate) rsp: isize,            // address stack pointer
    pub(crate) ip: Cell,              // instruction pointer
    pub(crate) ports: Ports,          // port register file
    pub(crate) devices: Devices,      // everything behind the ports
}

impl<S: ImageStore> Vm<S> {
    /// Allocate every table the run needs. Nothing grows after this point.
    pub fn new(config: VmConfig, store: S, devices: Devices) -> anyhow::Result<Self> {
        config.validate().context("invalid VM configuration")?;

        Ok(Vm {
            cache: CellCache::new(store, config.cache_size),
            data: vec![0; config.stack_depth].into_boxed_slice(),
            sp: 0,
            address: vec![0; config.address_depth].into_boxed_slice(),
            rsp: 0,
            ip: 0,
            ports: Ports::new(config.ports),
            devices,
            config,
        })
    }

    /// Boot the devices, execute from address 0 until the program halts, then sync the image.
    ///
    /// A fatal condition is reported on the console and returned; the image is not synced
    /// in that case.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.boot();

        if let Err(err) = self.execute() {
            self.devices.console.puts(&format!("\nERROR: {} ", err));
            self.devices.console.finish();
            error!("vm stopped at ip {}: {:#}", self.ip, err);
            return Err(err);
        }

        self.shutdown();
        Ok(())
    }

    /// Run until the instruction pointer leaves the image.
    pub fn execute(&mut self) -> anyhow::Result<()> {
        while self.is_running() {
            self.step()?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        (0..self.config.image_size).contains(&self.ip)
    }

    /// Fetch and execute one cell.
    pub fn step(&mut self) -> anyhow::Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        let cell = self.cache.get(self.ip)?;
        match Opcode::try_from(cell) {
            Ok(op) => self.execute_op(op)?,
            Err(target) => self.call(target)?,
        }

        self.ports.set(HEARTBEAT, 1);
        self.ip = self.ip.wrapping_add(1);
        if !self.is_running() {
            self.ip = self.config.image_size;
        }
        Ok(())
    }

    pub fn ip(&self) -> Cell {
        self.ip
    }

    /// Depth of the data stack
    pub fn depth(&self) -> usize {
        self.sp.max(0) as usize
    }

    /// Live data stack from bottom to top
    pub fn data_stack(&self) -> &[Cell] {
        &self.data[1..=self.depth()]
    }

    /// Live address stack from bottom to top
    pub fn address_stack(&self) -> &[Cell] {
        &self.address[1..=self.rsp.max(0) as usize]
    }

    pub fn ports(&self) -> &Ports {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut Ports {
        &mut self.ports
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn cache(&self) -> &CellCache<S> {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut CellCache<S> {
        &mut self.cache
    }

    /// Release the image store. Call after `run` or `shutdown` so nothing is left dirty.
    pub fn into_store(self) -> S {
        self.cache.into_store()
    }

    fn boot(&mut self) {
        self.devices.console.prepare();
        self.devices.console.puts("\nInitialize Ngaro VM.\n\n");
        if let Some(display) = self.devices.display.as_mut() {
            display.init();
            display.clear();
            display.set_cursor(0, 0);
        }
    }

    /// Flush the image and release the console.
    pub fn shutdown(&mut self) {
        self.cache.sync();
        let stats = self.cache.stats();
        info!(
            "cache: {} hits, {} misses, {} elided writes, {} evictions, {} write-backs",
            stats.hits, stats.misses, stats.elided, stats.evictions, stats.write_backs
        );
        self.devices.console.puts("\n\nNgaro VM is down.\n");
        self.devices.console.finish();
    }

    fn execute_op(&mut self, op: Opcode) -> anyhow::Result<()> {
        match op {
            Opcode::Nop => {}
            Opcode::Lit => {
                self.ip = self.ip.wrapping_add(1);
                let value = self.cache.get(self.ip)?;
                self.push(value)?;
            }
            Opcode::Dup => self.push(self.tos())?,
            Opcode::Drop => self.drop_cell(),
            Opcode::Swap => {
                let (tos, nos) = (self.tos(), self.nos());
                self.set_tos(nos);
                self.set_nos(tos);
            }
            Opcode::Push => {
                self.push_address(self.tos())?;
                self.drop_cell();
            }
            Opcode::Pop => {
                self.push(self.tors())?;
                self.rsp -= 1;
            }
            Opcode::Loop => {
                let counter = self.tos().wrapping_sub(1);
                self.set_tos(counter);
                self.ip = self.ip.wrapping_add(1);
                if counter > 0 {
                    self.ip = self.operand_target()?;
                } else {
                    self.drop_cell();
                }
            }
            Opcode::Jump => {
                self.ip = self.ip.wrapping_add(1);
                self.ip = self.operand_target()?;
                self.clamp_ip();
            }
            Opcode::Return => self.ret(),
            Opcode::GtJump => self.jump_if(|nos, tos| nos > tos)?,
            Opcode::LtJump => self.jump_if(|nos, tos| nos < tos)?,
            Opcode::NeJump => self.jump_if(|nos, tos| nos != tos)?,
            Opcode::EqJump => self.jump_if(|nos, tos| nos == tos)?,
            Opcode::Fetch => {
                let value = self.cache.get(self.tos())?;
                self.set_tos(value);
            }
            Opcode::Store => {
                self.cache.put(self.tos(), self.nos())?;
                self.drop_cell();
                self.drop_cell();
            }
            Opcode::Add => self.binary(|nos, tos| nos.wrapping_add(tos)),
            Opcode::Sub => self.binary(|nos, tos| nos.wrapping_sub(tos)),
            Opcode::Mul => self.binary(|nos, tos| nos.wrapping_mul(tos)),
            Opcode::DivMod => {
                let (quotient, remainder) = divmod(self.nos(), self.tos());
                self.set_tos(quotient);
                self.set_nos(remainder);
            }
            Opcode::And => self.binary(|nos, tos| nos & tos),
            Opcode::Or => self.binary(|nos, tos| nos | tos),
            Opcode::Xor => self.binary(|nos, tos| nos ^ tos),
            Opcode::Shl => self.binary(shift_left),
            Opcode::Shr => self.binary(shift_right),
            Opcode::ZeroExit => {
                if self.tos() == 0 {
                    self.drop_cell();
                    self.ret();
                }
            }
            Opcode::Inc => self.set_tos(self.tos().wrapping_add(1)),
            Opcode::Dec => self.set_tos(self.tos().wrapping_sub(1)),
            Opcode::In => {
                let port = self.tos();
                let value = self.ports.take(port);
                self.set_tos(value);
            }
            Opcode::Out => {
                let port = self.tos();
                self.ports.set(READY, 0);
                self.ports.set(port, self.nos());
                self.drop_cell();
                self.drop_cell();
            }
            Opcode::Wait => self.wait()?,
        }
        Ok(())
    }

    /// Unreserved cells are addresses: save the return point and jump.
    fn call(&mut self, target: Cell) -> anyhow::Result<()> {
        self.push_address(self.ip)?;
        self.ip = target.wrapping_sub(1);
        Ok(())
    }

    /// Pop the return address. A negative one ends the program.
    fn ret(&mut self) {
        self.ip = self.tors();
        self.rsp -= 1;
        self.clamp_ip();
    }

    /// Branch target stored at `ip`, minus one for the increment that ends the step
    fn operand_target(&mut self) -> Result<Cell, CacheError> {
        Ok(self.cache.get(self.ip)?.wrapping_sub(1))
    }

    fn jump_if(&mut self, relation: fn(Cell, Cell) -> bool) -> anyhow::Result<()> {
        self.ip = self.ip.wrapping_add(1);
        if relation(self.nos(), self.tos()) {
            self.ip = self.operand_target()?;
        }
        self.drop_cell();
        self.drop_cell();
        Ok(())
    }

    /// Combine next-on-stack with top-of-stack into next-on-stack and drop the top
    fn binary(&mut self, combine: fn(Cell, Cell) -> Cell) {
        let value = combine(self.nos(), self.tos());
        self.set_nos(value);
        self.drop_cell();
    }

    fn clamp_ip(&mut self) {
        if self.ip < 0 {
            self.ip = self.config.image_size;
        }
    }

    fn slot(stack: &[Cell], index: isize) -> Option<usize> {
        usize::try_from(index).ok().filter(|index| *index < stack.len())
    }

    pub(crate) fn tos(&self) -> Cell {
        Self::slot(&self.data, self.sp).map_or(0, |index| self.data[index])
    }

    pub(crate) fn nos(&self) -> Cell {
        Self::slot(&self.data, self.sp - 1).map_or(0, |index| self.data[index])
    }

    pub(crate) fn set_tos(&mut self, value: Cell) {
        if let Some(index) = Self::slot(&self.data, self.sp) {
            self.data[index] = value;
        }
    }

    pub(crate) fn set_nos(&mut self, value: Cell) {
        if let Some(index) = Self::slot(&self.data, self.sp - 1) {
            self.data[index] = value;
        }
    }

    pub(crate) fn push(&mut self, value: Cell) -> Result<(), VmError> {
        if self.sp + 1 >= self.data.len() as isize {
            return Err(VmError::DataStackOverflow {
                depth: self.data.len(),
            });
        }
        self.sp += 1;
        self.set_tos(value);
        Ok(())
    }

    /// Clear and discard the top of stack. Dropping past the bottom ends the program.
    pub(crate) fn drop_cell(&mut self) {
        self.set_tos(0);
        self.sp -= 1;
        if self.sp < 0 {
            self.ip = self.config.image_size;
        }
    }

    /// Top of the address stack. Below the bottom it reads as the end of the image.
    pub(crate) fn tors(&self) -> Cell {
        Self::slot(&self.address, self.rsp)
            .map_or(self.config.image_size, |index| self.address[index])
    }

    pub(crate) fn push_address(&mut self, value: Cell) -> Result<(), VmError> {
        if self.rsp + 1 >= self.address.len() as isize {
            return Err(VmError::AddressStackOverflow {
                depth: self.address.len(),
            });
        }
        self.rsp += 1;
        if let Some(index) = Self::slot(&self.address, self.rsp) {
            self.address[index] = value;
        }
        Ok(())
    }
}

impl<S: ImageStore> CellAccess for CellCache<S> {
    fn fetch(&mut self, address: Cell) -> Result<Cell, CacheError> {
        self.get(address)
    }

    fn store(&mut self, address: Cell, value: Cell) -> Result<(), CacheError> {
        self.put(address, value)
    }
}

/// Truncating division. A zero divisor yields a quotient of -1 and leaves the dividend as
/// the remainder, the way the AVR runtime divides.
fn divmod(dividend: Cell, divisor: Cell) -> (Cell, Cell) {
    if divisor == 0 {
        return (-1, dividend);
    }
    (dividend.wrapping_div(divisor), dividend.wrapping_rem(divisor))
}

/// Shift with the value widened to an int, so amounts of 16 and more clear the cell.
fn shift_left(value: Cell, amount: Cell) -> Cell {
    u32::try_from(amount)
        .ok()
        .and_then(|amount| i32::from(value).checked_shl(amount))
        .map_or(0, |shifted| shifted as Cell)
}

/// Arithmetic shift; large amounts leave only the sign.
fn shift_right(value: Cell, amount: Cell) -> Cell {
    let sign = if value < 0 { -1 } else { 0 };
    u32::try_from(amount)
        .ok()
        .and_then(|amount| i32::from(value).checked_shr(amount))
        .map_or(sign, |shifted| shifted as Cell)
}
