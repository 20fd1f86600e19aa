#![deny(unsafe_code)]

use log::trace;

use crate::config::EngineConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    Bus,
    Misaligned,
    NotSelected,
    OutOfRange,
    UnexpectedStatus,
}

/// Byte-addressed flash storage shared by the mounts placed on it.
pub trait Flash: Sync {
    fn capacity(&self) -> u32;

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn write(&self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    fn erase(&self, addr: u32, size: u32) -> Result<(), FlashError>;
}

/// Flash access as seen by the filesystem engine.
pub trait FlashHal {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError>;

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;

    /// Erases `size` bytes. The engine only asks for whole erase blocks.
    fn erase(&mut self, addr: u32, size: u32) -> Result<(), FlashError>;
}

/// Engine HAL of one mount. Confines the engine to its partition.
pub struct MountHal<'d> {
    flash: &'d dyn Flash,
    start: u32,
    end: u32,
}

impl<'d> MountHal<'d> {
    pub fn new(flash: &'d dyn Flash, config: &EngineConfig) -> Self {
        Self {
            flash,
            start: config.phys_addr,
            end: config.phys_end(),
        }
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<(), FlashError> {
        let len = u32::try_from(len).map_err(|_| FlashError::OutOfRange)?;
        let end = addr.checked_add(len).ok_or(FlashError::OutOfRange)?;
        if addr < self.start || end > self.end {
            return Err(FlashError::OutOfRange);
        }
        Ok(())
    }
}

impl FlashHal for MountHal<'_> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(addr, buf.len())?;
        trace!("hal read {:#x} +{}", addr, buf.len());
        self.flash.read(addr, buf)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_range(addr, data.len())?;
        trace!("hal write {:#x} +{}", addr, data.len());
        self.flash.write(addr, data)
    }

    fn erase(&mut self, addr: u32, size: u32) -> Result<(), FlashError> {
        self.check_range(addr, size as usize)?;
        trace!("hal erase {:#x} +{}", addr, size);
        self.flash.erase(addr, size)
    }
}
