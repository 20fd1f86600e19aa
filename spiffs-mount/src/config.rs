#![deny(unsafe_code)]

use bitflags::bitflags;

use crate::error::Error;

/// Default capacity of a mount table.
pub const MAX_MOUNTS: usize = 1;
/// File descriptors reserved in every mounted engine.
pub const MAX_OPEN_FILES: usize = 4;
/// Log pages kept in the engine cache.
pub const CACHE_PAGES: usize = 4;

/// Filesystem geometry handed to the engine.
///
/// Copied into the mount when mounting, so the caller's value can be reused or
/// modified afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub log_page_size: u32,
    pub log_block_size: u32,
    pub phys_size: u32,
    pub phys_addr: u32,
    pub phys_erase_block: u32,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        let sizes = [
            self.log_page_size,
            self.log_block_size,
            self.phys_size,
            self.phys_erase_block,
        ];
        if sizes.contains(&0) {
            return Err(Error::InvalidArgument);
        }

        if self.log_block_size % self.log_page_size != 0
            || self.log_block_size % self.phys_erase_block != 0
            || self.phys_size % self.log_block_size != 0
            || self.phys_addr % self.phys_erase_block != 0
        {
            return Err(Error::InvalidArgument);
        }

        self.phys_addr
            .checked_add(self.phys_size)
            .ok_or(Error::InvalidArgument)?;

        Ok(())
    }

    /// End of the partition, exclusive.
    pub fn phys_end(&self) -> u32 {
        self.phys_addr + self.phys_size
    }

    pub fn work_buf_size(&self) -> usize {
        2 * self.log_page_size as usize
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        /// Format the partition when the engine does not recognize it, then mount again.
        const FORMAT_IF_NEEDED = 0x0001;
    }
}
