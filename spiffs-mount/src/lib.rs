//! SPIFFS mount adapter for SPI NOR flash.
//!
//! Binds a SPIFFS-style filesystem engine to a flash device behind a shared SPI bus
//! and exposes the result as mount points with POSIX-flavoured file operations.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod file;
pub mod flash;
pub mod hal;
pub mod mount;
pub mod registry;
pub mod vfs;

pub use config::{EngineConfig, MountFlags, CACHE_PAGES, MAX_MOUNTS, MAX_OPEN_FILES};
pub use engine::{Engine, EngineError, Fd, FsInfo, Io, Whence};
pub use error::Error;
pub use file::{File, FileInfo, OpenFlags};
pub use flash::{FlashConf, FlashDevice};
pub use hal::{Flash, FlashError, FlashHal};
pub use mount::{DefaultRawMutex, Mount};
pub use registry::MountTable;
pub use vfs::{FileOps, FsOps};
