//! Contract of the SPIFFS-style filesystem engine driven by the adapter.
//!
//! The engine is not reentrant. The adapter only calls it while holding the
//! mount lock, and lends it the flash HAL and its buffers for the duration of a
//! single call through [`Io`].

#![deny(unsafe_code)]

use bitflags::bitflags;

use crate::config::EngineConfig;
use crate::hal::{FlashError, FlashHal};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineError {
    NotMounted,
    Full,
    NotFound,
    EndOfObject,
    Deleted,
    OutOfFileDescs,
    FileClosed,
    FileDeleted,
    BadDescriptor,
    NotWritable,
    NotReadable,
    ConflictingName,
    NotConfigured,
    NotAFs,
    Mounted,
    EraseFail,
    FileExists,
    NameTooLong,
    Flash(FlashError),
    Other(i32),
}

impl EngineError {
    /// Numeric SPIFFS error code.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::NotMounted => -10000,
            EngineError::Full => -10001,
            EngineError::NotFound => -10002,
            EngineError::EndOfObject => -10003,
            EngineError::Deleted => -10004,
            EngineError::OutOfFileDescs => -10007,
            EngineError::FileClosed => -10008,
            EngineError::FileDeleted => -10009,
            EngineError::BadDescriptor => -10010,
            EngineError::NotWritable => -10021,
            EngineError::NotReadable => -10022,
            EngineError::ConflictingName => -10023,
            EngineError::NotConfigured => -10024,
            EngineError::NotAFs => -10025,
            EngineError::Mounted => -10026,
            EngineError::EraseFail => -10027,
            EngineError::FileExists => -10030,
            EngineError::NameTooLong => -10036,
            // Flash failures surface from the HAL callbacks as the internal error.
            EngineError::Flash(_) => -10050,
            EngineError::Other(code) => *code,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            -10000 => EngineError::NotMounted,
            -10001 => EngineError::Full,
            -10002 => EngineError::NotFound,
            -10003 => EngineError::EndOfObject,
            -10004 => EngineError::Deleted,
            -10007 => EngineError::OutOfFileDescs,
            -10008 => EngineError::FileClosed,
            -10009 => EngineError::FileDeleted,
            -10010 => EngineError::BadDescriptor,
            -10021 => EngineError::NotWritable,
            -10022 => EngineError::NotReadable,
            -10023 => EngineError::ConflictingName,
            -10024 => EngineError::NotConfigured,
            -10025 => EngineError::NotAFs,
            -10026 => EngineError::Mounted,
            -10027 => EngineError::EraseFail,
            -10030 => EngineError::FileExists,
            -10036 => EngineError::NameTooLong,
            other => EngineError::Other(other),
        }
    }
}

impl From<FlashError> for EngineError {
    fn from(error: FlashError) -> Self {
        EngineError::Flash(error)
    }
}

bitflags! {
    /// Open flags understood by the engine.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct EngineFlags: u16 {
        const APPEND = 1 << 0;
        const TRUNC = 1 << 1;
        const CREAT = 1 << 2;
        const RDONLY = 1 << 3;
        const WRONLY = 1 << 4;
        const RDWR = Self::RDONLY.bits() | Self::WRONLY.bits();
        const DIRECT = 1 << 5;
        const EXCL = 1 << 6;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// Engine file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd(pub i16);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineStat {
    pub size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsInfo {
    pub total: u32,
    pub used: u32,
}

/// Everything an engine call may touch besides the engine state itself.
pub struct Io<'a> {
    pub hal: &'a mut dyn FlashHal,
    /// Scratch buffer, two log pages.
    pub work: &'a mut [u8],
    pub cache: &'a mut [u8],
    /// Descriptor table storage.
    pub fds: &'a mut [u8],
}

pub trait Engine: Send {
    /// Cache buffer size needed for `pages` cached log pages.
    fn cache_bytes_for(&self, config: &EngineConfig, pages: usize) -> usize;

    /// Descriptor buffer size needed for `files` simultaneously open files.
    fn fd_bytes_for(&self, config: &EngineConfig, files: usize) -> usize;

    fn mount(&mut self, config: &EngineConfig, io: &mut Io<'_>) -> EngineResult<()>;

    fn unmount(&mut self, io: &mut Io<'_>);

    /// Erases and provisions the partition. Only valid while not mounted.
    fn format(&mut self, io: &mut Io<'_>) -> EngineResult<()>;

    fn info(&mut self, io: &mut Io<'_>) -> EngineResult<FsInfo>;

    fn open(
        &mut self,
        io: &mut Io<'_>,
        name: &str,
        flags: EngineFlags,
        mode: u32,
    ) -> EngineResult<Fd>;

    fn close(&mut self, io: &mut Io<'_>, fd: Fd) -> EngineResult<()>;

    /// Reads at the file position. Reading at the end of the file fails with
    /// [`EngineError::EndOfObject`].
    fn read(&mut self, io: &mut Io<'_>, fd: Fd, buf: &mut [u8]) -> EngineResult<usize>;

    fn write(&mut self, io: &mut Io<'_>, fd: Fd, data: &[u8]) -> EngineResult<usize>;

    /// Moves the file position and returns the new one.
    fn lseek(&mut self, io: &mut Io<'_>, fd: Fd, offset: i32, whence: Whence)
        -> EngineResult<u32>;

    fn fflush(&mut self, io: &mut Io<'_>, fd: Fd) -> EngineResult<()>;

    fn stat(&mut self, io: &mut Io<'_>, name: &str) -> EngineResult<EngineStat>;

    fn fstat(&mut self, io: &mut Io<'_>, fd: Fd) -> EngineResult<EngineStat>;

    fn remove(&mut self, io: &mut Io<'_>, name: &str) -> EngineResult<()>;
}
