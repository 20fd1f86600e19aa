#![deny(unsafe_code)]

use crate::engine::EngineError;
use crate::hal::FlashError;

// newlib errno values, as seen by applications of the host OS.
pub const ENOENT: i32 = 2;
pub const EIO: i32 = 5;
pub const EBUSY: i32 = 16;
pub const ENODEV: i32 = 19;
pub const EINVAL: i32 = 22;
pub const ENOSPC: i32 = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    AlreadyMounted,
    Busy,
    InvalidArgument,
    Io(EngineError),
    NoSpace,
    NotFound,
    NotMounted,
}

impl Error {
    /// Error number the host OS reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::AlreadyMounted | Error::Busy => EBUSY,
            Error::InvalidArgument => EINVAL,
            Error::Io(_) => EIO,
            Error::NoSpace => ENOSPC,
            Error::NotFound => ENOENT,
            Error::NotMounted => ENODEV,
        }
    }
}

impl From<EngineError> for Error {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::NotFound => Error::NotFound,
            other => Error::Io(other),
        }
    }
}

impl From<FlashError> for Error {
    fn from(flash_error: FlashError) -> Self {
        Error::Io(EngineError::Flash(flash_error))
    }
}
