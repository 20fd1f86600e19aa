//! Object-safe capability records for the host VFS dispatcher.

#![deny(unsafe_code)]

use alloc::boxed::Box;

use lock_api::RawMutex;

use crate::engine::Engine;
use crate::error::Error;
use crate::file::{translate_whence, File, FileInfo, OpenFlags};
use crate::mount::Mount;

/// Operations on a mounted filesystem, by file name relative to the mount point.
pub trait FsOps: Sync {
    fn mount_point(&self) -> Option<&str>;

    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn FileOps + '_>, Error>;

    fn stat(&self, path: &str) -> Result<FileInfo, Error>;

    fn unlink(&self, path: &str) -> Result<(), Error>;
}

/// Operations on an open file.
pub trait FileOps {
    fn close(self: Box<Self>) -> Result<(), Error>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn write(&mut self, data: &[u8]) -> Result<usize, Error>;

    /// Seeks with a raw `SEEK_*` whence value.
    fn lseek(&mut self, offset: i32, whence: i32) -> Result<u32, Error>;

    fn sync(&mut self) -> Result<(), Error>;

    fn fstat(&self) -> Result<FileInfo, Error>;
}

impl<'d, E: Engine, R: RawMutex + Sync> FsOps for Mount<'d, E, R> {
    fn mount_point(&self) -> Option<&str> {
        Mount::mount_point(self)
    }

    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn FileOps + '_>, Error> {
        let file = Mount::open(self, path, flags, mode)?;
        Ok(Box::new(file))
    }

    fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        Mount::stat(self, path)
    }

    fn unlink(&self, path: &str) -> Result<(), Error> {
        Mount::unlink(self, path)
    }
}

impl<E: Engine, R: RawMutex> FileOps for File<'_, '_, E, R> {
    fn close(self: Box<Self>) -> Result<(), Error> {
        File::close(*self)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        File::read(self, buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        File::write(self, data)
    }

    fn lseek(&mut self, offset: i32, whence: i32) -> Result<u32, Error> {
        let whence = translate_whence(whence)?;
        File::seek(self, offset, whence)
    }

    fn sync(&mut self) -> Result<(), Error> {
        File::sync(self)
    }

    fn fstat(&self) -> Result<FileInfo, Error> {
        File::fstat(self)
    }
}
