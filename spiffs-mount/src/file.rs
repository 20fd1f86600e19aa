#![deny(unsafe_code)]

use bitflags::bitflags;
use lock_api::RawMutex;
use log::{debug, warn};
use portable_atomic::Ordering;

use crate::engine::{Engine, EngineError, EngineFlags, Fd, Whence};
use crate::error::Error;
use crate::mount::{DefaultRawMutex, Mount};

/// Access mode bits of [`OpenFlags`].
pub const O_ACCMODE: u32 = 0x0003;

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

bitflags! {
    /// Host open flags, newlib encoding. No access bits means read-only.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x0001;
        const RDWR = 0x0002;
        const APPEND = 0x0008;
        const CREAT = 0x0200;
        const TRUNC = 0x0400;
        const EXCL = 0x0800;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();
}

pub fn translate_flags(flags: OpenFlags) -> Result<EngineFlags, Error> {
    let mut engine_flags = match flags.bits() & O_ACCMODE {
        0 => EngineFlags::RDONLY,
        1 => EngineFlags::WRONLY,
        2 => EngineFlags::RDWR,
        _ => return Err(Error::InvalidArgument),
    };

    if flags.contains(OpenFlags::CREAT) {
        engine_flags |= EngineFlags::CREAT;
    }
    if flags.contains(OpenFlags::TRUNC) {
        engine_flags |= EngineFlags::TRUNC;
    }
    if flags.contains(OpenFlags::APPEND) {
        engine_flags |= EngineFlags::APPEND;
    }
    if flags.contains(OpenFlags::EXCL) {
        engine_flags |= EngineFlags::EXCL;
    }

    Ok(engine_flags)
}

pub fn translate_whence(whence: i32) -> Result<Whence, Error> {
    match whence {
        SEEK_SET => Ok(Whence::Set),
        SEEK_CUR => Ok(Whence::Cur),
        SEEK_END => Ok(Whence::End),
        _ => Err(Error::InvalidArgument),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub size: u32,
}

impl<'d, E: Engine, R: RawMutex> Mount<'d, E, R> {
    /// Opens `path`, a plain file name: the engine has no directories.
    ///
    /// The mode argument is accepted for the host API and ignored.
    pub fn open(&self, path: &str, flags: OpenFlags, _mode: u32) -> Result<File<'_, 'd, E, R>, Error> {
        if path.contains('/') {
            return Err(Error::NotFound);
        }

        let engine_flags = translate_flags(flags)?;
        let fd = self.dispatch(|engine, io| {
            let fd = engine.open(io, path, engine_flags, 0)?;
            self.open_files.fetch_add(1, Ordering::AcqRel);
            Ok(fd)
        })?;

        debug!("open {} {:?} -> {:?}", path, engine_flags, fd);
        Ok(File {
            mount: self,
            fd,
            closed: false,
        })
    }

    pub fn stat(&self, path: &str) -> Result<FileInfo, Error> {
        let stat = self.dispatch(|engine, io| engine.stat(io, path))?;
        Ok(FileInfo {
            is_dir: false,
            size: stat.size,
        })
    }

    pub fn unlink(&self, path: &str) -> Result<(), Error> {
        self.dispatch(|engine, io| engine.remove(io, path))
    }

    fn release(&self, fd: Fd) -> Result<(), Error> {
        self.engine_call(|engine, io| {
            let closed = engine.close(io, fd);
            self.open_files.fetch_sub(1, Ordering::AcqRel);
            closed
        })?
        .map_err(Error::Io)
    }
}

/// Open file on a mount.
///
/// Dropping the handle closes the file; use [`File::close`] to see close errors.
pub struct File<'m, 'd, E: Engine, R: RawMutex = DefaultRawMutex> {
    mount: &'m Mount<'d, E, R>,
    fd: Fd,
    closed: bool,
}

impl<'m, 'd, E: Engine, R: RawMutex> File<'m, 'd, E, R> {
    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn mount(&self) -> &'m Mount<'d, E, R> {
        self.mount
    }

    /// Closes the file. The handle is gone even if the engine reports an error.
    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        self.mount.release(self.fd)
    }

    /// Reads at the current position. Returns 0 at end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let fd = self.fd;
        match self.mount.engine_call(|engine, io| engine.read(io, fd, buf))? {
            Ok(len) => Ok(len),
            Err(EngineError::EndOfObject) => Ok(0),
            Err(err) => Err(Error::Io(err)),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        let fd = self.fd;
        self.mount
            .engine_call(|engine, io| engine.write(io, fd, data))?
            .map_err(Error::Io)
    }

    /// Moves the file position, returning the new one.
    pub fn seek(&mut self, offset: i32, whence: Whence) -> Result<u32, Error> {
        let fd = self.fd;
        self.mount
            .engine_call(|engine, io| engine.lseek(io, fd, offset, whence))?
            .map_err(Error::Io)
    }

    pub fn sync(&mut self) -> Result<(), Error> {
        let fd = self.fd;
        self.mount
            .engine_call(|engine, io| engine.fflush(io, fd))?
            .map_err(Error::Io)
    }

    pub fn fstat(&self) -> Result<FileInfo, Error> {
        let fd = self.fd;
        let stat = self.mount.dispatch(|engine, io| engine.fstat(io, fd))?;
        Ok(FileInfo {
            is_dir: false,
            size: stat.size,
        })
    }
}

impl<E: Engine, R: RawMutex> Drop for File<'_, '_, E, R> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.mount.release(self.fd) {
                warn!("implicit close of {:?} failed: {:?}", self.fd, err);
            }
        }
    }
}
