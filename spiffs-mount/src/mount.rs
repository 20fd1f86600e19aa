#![deny(unsafe_code)]

use alloc::boxed::Box;
use alloc::vec;

use lock_api::{Mutex, RawMutex};
use log::{error, info, warn};
use portable_atomic::{AtomicUsize, Ordering};

use crate::config::{EngineConfig, MountFlags, CACHE_PAGES, MAX_OPEN_FILES};
use crate::engine::{Engine, EngineError, EngineResult, FsInfo, Io};
use crate::error::Error;
use crate::hal::{Flash, MountHal};

/// A mounted filesystem: engine state plus everything lent to it on each call.
struct Volume<'d, E> {
    mount_point: &'d str,
    engine: E,
    config: EngineConfig,
    hal: MountHal<'d>,
    work: Box<[u8]>,
    cache: Box<[u8]>,
    fds: Box<[u8]>,
}

impl<'d, E: Engine> Volume<'d, E> {
    fn attach(
        mount_point: &'d str,
        flash: &'d dyn Flash,
        config: EngineConfig,
        flags: MountFlags,
        engine: E,
    ) -> Result<Self, Error> {
        let cache_size = engine.cache_bytes_for(&config, CACHE_PAGES);
        let fd_size = engine.fd_bytes_for(&config, MAX_OPEN_FILES);

        let mut volume = Volume {
            mount_point,
            engine,
            config,
            hal: MountHal::new(flash, &config),
            work: vec![0; config.work_buf_size()].into_boxed_slice(),
            cache: vec![0; cache_size].into_boxed_slice(),
            fds: vec![0; fd_size].into_boxed_slice(),
        };

        let mut mounted = volume.call(|engine, io| engine.mount(&config, io));
        if mounted == Err(EngineError::NotAFs) && flags.contains(MountFlags::FORMAT_IF_NEEDED) {
            warn!("{}: formatting required", mount_point);
            if let Err(err) = volume.call(|engine, io| engine.format(io)) {
                error!("{}: format error {}", mount_point, err.code());
                return Err(Error::Io(err));
            }
            mounted = volume.call(|engine, io| engine.mount(&config, io));
        }

        if let Err(err) = mounted {
            error!("{}: mount error {}", mount_point, err.code());
            return Err(Error::Io(err));
        }

        match volume.call(|engine, io| engine.info(io)) {
            Ok(FsInfo { total, used }) => {
                info!("{}: mounted, total {} used {}", mount_point, total, used)
            }
            Err(err) => warn!("{}: info error {}", mount_point, err.code()),
        }

        Ok(volume)
    }

    fn call<T>(&mut self, op: impl FnOnce(&mut E, &mut Io<'_>) -> T) -> T {
        let mut io = Io {
            hal: &mut self.hal,
            work: &mut self.work[..],
            cache: &mut self.cache[..],
            fds: &mut self.fds[..],
        };
        op(&mut self.engine, &mut io)
    }
}

/// Raw lock behind the mount lock when none is named.
///
/// A spin lock never yields. Under a priority-preemptive scheduler a high priority
/// task can spin forever on a lock held by a preempted lower priority task, so such
/// firmware should name a raw mutex that blocks, e.g. one over the RTOS mutex.
pub type DefaultRawMutex = spin::Mutex<()>;

/// One mount table slot.
///
/// The volume mutex is the mount lock: the engine is only reachable through it, so
/// every engine call runs with the lock held. `R` picks the lock implementation.
pub struct Mount<'d, E, R = DefaultRawMutex> {
    volume: Mutex<R, Option<Volume<'d, E>>>,
    pub(crate) open_files: AtomicUsize,
}

impl<'d, E, R: RawMutex> Mount<'d, E, R> {
    pub const fn new() -> Self {
        Self {
            volume: Mutex::const_new(R::INIT, None),
            open_files: AtomicUsize::new(0),
        }
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::Acquire)
    }

    pub fn is_mounted(&self) -> bool {
        self.volume.lock().is_some()
    }

    pub fn mount_point(&self) -> Option<&'d str> {
        self.volume.lock().as_ref().map(|volume| volume.mount_point)
    }

    /// Geometry the filesystem was mounted with.
    pub fn config(&self) -> Option<EngineConfig> {
        self.volume.lock().as_ref().map(|volume| volume.config)
    }
}

impl<'d, E, R: RawMutex> Default for Mount<'d, E, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d, E: Engine, R: RawMutex> Mount<'d, E, R> {
    pub(crate) fn attach(
        &self,
        mount_point: &'d str,
        flash: &'d dyn Flash,
        config: EngineConfig,
        flags: MountFlags,
        engine: E,
    ) -> Result<(), Error> {
        let mut slot = self.volume.lock();
        if slot.is_some() {
            return Err(Error::AlreadyMounted);
        }

        *slot = Some(Volume::attach(mount_point, flash, config, flags, engine)?);
        self.open_files.store(0, Ordering::Release);
        Ok(())
    }

    /// Unmounts the volume if it is still the one mounted at `mount_point`.
    ///
    /// The slot may have been unmounted and reused since the caller looked it up,
    /// so the name is checked again under the mount lock.
    pub(crate) fn detach(&self, mount_point: &str) -> Result<(), Error> {
        let mut slot = self.volume.lock();
        let volume = match slot.as_mut() {
            Some(volume) if volume.mount_point == mount_point => volume,
            _ => return Err(Error::NotFound),
        };

        let files = self.open_files();
        if files > 0 {
            warn!("{}: {} files still open", volume.mount_point, files);
            return Err(Error::Busy);
        }

        volume.call(|engine, io| engine.unmount(io));
        info!("{}: unmounted", volume.mount_point);
        *slot = None;
        Ok(())
    }

    /// Runs `op` on the engine with the mount lock held.
    pub(crate) fn engine_call<T>(
        &self,
        op: impl FnOnce(&mut E, &mut Io<'_>) -> T,
    ) -> Result<T, Error> {
        let mut slot = self.volume.lock();
        let volume = slot.as_mut().ok_or(Error::NotMounted)?;
        Ok(volume.call(op))
    }

    /// Like [`Mount::engine_call`], translating engine errors to host errors.
    pub(crate) fn dispatch<T>(
        &self,
        op: impl FnOnce(&mut E, &mut Io<'_>) -> EngineResult<T>,
    ) -> Result<T, Error> {
        self.engine_call(op)?.map_err(Error::from)
    }

    /// Total and used bytes of the filesystem.
    pub fn info(&self) -> Result<FsInfo, Error> {
        self.engine_call(|engine, io| engine.info(io))?
            .map_err(Error::Io)
    }
}
