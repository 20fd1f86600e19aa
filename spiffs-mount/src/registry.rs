#![deny(unsafe_code)]

use core::cell::RefCell;

use critical_section::Mutex;
use lock_api::RawMutex;
use log::{debug, info};

use crate::config::{EngineConfig, MountFlags, MAX_MOUNTS};
use crate::engine::Engine;
use crate::error::Error;
use crate::hal::Flash;
use crate::mount::{DefaultRawMutex, Mount};
use crate::vfs::FsOps;

struct Claims<'d, const N: usize> {
    used: u32,
    points: [Option<&'d str>; N],
}

/// Fixed-capacity table of mounts.
///
/// Slot occupancy and mount point names live in a bitmap guarded by a critical
/// section. A slot is claimed before its engine is mounted and released only after
/// the volume is gone. `R` is the raw lock of every slot's mount lock.
pub struct MountTable<'d, E, const N: usize = MAX_MOUNTS, R = DefaultRawMutex> {
    claims: Mutex<RefCell<Claims<'d, N>>>,
    slots: [Mount<'d, E, R>; N],
}

impl<'d, E, const N: usize, R: RawMutex> MountTable<'d, E, N, R> {
    pub const fn new() -> Self {
        assert!(N <= 32, "mount bitmap holds 32 slots");
        Self {
            claims: Mutex::new(RefCell::new(Claims {
                used: 0,
                points: [None; N],
            })),
            slots: [const { Mount::new() }; N],
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Claims the lowest free slot.
    pub fn allocate_slot(&self) -> Option<usize> {
        critical_section::with(|cs| {
            let mut claims = self.claims.borrow_ref_mut(cs);
            let index = (!claims.used).trailing_zeros() as usize;
            if index >= N {
                return None;
            }
            claims.used |= 1 << index;
            Some(index)
        })
    }

    pub fn release_slot(&self, index: usize) {
        if index >= N {
            return;
        }
        critical_section::with(|cs| {
            let mut claims = self.claims.borrow_ref_mut(cs);
            claims.used &= !(1 << index);
            claims.points[index] = None;
        })
    }

    pub fn slot_of(&self, index: usize) -> Option<&Mount<'d, E, R>> {
        self.slots.get(index)
    }

    /// Number of slots in use, mounted or mounting.
    pub fn used(&self) -> usize {
        critical_section::with(|cs| self.claims.borrow_ref(cs).used.count_ones() as usize)
    }

    fn claim(&self, mount_point: &'d str) -> Result<usize, Error> {
        critical_section::with(|cs| {
            let mut claims = self.claims.borrow_ref_mut(cs);
            if claims.points.contains(&Some(mount_point)) {
                return Err(Error::AlreadyMounted);
            }

            let index = (!claims.used).trailing_zeros() as usize;
            if index >= N {
                return Err(Error::NoSpace);
            }
            claims.used |= 1 << index;
            claims.points[index] = Some(mount_point);
            Ok(index)
        })
    }

    fn index_of(&self, mount_point: &str) -> Option<usize> {
        critical_section::with(|cs| {
            let claims = self.claims.borrow_ref(cs);
            claims
                .points
                .iter()
                .position(|point| *point == Some(mount_point))
        })
    }

    /// Mount registered under exactly `mount_point`.
    pub fn find(&self, mount_point: &str) -> Option<&Mount<'d, E, R>> {
        let index = self.index_of(mount_point)?;
        let mount = &self.slots[index];
        mount.is_mounted().then_some(mount)
    }

    fn lookup(&self, path: &str) -> Option<(usize, usize)> {
        critical_section::with(|cs| {
            let claims = self.claims.borrow_ref(cs);
            let mut best: Option<(usize, usize)> = None;
            for (index, point) in claims.points.iter().enumerate() {
                let Some(point) = point else { continue };
                let Some(rest) = path.strip_prefix(point) else {
                    continue;
                };
                if !rest.is_empty() && !rest.starts_with('/') && !point.ends_with('/') {
                    continue;
                }
                if best.map_or(true, |(_, len)| point.len() > len) {
                    best = Some((index, point.len()));
                }
            }
            best
        })
    }
}

impl<'d, E, const N: usize, R: RawMutex> Default for MountTable<'d, E, N, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'d, E: Engine, const N: usize, R: RawMutex> MountTable<'d, E, N, R> {
    /// Mounts a fresh default engine at `mount_point`.
    pub fn mount(
        &self,
        mount_point: &'d str,
        flash: &'d dyn Flash,
        config: &EngineConfig,
        flags: MountFlags,
    ) -> Result<&Mount<'d, E, R>, Error>
    where
        E: Default,
    {
        self.mount_engine(mount_point, flash, config, flags, E::default())
    }

    /// Mounts `engine`, which must not be mounted yet, at `mount_point`.
    pub fn mount_engine(
        &self,
        mount_point: &'d str,
        flash: &'d dyn Flash,
        config: &EngineConfig,
        flags: MountFlags,
        engine: E,
    ) -> Result<&Mount<'d, E, R>, Error> {
        config.validate()?;

        let index = self.claim(mount_point)?;
        debug!("{}: slot {}", mount_point, index);

        let mount = &self.slots[index];
        if let Err(err) = mount.attach(mount_point, flash, *config, flags, engine) {
            self.release_slot(index);
            return Err(err);
        }

        Ok(mount)
    }

    /// Unmounts `mount_point`. Fails with [`Error::Busy`] while files are open.
    ///
    /// The slot is released only by the call that detached its volume.
    pub fn unmount(&self, mount_point: &str) -> Result<(), Error> {
        let index = self.index_of(mount_point).ok_or(Error::NotFound)?;
        self.slots[index].detach(mount_point)?;
        self.release_slot(index);
        info!("{}: slot {} free", mount_point, index);
        Ok(())
    }

    /// Splits `path` into the mount serving it and the file name on that mount.
    ///
    /// The longest matching mount point wins. The remainder must be empty or start
    /// with `/`, which is stripped.
    pub fn resolve<'p>(&self, path: &'p str) -> Option<(&dyn FsOps, &'p str)>
    where
        R: Sync,
    {
        let (index, len) = self.lookup(path)?;
        let mount = &self.slots[index];
        if !mount.is_mounted() {
            return None;
        }
        let ops: &dyn FsOps = mount;
        let rest = &path[len..];
        Some((ops, rest.strip_prefix('/').unwrap_or(rest)))
    }
}
