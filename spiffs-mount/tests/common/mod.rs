#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use embedded_hal::blocking::delay::DelayMs;
use fugit::MillisDurationU32;
use spiffs_mount::bus::SpiBus;
use spiffs_mount::engine::{EngineFlags, EngineResult, EngineStat};
use spiffs_mount::{Engine, EngineConfig, EngineError, Fd, FlashConf, FlashDevice, FsInfo, Io, Whence};

pub const FLASH_SIZE: u32 = 256 * 1024;
pub const SECTOR_SIZE: u32 = 4096;
pub const PAGE_SIZE: u32 = 256;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn flash_conf() -> FlashConf {
    FlashConf {
        capacity: FLASH_SIZE,
        page_size: PAGE_SIZE,
        sector_size: SECTOR_SIZE,
        busy_wait: MillisDurationU32::millis(1),
        init_retries: 3,
    }
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        log_page_size: 256,
        log_block_size: 4096,
        phys_size: FLASH_SIZE,
        phys_addr: 0,
        phys_erase_block: 4096,
    }
}

pub type SimFlash<'a> = FlashDevice<&'a SimNor, StdDelay>;

pub fn sim_flash(nor: &SimNor) -> SimFlash<'_> {
    FlashDevice::init(nor, &flash_conf(), StdDelay::default()).unwrap()
}

/// Host sleep that also remembers how long it slept.
#[derive(Clone, Default)]
pub struct StdDelay {
    pub slept: Arc<AtomicU32>,
}

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.slept.fetch_add(ms, Ordering::Relaxed);
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Begin,
    Transfer(Vec<u8>),
    End,
}

const STATUS_BUSY: u8 = 0x01;
const STATUS_WEL: u8 = 0x02;
const JEDEC_ID: [u8; 3] = [0xef, 0x40, 0x18];

struct Chip {
    mem: Vec<u8>,
    selected: bool,
    cmd: Vec<u8>,
    wel: bool,
    busy_polls: u32,
    stuck_busy: u32,
    events: Vec<Event>,
    violations: Vec<String>,
    programs: usize,
    erases: usize,
}

impl Chip {
    fn addr(&self) -> u32 {
        u32::from_be_bytes([0, self.cmd[1], self.cmd[2], self.cmd[3]])
    }

    fn clock(&mut self, mosi: u8) -> u8 {
        let pos = self.cmd.len();
        self.cmd.push(mosi);
        if pos == 0 {
            if self.busy_polls > 0 && mosi != 0x05 {
                self.violations
                    .push(format!("command {:#04x} while busy", mosi));
            }
            if mosi == 0x02 && !self.wel {
                self.violations.push("page program without write enable".into());
            }
            return 0xff;
        }

        match self.cmd[0] {
            0x9f => JEDEC_ID.get(pos - 1).copied().unwrap_or(0xff),
            0x05 => {
                let mut status = if self.wel { STATUS_WEL } else { 0 };
                if self.stuck_busy > 0 {
                    self.stuck_busy -= 1;
                    status |= STATUS_BUSY;
                } else if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    status |= STATUS_BUSY;
                }
                status
            }
            0x03 if pos >= 4 => {
                let addr = (self.addr() as usize + pos - 4) % self.mem.len();
                self.mem[addr]
            }
            0x02 if pos >= 4 => {
                let start = self.addr() as usize;
                let page = start & !(PAGE_SIZE as usize - 1);
                let offset = start - page + pos - 4;
                if offset >= PAGE_SIZE as usize {
                    self.violations.push(format!("page program wraps at {:#x}", page));
                }
                let cell = page + offset % PAGE_SIZE as usize;
                if self.wel {
                    self.mem[cell] &= mosi;
                }
                0xff
            }
            _ => 0xff,
        }
    }

    fn finish(&mut self) {
        match self.cmd.first() {
            Some(0x06) => self.wel = true,
            Some(0x02) if self.wel => {
                self.programs += 1;
                self.wel = false;
                self.busy_polls = 2;
            }
            Some(0x20) if self.wel && self.cmd.len() >= 4 => {
                let sector = self.addr() & !(SECTOR_SIZE - 1);
                let start = sector as usize;
                self.mem[start..start + SECTOR_SIZE as usize].fill(0xff);
                self.erases += 1;
                self.wel = false;
                self.busy_polls = 3;
            }
            Some(0x20) => self.violations.push("sector erase without write enable".into()),
            _ => {}
        }
        self.cmd.clear();
    }
}

/// A 25-series SPI NOR chip on its own bus, decoding the real opcodes.
pub struct SimNor {
    chip: Mutex<Chip>,
    free: Condvar,
}

impl SimNor {
    pub fn new() -> Self {
        Self::with_busy_status(0)
    }

    /// A chip whose first `polls` status reads report a write in progress.
    pub fn with_busy_status(polls: u32) -> Self {
        Self {
            chip: Mutex::new(Chip {
                mem: vec![0xff; FLASH_SIZE as usize],
                selected: false,
                cmd: Vec::new(),
                wel: false,
                busy_polls: 0,
                stuck_busy: polls,
                events: Vec::new(),
                violations: Vec::new(),
                programs: 0,
                erases: 0,
            }),
            free: Condvar::new(),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.chip.lock().unwrap().events.clone()
    }

    pub fn clear_events(&self) {
        self.chip.lock().unwrap().events.clear();
    }

    pub fn violations(&self) -> Vec<String> {
        self.chip.lock().unwrap().violations.clone()
    }

    pub fn is_selected(&self) -> bool {
        self.chip.lock().unwrap().selected
    }

    pub fn programs(&self) -> usize {
        self.chip.lock().unwrap().programs
    }

    pub fn erases(&self) -> usize {
        self.chip.lock().unwrap().erases
    }

    pub fn peek(&self, addr: u32, len: usize) -> Vec<u8> {
        let chip = self.chip.lock().unwrap();
        chip.mem[addr as usize..addr as usize + len].to_vec()
    }
}

impl SpiBus for SimNor {
    type Error = ();

    fn begin(&self) -> Result<(), ()> {
        let mut chip = self.chip.lock().unwrap();
        while chip.selected {
            chip = self.free.wait(chip).unwrap();
        }
        chip.selected = true;
        chip.events.push(Event::Begin);
        Ok(())
    }

    fn end(&self) -> Result<(), ()> {
        let mut chip = self.chip.lock().unwrap();
        if !chip.selected {
            chip.violations.push("end without begin".into());
        }
        chip.finish();
        chip.selected = false;
        chip.events.push(Event::End);
        self.free.notify_one();
        Ok(())
    }

    fn transfer(&self, words: &mut [u8]) -> Result<(), ()> {
        let mut chip = self.chip.lock().unwrap();
        if !chip.selected {
            chip.violations.push("transfer outside a window".into());
            return Err(());
        }
        chip.events.push(Event::Transfer(words.to_vec()));
        for word in words.iter_mut() {
            *word = chip.clock(*word);
        }
        Ok(())
    }
}

/// Call counters and a reentrancy detector shared with a [`MiniFs`].
#[derive(Default)]
pub struct Probe {
    pub mounts: AtomicUsize,
    pub formats: AtomicUsize,
    pub opens: AtomicUsize,
    pub calls: AtomicUsize,
    pub overlaps: AtomicUsize,
    inside: AtomicBool,
    threads: Mutex<HashSet<ThreadId>>,
}

impl Probe {
    fn enter(self: &Arc<Self>) -> Inside {
        if self.inside.swap(true, Ordering::AcqRel) {
            self.overlaps.fetch_add(1, Ordering::Relaxed);
        }
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.threads
            .lock()
            .unwrap()
            .insert(std::thread::current().id());
        std::thread::yield_now();
        Inside(self.clone())
    }

    pub fn threads(&self) -> usize {
        self.threads.lock().unwrap().len()
    }
}

struct Inside(Arc<Probe>);

impl Drop for Inside {
    fn drop(&mut self) {
        self.0.inside.store(false, Ordering::Release);
    }
}

const SUPER_MAGIC: &[u8; 4] = b"MFS1";
const FILE_MAGIC: &[u8; 4] = b"FILE";
const NAME_LEN: usize = 32;
const HEADER_LEN: u32 = 64;
const FD_BYTES: usize = 32;
const CACHE_PAGE_OVERHEAD: usize = 32;
const SEEK_BOUNDS: i32 = -10041;

struct OpenFile {
    slot: u32,
    data: Vec<u8>,
    pos: u32,
    flags: EngineFlags,
    dirty: bool,
    deleted: bool,
}

/// A small filesystem with one erase block per file, enough to drive the adapter
/// through real flash traffic.
///
/// Block 0 holds the superblock. Every other block is a file slot: a header with
/// the length and name, data after it. Writes are buffered per descriptor and
/// written back on flush or close.
#[derive(Default)]
pub struct MiniFs {
    probe: Arc<Probe>,
    config: Option<EngineConfig>,
    mounted: bool,
    files: Vec<Option<OpenFile>>,
}

impl MiniFs {
    pub fn with_probe(probe: Arc<Probe>) -> Self {
        Self {
            probe,
            ..Self::default()
        }
    }

    fn config(&self) -> EngineResult<EngineConfig> {
        match (self.mounted, self.config) {
            (true, Some(config)) => Ok(config),
            _ => Err(EngineError::NotMounted),
        }
    }

    fn slots(config: &EngineConfig) -> u32 {
        config.phys_size / config.log_block_size
    }

    fn slot_addr(config: &EngineConfig, slot: u32) -> u32 {
        config.phys_addr + slot * config.log_block_size
    }

    fn file_capacity(config: &EngineConfig) -> u32 {
        config.log_block_size - HEADER_LEN
    }

    fn header(io: &mut Io<'_>, config: &EngineConfig, slot: u32) -> EngineResult<Option<(u32, String)>> {
        let mut header = [0u8; 8 + NAME_LEN];
        io.hal.read(Self::slot_addr(config, slot), &mut header)?;
        if &header[..4] != FILE_MAGIC {
            return Ok(None);
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let name = &header[8..];
        let name_len = name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&name[..name_len]).into_owned();
        Ok(Some((len, name)))
    }

    fn lookup(io: &mut Io<'_>, config: &EngineConfig, name: &str) -> EngineResult<Option<(u32, u32)>> {
        for slot in 1..Self::slots(config) {
            if let Some((len, found)) = Self::header(io, config, slot)? {
                if found == name {
                    return Ok(Some((slot, len)));
                }
            }
        }
        Ok(None)
    }

    fn free_slot(io: &mut Io<'_>, config: &EngineConfig) -> EngineResult<Option<u32>> {
        for slot in 1..Self::slots(config) {
            if Self::header(io, config, slot)?.is_none() {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    fn store(io: &mut Io<'_>, config: &EngineConfig, slot: u32, name: &str, data: &[u8]) -> EngineResult<()> {
        let addr = Self::slot_addr(config, slot);
        io.hal.erase(addr, config.log_block_size)?;

        let mut header = [0xffu8; HEADER_LEN as usize];
        header[..4].copy_from_slice(FILE_MAGIC);
        header[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
        header[8..8 + NAME_LEN].fill(0);
        header[8..8 + name.len()].copy_from_slice(name.as_bytes());
        io.hal.write(addr, &header)?;

        // Stage the data through the work buffer, a page at a time.
        let page = config.log_page_size as usize;
        let mut offset = addr + HEADER_LEN;
        for chunk in data.chunks(page) {
            io.work[..chunk.len()].copy_from_slice(chunk);
            io.hal.write(offset, &io.work[..chunk.len()])?;
            offset += chunk.len() as u32;
        }
        Ok(())
    }

    fn load(io: &mut Io<'_>, config: &EngineConfig, slot: u32, len: u32) -> EngineResult<Vec<u8>> {
        let mut data = vec![0; len as usize];
        if len > 0 {
            io.hal.read(Self::slot_addr(config, slot) + HEADER_LEN, &mut data)?;
        }
        Ok(data)
    }

    fn file(&mut self, fd: Fd) -> EngineResult<&mut OpenFile> {
        let index = usize::try_from(fd.0 - 1).map_err(|_| EngineError::BadDescriptor)?;
        match self.files.get_mut(index) {
            Some(Some(file)) if file.deleted => Err(EngineError::FileDeleted),
            Some(Some(file)) => Ok(file),
            _ => Err(EngineError::BadDescriptor),
        }
    }

    fn flush_file(&mut self, io: &mut Io<'_>, fd: Fd) -> EngineResult<()> {
        let config = self.config()?;
        let file = self.file(fd)?;
        if !file.dirty {
            return Ok(());
        }
        let slot = file.slot;
        let data = file.data.clone();
        file.dirty = false;

        let name = Self::header(io, &config, slot)?
            .map(|(_, name)| name)
            .ok_or(EngineError::FileDeleted)?;
        Self::store(io, &config, slot, &name, &data)
    }
}

impl Engine for MiniFs {
    fn cache_bytes_for(&self, config: &EngineConfig, pages: usize) -> usize {
        pages * (config.log_page_size as usize + CACHE_PAGE_OVERHEAD)
    }

    fn fd_bytes_for(&self, _config: &EngineConfig, files: usize) -> usize {
        files * FD_BYTES
    }

    fn mount(&mut self, config: &EngineConfig, io: &mut Io<'_>) -> EngineResult<()> {
        let _inside = self.probe.enter();
        self.probe.mounts.fetch_add(1, Ordering::Relaxed);

        if io.work.len() != 2 * config.log_page_size as usize {
            return Err(EngineError::NotConfigured);
        }
        self.config = Some(*config);

        let mut magic = [0u8; 4];
        io.hal.read(config.phys_addr, &mut magic)?;
        if &magic != SUPER_MAGIC {
            return Err(EngineError::NotAFs);
        }

        self.files = (0..io.fds.len() / FD_BYTES).map(|_| None).collect();
        io.fds.fill(0);
        self.mounted = true;
        Ok(())
    }

    fn unmount(&mut self, io: &mut Io<'_>) {
        let _inside = self.probe.enter();
        for index in 0..self.files.len() {
            let _ = self.flush_file(io, Fd(index as i16 + 1));
        }
        self.files.clear();
        self.mounted = false;
    }

    fn format(&mut self, io: &mut Io<'_>) -> EngineResult<()> {
        let _inside = self.probe.enter();
        self.probe.formats.fetch_add(1, Ordering::Relaxed);

        if self.mounted {
            return Err(EngineError::Mounted);
        }
        let config = self.config.ok_or(EngineError::NotConfigured)?;

        for slot in 0..Self::slots(&config) {
            io.hal.erase(Self::slot_addr(&config, slot), config.log_block_size)?;
        }
        io.hal.write(config.phys_addr, SUPER_MAGIC)?;
        Ok(())
    }

    fn info(&mut self, io: &mut Io<'_>) -> EngineResult<FsInfo> {
        let _inside = self.probe.enter();
        let config = self.config()?;

        let mut used = 0;
        for slot in 1..Self::slots(&config) {
            if let Some((len, _)) = Self::header(io, &config, slot)? {
                used += len;
            }
        }
        Ok(FsInfo {
            total: (Self::slots(&config) - 1) * Self::file_capacity(&config),
            used,
        })
    }

    fn open(&mut self, io: &mut Io<'_>, name: &str, flags: EngineFlags, _mode: u32) -> EngineResult<Fd> {
        let _inside = self.probe.enter();
        self.probe.opens.fetch_add(1, Ordering::Relaxed);
        let config = self.config()?;

        if name.len() > NAME_LEN {
            return Err(EngineError::NameTooLong);
        }
        let index = self
            .files
            .iter()
            .position(Option::is_none)
            .ok_or(EngineError::OutOfFileDescs)?;

        let (slot, data) = match Self::lookup(io, &config, name)? {
            Some(_) if flags.contains(EngineFlags::CREAT | EngineFlags::EXCL) => {
                return Err(EngineError::FileExists)
            }
            Some((slot, len)) => (slot, Self::load(io, &config, slot, len)?),
            None if flags.contains(EngineFlags::CREAT) => {
                let slot = Self::free_slot(io, &config)?.ok_or(EngineError::Full)?;
                Self::store(io, &config, slot, name, &[])?;
                (slot, Vec::new())
            }
            None => return Err(EngineError::NotFound),
        };

        let mut file = OpenFile {
            slot,
            data,
            pos: 0,
            flags,
            dirty: false,
            deleted: false,
        };
        if flags.contains(EngineFlags::TRUNC) && flags.contains(EngineFlags::WRONLY) {
            file.data.clear();
            file.dirty = true;
        }

        self.files[index] = Some(file);
        io.fds[index * FD_BYTES] = 1;
        Ok(Fd(index as i16 + 1))
    }

    fn close(&mut self, io: &mut Io<'_>, fd: Fd) -> EngineResult<()> {
        let _inside = self.probe.enter();
        let flushed = match self.flush_file(io, fd) {
            Err(EngineError::FileDeleted) => Ok(()),
            other => other,
        };
        let index = usize::try_from(fd.0 - 1).map_err(|_| EngineError::BadDescriptor)?;
        let entry = self.files.get_mut(index).ok_or(EngineError::BadDescriptor)?;
        if entry.take().is_none() {
            return Err(EngineError::BadDescriptor);
        }
        io.fds[index * FD_BYTES] = 0;
        flushed
    }

    fn read(&mut self, _io: &mut Io<'_>, fd: Fd, buf: &mut [u8]) -> EngineResult<usize> {
        let _inside = self.probe.enter();
        let file = self.file(fd)?;
        if !file.flags.contains(EngineFlags::RDONLY) {
            return Err(EngineError::NotReadable);
        }

        let pos = file.pos as usize;
        if pos >= file.data.len() {
            return Err(EngineError::EndOfObject);
        }
        let len = buf.len().min(file.data.len() - pos);
        buf[..len].copy_from_slice(&file.data[pos..pos + len]);
        file.pos += len as u32;
        Ok(len)
    }

    fn write(&mut self, _io: &mut Io<'_>, fd: Fd, data: &[u8]) -> EngineResult<usize> {
        let _inside = self.probe.enter();
        let capacity = Self::file_capacity(&self.config()?) as usize;
        let file = self.file(fd)?;
        if !file.flags.contains(EngineFlags::WRONLY) {
            return Err(EngineError::NotWritable);
        }

        if file.flags.contains(EngineFlags::APPEND) {
            file.pos = file.data.len() as u32;
        }
        let pos = file.pos as usize;
        let len = data.len().min(capacity.saturating_sub(pos));
        if len == 0 && !data.is_empty() {
            return Err(EngineError::Full);
        }

        let end = pos + len;
        if end > file.data.len() {
            file.data.resize(end, 0);
        }
        file.data[pos..end].copy_from_slice(&data[..len]);
        file.pos = end as u32;
        file.dirty = true;
        Ok(len)
    }

    fn lseek(&mut self, _io: &mut Io<'_>, fd: Fd, offset: i32, whence: Whence) -> EngineResult<u32> {
        let _inside = self.probe.enter();
        let file = self.file(fd)?;
        let size = file.data.len() as i64;
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => file.pos as i64,
            Whence::End => size,
        };

        let target = base + offset as i64;
        if target < 0 {
            return Err(EngineError::Other(SEEK_BOUNDS));
        }
        if target > size {
            file.pos = size as u32;
            return Err(EngineError::EndOfObject);
        }
        file.pos = target as u32;
        Ok(file.pos)
    }

    fn fflush(&mut self, io: &mut Io<'_>, fd: Fd) -> EngineResult<()> {
        let _inside = self.probe.enter();
        self.flush_file(io, fd)
    }

    fn stat(&mut self, io: &mut Io<'_>, name: &str) -> EngineResult<EngineStat> {
        let _inside = self.probe.enter();
        let config = self.config()?;
        let (_, size) = Self::lookup(io, &config, name)?.ok_or(EngineError::NotFound)?;
        Ok(EngineStat { size })
    }

    fn fstat(&mut self, _io: &mut Io<'_>, fd: Fd) -> EngineResult<EngineStat> {
        let _inside = self.probe.enter();
        let file = self.file(fd)?;
        Ok(EngineStat {
            size: file.data.len() as u32,
        })
    }

    fn remove(&mut self, io: &mut Io<'_>, name: &str) -> EngineResult<()> {
        let _inside = self.probe.enter();
        let config = self.config()?;
        let (slot, _) = Self::lookup(io, &config, name)?.ok_or(EngineError::NotFound)?;
        io.hal.erase(Self::slot_addr(&config, slot), config.log_block_size)?;

        for file in self.files.iter_mut().flatten() {
            if file.slot == slot {
                file.deleted = true;
            }
        }
        Ok(())
    }
}
