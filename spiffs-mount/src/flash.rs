#![deny(unsafe_code)]

use alloc::sync::Arc;
use core::fmt::Debug;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use fugit::MillisDurationU32;
use log::{debug, error, info, warn};
use portable_atomic::{AtomicBool, Ordering};
use spi_memory::series25;
use spi_memory::{BlockDevice, Read};
use spin::Mutex;

use crate::bus::SpiBus;
use crate::hal::{Flash, FlashError};

// spi-memory programs at most this many bytes per page program command.
const MAX_PAGE_SIZE: u32 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlashConf {
    pub capacity: u32,
    pub page_size: u32,
    pub sector_size: u32,
    /// Pause between attempts to talk to a chip that reports itself busy.
    pub busy_wait: MillisDurationU32,
    pub init_retries: u8,
}

impl FlashConf {
    pub fn validate(&self) -> Result<(), FlashError> {
        if self.page_size == 0
            || self.page_size > MAX_PAGE_SIZE
            || self.sector_size == 0
            || self.sector_size % self.page_size != 0
            || self.capacity % self.sector_size != 0
        {
            return Err(FlashError::Misaligned);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError<E> {
    NotSelected,
    Bus(E),
}

impl<E: Debug> From<LinkError<E>> for FlashError {
    fn from(error: LinkError<E>) -> Self {
        match error {
            LinkError::NotSelected => FlashError::NotSelected,
            LinkError::Bus(bus_error) => {
                error!("spi bus error: {:?}", bus_error);
                FlashError::Bus
            }
        }
    }
}

// Status register read, and the write-in-progress bit it returns.
const READ_STATUS: u8 = 0x05;
const STATUS_BUSY: u8 = 0x01;

/// Bus slave state shared by the command engine's SPI and chip-select handles.
///
/// A status read that finds the chip busy arms a pause. The pause runs once the
/// window closes, so the caller sleeps with the bus released instead of polling.
struct SpiLink<B, D> {
    bus: B,
    cs_held: AtomicBool,
    // Set from select until the first transfer of the window.
    opening: AtomicBool,
    busy: AtomicBool,
    wait: Mutex<FlashWait<D>>,
    busy_wait: MillisDurationU32,
}

impl<B: SpiBus, D: DelayMs<u32>> SpiLink<B, D> {
    fn new(bus: B, delay: D, busy_wait: MillisDurationU32) -> Self {
        Self {
            bus,
            cs_held: AtomicBool::new(false),
            opening: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            wait: Mutex::new(FlashWait::new(delay)),
            busy_wait,
        }
    }

    fn select(&self) -> Result<(), LinkError<B::Error>> {
        if !self.cs_held.load(Ordering::Acquire) {
            self.bus.begin().map_err(LinkError::Bus)?;
            self.cs_held.store(true, Ordering::Release);
            self.opening.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn deselect(&self) -> Result<(), LinkError<B::Error>> {
        let mut ended = Ok(());
        if self.cs_held.swap(false, Ordering::AcqRel) {
            self.opening.store(false, Ordering::Release);
            ended = self.bus.end().map_err(LinkError::Bus);
        }
        if self.busy.swap(false, Ordering::AcqRel) {
            self.wait.lock().wait(self.busy_wait);
        }
        ended
    }

    fn ensure_selected(&self) -> Result<(), LinkError<B::Error>> {
        if self.cs_held.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LinkError::NotSelected)
        }
    }
}

/// Data path of the flash command engine.
pub struct FlashSpi<B, D> {
    link: Arc<SpiLink<B, D>>,
}

impl<B: SpiBus, D: DelayMs<u32>> FlashSpi<B, D> {
    /// Sends `tx`, then clocks in `rx`. Chip select must be asserted.
    pub fn txrx(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), LinkError<B::Error>> {
        self.link.ensure_selected()?;
        self.link.opening.store(false, Ordering::Release);
        if !tx.is_empty() {
            self.link.bus.xmit(tx).map_err(LinkError::Bus)?;
        }
        if !rx.is_empty() {
            self.link.bus.rcvr(rx).map_err(LinkError::Bus)?;
        }
        Ok(())
    }
}

impl<B: SpiBus, D: DelayMs<u32>> Transfer<u8> for FlashSpi<B, D> {
    type Error = LinkError<B::Error>;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Self::Error> {
        self.link.ensure_selected()?;
        let opening = self.link.opening.swap(false, Ordering::AcqRel);
        let status_read = opening && words.len() == 2 && words[0] == READ_STATUS;

        self.link.bus.transfer(words).map_err(LinkError::Bus)?;
        if status_read && words[1] & STATUS_BUSY != 0 {
            self.link.busy.store(true, Ordering::Release);
        }
        Ok(words)
    }
}

impl<B: SpiBus, D: DelayMs<u32>> Write<u8> for FlashSpi<B, D> {
    type Error = LinkError<B::Error>;

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        self.txrx(words, &mut [])
    }
}

/// Latched chip select. Repeated asserts or releases are no-ops, so several
/// transfers can share one window.
pub struct FlashCs<B, D> {
    link: Arc<SpiLink<B, D>>,
}

impl<B: SpiBus, D: DelayMs<u32>> FlashCs<B, D> {
    pub fn set(&mut self, assert: bool) -> Result<(), LinkError<B::Error>> {
        if assert {
            self.link.select()
        } else {
            self.link.deselect()
        }
    }

    pub fn is_held(&self) -> bool {
        self.link.cs_held.load(Ordering::Acquire)
    }
}

// Chip select is active low.
impl<B: SpiBus, D: DelayMs<u32>> OutputPin for FlashCs<B, D> {
    type Error = LinkError<B::Error>;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set(true)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set(false)
    }
}

/// Host OS sleep for the flash command engine.
pub struct FlashWait<D> {
    delay: D,
}

impl<D: DelayMs<u32>> FlashWait<D> {
    pub fn new(delay: D) -> Self {
        Self { delay }
    }

    pub fn wait(&mut self, time: MillisDurationU32) {
        self.delay.delay_ms(time.to_millis());
    }
}

impl<D: DelayMs<u32>> DelayMs<u32> for FlashWait<D> {
    fn delay_ms(&mut self, ms: u32) {
        self.wait(MillisDurationU32::millis(ms));
    }
}

type Nor<B, D> = series25::Flash<FlashSpi<B, D>, FlashCs<B, D>>;

fn chip_error<B: SpiBus, D: DelayMs<u32>>(
    error: spi_memory::Error<FlashSpi<B, D>, FlashCs<B, D>>,
) -> FlashError {
    match error {
        spi_memory::Error::Spi(link) | spi_memory::Error::Gpio(link) => link.into(),
        spi_memory::Error::UnexpectedStatus => FlashError::UnexpectedStatus,
        _ => FlashError::Bus,
    }
}

/// SPI NOR flash chip on a shared bus.
///
/// While a program or erase is in progress, each busy status poll is followed by
/// a `busy_wait` sleep through the host delay.
pub struct FlashDevice<B: SpiBus, D: DelayMs<u32>> {
    link: Arc<SpiLink<B, D>>,
    chip: Mutex<Nor<B, D>>,
    conf: FlashConf,
}

impl<B, D> FlashDevice<B, D>
where
    B: SpiBus,
    D: DelayMs<u32>,
{
    /// Wires the chip to `bus` and probes it. Chip select starts released.
    pub fn init(bus: B, conf: &FlashConf, delay: D) -> Result<Self, FlashError> {
        conf.validate()?;

        let link = Arc::new(SpiLink::new(bus, delay, conf.busy_wait));

        let mut attempt = 0;
        let mut nor = loop {
            let spi = FlashSpi { link: link.clone() };
            let cs = FlashCs { link: link.clone() };
            match series25::Flash::init(spi, cs) {
                Ok(nor) => break nor,
                // The busy status read already paused for `busy_wait`.
                Err(spi_memory::Error::UnexpectedStatus) if attempt < conf.init_retries => {
                    attempt += 1;
                    warn!("flash busy, retry {} of {}", attempt, conf.init_retries);
                    // A failed attempt may leave the window open.
                    link.deselect()?;
                }
                Err(err) => {
                    link.deselect()?;
                    return Err(chip_error(err));
                }
            }
        };

        let id = nor.read_jedec_id().map_err(chip_error)?;
        info!("flash {:?}, {} bytes", id, conf.capacity);

        Ok(Self {
            link,
            chip: Mutex::new(nor),
            conf: *conf,
        })
    }

    pub fn conf(&self) -> &FlashConf {
        &self.conf
    }

    pub fn cs_held(&self) -> bool {
        self.link.cs_held.load(Ordering::Acquire)
    }

    /// Suspends the caller using the device's host sleep.
    pub fn wait(&self, time: MillisDurationU32) {
        self.link.wait.lock().wait(time);
    }

    fn check_range(&self, addr: u32, len: usize) -> Result<(), FlashError> {
        let len = u32::try_from(len).map_err(|_| FlashError::OutOfRange)?;
        match addr.checked_add(len) {
            Some(end) if end <= self.conf.capacity => Ok(()),
            _ => Err(FlashError::OutOfRange),
        }
    }
}

impl<B, D> Flash for FlashDevice<B, D>
where
    B: SpiBus + Send + Sync,
    D: DelayMs<u32> + Send,
{
    fn capacity(&self) -> u32 {
        self.conf.capacity
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(addr, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        self.chip.lock().read(addr, buf).map_err(chip_error)
    }

    fn write(&self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        self.check_range(addr, data.len())?;

        let mut nor = self.chip.lock();
        let mut page = [0u8; MAX_PAGE_SIZE as usize];
        let mut addr = addr;
        let mut rest = data;
        while !rest.is_empty() {
            // A page program must not wrap around the end of the page.
            let room = (self.conf.page_size - addr % self.conf.page_size) as usize;
            let (chunk, tail) = rest.split_at(room.min(rest.len()));
            let words = &mut page[..chunk.len()];
            words.copy_from_slice(chunk);
            nor.write_bytes(addr, words).map_err(chip_error)?;

            addr += chunk.len() as u32;
            rest = tail;
        }
        Ok(())
    }

    fn erase(&self, addr: u32, size: u32) -> Result<(), FlashError> {
        if addr % self.conf.sector_size != 0 || size % self.conf.sector_size != 0 {
            return Err(FlashError::Misaligned);
        }
        self.check_range(addr, size as usize)?;

        let mut nor = self.chip.lock();
        for sector in (addr..addr + size).step_by(self.conf.sector_size as usize) {
            debug!("erase sector {:#x}", sector);
            nor.erase_sectors(sector, 1).map_err(chip_error)?;
        }
        Ok(())
    }
}
