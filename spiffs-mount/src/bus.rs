#![deny(unsafe_code)]

use core::fmt::Debug;

use embedded_hal::blocking::spi::{Transfer, Write};
use embedded_hal::digital::v2::OutputPin;
use portable_atomic::{AtomicBool, Ordering};
use spin::mutex::Mutex;
use spin::relax::{RelaxStrategy, Spin};

/// Shared SPI bus with one flash slave selected between `begin` and `end`.
///
/// Methods take `&self`: the bus is shared and does its own arbitration. `begin`
/// blocks until the bus is free and selects the slave, `end` deselects it and
/// hands the bus to the next user.
pub trait SpiBus {
    type Error: Debug;

    fn begin(&self) -> Result<(), Self::Error>;

    fn end(&self) -> Result<(), Self::Error>;

    /// Full-duplex exchange: sends `words` and replaces them with the received bytes.
    fn transfer(&self, words: &mut [u8]) -> Result<(), Self::Error>;

    fn xmit(&self, data: &[u8]) -> Result<(), Self::Error> {
        let mut chunk = [0u8; 16];
        for part in data.chunks(chunk.len()) {
            let words = &mut chunk[..part.len()];
            words.copy_from_slice(part);
            self.transfer(words)?;
        }
        Ok(())
    }

    fn rcvr(&self, buf: &mut [u8]) -> Result<(), Self::Error> {
        buf.fill(0xff);
        self.transfer(buf)
    }
}

impl<T: SpiBus + ?Sized> SpiBus for &T {
    type Error = T::Error;

    fn begin(&self) -> Result<(), Self::Error> {
        (**self).begin()
    }

    fn end(&self) -> Result<(), Self::Error> {
        (**self).end()
    }

    fn transfer(&self, words: &mut [u8]) -> Result<(), Self::Error> {
        (**self).transfer(words)
    }

    fn xmit(&self, data: &[u8]) -> Result<(), Self::Error> {
        (**self).xmit(data)
    }

    fn rcvr(&self, buf: &mut [u8]) -> Result<(), Self::Error> {
        (**self).rcvr(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError<S, P> {
    Spi(S),
    Pin(P),
}

struct Hardware<SPI, CS> {
    spi: SPI,
    cs: CS,
}

/// [`SpiBus`] over an `embedded-hal` SPI peripheral and its chip-select pin.
///
/// `begin` retries until the bus is free, calling `R::relax` between attempts. The
/// default busy-spins, which livelocks when a higher priority task waits on a
/// preempted owner; firmware on a priority-preemptive RTOS should pass a strategy
/// that sleeps the task for a tick.
pub struct HalSpiBus<SPI, CS, R = Spin> {
    owned: AtomicBool,
    hw: Mutex<Hardware<SPI, CS>, R>,
}

impl<SPI, CS> HalSpiBus<SPI, CS> {
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self::with_relax(spi, cs)
    }
}

impl<SPI, CS, R> HalSpiBus<SPI, CS, R> {
    pub fn with_relax(spi: SPI, cs: CS) -> Self {
        Self {
            owned: AtomicBool::new(false),
            hw: Mutex::new(Hardware { spi, cs }),
        }
    }

    pub fn is_owned(&self) -> bool {
        self.owned.load(Ordering::Acquire)
    }

    pub fn release(self) -> (SPI, CS) {
        let hw = self.hw.into_inner();
        (hw.spi, hw.cs)
    }
}

impl<SPI, CS, E, R> SpiBus for HalSpiBus<SPI, CS, R>
where
    SPI: Transfer<u8, Error = E> + Write<u8, Error = E>,
    CS: OutputPin,
    CS::Error: Debug,
    E: Debug,
    R: RelaxStrategy,
{
    type Error = BusError<E, CS::Error>;

    fn begin(&self) -> Result<(), Self::Error> {
        while self
            .owned
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            R::relax();
        }

        let selected = self.hw.lock().cs.set_low().map_err(BusError::Pin);
        if selected.is_err() {
            self.owned.store(false, Ordering::Release);
        }
        selected
    }

    fn end(&self) -> Result<(), Self::Error> {
        let deselected = self.hw.lock().cs.set_high().map_err(BusError::Pin);
        self.owned.store(false, Ordering::Release);
        deselected
    }

    fn transfer(&self, words: &mut [u8]) -> Result<(), Self::Error> {
        self.hw
            .lock()
            .spi
            .transfer(words)
            .map(|_| ())
            .map_err(BusError::Spi)
    }

    fn xmit(&self, data: &[u8]) -> Result<(), Self::Error> {
        self.hw.lock().spi.write(data).map_err(BusError::Spi)
    }
}
