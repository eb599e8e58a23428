//! The byte transport an SD card sits behind, and provided implementations.

use core::cell::RefCell;

use embedded_hal::{digital::OutputPin, spi::SpiBus};

/// Something that can swap one byte with an SD card.
///
/// SPI is full duplex, so every byte clocked out brings one back. The card
/// driver builds everything else (command frames, polling, data tokens) on
/// top of this single call.
///
/// Chip-select control is optional. Implementations that drive the select
/// line from elsewhere can leave the provided no-op methods in place.
pub trait Transport {
    /// Clock `out` to the card and return the byte clocked in at the same
    /// time.
    fn exchange(&mut self, out: u8) -> Result<u8, TransportError>;

    /// Assert chip select (drive it low).
    fn select(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release chip select (drive it high).
    fn deselect(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl<T> Transport for &mut T
where
    T: Transport + ?Sized,
{
    fn exchange(&mut self, out: u8) -> Result<u8, TransportError> {
        T::exchange(self, out)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        T::select(self)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        T::deselect(self)
    }
}

/// Errors that can occur when using a [`Transport`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[non_exhaustive]
pub enum TransportError {
    /// An operation on the inner SPI bus failed.
    Spi,
    /// Setting the value of the Chip Select (CS) pin failed.
    Cs,
}

/// An SPI bus and a CS pin, owned outright.
pub struct SpiTransport<BUS, CS> {
    bus: BUS,
    cs: CS,
}

impl<BUS, CS> SpiTransport<BUS, CS> {
    /// Create a new `SpiTransport`.
    pub fn new(bus: BUS, cs: CS) -> Self {
        Self { bus, cs }
    }

    /// Get a temporary borrow on the underlying SPI bus. Useful if you need
    /// to re-clock it once the card is initialised.
    pub fn bus<T, F>(&mut self, func: F) -> T
    where
        F: FnOnce(&mut BUS) -> T,
    {
        func(&mut self.bus)
    }

    /// Give back the bus and the pin.
    pub fn free(self) -> (BUS, CS) {
        (self.bus, self.cs)
    }
}

impl<BUS, CS> Transport for SpiTransport<BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn exchange(&mut self, out: u8) -> Result<u8, TransportError> {
        bus_exchange(&mut self.bus, out)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.cs.set_low().map_err(|_| TransportError::Cs)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        bus_release(&mut self.bus, &mut self.cs)
    }
}

/// A wrapper around a SPI bus and a CS pin, using a `RefCell`.
///
/// This allows sharing the bus within the same thread. The bus is borrowed
/// once per byte, so whoever else uses it must not do so between our
/// `select` and `deselect`.
pub struct RefCellSpiTransport<'a, BUS, CS> {
    bus: &'a RefCell<BUS>,
    cs: CS,
}

impl<'a, BUS, CS> RefCellSpiTransport<'a, BUS, CS> {
    /// Create a new `RefCellSpiTransport`.
    pub fn new(bus: &'a RefCell<BUS>, cs: CS) -> Self {
        Self { bus, cs }
    }
}

impl<BUS, CS> Transport for RefCellSpiTransport<'_, BUS, CS>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    fn exchange(&mut self, out: u8) -> Result<u8, TransportError> {
        let mut bus = self.bus.borrow_mut();
        bus_exchange(&mut *bus, out)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.cs.set_low().map_err(|_| TransportError::Cs)
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        let mut bus = self.bus.borrow_mut();
        bus_release(&mut *bus, &mut self.cs)
    }
}

/// Swap one byte on the bus.
fn bus_exchange<BUS>(bus: &mut BUS, out: u8) -> Result<u8, TransportError>
where
    BUS: SpiBus,
{
    let mut buf = [out];
    bus.transfer_in_place(&mut buf)
        .map_err(|_| TransportError::Spi)?;
    Ok(buf[0])
}

/// Flush the bus and raise CS.
fn bus_release<BUS, CS>(bus: &mut BUS, cs: &mut CS) -> Result<(), TransportError>
where
    BUS: SpiBus,
    CS: OutputPin,
{
    // On failure, it's important to still deassert CS.
    let flush_res = bus.flush();
    let cs_res = cs.set_high();

    flush_res.map_err(|_| TransportError::Spi)?;
    cs_res.map_err(|_| TransportError::Cs)?;
    Ok(())
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
