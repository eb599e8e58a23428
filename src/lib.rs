//! # sdspi-media
//!
//! > An SD card block media driver written in Embedded Rust
//!
//! This crate talks to an SD card in SPI mode over a byte-wide transport you
//! supply, works out where the first filesystem partition begins, and then
//! serves 512-byte sector reads and writes to a filesystem layer through a
//! small request/dispatch contract. It is `#![no_std]` and does not use
//! `alloc`.
//!
//! ## Using the crate
//!
//! You will need something that implements [`Transport`] (one full-duplex
//! byte exchange), and something that implements
//! [`embedded_hal::delay::DelayNs`]. The [`SpiTransport`] adapter covers any
//! `embedded-hal` SPI bus plus chip-select pin.
//!
//! ```rust
//! use sdspi_media::{mount, MediaBuffer, MediaDriver, MediaRequest, MediaStatus, RequestKind, SdCard, Transport};
//!
//! fn example<T, D>(transport: T, delay: D) -> Option<[u8; 512]>
//! where
//!     T: Transport,
//!     D: embedded_hal::delay::DelayNs,
//! {
//!     let mut card = SdCard::new(transport, delay);
//!     let context = mount(&mut card).ok()?;
//!     let mut driver = MediaDriver::new(card);
//!     let mut sector = [0u8; 512];
//!     let mut request = MediaRequest::new(RequestKind::Read, &context)
//!         .with_sectors(0, 1)
//!         .with_buffer(MediaBuffer::Read(&mut sector));
//!     driver.dispatch(&mut request);
//!     if request.status == MediaStatus::Success {
//!         Some(sector)
//!     } else {
//!         None
//!     }
//! }
//! ```
//!
//! ## Features
//!
//! * `log`: Enabled by default. Generates log messages using the `log` crate.
//! * `defmt-log`: By turning off the default features and enabling the
//!   `defmt-log` feature you can configure this crate to log messages over defmt
//!   instead.
//!
//! You cannot enable both the `log` feature and the `defmt-log` feature.

#![cfg_attr(not(test), no_std)]

#[cfg(test)]
#[macro_use]
extern crate hex_literal;

pub mod blockdevice;
pub mod media;
pub mod partition;
pub mod rollover;
pub mod sdcard;

#[doc(inline)]
pub use crate::blockdevice::{Block, BlockCount, BlockDevice, BlockIdx};

#[doc(inline)]
pub use crate::sdcard::{
    AddressingMode, Config, Error as SdCardError, InitReport, InitState, RefCellSpiTransport,
    SdCard, SpiTransport, Transport, TransportError,
};

#[doc(inline)]
pub use crate::partition::{locate_partition, Partition, PartitionError};

#[doc(inline)]
pub use crate::media::{
    mount, DriverContext, MediaBuffer, MediaDriver, MediaRequest, MediaStatus, MountError,
    RequestKind,
};

#[doc(inline)]
pub use crate::rollover::{LogFileOps, RolloverError, RolloverLog};

#[cfg(all(feature = "defmt-log", feature = "log"))]
compile_error!("Cannot enable both log and defmt-log");

#[cfg(feature = "log")]
use log::{debug, trace, warn};

#[cfg(feature = "defmt-log")]
use defmt::{debug, trace, warn};

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::debug! but does nothing at all
macro_rules! debug {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::trace! but does nothing at all
macro_rules! trace {
    ($($arg:tt)+) => {};
}

#[cfg(all(not(feature = "defmt-log"), not(feature = "log")))]
#[macro_export]
/// Like log::warn! but does nothing at all
macro_rules! warn {
    ($($arg:tt)+) => {};
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
