//! Constants and pure helpers from the SD Specifications, SPI mode subset.
//!
//! Based on SdFat, under the following terms:
//!
//! > Copyright (c) 2011-2018 Bill Greiman
//! > This file is part of the SdFat library for SD memory cards.
//! >
//! > MIT License
//! >
//! > Permission is hereby granted, free of charge, to any person obtaining a
//! > copy of this software and associated documentation files (the "Software"),
//! > to deal in the Software without restriction, including without limitation
//! > the rights to use, copy, modify, merge, publish, distribute, sublicense,
//! > and/or sell copies of the Software, and to permit persons to whom the
//! > Software is furnished to do so, subject to the following conditions:
//! >
//! > The above copyright notice and this permission notice shall be included
//! > in all copies or substantial portions of the Software.
//! >
//! > THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
//! > OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
//! > FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
//! > AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
//! > LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
//! > FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
//! > DEALINGS IN THE SOFTWARE.

use crate::blockdevice::Block;

//==============================================================================

// SD Card Commands

/// GO_IDLE_STATE - init card in spi mode if CS low
pub const CMD0: u8 = 0x00;
/// SEND_IF_COND - verify SD Memory Card interface operating condition.
pub const CMD8: u8 = 0x08;
/// READ_SINGLE_BLOCK - read a single data block from the card
pub const CMD17: u8 = 0x11;
/// WRITE_BLOCK - write a single data block to the card
pub const CMD24: u8 = 0x18;
/// APP_CMD - escape for application specific command
pub const CMD55: u8 = 0x37;
/// READ_OCR - read the OCR register of a card
pub const CMD58: u8 = 0x3A;
/// SD_SEND_OP_COMD - Sends host capacity support information and activates
/// the card's initialization process
pub const ACMD41: u8 = 0x29;

/// Start bits of every command byte: `0b01` followed by the 6-bit index.
pub const CMD_START: u8 = 0x40;
/// Command indices occupy the low six bits of the first frame byte.
pub const CMD_INDEX_MASK: u8 = 0x3F;

/// The CRC byte CMD0 must carry, since CRC checking is on until SPI mode is
/// entered.
pub const CMD0_CRC: u8 = 0x95;
/// The CRC byte CMD8 must carry with [`CMD8_ARG`].
pub const CMD8_CRC: u8 = 0x87;
/// Voltage window 2.7-3.6V (`0x1`) plus the `0xAA` check pattern.
pub const CMD8_ARG: u32 = 0x0000_01AA;
/// The check pattern echoed in the last byte of R7.
pub const CMD8_CHECK_PATTERN: u8 = 0xAA;
/// ACMD41 Host Capacity Support bit - we can handle block addressing.
pub const ACMD41_HCS: u32 = 0x4000_0000;

//==============================================================================

/// status for card in the ready state
pub const R1_READY_STATE: u8 = 0x00;

/// status for card in the idle state
pub const R1_IDLE_STATE: u8 = 0x01;

/// status bit for illegal command
pub const R1_ILLEGAL_COMMAND: u8 = 0x04;

/// Every valid R1 has bit 7 clear.
pub const R1_START_BIT: u8 = 0x80;

/// What MISO idles at. Clocked out whenever we only want to receive, and
/// read back as "no response yet" (never a legitimate R1).
pub const FILLER: u8 = 0xFF;

/// start data token for read or write single block
pub const DATA_START_BLOCK: u8 = 0xFE;

/// mask for data response tokens after a write block operation
pub const DATA_RES_MASK: u8 = 0x1F;

/// write data accepted token
pub const DATA_RES_ACCEPTED: u8 = 0x05;

/// Card Capacity Status, in byte 0 of the OCR.
pub const OCR_CCS: u8 = 0x40;

/// A command as it goes out on the wire.
pub type CommandFrame = [u8; 6];

/// The Operating Conditions Register, most significant byte first.
pub type Ocr = [u8; 4];

/// The R7 payload that follows the R1 of CMD8.
pub type R7 = [u8; 4];

/// How the card interprets the address argument of CMD17/CMD24.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressingMode {
    /// Standard capacity (SDSC) cards take a byte offset.
    ///
    /// Limited to 4 GiB by the 32-bit argument, 2 GiB in practice.
    ByteAddressed,
    /// High capacity (SDHC/SDXC) cards take a 512-byte block index.
    BlockAddressed,
}

impl AddressingMode {
    /// Work out the addressing mode from the Card Capacity Status bit.
    pub fn from_ocr(ocr: &Ocr) -> AddressingMode {
        if (ocr[0] & OCR_CCS) != 0 {
            AddressingMode::BlockAddressed
        } else {
            AddressingMode::ByteAddressed
        }
    }

    /// The CMD17/CMD24 argument for the given block.
    pub fn block_argument(self, lba: u32) -> u32 {
        match self {
            AddressingMode::BlockAddressed => lba,
            AddressingMode::ByteAddressed => lba.wrapping_mul(Block::LEN_U32),
        }
    }
}

/// Perform the 7-bit CRC used on the SD card command frames.
///
/// Returns the CRC in the top seven bits with the end bit set, ready to go
/// out as the last byte of a frame.
pub fn crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut d in data.iter().cloned() {
        for _bit in 0..8 {
            crc <<= 1;
            if ((d & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            d <<= 1;
        }
    }
    (crc << 1) | 1
}

/// Build a six byte command frame.
///
/// With `crc` of `None` the CRC7 is computed over the first five bytes.
/// With `Some(byte)` that byte is sent as-is, which is how the fixed CMD0
/// and CMD8 CRCs go out.
pub fn command_frame(command: u8, arg: u32, crc: Option<u8>) -> CommandFrame {
    let mut buf = [
        CMD_START | (command & CMD_INDEX_MASK),
        (arg >> 24) as u8,
        (arg >> 16) as u8,
        (arg >> 8) as u8,
        arg as u8,
        0,
    ];
    buf[5] = match crc {
        Some(byte) => byte,
        None => crc7(&buf[0..5]),
    };
    buf
}

/// Like [`command_frame`], but a CRC byte of zero means "compute it".
///
/// Zero can never be a valid final byte, because the end bit is always set.
pub fn command_frame_raw(command: u8, arg: u32, crc_or_zero: u8) -> CommandFrame {
    let crc = if crc_or_zero == 0 {
        None
    } else {
        Some(crc_or_zero)
    };
    command_frame(command, arg, crc)
}

/// Does this data response token say the card took our block?
pub fn data_response_accepted(token: u8) -> bool {
    (token & DATA_RES_MASK) == DATA_RES_ACCEPTED
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
