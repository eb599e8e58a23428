//! Useful library code for tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};

use sdspi_media::sdcard::proto::crc7;
use sdspi_media::{Block, Transport, TransportError};

/// Turn on log output, if `RUST_LOG` asks for it.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// What sort of card to pretend to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardKind {
    /// A high capacity card. Block addressed.
    Sdhc,
    /// A version 2 standard capacity card. Byte addressed.
    Sdsc,
    /// A version 1 card, which doesn't know CMD8. Byte addressed.
    Legacy,
}

#[derive(Debug)]
enum Phase {
    Command,
    WriteWaitToken { block: u32 },
    WriteData { block: u32, data: Vec<u8> },
    WriteCrc { block: u32, data: Vec<u8>, remaining: usize },
}

/// An SD card, simulated one byte at a time.
///
/// Understands CMD0, CMD8, CMD55, ACMD41, CMD58, CMD17 and CMD24. Blocks
/// that have never been written read back as zeros.
#[derive(Debug)]
pub struct SimCard {
    kind: CardKind,
    blocks: HashMap<u32, [u8; Block::LEN]>,
    selected: bool,
    idle: bool,
    app_cmd: bool,
    frame: Vec<u8>,
    tx: VecDeque<u8>,
    phase: Phase,
    /// Every command received, as (index, argument).
    pub commands: Vec<(u8, u32)>,
    /// Every block index read, after address translation.
    pub reads: Vec<u32>,
    /// Every block index written, after address translation.
    pub writes: Vec<u32>,
    /// How many ACMD41s to answer with "still idle".
    pub acmd41_busy: u32,
    /// How many filler bytes before each R1.
    pub r1_delay: usize,
    /// How many filler bytes before a data token.
    pub token_delay: usize,
    /// How many busy bytes after accepting a block.
    pub busy_bytes: usize,
    /// Answer CMD17 with this instead of the start token.
    pub bad_token: Option<u8>,
    /// Answer the next write with this data response.
    pub write_response: u8,
    /// Say nothing at all.
    pub absent: bool,
    /// Bytes exchanged with chip select released.
    pub idle_bytes: usize,
    /// Total bytes exchanged.
    pub exchanges: usize,
    /// How many times chip select was released.
    pub deselects: usize,
}

impl SimCard {
    pub fn new(kind: CardKind) -> SimCard {
        SimCard {
            kind,
            blocks: HashMap::new(),
            selected: false,
            idle: false,
            app_cmd: false,
            frame: Vec::new(),
            tx: VecDeque::new(),
            phase: Phase::Command,
            commands: Vec::new(),
            reads: Vec::new(),
            writes: Vec::new(),
            acmd41_busy: 0,
            r1_delay: 1,
            token_delay: 3,
            busy_bytes: 4,
            bad_token: None,
            write_response: 0xE5,
            absent: false,
            idle_bytes: 0,
            exchanges: 0,
            deselects: 0,
        }
    }

    pub fn kind(&self) -> CardKind {
        self.kind
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn block(&self, idx: u32) -> [u8; Block::LEN] {
        self.blocks.get(&idx).copied().unwrap_or([0u8; Block::LEN])
    }

    pub fn set_block(&mut self, idx: u32, contents: [u8; Block::LEN]) {
        self.blocks.insert(idx, contents);
    }

    /// The index of every command received, in order.
    pub fn command_indices(&self) -> Vec<u8> {
        self.commands.iter().map(|(idx, _)| *idx).collect()
    }

    fn queue_r1(&mut self, r1: u8) {
        for _ in 0..self.r1_delay {
            self.tx.push_back(0xFF);
        }
        self.tx.push_back(r1);
    }

    fn status(&self) -> u8 {
        if self.idle {
            0x01
        } else {
            0x00
        }
    }

    /// Turn a CMD17/CMD24 argument into a block index.
    fn block_for(&self, arg: u32) -> Option<u32> {
        match self.kind {
            CardKind::Sdhc => Some(arg),
            CardKind::Sdsc | CardKind::Legacy => {
                if arg % Block::LEN_U32 == 0 {
                    Some(arg / Block::LEN_U32)
                } else {
                    None
                }
            }
        }
    }

    fn handle_frame(&mut self) {
        let frame: [u8; 6] = self.frame[..].try_into().unwrap();
        self.frame.clear();
        let index = frame[0] & 0x3F;
        let arg = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app_cmd = std::mem::replace(&mut self.app_cmd, false);
        self.commands.push((index, arg));
        if (index == 0 || index == 8) && frame[5] != crc7(&frame[0..5]) {
            // Communication CRC error
            self.queue_r1(0x08 | self.status());
            return;
        }
        match (app_cmd, index) {
            (_, 0) => {
                self.idle = true;
                self.queue_r1(0x01);
            }
            (_, 8) => {
                if self.kind == CardKind::Legacy {
                    self.queue_r1(0x05);
                } else {
                    self.queue_r1(self.status());
                    self.tx.extend([0x00, 0x00, (arg >> 8) as u8 & 0x0F, arg as u8]);
                }
            }
            (_, 55) => {
                self.app_cmd = true;
                self.queue_r1(self.status());
            }
            (true, 41) => {
                if self.acmd41_busy > 0 {
                    self.acmd41_busy -= 1;
                } else {
                    self.idle = false;
                }
                self.queue_r1(self.status());
            }
            (_, 58) => {
                self.queue_r1(self.status());
                let ocr = match self.kind {
                    CardKind::Sdhc => [0xC0, 0xFF, 0x80, 0x00],
                    CardKind::Sdsc | CardKind::Legacy => [0x80, 0xFF, 0x80, 0x00],
                };
                self.tx.extend(ocr);
            }
            (_, 17) => match self.block_for(arg) {
                _ if self.idle => self.queue_r1(0x05),
                None => self.queue_r1(0x20),
                Some(block) => {
                    self.reads.push(block);
                    self.queue_r1(0x00);
                    for _ in 0..self.token_delay {
                        self.tx.push_back(0xFF);
                    }
                    if let Some(token) = self.bad_token {
                        self.tx.push_back(token);
                        return;
                    }
                    self.tx.push_back(0xFE);
                    let data = self.block(block);
                    self.tx.extend(data);
                    self.tx.extend([0x12, 0x34]);
                }
            },
            (_, 24) => match self.block_for(arg) {
                _ if self.idle => self.queue_r1(0x05),
                None => self.queue_r1(0x20),
                Some(block) => {
                    self.queue_r1(0x00);
                    self.phase = Phase::WriteWaitToken { block };
                }
            },
            _ => self.queue_r1(0x04 | self.status()),
        }
    }

    fn receive(&mut self, byte: u8) {
        let phase = std::mem::replace(&mut self.phase, Phase::Command);
        self.phase = match phase {
            Phase::Command => {
                if !self.frame.is_empty() || (byte & 0xC0) == 0x40 {
                    self.frame.push(byte);
                    if self.frame.len() == 6 {
                        self.handle_frame();
                    }
                }
                // handle_frame may have started a write
                std::mem::replace(&mut self.phase, Phase::Command)
            }
            Phase::WriteWaitToken { block } => {
                if byte == 0xFE {
                    Phase::WriteData {
                        block,
                        data: Vec::with_capacity(Block::LEN),
                    }
                } else {
                    Phase::WriteWaitToken { block }
                }
            }
            Phase::WriteData { block, mut data } => {
                data.push(byte);
                if data.len() == Block::LEN {
                    Phase::WriteCrc {
                        block,
                        data,
                        remaining: 2,
                    }
                } else {
                    Phase::WriteData { block, data }
                }
            }
            Phase::WriteCrc {
                block,
                data,
                remaining,
            } => {
                if remaining > 1 {
                    Phase::WriteCrc {
                        block,
                        data,
                        remaining: remaining - 1,
                    }
                } else {
                    self.tx.push_back(self.write_response);
                    if (self.write_response & 0x1F) == 0x05 {
                        self.writes.push(block);
                        self.blocks.insert(block, data.try_into().unwrap());
                        for _ in 0..self.busy_bytes {
                            self.tx.push_back(0x00);
                        }
                    }
                    Phase::Command
                }
            }
        };
    }
}

impl Transport for SimCard {
    fn exchange(&mut self, out: u8) -> Result<u8, TransportError> {
        self.exchanges += 1;
        if !self.selected {
            self.idle_bytes += 1;
            return Ok(0xFF);
        }
        if self.absent {
            return Ok(0xFF);
        }
        let reply = self.tx.pop_front().unwrap_or(0xFF);
        self.receive(out);
        Ok(reply)
    }

    fn select(&mut self) -> Result<(), TransportError> {
        self.selected = true;
        Ok(())
    }

    fn deselect(&mut self) -> Result<(), TransportError> {
        self.selected = false;
        self.deselects += 1;
        self.tx.clear();
        self.frame.clear();
        self.phase = Phase::Command;
        Ok(())
    }
}

/// Counts the time it was asked to wait, instead of waiting.
#[derive(Debug, Default)]
pub struct FakeDelay {
    pub elapsed_ns: u64,
}

impl embedded_hal::delay::DelayNs for FakeDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.elapsed_ns += u64::from(ns);
    }
}

/// A Master Boot Record with one partition in the first slot.
pub fn mbr(start_lba: u32, sector_count: u32, partition_type: u8) -> [u8; Block::LEN] {
    let mut block = [0u8; Block::LEN];
    block[446] = 0x80;
    block[446 + 4] = partition_type;
    block[446 + 8..446 + 12].copy_from_slice(&start_lba.to_le_bytes());
    block[446 + 12..446 + 16].copy_from_slice(&sector_count.to_le_bytes());
    block[510] = 0x55;
    block[511] = 0xAA;
    block
}

/// A block full of a pattern that changes with `seed`.
pub fn pattern(seed: u8) -> [u8; Block::LEN] {
    let mut block = [0u8; Block::LEN];
    for (i, b) in block.iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(7).wrapping_add(seed);
    }
    block
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
