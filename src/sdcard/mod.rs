//! The SD Card Protocol, SPI mode.
//!
//! Implements initialisation and single-block I/O on top of a byte-wide
//! [`Transport`].
//!
//! This is currently optimised for readability and debugability, not
//! performance.

pub mod proto;
pub mod transport;

use crate::{Block, BlockCount, BlockDevice, BlockIdx};
use embedded_hal::delay::DelayNs;
use proto::*;

#[doc(inline)]
pub use proto::AddressingMode;

#[doc(inline)]
pub use transport::{RefCellSpiTransport, SpiTransport, Transport, TransportError};

// =============================================================================
// Imports
// =============================================================================

use crate::{debug, trace, warn};

// =============================================================================
// Constants
// =============================================================================

/// Bytes clocked with chip select released before CMD0. Gives the 74 clock
/// cycles the card needs to wake up, and then some.
const RESET_CLOCK_BYTES: usize = 10;

// =============================================================================
// Types and Implementations
// =============================================================================

/// Represents an SD Card on a byte transport.
///
/// Built from a [`Transport`] and something that can sleep. Holds the
/// addressing mode discovered at initialisation, so you need one of these
/// per card.
pub struct SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    transport: T,
    delayer: D,
    config: Config,
    addressing: Option<AddressingMode>,
    state: InitState,
    report: InitReport,
}

impl<T, D> SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Create a new SD Card driver using the default configuration.
    ///
    /// Nothing is sent to the card until you call [`SdCard::acquire`].
    pub fn new(transport: T, delayer: D) -> SdCard<T, D> {
        Self::new_with_config(transport, delayer, Config::default())
    }

    /// Create a new SD Card driver with the given configuration.
    pub fn new_with_config(transport: T, delayer: D, config: Config) -> SdCard<T, D> {
        SdCard {
            transport,
            delayer,
            config,
            addressing: None,
            state: InitState::Reset,
            report: InitReport::new(),
        }
    }

    /// Get a temporary borrow on the underlying transport. Useful if you
    /// need to re-clock the SPI once the card is up.
    pub fn transport<R, F>(&mut self, func: F) -> R
    where
        F: FnOnce(&mut T) -> R,
    {
        func(&mut self.transport)
    }

    /// Give back the transport and the delay.
    pub fn free(self) -> (T, D) {
        (self.transport, self.delayer)
    }

    /// The configuration this driver was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Where the initialisation sequence got to.
    pub fn init_state(&self) -> InitState {
        self.state
    }

    /// The raw responses collected during the last initialisation.
    pub fn init_report(&self) -> &InitReport {
        &self.report
    }

    /// How this card wants its block addresses, if we know yet.
    pub fn addressing_mode(&self) -> Option<AddressingMode> {
        self.addressing
    }

    /// Mark the card as requiring a reset.
    ///
    /// Block I/O fails with [`Error::NotInitialised`] until the next
    /// successful [`SdCard::acquire`].
    pub fn mark_card_uninit(&mut self) {
        self.addressing = None;
        self.state = InitState::Reset;
    }

    /// Initializes the card into a known state (or at least tries to).
    ///
    /// Always starts again from [`InitState::Reset`], and runs the whole
    /// handshake through to [`InitState::Ready`]. On failure the state is
    /// [`InitState::Failed`] and you should start again from the top.
    pub fn acquire(&mut self) -> Result<(), Error> {
        debug!("acquiring card with config: {:?}", self.config);
        self.mark_card_uninit();
        self.report = InitReport::new();
        loop {
            if self.step()? == InitState::Ready {
                return Ok(());
            }
        }
    }

    /// Run one step of the initialisation sequence, and return the state
    /// we moved to.
    ///
    /// Stepping from [`InitState::Ready`] does nothing. Stepping from
    /// [`InitState::Failed`] goes back to [`InitState::Reset`].
    pub fn step(&mut self) -> Result<InitState, Error> {
        let result = match self.state {
            InitState::Reset => self.reset().map(|_| InitState::SendCmd0),
            InitState::SendCmd0 => self.go_idle().map(|_| InitState::SendCmd8),
            InitState::SendCmd8 => self
                .check_interface_condition()
                .map(|_| InitState::AppCmdInitLoop),
            InitState::AppCmdInitLoop => self.wait_ready().map(|_| InitState::ReadOcr),
            InitState::ReadOcr => self.read_ocr().map(|_| InitState::Ready),
            InitState::Ready => Ok(InitState::Ready),
            InitState::Failed => Ok(InitState::Reset),
        };
        match result {
            Ok(next) => {
                trace!("init {:?} -> {:?}", self.state, next);
                self.state = next;
                Ok(next)
            }
            Err(e) => {
                warn!("init failed in {:?}: {:?}", self.state, e);
                self.state = InitState::Failed;
                self.addressing = None;
                Err(e)
            }
        }
    }

    /// Read the Operating Conditions Register and update the addressing
    /// mode from its Card Capacity Status bit.
    ///
    /// Accepts an R1 of idle as well as ready, since some cards still
    /// report idle here. The addressing mode is left alone on failure.
    pub fn read_ocr(&mut self) -> Result<Ocr, Error> {
        let (r1, ocr) = self.with_chip_select(2, |s| {
            let r1 = s.send_command(CMD58, 0, None)?;
            let mut ocr = [FILLER; 4];
            if r1 == R1_READY_STATE || r1 == R1_IDLE_STATE {
                s.read_response_bytes(&mut ocr)?;
            }
            Ok((r1, ocr))
        })?;
        self.report.cmd58_r1 = r1;
        self.report.ocr = ocr;
        match r1 {
            R1_READY_STATE | R1_IDLE_STATE => {}
            FILLER => return Err(Error::TimeoutCommand(CMD58)),
            r1 => {
                return Err(Error::RejectedCommand {
                    command: CMD58,
                    r1,
                })
            }
        }
        let mode = AddressingMode::from_ocr(&ocr);
        debug!("OCR {:?}, card is {:?}", ocr, mode);
        self.addressing = Some(mode);
        Ok(ocr)
    }

    /// Read one 512 byte block.
    ///
    /// `lba` is the block index; the byte-offset conversion for standard
    /// capacity cards happens here.
    pub fn read_block(&mut self, lba: u32, block: &mut Block) -> Result<(), Error> {
        let arg = self.block_argument(lba)?;
        trace!("CMD17 lba {} arg {:x}", lba, arg);
        self.with_chip_select(2, |s| {
            s.card_command_ready(CMD17, arg)?;
            s.wait_for_token(DATA_START_BLOCK)?;
            s.read_response_bytes(&mut block.contents)?;
            // The CRC16 trailer. Nobody has switched CRC checking on.
            let mut crc = [0u8; 2];
            s.read_response_bytes(&mut crc)?;
            Ok(())
        })
    }

    /// Write one 512 byte block, and wait for the card to finish
    /// programming it.
    pub fn write_block(&mut self, lba: u32, block: &Block) -> Result<(), Error> {
        let arg = self.block_argument(lba)?;
        trace!("CMD24 lba {} arg {:x}", lba, arg);
        self.with_chip_select(2, |s| {
            s.card_command_ready(CMD24, arg)?;
            s.send(FILLER)?;
            s.send(DATA_START_BLOCK)?;
            for &b in block.contents.iter() {
                s.send(b)?;
            }
            // Dummy CRC16
            s.send(FILLER)?;
            s.send(FILLER)?;
            let token = s.receive()?;
            if !data_response_accepted(token) {
                return Err(Error::WriteRejected(token));
            }
            s.wait_not_busy()
        })
    }

    /// Send a command frame and poll for the first byte that could be an R1,
    /// i.e. has [`R1_START_BIT`] clear.
    ///
    /// Returns [`FILLER`] itself if the card stays quiet for
    /// [`Config::response_poll_bytes`] bytes. Doesn't touch chip select
    /// and doesn't judge the R1 it returns.
    pub fn send_command(&mut self, command: u8, arg: u32, crc: Option<u8>) -> Result<u8, Error> {
        let frame = command_frame(command, arg, crc);
        for b in frame.iter() {
            self.send(*b)?;
        }
        for _ in 0..self.config.response_poll_bytes {
            let result = self.receive()?;
            if (result & R1_START_BIT) == 0 {
                return Ok(result);
            }
        }
        Ok(FILLER)
    }

    /// Clock in exactly `buffer.len()` bytes.
    pub fn read_response_bytes(&mut self, buffer: &mut [u8]) -> Result<(), Error> {
        for b in buffer.iter_mut() {
            *b = self.receive()?;
        }
        Ok(())
    }

    /// Spin until the card sends `expected`, gives up on anything else that
    /// isn't [`FILLER`], or the token timeout runs out.
    pub fn wait_for_token(&mut self, expected: u8) -> Result<(), Error> {
        let mut delay = Delay::new(self.config.token_timeout_us, self.config.poll_interval_us);
        loop {
            let s = self.receive()?;
            if s == expected {
                return Ok(());
            }
            if s != FILLER {
                return Err(Error::UnexpectedToken(s));
            }
            delay.delay(&mut self.delayer, Error::TimeoutDataToken)?;
        }
    }

    /// Spin until the card returns 0xFF, or the busy timeout runs out.
    pub fn wait_not_busy(&mut self) -> Result<(), Error> {
        let mut delay = Delay::new(self.config.busy_timeout_us, self.config.poll_interval_us);
        loop {
            let s = self.receive()?;
            if s == FILLER {
                break;
            }
            delay.delay(&mut self.delayer, Error::TimeoutWaitNotBusy)?;
        }
        Ok(())
    }

    /// Clock out idle bytes with chip select released, then hand over to
    /// SPI mode.
    fn reset(&mut self) -> Result<(), Error> {
        trace!("Reset card..");
        self.deselect()?;
        self.idle_clocks(RESET_CLOCK_BYTES)
    }

    /// CMD0. Anything but idle is suspicious, but later steps will tell us
    /// for sure.
    fn go_idle(&mut self) -> Result<(), Error> {
        let r1 = self.with_chip_select(1, |s| s.send_command(CMD0, 0, Some(CMD0_CRC)))?;
        self.report.cmd0_r1 = r1;
        if r1 != R1_IDLE_STATE {
            warn!("CMD0 got {:x}, expected idle", r1);
        }
        Ok(())
    }

    /// CMD8. Version 1 cards call this an illegal command and send no R7.
    fn check_interface_condition(&mut self) -> Result<(), Error> {
        let (r1, r7) = self.with_chip_select(2, |s| {
            let r1 = s.send_command(CMD8, CMD8_ARG, Some(CMD8_CRC))?;
            let mut r7 = [FILLER; 4];
            if r1 != FILLER && (r1 & R1_ILLEGAL_COMMAND) == 0 {
                s.read_response_bytes(&mut r7)?;
            }
            Ok((r1, r7))
        })?;
        self.report.cmd8_r1 = r1;
        self.report.r7 = r7;
        debug!("CMD8 R1 {:x}", r1);
        if r1 == FILLER {
            debug!("No response to CMD8, assuming legacy card");
        } else if (r1 & R1_ILLEGAL_COMMAND) != 0 {
            debug!("CMD8 illegal, legacy card");
        } else if r7[3] != CMD8_CHECK_PATTERN {
            warn!("CMD8 echo mismatch: {:?}", r7);
        }
        Ok(())
    }

    /// CMD55 + ACMD41 until the card leaves the idle state.
    fn wait_ready(&mut self) -> Result<(), Error> {
        let mut last_r1 = FILLER;
        for _attempt in 0..self.config.init_attempts {
            let r1 = self.with_chip_select(2, |s| {
                let _cmd55_r1 = s.send_command(CMD55, 0, None)?;
                s.send(FILLER)?;
                s.send_command(ACMD41, ACMD41_HCS, None)
            })?;
            trace!("ACMD41 attempt {} got {:x}", _attempt, r1);
            last_r1 = r1;
            self.report.acmd41_r1 = r1;
            if r1 == R1_READY_STATE {
                return Ok(());
            }
            self.delayer.delay_ms(self.config.init_retry_delay_ms);
        }
        Err(Error::CardNotReady(last_r1))
    }

    /// Send a command and insist on an R1 of ready.
    fn card_command_ready(&mut self, command: u8, arg: u32) -> Result<(), Error> {
        match self.send_command(command, arg, None)? {
            R1_READY_STATE => Ok(()),
            FILLER => Err(Error::TimeoutCommand(command)),
            r1 => Err(Error::RejectedCommand { command, r1 }),
        }
    }

    fn block_argument(&self, lba: u32) -> Result<u32, Error> {
        self.addressing
            .map(|mode| mode.block_argument(lba))
            .ok_or(Error::NotInitialised)
    }

    /// Perform a function that might error with the chipselect low.
    ///
    /// Sends one gap byte after selecting. Always releases the chipselect
    /// and clocks `trailing` idle bytes, even if the function errors.
    fn with_chip_select<F, R>(&mut self, trailing: usize, func: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Self) -> Result<R, Error>,
    {
        self.select()?;
        let result = self.send(FILLER).and_then(|_| func(self));
        let release = self.deselect().and_then(|_| self.idle_clocks(trailing));
        let value = result?;
        release?;
        Ok(value)
    }

    fn idle_clocks(&mut self, count: usize) -> Result<(), Error> {
        for _ in 0..count {
            self.send(FILLER)?;
        }
        Ok(())
    }

    fn select(&mut self) -> Result<(), Error> {
        self.transport.select().map_err(|_e| Error::Transport)
    }

    fn deselect(&mut self) -> Result<(), Error> {
        self.transport.deselect().map_err(|_e| Error::Transport)
    }

    /// Receive a byte from the SD card by clocking in an 0xFF byte.
    fn receive(&mut self) -> Result<u8, Error> {
        self.transfer(FILLER)
    }

    /// Send a byte to the SD card.
    fn send(&mut self, out: u8) -> Result<(), Error> {
        let _ = self.transfer(out)?;
        Ok(())
    }

    /// Send one byte and receive one byte.
    fn transfer(&mut self, out: u8) -> Result<u8, Error> {
        self.transport
            .exchange(out)
            .map_err(|_e| Error::Transport)
    }
}

impl<T, D> BlockDevice for SdCard<T, D>
where
    T: Transport,
    D: DelayNs,
{
    type Error = Error;

    /// Read one or more blocks, starting at the given block index.
    fn read(&mut self, blocks: &mut [Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        debug!("Read {} blocks @ {}", blocks.len(), start_block_idx.0);
        for (offset, block) in blocks.iter_mut().enumerate() {
            let lba = block_index(start_block_idx, offset)?;
            self.read_block(lba, block)?;
        }
        Ok(())
    }

    /// Write one or more blocks, starting at the given block index.
    fn write(&mut self, blocks: &[Block], start_block_idx: BlockIdx) -> Result<(), Self::Error> {
        debug!("Writing {} blocks @ {}", blocks.len(), start_block_idx.0);
        for (offset, block) in blocks.iter().enumerate() {
            let lba = block_index(start_block_idx, offset)?;
            self.write_block(lba, block)?;
        }
        Ok(())
    }
}

fn block_index(start: BlockIdx, offset: usize) -> Result<u32, Error> {
    u32::try_from(offset)
        .ok()
        .and_then(|offset| start.checked_add(BlockCount(offset)))
        .map(|idx| idx.0)
        .ok_or(Error::AddressOverflow)
}

/// Options for talking to the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Config {
    /// How many bytes to clock while waiting for an R1.
    pub response_poll_bytes: u32,
    /// How many times to send ACMD41 before giving up on the card.
    pub init_attempts: u32,
    /// How long to sleep between ACMD41 attempts.
    pub init_retry_delay_ms: u32,
    /// How long to wait for a data token after CMD17.
    pub token_timeout_us: u32,
    /// How long to wait for the card to finish programming a block.
    pub busy_timeout_us: u32,
    /// How long to sleep between polls while waiting for a token or for
    /// busy to clear.
    pub poll_interval_us: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            response_poll_bytes: 100,
            init_attempts: 100,
            init_retry_delay_ms: 10,
            token_timeout_us: 100_000,
            busy_timeout_us: 500_000,
            poll_interval_us: 10,
        }
    }
}

/// The steps of the initialisation handshake.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InitState {
    /// Nothing sent yet, or starting over.
    Reset,
    /// About to send GO_IDLE_STATE.
    SendCmd0,
    /// About to send SEND_IF_COND.
    SendCmd8,
    /// Polling APP_CMD + SD_SEND_OP_COND until the card is ready.
    AppCmdInitLoop,
    /// About to read the OCR.
    ReadOcr,
    /// Initialised. Block I/O will work.
    Ready,
    /// Something went wrong. Start again.
    Failed,
}

/// Responses seen during initialisation, for diagnostics.
///
/// Anything the card never sent reads as 0xFF.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InitReport {
    /// R1 from CMD0
    pub cmd0_r1: u8,
    /// R1 from CMD8
    pub cmd8_r1: u8,
    /// R7 from CMD8
    pub r7: R7,
    /// R1 from the last ACMD41
    pub acmd41_r1: u8,
    /// R1 from CMD58
    pub cmd58_r1: u8,
    /// OCR from CMD58
    pub ocr: Ocr,
}

impl InitReport {
    const fn new() -> InitReport {
        InitReport {
            cmd0_r1: FILLER,
            cmd8_r1: FILLER,
            r7: [FILLER; 4],
            acmd41_r1: FILLER,
            cmd58_r1: FILLER,
            ocr: [FILLER; 4],
        }
    }
}

/// The possible errors the card driver can generate.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    /// We got an error from the transport
    Transport,
    /// We didn't get a response when executing this command
    TimeoutCommand(u8),
    /// We didn't get a data token when reading a block
    TimeoutDataToken,
    /// We didn't get a response when waiting for the card to not be busy
    TimeoutWaitNotBusy,
    /// The card answered this command with an error
    RejectedCommand {
        /// The command index
        command: u8,
        /// What the card said
        r1: u8,
    },
    /// We were waiting for a data token and got this instead
    UnexpectedToken(u8),
    /// The card didn't accept our block (the data response token)
    WriteRejected(u8),
    /// The card never left the idle state (the last ACMD41 R1)
    CardNotReady(u8),
    /// Block I/O attempted before the addressing mode is known
    NotInitialised,
    /// A multi-block transfer ran past the last addressable block
    AddressOverflow,
}

impl Error {
    /// Did we give up waiting for the card, rather than being told no?
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::TimeoutCommand(_) | Error::TimeoutDataToken | Error::TimeoutWaitNotBusy
        )
    }
}

/// A time budget for busy-waiting on the card.
///
/// Each call sleeps for the poll interval and takes it off the budget.
struct Delay {
    remaining_us: u32,
    interval_us: u32,
}

impl Delay {
    fn new(budget_us: u32, interval_us: u32) -> Delay {
        Delay {
            remaining_us: budget_us,
            interval_us: interval_us.max(1),
        }
    }

    fn delay<T>(&mut self, delayer: &mut T, err: Error) -> Result<(), Error>
    where
        T: DelayNs,
    {
        if self.remaining_us == 0 {
            Err(err)
        } else {
            let step = self.interval_us.min(self.remaining_us);
            delayer.delay_us(step);
            self.remaining_us -= step;
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::VecDeque;

    /// Replies from a script, then 0xFF forever.
    #[derive(Default)]
    struct Scripted {
        replies: VecDeque<u8>,
        sent: std::vec::Vec<u8>,
        fail_at: Option<usize>,
        selected: bool,
        deselects: usize,
    }

    impl Scripted {
        fn new(parts: &[&[u8]]) -> Scripted {
            Scripted {
                replies: parts.iter().flat_map(|p| p.iter().cloned()).collect(),
                ..Default::default()
            }
        }
    }

    impl Transport for Scripted {
        fn exchange(&mut self, out: u8) -> Result<u8, TransportError> {
            if self.fail_at == Some(self.sent.len()) {
                self.fail_at = None;
                return Err(TransportError::Spi);
            }
            self.sent.push(out);
            Ok(self.replies.pop_front().unwrap_or(0xFF))
        }

        fn select(&mut self) -> Result<(), TransportError> {
            self.selected = true;
            Ok(())
        }

        fn deselect(&mut self) -> Result<(), TransportError> {
            self.selected = false;
            self.deselects += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeDelay {
        elapsed_ns: u64,
    }

    impl DelayNs for FakeDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.elapsed_ns += u64::from(ns);
        }
    }

    fn card(parts: &[&[u8]]) -> SdCard<Scripted, FakeDelay> {
        SdCard::new(Scripted::new(parts), FakeDelay::default())
    }

    const FF6: [u8; 6] = [0xFF; 6];

    #[test]
    fn r1_after_three_fillers() {
        let mut card = card(&[&FF6, &hex!("FF FF FF 01")]);
        assert_eq!(card.send_command(CMD0, 0, Some(CMD0_CRC)), Ok(0x01));
        let (t, _) = card.free();
        assert_eq!(t.sent.len(), 10);
        assert_eq!(&t.sent[0..6], &hex!("40 00 00 00 00 95"));
        assert!(t.sent[6..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn r1_on_third_poll() {
        let mut card = card(&[&FF6, &hex!("FF FF 01")]);
        assert_eq!(card.send_command(CMD0, 0, Some(CMD0_CRC)), Ok(0x01));
        let (t, _) = card.free();
        assert_eq!(t.sent.len(), 6 + 3);
    }

    #[test]
    fn r1_skips_bytes_with_top_bit_set() {
        // Only 0xFF is the idle line, but nothing with bit 7 set is an R1
        let mut card = card(&[&FF6, &hex!("FF 9F C1 05")]);
        assert_eq!(card.send_command(CMD17, 0, None), Ok(0x05));
        let (t, _) = card.free();
        assert_eq!(t.sent.len(), 6 + 4);
    }

    #[test]
    fn r1_never_arrives() {
        let mut card = card(&[]);
        assert_eq!(card.send_command(CMD58, 0, None), Ok(0xFF));
        let (t, _) = card.free();
        assert_eq!(t.sent.len(), 6 + 100);
    }

    #[test]
    fn r1_poll_bound_is_configurable() {
        let config = Config {
            response_poll_bytes: 8,
            ..Default::default()
        };
        let mut card = SdCard::new_with_config(Scripted::new(&[]), FakeDelay::default(), config);
        assert_eq!(card.send_command(CMD58, 0, None), Ok(0xFF));
        let (t, _) = card.free();
        assert_eq!(t.sent.len(), 6 + 8);
    }

    #[test]
    fn token_arrives() {
        let mut card = card(&[&hex!("FF FF FE")]);
        assert_eq!(card.wait_for_token(DATA_START_BLOCK), Ok(()));
        let (t, d) = card.free();
        assert_eq!(t.sent.len(), 3);
        assert_eq!(d.elapsed_ns, 20_000);
    }

    #[test]
    fn token_unexpected() {
        let mut card = card(&[&hex!("FF FF 0B")]);
        assert_eq!(
            card.wait_for_token(DATA_START_BLOCK),
            Err(Error::UnexpectedToken(0x0B))
        );
    }

    #[test]
    fn token_times_out() {
        let mut card = card(&[]);
        let err = card.wait_for_token(DATA_START_BLOCK).unwrap_err();
        assert_eq!(err, Error::TimeoutDataToken);
        assert!(err.is_timeout());
        let (t, d) = card.free();
        assert_eq!(d.elapsed_ns, 100_000 * 1000);
        // One poll per interval, plus the one that found the budget empty
        assert_eq!(t.sent.len(), 100_000 / 10 + 1);
    }

    #[test]
    fn busy_clears() {
        let mut card = card(&[&hex!("00 00 00 FF")]);
        assert_eq!(card.wait_not_busy(), Ok(()));
    }

    #[test]
    fn busy_forever() {
        let config = Config {
            busy_timeout_us: 1000,
            poll_interval_us: 100,
            ..Default::default()
        };
        let mut card =
            SdCard::new_with_config(Scripted::new(&[&[0u8; 64]]), FakeDelay::default(), config);
        assert_eq!(card.wait_not_busy(), Err(Error::TimeoutWaitNotBusy));
        let (t, d) = card.free();
        assert_eq!(t.sent.len(), 11);
        assert_eq!(d.elapsed_ns, 1_000_000);
    }

    #[test]
    fn block_io_needs_init() {
        let mut card = card(&[]);
        let mut block = Block::new();
        assert_eq!(card.read_block(0, &mut block), Err(Error::NotInitialised));
        assert_eq!(card.write_block(0, &block), Err(Error::NotInitialised));
        let (t, _) = card.free();
        assert!(t.sent.is_empty());
    }

    #[test]
    fn read_byte_addressed() {
        let mut data = [0u8; 512];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        // gap, frame, R1, token, data, crc
        let mut card = card(&[&[0xFF], &FF6, &[0x00, 0xFE], &data, &hex!("12 34")]);
        card.addressing = Some(AddressingMode::ByteAddressed);
        let mut block = Block::new();
        card.read_block(5, &mut block).unwrap();
        assert_eq!(block.contents, data);
        let (t, _) = card.free();
        assert_eq!(&t.sent[1..7], &command_frame(CMD17, 5 * 512, None));
        assert_eq!(t.sent.len(), 1 + 6 + 2 + 512 + 2 + 2);
        assert_eq!(t.deselects, 1);
        assert!(!t.selected);
    }

    #[test]
    fn read_rejected_releases_card() {
        let mut card = card(&[&[0xFF], &FF6, &[R1_ILLEGAL_COMMAND]]);
        card.addressing = Some(AddressingMode::BlockAddressed);
        let mut block = Block::new();
        assert_eq!(
            card.read_block(7, &mut block),
            Err(Error::RejectedCommand {
                command: CMD17,
                r1: R1_ILLEGAL_COMMAND
            })
        );
        let (t, _) = card.free();
        assert_eq!(&t.sent[1..7], &command_frame(CMD17, 7, None));
        assert!(!t.selected);
        assert_eq!(&t.sent[t.sent.len() - 2..], &[0xFF, 0xFF]);
    }

    #[test]
    fn read_no_r1() {
        let mut card = card(&[]);
        card.addressing = Some(AddressingMode::BlockAddressed);
        let mut block = Block::new();
        assert_eq!(
            card.read_block(0, &mut block),
            Err(Error::TimeoutCommand(CMD17))
        );
    }

    #[test]
    fn write_accepted() {
        let block = Block {
            contents: [0xA5; 512],
        };
        // gap, frame, R1, then gap + token + data + crc all echo 0xFF, then
        // the data response, then busy for a while
        let mut card = card(&[
            &[0xFF],
            &FF6,
            &[0x00],
            &[0xFF; 1 + 1 + 512 + 2],
            &[0xE5],
            &hex!("00 00 FF"),
        ]);
        card.addressing = Some(AddressingMode::BlockAddressed);
        assert_eq!(card.write_block(2053, &block), Ok(()));
        let (t, _) = card.free();
        assert_eq!(&t.sent[1..7], &command_frame(CMD24, 2053, None));
        let payload = &t.sent[8..];
        assert_eq!(payload[0], 0xFF);
        assert_eq!(payload[1], 0xFE);
        assert_eq!(&payload[2..514], &[0xA5; 512][..]);
        assert_eq!(&payload[514..516], &[0xFF, 0xFF]);
        assert!(!t.selected);
    }

    #[test]
    fn write_rejected() {
        let mut card = card(&[&[0xFF], &FF6, &[0x00], &[0xFF; 516], &[0x0B]]);
        card.addressing = Some(AddressingMode::ByteAddressed);
        assert_eq!(
            card.write_block(1, &Block::new()),
            Err(Error::WriteRejected(0x0B))
        );
        let (t, _) = card.free();
        assert_eq!(t.deselects, 1);
    }

    #[test]
    fn bus_fault_mid_block() {
        let mut card = card(&[&[0xFF], &FF6, &[0x00, 0xFE], &[0x5A; 512]]);
        card.addressing = Some(AddressingMode::BlockAddressed);
        // Part way through the data
        card.transport.fail_at = Some(1 + 6 + 2 + 100);
        let mut block = Block::new();
        assert_eq!(card.read_block(9, &mut block), Err(Error::Transport));
        let (t, _) = card.free();
        assert!(!t.selected);
        assert_eq!(t.deselects, 1);
        // The trailing clocks still went out after the fault
        assert_eq!(t.sent.len(), 1 + 6 + 2 + 100 + 2);
        assert_eq!(&t.sent[t.sent.len() - 2..], &[0xFF, 0xFF]);
    }

    #[test]
    fn step_from_failed_restarts() {
        let mut card = card(&[]);
        card.state = InitState::Failed;
        assert_eq!(card.step(), Ok(InitState::Reset));
        assert_eq!(card.step(), Ok(InitState::SendCmd0));
        let (t, _) = card.free();
        assert_eq!(t.sent, [0xFF; 10]);
        assert_eq!(t.deselects, 1);
    }

    #[test]
    fn timeouts_are_grouped() {
        assert!(Error::TimeoutCommand(17).is_timeout());
        assert!(Error::TimeoutWaitNotBusy.is_timeout());
        assert!(!Error::WriteRejected(0x0B).is_timeout());
        assert!(!Error::CardNotReady(0x01).is_timeout());
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
