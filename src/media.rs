//! The media driver a filesystem talks to.
//!
//! A filesystem hands us a [`MediaRequest`] naming what it wants done, and
//! we hand it back with the status filled in. Sector numbers in a request
//! are relative to the start of the partition found by [`mount`].

use crate::sdcard::{Error as SdCardError, SdCard, Transport};
use crate::{debug, warn};
use crate::{locate_partition, Block, BlockCount, BlockIdx, Partition, PartitionError};
use embedded_hal::delay::DelayNs;

/// What the driver knows about a mounted card.
///
/// Made by [`mount`], and referenced by every request.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct DriverContext {
    /// The block where logical sector 0 lives.
    pub partition_start_lba: u32,
    /// How many sectors the filesystem may use.
    pub partition_sector_count: u32,
    /// Set once the card and its partition are known. The driver won't
    /// touch the card for a context where this is clear.
    pub initialized: bool,
}

impl DriverContext {
    /// A context for a card whose partition we've just found.
    pub fn from_partition(partition: &Partition) -> DriverContext {
        DriverContext {
            partition_start_lba: partition.start_lba,
            partition_sector_count: partition.sector_count,
            initialized: true,
        }
    }

    /// The physical block holding `logical_sector`, provided the whole run
    /// of `sector_count` sectors sits inside the partition.
    pub fn physical_lba(&self, logical_sector: u32, sector_count: u32) -> Option<u32> {
        let end = logical_sector.checked_add(sector_count)?;
        if end > self.partition_sector_count {
            return None;
        }
        let first = BlockIdx(self.partition_start_lba).checked_add(BlockCount(logical_sector))?;
        if sector_count > 0 {
            first.checked_add(BlockCount(sector_count - 1))?;
        }
        Some(first.0)
    }
}

/// The things a filesystem can ask of its media.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestKind {
    /// The media is being opened. Report the geometry.
    Init,
    /// The media is being closed.
    Uninit,
    /// Read sectors.
    Read,
    /// Read the boot sector.
    BootRead,
    /// Write sectors.
    Write,
    /// Write the boot sector.
    BootWrite,
    /// Make sure everything written so far is on the card.
    Flush,
    /// Give up on whatever is in progress.
    Abort,
    /// Something we've never heard of. Holds the raw request code.
    Unknown(u32),
}

/// The data a request carries, if any.
#[derive(Debug)]
pub enum MediaBuffer<'a> {
    /// No buffer.
    None,
    /// Somewhere to put the sectors we read.
    Read(&'a mut [u8]),
    /// The sectors to write.
    Write(&'a [u8]),
}

/// How a request turned out.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MediaStatus {
    /// It worked.
    Success,
    /// The card failed somewhere in the request. Assume no sectors were
    /// transferred.
    IoError,
    /// We don't do that.
    NotImplemented,
    /// The context or the buffer was missing, or the buffer was the wrong
    /// kind or too short.
    PtrError,
}

/// One request from the filesystem.
#[derive(Debug)]
pub struct MediaRequest<'a> {
    /// What to do.
    pub kind: RequestKind,
    /// The first sector, counted from the start of the partition.
    pub logical_sector: u32,
    /// How many sectors.
    pub sector_count: u32,
    /// Where the sector data comes from or goes to.
    pub buffer: MediaBuffer<'a>,
    /// The mounted card this request is for.
    pub context: Option<&'a DriverContext>,
    /// Written by [`MediaDriver::dispatch`].
    pub status: MediaStatus,
    /// Written on [`RequestKind::Init`].
    pub bytes_per_sector: u32,
    /// Written on [`RequestKind::Init`].
    pub total_sectors: u32,
}

impl<'a> MediaRequest<'a> {
    /// A request with no sectors and no buffer.
    pub fn new(kind: RequestKind, context: &'a DriverContext) -> MediaRequest<'a> {
        MediaRequest {
            kind,
            logical_sector: 0,
            sector_count: 0,
            buffer: MediaBuffer::None,
            context: Some(context),
            status: MediaStatus::IoError,
            bytes_per_sector: 0,
            total_sectors: 0,
        }
    }

    /// Set the run of sectors this request covers.
    pub fn with_sectors(mut self, logical_sector: u32, sector_count: u32) -> MediaRequest<'a> {
        self.logical_sector = logical_sector;
        self.sector_count = sector_count;
        self
    }

    /// Attach the data buffer.
    pub fn with_buffer(mut self, buffer: MediaBuffer<'a>) -> MediaRequest<'a> {
        self.buffer = buffer;
        self
    }
}

/// Turns [`MediaRequest`]s into block I/O on an [`SdCard`].
pub struct MediaDriver<T, D>
where
    T: Transport,
    D: DelayNs,
{
    card: SdCard<T, D>,
}

impl<T, D> MediaDriver<T, D>
where
    T: Transport,
    D: DelayNs,
{
    /// Wrap a card. It should already be mounted.
    pub fn new(card: SdCard<T, D>) -> MediaDriver<T, D> {
        MediaDriver { card }
    }

    /// Get at the card, say to re-mount it.
    pub fn card(&mut self) -> &mut SdCard<T, D> {
        &mut self.card
    }

    /// Give back the card.
    pub fn free(self) -> SdCard<T, D> {
        self.card
    }

    /// Carry out a request, and set its status.
    ///
    /// Nothing here retries. The first failing sector ends the request.
    pub fn dispatch(&mut self, request: &mut MediaRequest<'_>) {
        request.status = self.handle(request);
        debug!("{:?} -> {:?}", request.kind, request.status);
    }

    fn handle(&mut self, request: &mut MediaRequest<'_>) -> MediaStatus {
        let Some(context) = request.context else {
            warn!("{:?} request with no context", request.kind);
            return MediaStatus::PtrError;
        };
        let needs_card = matches!(
            request.kind,
            RequestKind::Init
                | RequestKind::Read
                | RequestKind::BootRead
                | RequestKind::Write
                | RequestKind::BootWrite
        );
        if needs_card && !context.initialized {
            warn!("{:?} request for a card that isn't mounted", request.kind);
            return MediaStatus::IoError;
        }
        match request.kind {
            RequestKind::Init => match self.card.read_ocr() {
                Ok(_) => {
                    request.bytes_per_sector = Block::LEN_U32;
                    request.total_sectors = context.partition_sector_count;
                    MediaStatus::Success
                }
                Err(_e) => {
                    warn!("Init could not read the OCR: {:?}", _e);
                    MediaStatus::IoError
                }
            },
            RequestKind::Uninit => MediaStatus::Success,
            // Writes don't return until the card has finished programming
            RequestKind::Flush => MediaStatus::Success,
            RequestKind::Read | RequestKind::BootRead => {
                let MediaBuffer::Read(buffer) = &mut request.buffer else {
                    return MediaStatus::PtrError;
                };
                self.read_sectors(context, request.logical_sector, request.sector_count, buffer)
            }
            RequestKind::Write | RequestKind::BootWrite => {
                let MediaBuffer::Write(buffer) = &request.buffer else {
                    return MediaStatus::PtrError;
                };
                self.write_sectors(context, request.logical_sector, request.sector_count, buffer)
            }
            RequestKind::Abort | RequestKind::Unknown(_) => MediaStatus::NotImplemented,
        }
    }

    fn read_sectors(
        &mut self,
        context: &DriverContext,
        logical_sector: u32,
        sector_count: u32,
        buffer: &mut [u8],
    ) -> MediaStatus {
        if !buffer_fits(buffer.len(), sector_count) {
            return MediaStatus::PtrError;
        }
        let Some(first) = context.physical_lba(logical_sector, sector_count) else {
            warn!(
                "Read of {} sectors at {} is outside the partition",
                sector_count, logical_sector
            );
            return MediaStatus::IoError;
        };
        let mut block = Block::new();
        for (offset, chunk) in buffer
            .chunks_exact_mut(Block::LEN)
            .take(sector_count as usize)
            .enumerate()
        {
            let lba = first + offset as u32;
            if let Err(_e) = self.card.read_block(lba, &mut block) {
                warn!("Read of block {} failed: {:?}", lba, _e);
                return MediaStatus::IoError;
            }
            chunk.copy_from_slice(&block.contents);
        }
        MediaStatus::Success
    }

    fn write_sectors(
        &mut self,
        context: &DriverContext,
        logical_sector: u32,
        sector_count: u32,
        buffer: &[u8],
    ) -> MediaStatus {
        if !buffer_fits(buffer.len(), sector_count) {
            return MediaStatus::PtrError;
        }
        let Some(first) = context.physical_lba(logical_sector, sector_count) else {
            warn!(
                "Write of {} sectors at {} is outside the partition",
                sector_count, logical_sector
            );
            return MediaStatus::IoError;
        };
        let mut block = Block::new();
        for (offset, chunk) in buffer
            .chunks_exact(Block::LEN)
            .take(sector_count as usize)
            .enumerate()
        {
            let lba = first + offset as u32;
            block.contents.copy_from_slice(chunk);
            if let Err(_e) = self.card.write_block(lba, &block) {
                warn!("Write of block {} failed: {:?}", lba, _e);
                return MediaStatus::IoError;
            }
        }
        MediaStatus::Success
    }
}

fn buffer_fits(len: usize, sector_count: u32) -> bool {
    usize::try_from(sector_count)
        .ok()
        .and_then(|count| count.checked_mul(Block::LEN))
        .map_or(false, |needed| len >= needed)
}

/// Why a card could not be mounted.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MountError {
    /// The card didn't initialise.
    Card(SdCardError),
    /// The card came up, but we couldn't find a filesystem on it.
    Partition(PartitionError<SdCardError>),
}

impl From<PartitionError<SdCardError>> for MountError {
    fn from(value: PartitionError<SdCardError>) -> MountError {
        MountError::Partition(value)
    }
}

/// Bring a card up and find its filesystem.
///
/// On failure, start again from the top; there is nothing useful to retry
/// piecemeal.
pub fn mount<T, D>(card: &mut SdCard<T, D>) -> Result<DriverContext, MountError>
where
    T: Transport,
    D: DelayNs,
{
    card.acquire().map_err(MountError::Card)?;
    let partition = locate_partition(card)?;
    let context = DriverContext::from_partition(&partition);
    debug!("Mounted: {:?}", context);
    Ok(context)
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
