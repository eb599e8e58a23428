//! Finding the filesystem on a card.
//!
//! Block 0 of an SD card is either a Master Boot Record, with a partition
//! table at the end, or (on cards formatted as a "superfloppy") the FAT
//! volume boot record itself.

use byteorder::{ByteOrder, LittleEndian};

use crate::{debug, Block, BlockDevice, BlockIdx};

const PARTITION1_START: usize = 446;
const PARTITION_INFO_LENGTH: usize = 16;
const PARTITION_INFO_TYPE_INDEX: usize = 4;
const PARTITION_INFO_LBA_START_INDEX: usize = 8;
const PARTITION_INFO_NUM_BLOCKS_INDEX: usize = 12;
const MAX_PARTITIONS: usize = 4;

const FOOTER_START: usize = 510;
const FOOTER: [u8; 2] = [0x55, 0xAA];

/// Short jump, as found at the start of every FAT boot sector.
const JUMP_SHORT: u8 = 0xEB;
/// Near jump, as found on some older boot sectors.
const JUMP_NEAR: u8 = 0xE9;

/// BPB_TotSec16
const BPB_TOTAL_SECTORS_16: usize = 19;
/// BPB_TotSec32, used when the 16-bit field is zero.
const BPB_TOTAL_SECTORS_32: usize = 32;
/// exFAT VolumeLength. Both FAT fields are zero on an exFAT volume.
const EXFAT_VOLUME_LENGTH: usize = 72;

/// Where a filesystem lives on the card.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Partition {
    /// The first block of the filesystem.
    pub start_lba: u32,
    /// How many blocks the filesystem covers.
    pub sector_count: u32,
    /// The MBR partition type byte. Zero for an unpartitioned card.
    pub partition_type: u8,
}

/// Ways finding a partition can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PartitionError<E>
where
    E: core::fmt::Debug,
{
    /// The underlying block device threw an error.
    Device(E),
    /// Block 0 is neither a boot record nor a partition table.
    NotAPartitionTable,
    /// MBR partition tables only have four entries.
    NoSuchPartition,
    /// The boot record says the filesystem has no sectors.
    EmptyVolume,
}

impl<E> From<E> for PartitionError<E>
where
    E: core::fmt::Debug,
{
    fn from(value: E) -> PartitionError<E> {
        PartitionError::Device(value)
    }
}

/// Read block 0 of the device and work out where the filesystem is.
///
/// Only the first partition table entry is considered.
pub fn locate_partition<D>(device: &mut D) -> Result<Partition, PartitionError<D::Error>>
where
    D: BlockDevice,
{
    let mut blocks = [Block::new()];
    device.read(&mut blocks, BlockIdx(0))?;
    let partition = parse_boot_sector(&blocks[0])?;
    if partition.sector_count == 0 {
        return Err(PartitionError::EmptyVolume);
    }
    debug!(
        "Partition type {:x} at {} for {} blocks",
        partition.partition_type, partition.start_lba, partition.sector_count
    );
    Ok(partition)
}

/// Work out where the filesystem is from the contents of block 0.
pub fn parse_boot_sector<E>(block: &Block) -> Result<Partition, PartitionError<E>>
where
    E: core::fmt::Debug,
{
    let data = &block.contents;
    if data[0] == JUMP_SHORT || data[0] == JUMP_NEAR {
        debug!("Block 0 is a volume boot record");
        let total_16 = LittleEndian::read_u16(&data[BPB_TOTAL_SECTORS_16..]);
        let total_32 = LittleEndian::read_u32(&data[BPB_TOTAL_SECTORS_32..]);
        let sector_count = if total_16 != 0 {
            u32::from(total_16)
        } else if total_32 != 0 {
            total_32
        } else {
            // exFAT. We can only address the first 2 TiB.
            let volume_length = LittleEndian::read_u64(&data[EXFAT_VOLUME_LENGTH..]);
            u32::try_from(volume_length).unwrap_or(u32::MAX)
        };
        return Ok(Partition {
            start_lba: 0,
            sector_count,
            partition_type: 0,
        });
    }
    partition_entry(block, 0)
}

/// Read entry `idx` (0 to 3) of the partition table in block 0.
///
/// The entry is returned even if it is empty.
pub fn partition_entry<E>(block: &Block, idx: usize) -> Result<Partition, PartitionError<E>>
where
    E: core::fmt::Debug,
{
    // We only support Master Boot Record (MBR) partitioned cards, not
    // GUID Partition Table (GPT)
    let data = &block.contents;
    if data[FOOTER_START..FOOTER_START + 2] != FOOTER {
        return Err(PartitionError::NotAPartitionTable);
    }
    if idx >= MAX_PARTITIONS {
        return Err(PartitionError::NoSuchPartition);
    }
    let start = PARTITION1_START + (idx * PARTITION_INFO_LENGTH);
    let partition = &data[start..(start + PARTITION_INFO_LENGTH)];
    Ok(Partition {
        start_lba: LittleEndian::read_u32(
            &partition[PARTITION_INFO_LBA_START_INDEX..(PARTITION_INFO_LBA_START_INDEX + 4)],
        ),
        sector_count: LittleEndian::read_u32(
            &partition[PARTITION_INFO_NUM_BLOCKS_INDEX..(PARTITION_INFO_NUM_BLOCKS_INDEX + 4)],
        ),
        partition_type: partition[PARTITION_INFO_TYPE_INDEX],
    })
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
