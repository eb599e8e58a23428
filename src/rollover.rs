//! An append-only log file that rolls over when it gets too big.
//!
//! Records go to an active file (say `debug.log`). When a record would take
//! it past the threshold, the active file is renamed to the first free
//! archive name (`debug_0001.log`, `debug_0002.log`, ...) and a fresh active
//! file is started.
//!
//! This module knows nothing about SD cards. All file access goes through a
//! [`LogFileOps`] you supply, which usually wraps whatever filesystem sits
//! on top of the media driver.

use core::fmt::Write;

use crate::{debug, trace, warn};

/// Longest active file name, in bytes.
pub const MAX_NAME_LEN: usize = 31;
/// Longest archive prefix, in bytes.
pub const MAX_PREFIX_LEN: usize = 15;
/// Archive indices must stay below this, to fit in four digits.
pub const ARCHIVE_INDEX_LIMIT: u16 = 10000;

/// A file name we can hold without allocating.
pub type FileName = heapless::String<MAX_NAME_LEN>;

/// The file operations the log needs.
///
/// There is at most one open file at a time, so `write`, `flush` and `close`
/// apply to whichever file `open_append` opened last.
pub trait LogFileOps {
    /// The errors the filesystem can return.
    type Error: core::fmt::Debug;
    /// Open an existing file, positioned at the end.
    fn open_append(&mut self, name: &str) -> Result<(), Self::Error>;
    /// Create a new, empty file. Doesn't open it.
    fn create(&mut self, name: &str) -> Result<(), Self::Error>;
    /// Close the open file.
    fn close(&mut self) -> Result<(), Self::Error>;
    /// Append to the open file.
    fn write(&mut self, data: &[u8]) -> Result<(), Self::Error>;
    /// Push anything buffered for the open file out to the media.
    fn flush(&mut self) -> Result<(), Self::Error>;
    /// Rename a closed file.
    fn rename(&mut self, old_name: &str, new_name: &str) -> Result<(), Self::Error>;
    /// Is there a file with this name?
    fn exists(&mut self, name: &str) -> Result<bool, Self::Error>;
    /// How big is this file, in bytes?
    fn get_size(&mut self, name: &str) -> Result<u32, Self::Error>;
}

/// Ways the log can fail.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RolloverError<E>
where
    E: core::fmt::Debug,
{
    /// The active file name or archive prefix is too long.
    NameTooLong,
    /// Every archive name up to index 9999 is taken.
    ArchivesExhausted,
    /// The filesystem returned an error.
    Io(E),
}

impl<E> From<E> for RolloverError<E>
where
    E: core::fmt::Debug,
{
    fn from(value: E) -> RolloverError<E> {
        RolloverError::Io(value)
    }
}

/// An append-only log with size-based rollover.
#[derive(Debug, Clone)]
pub struct RolloverLog {
    threshold_bytes: u32,
    current_size: u32,
    next_archive_index: u16,
    is_open: bool,
    active_name: FileName,
    archive_prefix: heapless::String<MAX_PREFIX_LEN>,
}

impl RolloverLog {
    /// Set up a log. Nothing is touched on the filesystem until the first
    /// record is written.
    pub fn new<E>(
        threshold_bytes: u32,
        active_name: &str,
        archive_prefix: &str,
    ) -> Result<RolloverLog, RolloverError<E>>
    where
        E: core::fmt::Debug,
    {
        let active_name =
            heapless::String::try_from(active_name).map_err(|_| RolloverError::NameTooLong)?;
        let archive_prefix =
            heapless::String::try_from(archive_prefix).map_err(|_| RolloverError::NameTooLong)?;
        Ok(RolloverLog {
            threshold_bytes,
            current_size: 0,
            next_archive_index: 1,
            is_open: false,
            active_name,
            archive_prefix,
        })
    }

    /// The name records are currently written to.
    pub fn active_name(&self) -> &str {
        &self.active_name
    }

    /// How big we think the active file is.
    pub fn current_size(&self) -> u32 {
        self.current_size
    }

    /// Where the next search for a free archive name will start.
    pub fn next_archive_index(&self) -> u16 {
        self.next_archive_index
    }

    /// Is the active file open?
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Make sure the active file exists and is open for append.
    ///
    /// Picks up the size of any existing file, so rollover still happens at
    /// the right point after a reboot.
    pub fn open_if_needed<F>(&mut self, ops: &mut F) -> Result<(), RolloverError<F::Error>>
    where
        F: LogFileOps,
    {
        if self.is_open {
            return Ok(());
        }
        if !ops.exists(&self.active_name)? {
            debug!("Creating {}", self.active_name.as_str());
            ops.create(&self.active_name)?;
        }
        ops.open_append(&self.active_name)?;
        self.is_open = true;
        self.current_size = match ops.get_size(&self.active_name) {
            Ok(size) => size,
            Err(_) => {
                warn!("Can't get size of {}", self.active_name.as_str());
                0
            }
        };
        Ok(())
    }

    /// Append a record, rolling over first if it wouldn't fit.
    ///
    /// An empty record does nothing at all.
    pub fn write_record<F>(
        &mut self,
        ops: &mut F,
        record: &[u8],
    ) -> Result<(), RolloverError<F::Error>>
    where
        F: LogFileOps,
    {
        if record.is_empty() {
            return Ok(());
        }
        self.open_if_needed(ops)?;
        let len = u32::try_from(record.len()).unwrap_or(u32::MAX);
        if self.current_size.saturating_add(len) > self.threshold_bytes {
            self.roll_over(ops)?;
        }
        ops.write(record)?;
        self.current_size = self.current_size.saturating_add(len);
        Ok(())
    }

    /// Flush and close the active file, if it's open.
    pub fn flush_and_close<F>(&mut self, ops: &mut F) -> Result<(), RolloverError<F::Error>>
    where
        F: LogFileOps,
    {
        if self.is_open {
            self.close_quietly(ops);
        }
        Ok(())
    }

    /// Archive the active file and start a new one.
    fn roll_over<F>(&mut self, ops: &mut F) -> Result<(), RolloverError<F::Error>>
    where
        F: LogFileOps,
    {
        if self.is_open {
            self.close_quietly(ops);
        }
        let archive_name = self.find_archive_name(ops)?;
        debug!(
            "Rolling {} over to {}",
            self.active_name.as_str(),
            archive_name.as_str()
        );
        ops.rename(&self.active_name, &archive_name)?;
        ops.create(&self.active_name)?;
        ops.open_append(&self.active_name)?;
        self.is_open = true;
        self.current_size = 0;
        Ok(())
    }

    /// Flush and close, carrying on regardless. The rename that follows is
    /// what matters.
    fn close_quietly<F>(&mut self, ops: &mut F)
    where
        F: LogFileOps,
    {
        if ops.flush().is_err() {
            warn!("Flush failed");
        }
        if ops.close().is_err() {
            warn!("Close failed");
        }
        self.is_open = false;
    }

    /// The first archive name at or after `next_archive_index` that isn't
    /// taken.
    fn find_archive_name<F>(&mut self, ops: &mut F) -> Result<FileName, RolloverError<F::Error>>
    where
        F: LogFileOps,
    {
        for index in self.next_archive_index..ARCHIVE_INDEX_LIMIT {
            let name = archive_name(&self.archive_prefix, index)?;
            if !ops.exists(&name)? {
                self.next_archive_index = index + 1;
                return Ok(name);
            }
            trace!("{} already exists", name.as_str());
        }
        Err(RolloverError::ArchivesExhausted)
    }
}

/// `<prefix><NNNN>.log`
fn archive_name<E>(prefix: &str, index: u16) -> Result<FileName, RolloverError<E>>
where
    E: core::fmt::Debug,
{
    let mut name = FileName::new();
    write!(name, "{}{:04}.log", prefix, index).map_err(|_| RolloverError::NameTooLong)?;
    Ok(name)
}


// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
