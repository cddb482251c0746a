//! Error taxonomy of the journal subsystem.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::record::JournalAddress;

/// Human-readable location of a journal byte address, resolved against the
/// journal's block size. Used in error messages only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileAddress {
    pub generation: u64,
    pub offset: u64,
    pub timestamp: u64,
}

impl FileAddress {
    pub fn resolve(address: JournalAddress, block_size: u64, timestamp: u64) -> Self {
        Self {
            generation: address / block_size,
            offset: address % block_size,
            timestamp,
        }
    }
}

impl fmt::Display for FileAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "generation {} offset {} (ts {})",
            self.generation, self.offset, self.timestamp
        )
    }
}

/// Errors of the mediated file channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The calling session was interrupted. Delivered at most once per
    /// interrupt, and only to the interrupted caller.
    #[error("operation interrupted")]
    Interrupted,
    /// The channel was closed explicitly; it will not reopen.
    #[error("channel is closed")]
    Closed,
    /// The operation is not supported by design.
    #[error("operation not supported")]
    Unsupported,
}

/// A single record failed the codec invariants.
#[derive(Debug, Error)]
#[error("corrupt record at offset {offset}: {reason}")]
pub struct CorruptRecord {
    pub reason: String,
    pub offset: u64,
}

impl CorruptRecord {
    pub fn new(offset: u64, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            offset,
        }
    }
}

/// A structural invariant of the journal was violated.
#[derive(Debug, Error)]
#[error("corrupt journal at address {address}: {reason}")]
pub struct CorruptJournal {
    pub reason: String,
    pub address: JournalAddress,
}

impl CorruptJournal {
    pub fn new(address: JournalAddress, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            address,
        }
    }
}

/// Umbrella error of the journal manager, recovery and replay paths.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("operation interrupted")]
    Interrupted,
    #[error(transparent)]
    Record(#[from] CorruptRecord),
    #[error(transparent)]
    Journal(#[from] CorruptJournal),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Internal signal: the transaction must be retried.
    #[error("transaction signalled rollback")]
    Rollback,
    /// Too many rollback retries.
    #[error("transaction failed after {attempts} attempts")]
    TransactionFailed { attempts: u32 },
}

impl From<ChannelError> for JournalError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Io(e) => JournalError::Io(e),
            ChannelError::Interrupted => JournalError::Interrupted,
            ChannelError::Closed => {
                JournalError::Io(io::Error::new(io::ErrorKind::NotConnected, "channel is closed"))
            }
            ChannelError::Unsupported => {
                JournalError::Io(io::Error::new(io::ErrorKind::Unsupported, "operation not supported"))
            }
        }
    }
}
