//! The durability core of the tanoak storage engine: a segmented
//! write-ahead journal, crash recovery with commit-ordered replay, and the
//! background cleanup engine.
//!
//! Foreground mutators journal their updates through [`txn::Transaction`];
//! on restart, [`recovery::RecoveryPlan`] scans the journal from the last
//! checkpoint cut and replays every committed transaction, in commit order,
//! through a [`player::ReplayListener`]. [`cleanup::CleanupManager`] drains
//! deferred B-tree maintenance in the background.

use std::time::Duration;

pub mod channel;
pub mod cleanup;
pub mod error;
pub mod journal;
pub mod player;
pub mod record;
pub mod recovery;
pub mod repo;
pub mod txn;

#[cfg(test)]
mod tests;

pub use crate::{
    channel::MediatedFile,
    cleanup::{CleanupAction, CleanupManager, CleanupStats},
    error::{ChannelError, CorruptJournal, CorruptRecord, JournalError},
    journal::{CheckpointMark, Journal, JournalStats},
    player::{ReplayListener, TransactionMapItem, TransactionPlayer},
    record::JournalAddress,
    recovery::{RecoveryPlan, RecoveryStats},
    txn::{run_transaction, Transaction},
};

/// Journal configuration.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Maximum size in bytes of one journal segment file. A record never
    /// straddles segments; when the current file cannot hold the next
    /// record it is sealed and a new generation opened.
    ///
    /// Default: 1 GiB
    pub block_size: u64,
    /// Inhibit copy-back and segment deletion entirely. Used while a
    /// backup walks the journal, or to preserve history for diagnosis.
    ///
    /// Default: `false`
    pub append_only: bool,
    /// Fsync the current segment after every commit record.
    ///
    /// Default: `true`
    pub sync_on_commit: bool,
    /// Buffered update bytes beyond which an open transaction flushes an
    /// early, back-chained container.
    ///
    /// Default: 64 KiB
    pub tx_chunk_size: usize,
    /// How often the maintenance tick writes a checkpoint.
    ///
    /// Default: 120 s
    pub checkpoint_interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            block_size: 1024 * 1024 * 1024,
            append_only: false,
            sync_on_commit: true,
            tx_chunk_size: 64 * 1024,
            checkpoint_interval: Duration::from_secs(120),
        }
    }
}
