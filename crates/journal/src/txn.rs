//! Write-side transactions: buffered update streams journaled as chained
//! `TX` containers.
//!
//! Updates accumulate in memory and are flushed as one container at commit.
//! A transaction outgrowing [`crate::Options::tx_chunk_size`] flushes early;
//! later chunks back-chain to earlier ones so replay can reassemble the
//! stream in order regardless of how many segments it crosses.

use log::{debug, warn};
use tanoak_core::clock::Timestamp;
use tanoak_core::key::{AntiValue, Key};
use tanoak_core::page::TreeHandle;

use crate::error::JournalError;
use crate::journal::Journal;
use crate::record::{AccumulatorKind, JournalAddress, Update};
use crate::repo::Repo;

/// Rollback retries before a transaction is abandoned.
const MAX_ATTEMPTS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TxPhase {
    Active,
    Finished,
}

/// One open transaction.
///
/// Dropped without [`commit`](Self::commit), the transaction rolls back.
pub struct Transaction<'j, R: Repo> {
    journal: &'j Journal<R>,
    start_ts: Timestamp,
    buffer: Vec<u8>,
    /// Address of the latest flushed chunk, zero while none was flushed.
    last_chunk: JournalAddress,
    /// Whether the `TS` record is in the journal yet. Nothing is journaled
    /// for a transaction that never buffers an update.
    started: bool,
    phase: TxPhase,
}

impl<'j, R: Repo> Transaction<'j, R> {
    pub(crate) fn begin(journal: &'j Journal<R>) -> Self {
        Self {
            journal,
            start_ts: journal.clock().next(),
            buffer: Vec::new(),
            last_chunk: 0,
            started: false,
            phase: TxPhase::Active,
        }
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Journal a key/value store against `tree`.
    pub fn store(&mut self, tree: TreeHandle, key: &Key, value: &[u8]) -> Result<(), JournalError> {
        self.push(Update::Store {
            tree,
            key: key.encoded().to_vec(),
            value: value.to_vec(),
        })
    }

    /// Journal the removal of the key range `[key1, key2]` from `tree`.
    /// The upper bound is stored with its common prefix elided.
    pub fn remove_key_range(&mut self, tree: TreeHandle, key1: &Key, key2: &Key) -> Result<(), JournalError> {
        let anti = AntiValue::between(key1, key2)
            .map_err(|_| JournalError::InvalidState("range bound exceeds maximum key length"))?;
        self.push(Update::RangeDelete {
            tree,
            elision: anti.elision(),
            key1: key1.encoded().to_vec(),
            key2_suffix: anti.suffix().to_vec(),
        })
    }

    /// Journal the removal of the whole `tree`.
    pub fn remove_tree(&mut self, tree: TreeHandle) -> Result<(), JournalError> {
        self.push(Update::TreeDelete { tree })
    }

    /// Journal an accumulator delta. A delta of one is stored in the
    /// compact form.
    pub fn delta(
        &mut self,
        tree: TreeHandle,
        accumulator: AccumulatorKind,
        index: u32,
        value: i64,
    ) -> Result<(), JournalError> {
        self.push(if value == 1 {
            Update::DeltaOne {
                tree,
                accumulator,
                index,
            }
        } else {
            Update::DeltaValue {
                tree,
                accumulator,
                index,
                value,
            }
        })
    }

    fn push(&mut self, update: Update) -> Result<(), JournalError> {
        if self.phase != TxPhase::Active {
            return Err(JournalError::InvalidState("transaction already finished"));
        }
        update.encode(self.start_ts, &mut self.buffer);
        if self.buffer.len() >= self.journal.options().tx_chunk_size {
            self.flush_chunk(0)?;
        }
        Ok(())
    }

    /// Journal the buffered updates as one `TX` container, chained to any
    /// previously flushed chunk.
    fn flush_chunk(&mut self, commit_ts: Timestamp) -> Result<(), JournalError> {
        if !self.started {
            self.journal.write_tx_start(self.start_ts)?;
            self.started = true;
        }
        let backchain = self.last_chunk;
        let updates = std::mem::take(&mut self.buffer);
        self.last_chunk = self.journal.write_tx_chunk(self.start_ts, commit_ts, backchain, updates)?;
        Ok(())
    }

    /// Commit: flush the remaining updates and journal the commit record.
    ///
    /// A transaction that journaled nothing commits without touching the
    /// journal at all. Returns the commit timestamp.
    pub fn commit(mut self) -> Result<Timestamp, JournalError> {
        if self.phase != TxPhase::Active {
            return Err(JournalError::InvalidState("transaction already finished"));
        }
        let commit_ts = self.journal.clock().next();
        if !self.buffer.is_empty() {
            self.flush_chunk(commit_ts)?;
        }
        if self.started {
            self.journal.write_tx_commit(self.start_ts, commit_ts)?;
        }
        self.phase = TxPhase::Finished;
        Ok(commit_ts)
    }

    /// Roll back: erase the transaction from the plan. A transaction that
    /// journaled nothing rolls back without touching the journal.
    pub fn rollback(mut self) -> Result<(), JournalError> {
        self.rollback_in_place()
    }

    fn rollback_in_place(&mut self) -> Result<(), JournalError> {
        if self.phase != TxPhase::Active {
            return Err(JournalError::InvalidState("transaction already finished"));
        }
        self.phase = TxPhase::Finished;
        self.buffer.clear();
        if self.started {
            self.journal.write_tx_rollback(self.start_ts)?;
        }
        Ok(())
    }
}

impl<R: Repo> Drop for Transaction<'_, R> {
    fn drop(&mut self) {
        if self.phase == TxPhase::Active {
            debug!("rolling back abandoned transaction ts={}", self.start_ts);
            if let Err(e) = self.rollback_in_place() {
                warn!("rollback of abandoned transaction ts={} failed: {e}", self.start_ts);
            }
        }
    }
}

/// Run `body` transactionally, retrying on [`JournalError::Rollback`].
///
/// The rollback signal is caught and the body retried with a fresh
/// transaction, up to a small bound; exhausting it surfaces
/// [`JournalError::TransactionFailed`]. Every other error rolls back and
/// propagates.
pub fn run_transaction<R, T, F>(journal: &Journal<R>, mut body: F) -> Result<T, JournalError>
where
    R: Repo,
    F: FnMut(&mut Transaction<'_, R>) -> Result<T, JournalError>,
{
    for attempt in 1..=MAX_ATTEMPTS {
        let mut tx = journal.begin_transaction();
        match body(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                return Ok(value);
            }
            Err(JournalError::Rollback) => {
                debug!("transaction rolled back, attempt {attempt}/{MAX_ATTEMPTS}");
                tx.rollback()?;
            }
            Err(e) => {
                tx.rollback()?;
                return Err(e);
            }
        }
    }
    Err(JournalError::TransactionFailed {
        attempts: MAX_ATTEMPTS,
    })
}
