//! Replay of one journaled transaction through a listener.
//!
//! The player walks a transaction's `TX` chain backwards from its last
//! chunk, validates the chain, then replays the update stream forwards,
//! dispatching each update to a [`ReplayListener`]. It holds no locks and
//! assumes exclusive mutator access, which recovery guarantees.

use log::trace;
use tanoak_core::clock::Timestamp;
use tanoak_core::key::{AntiValue, Key};
use tanoak_core::page::{TreeDescriptor, TreeHandle, VolumeDescriptor, VolumeHandle};

use crate::error::{CorruptJournal, JournalError};
use crate::record::{AccumulatorKind, JournalAddress, Record, RecordHeader, Update};

/// First byte of a value whose on-disk representation is a pointer chain
/// into overflow pages rather than an inline byte string.
pub const LONG_RECORD_TYPE: u8 = 255;

/// Minimum size of a long-record pointer value.
pub const LONG_RECORD_SIZE: usize = 32;

/// `true` if `value` carries the long-record marker.
pub fn is_long_record(value: &[u8]) -> bool {
    value.len() >= LONG_RECORD_SIZE && value[0] == LONG_RECORD_TYPE
}

/// Everything the player needs to replay one transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransactionMapItem {
    pub start_ts: Timestamp,
    pub commit_ts: Timestamp,
    /// Address of the earliest `TX` chunk (`backchain == 0`).
    pub start_addr: JournalAddress,
    /// Address of the latest `TX` chunk; the chain is walked from here.
    pub last_addr: JournalAddress,
}

/// Random-access view of the journal the player reads through.
pub trait JournalSource {
    fn read_record(&self, address: JournalAddress) -> Result<(RecordHeader, Record), JournalError>;

    fn tree(&self, handle: TreeHandle) -> Option<TreeDescriptor>;

    fn volume(&self, handle: VolumeHandle) -> Option<VolumeDescriptor>;
}

/// Sink the replayed updates are re-issued through.
///
/// `addr` arguments locate the chunk the update came from, for error
/// attribution. Within one transaction, calls arrive in journal append
/// order.
pub trait ReplayListener {
    fn start_transaction(
        &mut self,
        addr: JournalAddress,
        start_ts: Timestamp,
        commit_ts: Timestamp,
    ) -> Result<(), JournalError>;

    fn store(
        &mut self,
        addr: JournalAddress,
        ts: Timestamp,
        tree: &TreeDescriptor,
        key: &Key,
        value: &[u8],
    ) -> Result<(), JournalError>;

    fn remove_key_range(
        &mut self,
        addr: JournalAddress,
        ts: Timestamp,
        tree: &TreeDescriptor,
        key1: &Key,
        key2: &Key,
    ) -> Result<(), JournalError>;

    fn remove_tree(&mut self, addr: JournalAddress, ts: Timestamp, tree: &TreeDescriptor) -> Result<(), JournalError>;

    fn delta(
        &mut self,
        addr: JournalAddress,
        ts: Timestamp,
        tree: &TreeDescriptor,
        accumulator: AccumulatorKind,
        index: u32,
        value: i64,
    ) -> Result<(), JournalError>;

    fn end_transaction(&mut self, addr: JournalAddress, start_ts: Timestamp) -> Result<(), JournalError>;

    /// Resolve the live volume for a journaled binding.
    ///
    /// Live volumes belong to the engine, not the journal. An
    /// implementation backed by an open-volume registry returns the volume
    /// currently open under the binding's handle or, if that handle is no
    /// longer open, the one found by `recorded.name`. The player verifies
    /// the returned descriptor's persistent id against the journaled one.
    ///
    /// The default echoes the journaled binding.
    fn resolve_volume(
        &mut self,
        _addr: JournalAddress,
        recorded: &VolumeDescriptor,
    ) -> Result<VolumeDescriptor, JournalError> {
        Ok(recorded.clone())
    }

    /// Whether stored values carrying the long-record marker should be
    /// converted before [`Self::store`] sees them.
    fn convert_long_records(&self) -> bool {
        false
    }

    /// Convert a long-record pointer value in place. Only called when
    /// [`Self::convert_long_records`] returns `true`; the buffer is a
    /// private copy, never the shared read buffer.
    fn convert_long_record(&mut self, _tree: &TreeDescriptor, _value: &mut Vec<u8>) -> Result<(), JournalError> {
        Ok(())
    }
}

/// Decodes one transaction's update stream and re-applies it.
pub struct TransactionPlayer<'a, S> {
    source: &'a S,
}

impl<'a, S: JournalSource> TransactionPlayer<'a, S> {
    pub fn new(source: &'a S) -> Self {
        Self { source }
    }

    /// Replay the transaction described by `item` through `listener`.
    pub fn apply_transaction(
        &self,
        item: &TransactionMapItem,
        listener: &mut dyn ReplayListener,
    ) -> Result<(), JournalError> {
        let chunks = self.collect_chain(item)?;

        listener.start_transaction(item.start_addr, item.start_ts, item.commit_ts)?;
        for (addr, updates) in chunks.iter().rev() {
            trace!("replaying chunk at {addr} ({} bytes)", updates.len());
            self.replay_chunk(*addr, updates, item, listener)?;
        }
        listener.end_transaction(item.last_addr, item.start_ts)?;
        Ok(())
    }

    /// Walk the back-chain from `last_addr` to the earliest chunk,
    /// validating every link. Chunks are returned newest first.
    fn collect_chain(&self, item: &TransactionMapItem) -> Result<Vec<(JournalAddress, Vec<u8>)>, JournalError> {
        let mut chunks = Vec::new();
        let mut addr = item.last_addr;
        loop {
            let (header, record) = self.source.read_record(addr)?;
            // The kind check runs against this chunk's own header on every
            // iteration of the walk.
            let Record::Tx {
                backchain, updates, ..
            } = record
            else {
                return Err(CorruptJournal::new(
                    addr,
                    format!("transaction chain holds a {} record", header.kind),
                )
                .into());
            };
            if header.timestamp != item.start_ts {
                return Err(CorruptJournal::new(
                    addr,
                    format!(
                        "chunk start timestamp {} does not match transaction {}",
                        header.timestamp, item.start_ts
                    ),
                )
                .into());
            }
            chunks.push((addr, updates));
            if backchain == 0 {
                if addr != item.start_addr {
                    return Err(CorruptJournal::new(
                        addr,
                        format!("chain terminates at {addr}, expected {}", item.start_addr),
                    )
                    .into());
                }
                return Ok(chunks);
            }
            if backchain >= addr {
                return Err(CorruptJournal::new(addr, "back-chain does not point backwards").into());
            }
            addr = backchain;
        }
    }

    fn replay_chunk(
        &self,
        chunk_addr: JournalAddress,
        updates: &[u8],
        item: &TransactionMapItem,
        listener: &mut dyn ReplayListener,
    ) -> Result<(), JournalError> {
        let mut reader = updates;
        while !reader.is_empty() {
            let (header, update) =
                Update::decode(&mut reader, chunk_addr).map_err(|e| CorruptJournal::new(chunk_addr, e.reason))?;
            if header.timestamp != item.start_ts {
                return Err(CorruptJournal::new(
                    chunk_addr,
                    format!(
                        "update timestamp {} does not match transaction {}",
                        header.timestamp, item.start_ts
                    ),
                )
                .into());
            }
            self.dispatch(chunk_addr, update, item, listener)?;
        }
        Ok(())
    }

    fn dispatch(
        &self,
        addr: JournalAddress,
        update: Update,
        item: &TransactionMapItem,
        listener: &mut dyn ReplayListener,
    ) -> Result<(), JournalError> {
        let tree = self.resolve_tree(addr, update.tree(), listener)?;
        let ts = item.start_ts;
        match update {
            Update::Store { key, value, .. } => {
                let key = Key::from_encoded(&key).map_err(|e| CorruptJournal::new(addr, e.to_string()))?;
                if listener.convert_long_records() && is_long_record(&value) {
                    // Conversion may clobber the buffer it works on, so it
                    // gets a private copy.
                    let mut scratch = value.clone();
                    listener.convert_long_record(&tree, &mut scratch)?;
                    listener.store(addr, ts, &tree, &key, &scratch)
                } else {
                    listener.store(addr, ts, &tree, &key, &value)
                }
            }
            Update::RangeDelete {
                elision,
                key1,
                key2_suffix,
                ..
            } => {
                let key1 = Key::from_encoded(&key1).map_err(|e| CorruptJournal::new(addr, e.to_string()))?;
                let anti = AntiValue::from_parts(elision, &key2_suffix)
                    .map_err(|e| CorruptJournal::new(addr, e.to_string()))?;
                let mut key2 = Key::new();
                anti.fix_up(&key1, &mut key2)
                    .map_err(|e| CorruptJournal::new(addr, e.to_string()))?;
                listener.remove_key_range(addr, ts, &tree, &key1, &key2)
            }
            Update::TreeDelete { .. } => listener.remove_tree(addr, ts, &tree),
            Update::DeltaOne {
                accumulator, index, ..
            } => listener.delta(addr, ts, &tree, accumulator, index, 1),
            Update::DeltaValue {
                accumulator,
                index,
                value,
                ..
            } => listener.delta(addr, ts, &tree, accumulator, index, value),
        }
    }

    /// Resolve `handle` through the source's bindings and the listener's
    /// open volumes.
    ///
    /// The journaled volume binding carries the name a no-longer-open
    /// volume is looked up by, and the persistent id the live volume must
    /// match. A tree named
    /// [`DIRECTORY_TREE_NAME`](tanoak_core::page::DIRECTORY_TREE_NAME)
    /// addresses the volume's directory rather than a user tree; the
    /// descriptor's [`TreeDescriptor::is_directory`] carries that routing
    /// to the listener.
    fn resolve_tree(
        &self,
        addr: JournalAddress,
        handle: TreeHandle,
        listener: &mut dyn ReplayListener,
    ) -> Result<TreeDescriptor, JournalError> {
        let tree = self
            .source
            .tree(handle)
            .ok_or_else(|| CorruptJournal::new(addr, format!("update names unknown {handle}")))?;
        let recorded = self
            .source
            .volume(tree.volume)
            .ok_or_else(|| CorruptJournal::new(addr, format!("{} belongs to unknown {}", handle, tree.volume)))?;
        let live = listener.resolve_volume(addr, &recorded)?;
        if live.id != recorded.id {
            return Err(CorruptJournal::new(
                addr,
                format!(
                    "volume {} resolves to id {:#x}, journal recorded {:#x}",
                    recorded.name, live.id, recorded.id
                ),
            )
            .into());
        }
        Ok(tree)
    }
}
