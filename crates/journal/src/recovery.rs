//! Crash recovery: a single-threaded forward scan of the journal building
//! a commit-ordered plan of transactions to replay, then the replay itself.
//!
//! The scan starts at the oldest retained generation, which copy-back
//! keeps at the last checkpoint cut. Checkpoints met along the way evict
//! every transaction started before them; whatever survives the scan is
//! exactly the set committed after the last checkpoint preceding it.

use std::collections::{btree_map, BTreeMap, HashMap};

use log::{debug, info, warn};
use tanoak_core::clock::Timestamp;
use tanoak_core::page::{PageAddress, TreeDescriptor, TreeHandle, VolumeDescriptor, VolumeHandle};
use tanoak_core::session::SessionContext;

use crate::error::{CorruptJournal, FileAddress, JournalError};
use crate::journal::{CheckpointMark, SegmentReads};
use crate::player::{JournalSource, ReplayListener, TransactionMapItem, TransactionPlayer};
use crate::record::{JournalAddress, Record, RecordHeader};
use crate::repo::{JournalFile, Repo};
use crate::Options;

/// Scan-and-replay lifecycle of one recovered transaction. States only
/// ever advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TxState {
    /// `TS` seen, nothing else yet.
    Scanning,
    /// At least one `TX` chunk seen.
    Started,
    /// `TC` seen; the transaction will be replayed.
    Complete,
    /// Replay succeeded.
    Committed,
    /// Replay failed; later transactions are still replayed.
    Aborted,
}

#[derive(Clone, Copy, Debug)]
struct PlanEntry {
    /// Address of the `TS` record.
    start_record: JournalAddress,
    /// Address of the earliest `TX` chunk, zero while none was seen.
    start_addr: JournalAddress,
    last_addr: JournalAddress,
    commit_ts: Timestamp,
    state: TxState,
}

impl PlanEntry {
    fn advance(&mut self, to: TxState) -> Result<(), JournalError> {
        if to < self.state {
            return Err(JournalError::InvalidState("transaction state may not regress"));
        }
        self.state = to;
        Ok(())
    }
}

/// Counters operators read after recovery. Partial failures surface here,
/// not as errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Plan entries surviving the scan.
    pub size: usize,
    /// Entries found committed (to be replayed).
    pub committed: usize,
    /// Entries that never committed; abandoned.
    pub uncommitted: usize,
    /// Entries replayed successfully.
    pub applied: usize,
}

/// Handle bindings and page map rebuilt by the scan, for the journal
/// manager to adopt once recovery is done.
#[derive(Clone, Debug, Default)]
pub struct RecoveredState {
    pub volumes: HashMap<VolumeHandle, VolumeDescriptor>,
    pub trees: HashMap<TreeHandle, TreeDescriptor>,
    pub page_map: HashMap<(VolumeHandle, PageAddress), JournalAddress>,
    pub last_checkpoint: Option<CheckpointMark>,
    /// Highest timestamp seen anywhere in the journal.
    pub max_timestamp: Timestamp,
}

/// The recovery plan: scan result plus the replay driver.
#[derive(Debug)]
pub struct RecoveryPlan<R: Repo> {
    reads: SegmentReads<R>,
    block_size: u64,
    plan: BTreeMap<Timestamp, PlanEntry>,
    recovered: RecoveredState,
    applied: usize,
}

impl<R: Repo> RecoveryPlan<R> {
    /// Scan the journal in `repo` forward, building the plan.
    ///
    /// Structural anomalies abort the scan with [`CorruptJournal`]; a torn
    /// record at the tail of the newest generation is the footprint of a
    /// crash mid-append and ends the scan cleanly.
    pub fn scan(repo: R, opts: Options) -> Result<Self, JournalError> {
        let block_size = opts.block_size;
        let mut this = Self {
            reads: SegmentReads::new(repo.clone(), block_size),
            block_size,
            plan: BTreeMap::new(),
            recovered: RecoveredState::default(),
            applied: 0,
        };

        let generations = repo.existing_generations()?;
        let Some(&last) = generations.last() else {
            debug!("empty journal, nothing to recover");
            return Ok(this);
        };
        let cx = SessionContext::new();

        'generations: for &generation in &generations {
            let file = repo.open(generation)?;
            let file_len = file.len(&cx)?;
            let mut offset = 0u64;

            while offset + (RecordHeader::LEN as u64) <= file_len {
                let addr = generation * block_size + offset;
                match this.reads.read_record(addr) {
                    Ok((header, record)) => {
                        this.observe(addr, &header, record)?;
                        offset += header.length as u64;
                    }
                    Err(e) if generation == last => {
                        warn!("scan ends at torn tail of generation {generation}: {e}");
                        break 'generations;
                    }
                    Err(e) => return Err(e),
                }
            }
            if offset < file_len {
                let addr = generation * block_size + offset;
                if generation == last {
                    warn!("scan ends at torn tail of generation {generation}");
                    break;
                }
                return Err(CorruptJournal::new(addr, "trailing bytes in sealed generation").into());
            }
        }

        info!(
            "scan complete: {} transactions to consider, last checkpoint {:?}",
            this.plan.len(),
            this.recovered.last_checkpoint.map(|cp| cp.timestamp)
        );
        Ok(this)
    }

    fn observe(&mut self, addr: JournalAddress, header: &RecordHeader, record: Record) -> Result<(), JournalError> {
        let ts = header.timestamp;
        self.recovered.max_timestamp = self.recovered.max_timestamp.max(ts);
        match record {
            Record::InstallVolume { handle, id, name } => {
                self.recovered.volumes.insert(handle, VolumeDescriptor { handle, id, name });
            }
            Record::InstallTree { handle, volume, name } => {
                self.recovered.trees.insert(handle, TreeDescriptor { handle, volume, name });
            }
            Record::PageImage { volume, page, .. } => {
                self.recovered.page_map.insert((volume, page), addr);
            }
            Record::TxStart => match self.plan.entry(ts) {
                btree_map::Entry::Occupied(_) => {
                    return Err(CorruptJournal::new(addr, format!("duplicate transaction start ts={ts}")).into());
                }
                btree_map::Entry::Vacant(entry) => {
                    entry.insert(PlanEntry {
                        start_record: addr,
                        start_addr: 0,
                        last_addr: 0,
                        commit_ts: 0,
                        state: TxState::Scanning,
                    });
                }
            },
            Record::Tx {
                commit_ts, backchain, ..
            } => {
                let entry = self
                    .plan
                    .get_mut(&ts)
                    .ok_or_else(|| CorruptJournal::new(addr, format!("container without start ts={ts}")))?;
                if entry.state >= TxState::Complete {
                    return Err(CorruptJournal::new(addr, format!("container after commit ts={ts}")).into());
                }
                if entry.start_addr == 0 {
                    if backchain != 0 {
                        return Err(
                            CorruptJournal::new(addr, "earliest container carries a back-chain").into()
                        );
                    }
                    entry.start_addr = addr;
                } else if backchain != entry.last_addr {
                    return Err(CorruptJournal::new(
                        addr,
                        format!("back-chain {backchain} skips the previous container {}", entry.last_addr),
                    )
                    .into());
                }
                entry.last_addr = addr;
                entry.advance(TxState::Started)?;
                if commit_ts != 0 {
                    entry.commit_ts = commit_ts;
                    self.recovered.max_timestamp = self.recovered.max_timestamp.max(commit_ts);
                }
            }
            Record::TxCommit { commit_ts } => {
                let entry = self
                    .plan
                    .get_mut(&ts)
                    .ok_or_else(|| CorruptJournal::new(addr, format!("commit without start ts={ts}")))?;
                if entry.state >= TxState::Complete {
                    return Err(CorruptJournal::new(addr, format!("transaction ts={ts} committed twice")).into());
                }
                entry.advance(TxState::Complete)?;
                entry.commit_ts = commit_ts;
                self.recovered.max_timestamp = self.recovered.max_timestamp.max(commit_ts);
            }
            Record::TxRollback => {
                let entry = self
                    .plan
                    .get(&ts)
                    .ok_or_else(|| CorruptJournal::new(addr, format!("rollback without start ts={ts}")))?;
                if entry.state >= TxState::Complete {
                    return Err(CorruptJournal::new(addr, format!("rollback of committed ts={ts}")).into());
                }
                self.plan.remove(&ts);
            }
            Record::TxJoin => {
                // Continuation marker only; the back-chain carries the
                // linkage.
            }
            Record::Checkpoint => {
                debug!(
                    "checkpoint at {}",
                    FileAddress::resolve(addr, self.block_size, ts)
                );
                self.recovered.last_checkpoint = Some(CheckpointMark {
                    timestamp: ts,
                    address: addr,
                });
                // Effects of everything started before the checkpoint are
                // on disk already.
                self.plan.retain(|&start_ts, _| start_ts >= ts);
            }
        }
        Ok(())
    }

    /// Plan entries surviving the scan.
    pub fn size(&self) -> usize {
        self.plan.len()
    }

    pub fn committed_count(&self) -> usize {
        self.plan
            .values()
            .filter(|e| e.state >= TxState::Complete && e.state != TxState::Aborted)
            .count()
    }

    pub fn uncommitted_count(&self) -> usize {
        self.plan.values().filter(|e| e.state < TxState::Complete).count()
    }

    /// The transactions the plan will replay, in replay order (ascending
    /// commit timestamp).
    pub fn planned_items(&self) -> Vec<TransactionMapItem> {
        let mut items: Vec<TransactionMapItem> = self
            .plan
            .iter()
            .filter(|(_, e)| e.state == TxState::Complete)
            .map(|(&start_ts, e)| TransactionMapItem {
                start_ts,
                commit_ts: e.commit_ts,
                start_addr: e.start_addr,
                last_addr: e.last_addr,
            })
            .collect();
        items.sort_by_key(|item| item.commit_ts);
        items
    }

    /// State rebuilt by the scan, for the journal manager to adopt.
    pub fn recovered_state(&self) -> RecoveredState {
        self.recovered.clone()
    }

    /// Replay every committed transaction in ascending commit-timestamp
    /// order, so recovery reproduces the serializable commit history.
    ///
    /// A transaction that fails to replay is logged, marked aborted and
    /// skipped; recovery continues with the rest. The outcome is read from
    /// the returned counters.
    pub fn apply_committed_transactions(&mut self, listener: &mut dyn ReplayListener) -> RecoveryStats {
        let todo = self.planned_items();
        let committed = todo.len();

        for item in todo {
            let outcome = if item.start_addr == 0 {
                // Committed without journaling any update.
                Ok(())
            } else {
                TransactionPlayer::new(&*self).apply_transaction(&item, listener)
            };
            let entry = self.plan.get_mut(&item.start_ts).expect("entry was planned");
            match outcome {
                Ok(()) => {
                    self.applied += 1;
                    let _ = entry.advance(TxState::Committed);
                }
                Err(e) => {
                    warn!("replay of transaction ts={} failed: {e}", item.start_ts);
                    let _ = entry.advance(TxState::Aborted);
                }
            }
        }

        let stats = RecoveryStats {
            size: self.plan.len(),
            committed,
            uncommitted: self.uncommitted_count(),
            applied: self.applied,
        };
        info!(
            "recovery applied {}/{} committed transactions ({} abandoned)",
            stats.applied, stats.committed, stats.uncommitted
        );
        stats
    }
}

impl<R: Repo> JournalSource for RecoveryPlan<R> {
    fn read_record(&self, address: JournalAddress) -> Result<(RecordHeader, Record), JournalError> {
        self.reads.read_record(address)
    }

    fn tree(&self, handle: TreeHandle) -> Option<TreeDescriptor> {
        self.recovered.trees.get(&handle).cloned()
    }

    fn volume(&self, handle: VolumeHandle) -> Option<VolumeDescriptor> {
        self.recovered.volumes.get(&handle).cloned()
    }
}
