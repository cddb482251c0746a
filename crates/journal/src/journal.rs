//! The journal manager: a serialized append path over a segmented rolling
//! log, the per-transaction chain map, checkpointing, copy-back, and the
//! random-access read path recovery and replay run against.

use std::collections::{btree_map, BTreeMap, HashMap};
use std::io;
use std::sync::Arc;
use std::time::Instant;

use itertools::Itertools as _;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tanoak_core::clock::{Timestamp, TimestampAllocator};
use tanoak_core::page::{PageAddress, PageError, PageStore, TreeDescriptor, TreeHandle, VolumeDescriptor, VolumeHandle};
use tanoak_core::session::SessionContext;

use crate::error::{CorruptJournal, JournalError};
use crate::player::JournalSource;
use crate::recovery::RecoveredState;
use crate::record::{JournalAddress, Record, RecordHeader};
use crate::repo::{JournalFile, Repo};
use crate::txn::Transaction;
use crate::Options;

/// Smallest permitted segment size. Keeps rollover arithmetic sane; real
/// deployments use sizes in the hundreds of megabytes.
pub const MIN_BLOCK_SIZE: u64 = 64;

/// The last durable checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointMark {
    pub timestamp: Timestamp,
    pub address: JournalAddress,
}

/// Live bookkeeping for one journaled transaction.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct TxItem {
    /// Address of the `TS` record.
    pub start_record: JournalAddress,
    /// Address of the earliest `TX` chunk, zero while none was written.
    pub start_addr: JournalAddress,
    /// Address of the latest `TX` chunk, zero while none was written.
    pub last_addr: JournalAddress,
    /// Commit timestamp, zero while uncommitted.
    pub commit_ts: Timestamp,
}

/// Operator-readable snapshot of the journal's position and load.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalStats {
    /// Next address to be written.
    pub current_address: JournalAddress,
    pub generation: u64,
    /// Lowest retained address.
    pub base_address: JournalAddress,
    pub appended_bytes: u64,
    pub live_transactions: usize,
    pub page_images: usize,
    pub last_checkpoint: Option<Timestamp>,
}

struct Appender<F> {
    head: F,
    generation: u64,
    /// Next global address to write.
    address: JournalAddress,
    appended_bytes: u64,
}

struct State {
    live: BTreeMap<Timestamp, TxItem>,
    page_map: HashMap<(VolumeHandle, PageAddress), JournalAddress>,
    volumes: HashMap<VolumeHandle, VolumeDescriptor>,
    trees: HashMap<TreeHandle, TreeDescriptor>,
    last_checkpoint: Option<CheckpointMark>,
    last_checkpoint_time: Instant,
    base_address: JournalAddress,
}

/// Random-access read path over sealed (and the current) generations.
///
/// Opens its own handles, so readers never contend with the appender.
#[derive(Debug)]
pub(crate) struct SegmentReads<R: Repo> {
    repo: R,
    block_size: u64,
    cx: SessionContext,
    files: Mutex<HashMap<u64, Arc<R::File>>>,
}

impl<R: Repo> SegmentReads<R> {
    pub(crate) fn new(repo: R, block_size: u64) -> Self {
        Self {
            repo,
            block_size,
            cx: SessionContext::new(),
            files: Mutex::new(HashMap::new()),
        }
    }

    fn file(&self, generation: u64) -> Result<Arc<R::File>, JournalError> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(&generation) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(self.repo.open(generation)?);
        files.insert(generation, Arc::clone(&file));
        Ok(file)
    }

    fn evict_below(&self, generation: u64) {
        self.files.lock().retain(|g, _| *g >= generation);
    }

    /// Read and decode the record at `address`.
    pub(crate) fn read_record(&self, address: JournalAddress) -> Result<(RecordHeader, Record), JournalError> {
        let generation = address / self.block_size;
        let offset = address % self.block_size;
        let file = self.file(generation)?;

        let truncated = |e: crate::error::ChannelError| match e {
            crate::error::ChannelError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                JournalError::from(CorruptJournal::new(address, "truncated mid-record"))
            }
            other => other.into(),
        };

        let mut head = [0u8; RecordHeader::LEN];
        file.read_exact_at(&self.cx, offset, &mut head).map_err(truncated)?;
        let header = RecordHeader::decode(&mut head.as_slice(), address)
            .map_err(|e| CorruptJournal::new(address, e.reason))?;
        if offset + header.length as u64 > self.block_size {
            return Err(CorruptJournal::new(address, "record straddles a segment boundary").into());
        }

        let mut payload = vec![0u8; header.payload_len()];
        file.read_exact_at(&self.cx, offset + RecordHeader::LEN as u64, &mut payload)
            .map_err(truncated)?;
        let record = Record::decode(&header, &payload, address).map_err(|e| CorruptJournal::new(address, e.reason))?;
        Ok((header, record))
    }
}

/// A transactional, segmented write-ahead journal generic over its storage
/// backend.
pub struct Journal<R: Repo> {
    repo: R,
    clock: Arc<TimestampAllocator>,
    opts: Options,
    cx: SessionContext,
    appender: Mutex<Appender<R::File>>,
    state: Mutex<State>,
    reads: SegmentReads<R>,
}

impl<R: Repo> Journal<R> {
    /// Open the journal in `repo`, resuming after the last whole record of
    /// the newest generation, or starting generation zero in an empty repo.
    ///
    /// A torn record at the tail (the footprint of a crash mid-append) is
    /// truncated away so the resumed append path writes over clean ground.
    pub fn open(repo: R, clock: Arc<TimestampAllocator>, opts: Options) -> Result<Self, JournalError> {
        if opts.block_size < MIN_BLOCK_SIZE {
            return Err(JournalError::InvalidState("journal block size below minimum"));
        }
        let cx = SessionContext::new();
        let generations = repo.existing_generations()?;

        let (head, generation, address, base_address) = match generations.last().copied() {
            None => {
                debug!("starting fresh journal");
                (repo.create(0)?, 0, 0, 0)
            }
            Some(last) => {
                let head = repo.open(last)?;
                let tail = scan_tail(&head, &cx, opts.block_size)?;
                let file_len = head.len(&cx)?;
                if tail < file_len {
                    warn!("truncating torn tail of generation {last}: {tail} < {file_len}");
                    head.truncate(&cx, tail)?;
                }
                debug!("resuming generation {last} at offset {tail}");
                (head, last, last * opts.block_size + tail, generations[0] * opts.block_size)
            }
        };

        Ok(Self {
            reads: SegmentReads::new(repo.clone(), opts.block_size),
            repo,
            clock,
            opts,
            cx,
            appender: Mutex::new(Appender {
                head,
                generation,
                address,
                appended_bytes: 0,
            }),
            state: Mutex::new(State {
                live: BTreeMap::new(),
                page_map: HashMap::new(),
                volumes: HashMap::new(),
                trees: HashMap::new(),
                last_checkpoint: None,
                last_checkpoint_time: Instant::now(),
                base_address,
            }),
        })
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub(crate) fn clock(&self) -> &TimestampAllocator {
        &self.clock
    }

    /// Begin a new transaction against this journal.
    pub fn begin_transaction(&self) -> Transaction<'_, R> {
        Transaction::begin(self)
    }

    /// Bind `desc.handle` to the volume identity, durably.
    pub fn install_volume(&self, desc: VolumeDescriptor) -> Result<JournalAddress, JournalError> {
        let ts = self.clock.next();
        let record = Record::InstallVolume {
            handle: desc.handle,
            id: desc.id,
            name: desc.name.clone(),
        };
        let addr = self.append_record(ts, &record)?;
        self.state.lock().volumes.insert(desc.handle, desc);
        Ok(addr)
    }

    /// Bind `desc.handle` to the tree identity, durably. The tree's volume
    /// handle must have been installed first.
    pub fn install_tree(&self, desc: TreeDescriptor) -> Result<JournalAddress, JournalError> {
        if !self.state.lock().volumes.contains_key(&desc.volume) {
            return Err(JournalError::InvalidState("tree references an unknown volume"));
        }
        let ts = self.clock.next();
        let record = Record::InstallTree {
            handle: desc.handle,
            volume: desc.volume,
            name: desc.name.clone(),
        };
        let addr = self.append_record(ts, &record)?;
        self.state.lock().trees.insert(desc.handle, desc);
        Ok(addr)
    }

    /// Journal a dirty page image. `ts` is the page's dirty timestamp.
    pub fn write_page_image(
        &self,
        volume: VolumeHandle,
        page: PageAddress,
        ts: Timestamp,
        data: &[u8],
    ) -> Result<JournalAddress, JournalError> {
        if !self.state.lock().volumes.contains_key(&volume) {
            return Err(JournalError::InvalidState("page image references an unknown volume"));
        }
        let record = Record::PageImage {
            volume,
            page,
            data: data.to_vec(),
        };
        let addr = self.append_record(ts, &record)?;
        self.state.lock().page_map.insert((volume, page), addr);
        Ok(addr)
    }

    pub fn volume(&self, handle: VolumeHandle) -> Option<VolumeDescriptor> {
        self.state.lock().volumes.get(&handle).cloned()
    }

    pub fn tree(&self, handle: TreeHandle) -> Option<TreeDescriptor> {
        self.state.lock().trees.get(&handle).cloned()
    }

    pub fn last_checkpoint(&self) -> Option<CheckpointMark> {
        self.state.lock().last_checkpoint
    }

    pub fn stats(&self) -> JournalStats {
        let ap = self.appender.lock();
        let st = self.state.lock();
        JournalStats {
            current_address: ap.address,
            generation: ap.generation,
            base_address: st.base_address,
            appended_bytes: ap.appended_bytes,
            live_transactions: st.live.len(),
            page_images: st.page_map.len(),
            last_checkpoint: st.last_checkpoint.map(|cp| cp.timestamp),
        }
    }

    /// Read and decode the record at `address`.
    pub fn read_record_at(&self, address: JournalAddress) -> Result<(RecordHeader, Record), JournalError> {
        self.reads.read_record(address)
    }

    /// Adopt the handle bindings, page map and checkpoint mark the recovery
    /// scan rebuilt, and lift the clock past every recovered timestamp.
    pub fn adopt_recovered_state(&self, recovered: RecoveredState) {
        self.clock.advance_to(recovered.max_timestamp);
        let mut st = self.state.lock();
        st.volumes.extend(recovered.volumes);
        st.trees.extend(recovered.trees);
        st.page_map.extend(recovered.page_map);
        if st.last_checkpoint.is_none() {
            st.last_checkpoint = recovered.last_checkpoint;
        }
    }

    /// Write a checkpoint: all pages dirtied at or before the returned
    /// timestamp are durable in their volumes, so transactions committed
    /// before it need never be replayed.
    ///
    /// Returns `None` without writing when a live transaction has already
    /// journaled chunks but not yet committed; recovery semantics evict
    /// everything started before a checkpoint, so such a transaction must
    /// reach its verdict first. The caller retries on the next tick.
    pub fn checkpoint(&self, pages: Option<&dyn PageStore>) -> Result<Option<Timestamp>, JournalError> {
        let ts = self.clock.next();
        if let Some(store) = pages {
            store.sync().map_err(page_error)?;
        }
        let mut ap = self.appender.lock();
        {
            let st = self.state.lock();
            if st.live.values().any(|item| item.commit_ts == 0 && item.start_addr != 0) {
                debug!("checkpoint deferred: chunked transaction in flight");
                return Ok(None);
            }
        }
        let addr = self.append_locked(&mut ap, ts, &Record::Checkpoint)?;
        ap.head.sync(&self.cx, true)?;

        let mut st = self.state.lock();
        st.last_checkpoint = Some(CheckpointMark {
            timestamp: ts,
            address: addr,
        });
        st.last_checkpoint_time = Instant::now();
        st.live.retain(|_, item| item.commit_ts == 0 || item.commit_ts >= ts);
        info!("checkpoint ts={ts} address={addr}");
        Ok(Some(ts))
    }

    /// Write a checkpoint if the configured interval has elapsed.
    pub fn checkpoint_if_due(&self, pages: Option<&dyn PageStore>) -> Result<Option<Timestamp>, JournalError> {
        let due = self.state.lock().last_checkpoint_time.elapsed() >= self.opts.checkpoint_interval;
        if due {
            self.checkpoint(pages)
        } else {
            Ok(None)
        }
    }

    /// Forget transactions whose effects the last checkpoint made durable.
    /// Returns how many were dropped.
    pub fn prune_obsolete_transactions(&self) -> usize {
        let mut st = self.state.lock();
        let Some(cp) = st.last_checkpoint else {
            return 0;
        };
        let before = st.live.len();
        st.live
            .retain(|_, item| item.commit_ts == 0 || item.commit_ts > cp.timestamp);
        before - st.live.len()
    }

    /// Copy still-referenced page images into their volumes through
    /// `store`, then discard journal generations nothing refers to anymore.
    ///
    /// Inhibited entirely in append-only mode. Returns the number of pages
    /// copied.
    pub fn copy_back_pages(&self, store: &dyn PageStore) -> Result<usize, JournalError> {
        if self.opts.append_only {
            debug!("copy-back suppressed: journal is append-only");
            return Ok(0);
        }
        let snapshot: Vec<((VolumeHandle, PageAddress), JournalAddress)> = self
            .state
            .lock()
            .page_map
            .iter()
            .map(|(k, v)| (*k, *v))
            .sorted()
            .collect();

        for ((volume, page), addr) in &snapshot {
            let (_, record) = self.reads.read_record(*addr)?;
            let Record::PageImage {
                volume: rec_volume,
                page: rec_page,
                data,
            } = record
            else {
                return Err(CorruptJournal::new(*addr, "page map points at a non-page record").into());
            };
            if rec_volume != *volume || rec_page != *page {
                return Err(CorruptJournal::new(*addr, "page image does not match its map entry").into());
            }
            let desc = self
                .volume(*volume)
                .ok_or_else(|| CorruptJournal::new(*addr, format!("page image names unknown {volume}")))?;
            store.write_page(&desc, *page, &data).map_err(page_error)?;
        }
        if !snapshot.is_empty() {
            store.sync().map_err(page_error)?;
        }

        let mut ap = self.appender.lock();
        let mut st = self.state.lock();
        for (key, addr) in &snapshot {
            if st.page_map.get(key) == Some(addr) {
                st.page_map.remove(key);
            }
        }
        // Everything below the earliest still-needed address can go.
        let mut keep = ap.address;
        if let Some(cp) = &st.last_checkpoint {
            keep = keep.min(cp.address);
        }
        for item in st.live.values() {
            keep = keep.min(item.start_record);
        }
        for addr in st.page_map.values() {
            keep = keep.min(*addr);
        }
        let keep_generation = keep / self.opts.block_size;
        for generation in self.repo.existing_generations()? {
            if generation < keep_generation && generation != ap.generation {
                debug!("removing generation {generation}");
                self.repo.remove(generation)?;
            }
        }
        st.base_address = st.base_address.max(keep_generation * self.opts.block_size);
        self.reads.evict_below(keep_generation);
        drop(st);
        drop(ap);

        Ok(snapshot.len())
    }

    pub(crate) fn write_tx_start(&self, start_ts: Timestamp) -> Result<JournalAddress, JournalError> {
        let mut ap = self.appender.lock();
        let addr = self.append_locked(&mut ap, start_ts, &Record::TxStart)?;
        match self.state.lock().live.entry(start_ts) {
            btree_map::Entry::Occupied(_) => Err(JournalError::InvalidState("transaction already started")),
            btree_map::Entry::Vacant(entry) => {
                entry.insert(TxItem {
                    start_record: addr,
                    ..TxItem::default()
                });
                Ok(addr)
            }
        }
    }

    pub(crate) fn write_tx_chunk(
        &self,
        start_ts: Timestamp,
        commit_ts: Timestamp,
        backchain: JournalAddress,
        updates: Vec<u8>,
    ) -> Result<JournalAddress, JournalError> {
        let mut ap = self.appender.lock();
        let record = Record::Tx {
            commit_ts,
            backchain,
            updates,
        };
        let addr = self.append_locked(&mut ap, start_ts, &record)?;
        let mut st = self.state.lock();
        let item = st
            .live
            .get_mut(&start_ts)
            .ok_or(JournalError::InvalidState("transaction not started"))?;
        if item.start_addr == 0 {
            item.start_addr = addr;
        }
        item.last_addr = addr;
        if commit_ts != 0 {
            item.commit_ts = commit_ts;
        }
        Ok(addr)
    }

    pub(crate) fn write_tx_commit(&self, start_ts: Timestamp, commit_ts: Timestamp) -> Result<JournalAddress, JournalError> {
        let mut ap = self.appender.lock();
        let addr = self.append_locked(&mut ap, start_ts, &Record::TxCommit { commit_ts })?;
        if self.opts.sync_on_commit {
            ap.head.sync(&self.cx, false)?;
        }
        let mut st = self.state.lock();
        if let Some(item) = st.live.get_mut(&start_ts) {
            item.commit_ts = commit_ts;
        }
        Ok(addr)
    }

    pub(crate) fn write_tx_rollback(&self, start_ts: Timestamp) -> Result<JournalAddress, JournalError> {
        let mut ap = self.appender.lock();
        let addr = self.append_locked(&mut ap, start_ts, &Record::TxRollback)?;
        self.state.lock().live.remove(&start_ts);
        Ok(addr)
    }

    fn append_record(&self, ts: Timestamp, record: &Record) -> Result<JournalAddress, JournalError> {
        let mut ap = self.appender.lock();
        self.append_locked(&mut ap, ts, record)
    }

    /// Append one record under the appender lock, rolling to a new
    /// generation when the record would straddle the block boundary.
    fn append_locked(
        &self,
        ap: &mut Appender<R::File>,
        ts: Timestamp,
        record: &Record,
    ) -> Result<JournalAddress, JournalError> {
        let block_size = self.opts.block_size;
        let len = record.encoded_len() as u64;
        if len > block_size {
            return Err(JournalError::InvalidState("record larger than a journal segment"));
        }
        if ap.address % block_size + len > block_size {
            self.roll(ap)?;
        }
        let mut buf = Vec::with_capacity(len as usize);
        record.encode(ts, &mut buf);
        ap.head.write_all_at(&self.cx, ap.address % block_size, &buf)?;
        let addr = ap.address;
        ap.address += len;
        ap.appended_bytes += len;
        Ok(addr)
    }

    /// Seal the current generation and open the next one. If a live
    /// transaction's chain will continue into the new file, lead with a
    /// continuation marker.
    fn roll(&self, ap: &mut Appender<R::File>) -> Result<(), JournalError> {
        debug!("sealing generation {}", ap.generation);
        ap.head.sync(&self.cx, true)?;
        ap.generation += 1;
        ap.address = ap.generation * self.opts.block_size;
        ap.head = self.repo.create(ap.generation)?;

        let continued = {
            let st = self.state.lock();
            st.live
                .iter()
                .find(|(_, item)| item.commit_ts == 0 && item.start_addr != 0)
                .map(|(ts, _)| *ts)
        };
        if let Some(ts) = continued {
            let mut buf = Vec::with_capacity(RecordHeader::LEN);
            Record::TxJoin.encode(ts, &mut buf);
            ap.head.write_all_at(&self.cx, 0, &buf)?;
            ap.address += buf.len() as u64;
            ap.appended_bytes += buf.len() as u64;
        }
        Ok(())
    }
}

impl<R: Repo> JournalSource for Journal<R> {
    fn read_record(&self, address: JournalAddress) -> Result<(RecordHeader, Record), JournalError> {
        self.reads.read_record(address)
    }

    fn tree(&self, handle: TreeHandle) -> Option<TreeDescriptor> {
        Journal::tree(self, handle)
    }

    fn volume(&self, handle: VolumeHandle) -> Option<VolumeDescriptor> {
        Journal::volume(self, handle)
    }
}

impl<R: Repo> Drop for Journal<R> {
    fn drop(&mut self) {
        let ap = self.appender.lock();
        if let Err(e) = ap.head.sync(&self.cx, true) {
            warn!("failed to sync journal on drop: {e}");
        }
    }
}

fn page_error(e: PageError) -> JournalError {
    match e {
        PageError::Io(io) => JournalError::Io(io),
        other => JournalError::Io(io::Error::other(other.to_string())),
    }
}

/// Offset just past the last whole record in a segment file.
fn scan_tail<F: JournalFile>(file: &F, cx: &SessionContext, block_size: u64) -> Result<u64, JournalError> {
    let file_len = file.len(cx)?;
    let mut offset = 0u64;
    loop {
        if offset + RecordHeader::LEN as u64 > file_len {
            return Ok(offset);
        }
        let mut head = [0u8; RecordHeader::LEN];
        file.read_exact_at(cx, offset, &mut head)?;
        let Ok(header) = RecordHeader::decode(&mut head.as_slice(), offset) else {
            return Ok(offset);
        };
        let end = offset + header.length as u64;
        if end > file_len || end > block_size {
            return Ok(offset);
        }
        offset = end;
    }
}
