//! Journal manager behavior: rollover, resume, copy-back, retry loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tanoak_core::clock::TimestampAllocator;
use tanoak_core::page::{PageAddress, PageError, PageStore, TreeHandle, VolumeDescriptor, VolumeHandle};

use crate::error::JournalError;
use crate::journal::Journal;
use crate::record::{Record, RecordKind};
use crate::recovery::RecoveryPlan;
use crate::repo::{JournalFile as _, Repo as _};
use crate::tests::helpers::*;
use crate::txn::run_transaction;
use crate::Options;
use tanoak_core::session::SessionContext;

#[derive(Default)]
struct CapturingStore {
    pages: Mutex<HashMap<(VolumeHandle, PageAddress), Vec<u8>>>,
    syncs: AtomicUsize,
}

impl PageStore for CapturingStore {
    fn read_page(&self, volume: &VolumeDescriptor, page: PageAddress, buf: &mut Vec<u8>) -> Result<(), PageError> {
        let pages = self.pages.lock();
        let data = pages
            .get(&(volume.handle, page))
            .ok_or(PageError::InvalidPageAddress(page))?;
        buf.clear();
        buf.extend_from_slice(data);
        Ok(())
    }

    fn write_page(&self, volume: &VolumeDescriptor, page: PageAddress, data: &[u8]) -> Result<(), PageError> {
        self.pages.lock().insert((volume.handle, page), data.to_vec());
        Ok(())
    }

    fn allocate_page(&self, _volume: &VolumeDescriptor) -> Result<PageAddress, PageError> {
        Ok(self.pages.lock().len() as PageAddress + 1)
    }

    fn sync(&self) -> Result<(), PageError> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn records_never_straddle_a_generation() {
    let opts = Options {
        tx_chunk_size: 1,
        ..small_opts(128)
    };
    let (repo, _clock, journal) = mem_journal(opts);

    let mut tx = journal.begin_transaction();
    for i in 0..8u8 {
        tx.store(TreeHandle(1), &key(&[b'k', i]), &[i; 24]).unwrap();
    }
    tx.commit().unwrap();
    assert!(journal.stats().generation > 0);

    // Every record sits wholly inside its generation: walking each file by
    // record lengths comes out exactly at the file end.
    let cx = SessionContext::new();
    for generation in repo.existing_generations().unwrap() {
        let file = repo.open(generation).unwrap();
        let file_len = file.len(&cx).unwrap();
        assert!(file_len <= opts.block_size);
        let mut offset = 0;
        while offset < file_len {
            let (header, _) = journal.read_record_at(generation * opts.block_size + offset).unwrap();
            offset += header.length as u64;
        }
        assert_eq!(offset, file_len);
    }

    let (_, listener, stats) = {
        let mut plan = RecoveryPlan::scan(repo.clone(), opts).unwrap();
        let mut listener = MapListener::default();
        let stats = plan.apply_committed_transactions(&mut listener);
        (plan, listener, stats)
    };
    assert_eq!(stats.applied, 1);
    assert_eq!(listener.data.len(), 8);
}

#[test]
fn chain_crossing_generations_leads_with_a_join_marker() {
    let opts = Options {
        tx_chunk_size: 1,
        ..small_opts(128)
    };
    let (repo, _clock, journal) = mem_journal(opts);

    let mut tx = journal.begin_transaction();
    let start_ts = tx.start_ts();
    for i in 0..6u8 {
        tx.store(TreeHandle(1), &key(&[b'j', i]), &[i; 32]).unwrap();
    }
    tx.commit().unwrap();

    let generations = repo.existing_generations().unwrap();
    assert!(generations.len() > 1);
    let (header, record) = journal.read_record_at(generations[1] * opts.block_size).unwrap();
    assert_eq!(record, Record::TxJoin);
    assert_eq!(header.kind, RecordKind::TxJoin);
    assert_eq!(header.timestamp, start_ts);
}

#[test]
fn reopen_resumes_after_the_last_record() {
    let opts = small_opts(4096);
    let (repo, _clock, journal) = mem_journal(opts);

    let mut tx = journal.begin_transaction();
    tx.store(TreeHandle(1), &key(b"one"), b"1").unwrap();
    tx.commit().unwrap();
    let resumed_at = journal.stats().current_address;
    drop(journal);

    // Recover, then resume appending with a fresh clock lifted past every
    // recovered timestamp.
    let plan = RecoveryPlan::scan(repo.clone(), opts).unwrap();
    let clock = Arc::new(TimestampAllocator::new());
    let journal = Journal::open(repo.clone(), Arc::clone(&clock), opts).unwrap();
    journal.adopt_recovered_state(plan.recovered_state());
    assert_eq!(journal.stats().current_address, resumed_at);
    assert!(journal.tree(TreeHandle(1)).is_some());

    let mut tx = journal.begin_transaction();
    tx.store(TreeHandle(1), &key(b"two"), b"2").unwrap();
    tx.commit().unwrap();
    drop(journal);

    let mut plan = RecoveryPlan::scan(repo, opts).unwrap();
    let mut listener = MapListener::default();
    let stats = plan.apply_committed_transactions(&mut listener);
    assert_eq!(stats.applied, 2);
    assert_eq!(listener.get(1, b"one"), Some(&b"1"[..]));
    assert_eq!(listener.get(1, b"two"), Some(&b"2"[..]));
}

#[test]
fn open_truncates_a_torn_tail() {
    let opts = small_opts(4096);
    let (repo, clock, journal) = mem_journal(opts);

    let mut tx = journal.begin_transaction();
    tx.store(TreeHandle(1), &key(b"whole"), b"1").unwrap();
    tx.commit().unwrap();
    let clean_len = journal.stats().current_address;
    drop(journal);

    let cx = SessionContext::new();
    let segment = repo.open(0).unwrap();
    segment.buf_mut().extend_from_slice(&[0x13; 21]);

    let journal = Journal::open(repo.clone(), clock, opts).unwrap();
    assert_eq!(journal.stats().current_address, clean_len);
    assert_eq!(segment.len(&cx).unwrap(), clean_len);
}

#[test]
fn copy_back_moves_pages_and_releases_generations() {
    let opts = small_opts(256);
    let (repo, clock, journal) = mem_journal(opts);

    for page in 0..6u64 {
        let ts = clock.next();
        journal
            .write_page_image(VolumeHandle(1), page, ts, &[page as u8; 100])
            .unwrap();
    }
    assert!(repo.existing_generations().unwrap().len() > 2);
    journal.checkpoint(None).unwrap().expect("nothing in flight");

    let store = CapturingStore::default();
    let copied = journal.copy_back_pages(&store).unwrap();
    assert_eq!(copied, 6);
    assert!(store.syncs.load(Ordering::SeqCst) > 0);
    for page in 0..6u64 {
        assert_eq!(
            store.pages.lock().get(&(VolumeHandle(1), page)).unwrap(),
            &vec![page as u8; 100]
        );
    }

    // Everything below the checkpoint cut is gone; the journal still
    // remembers no pages.
    let stats = journal.stats();
    assert_eq!(stats.page_images, 0);
    let remaining = repo.existing_generations().unwrap();
    assert_eq!(remaining.first().copied(), Some(stats.generation));
    assert!(stats.base_address > 0);
}

#[test]
fn append_only_journal_never_discards() {
    let opts = Options {
        append_only: true,
        ..small_opts(256)
    };
    let (repo, clock, journal) = mem_journal(opts);

    for page in 0..6u64 {
        let ts = clock.next();
        journal
            .write_page_image(VolumeHandle(1), page, ts, &[page as u8; 100])
            .unwrap();
    }
    journal.checkpoint(None).unwrap().expect("nothing in flight");
    let generations = repo.existing_generations().unwrap();

    let store = CapturingStore::default();
    assert_eq!(journal.copy_back_pages(&store).unwrap(), 0);
    assert!(store.pages.lock().is_empty());
    assert_eq!(repo.existing_generations().unwrap(), generations);
    assert_eq!(journal.stats().page_images, 6);
}

#[test]
fn checkpoint_defers_while_a_chunked_transaction_is_open() {
    let opts = Options {
        tx_chunk_size: 1,
        ..small_opts(4096)
    };
    let (_repo, _clock, journal) = mem_journal(opts);

    let mut tx = journal.begin_transaction();
    tx.store(TreeHandle(1), &key(b"open"), b"1").unwrap();
    assert_eq!(journal.checkpoint(None).unwrap(), None);

    tx.commit().unwrap();
    assert!(journal.checkpoint(None).unwrap().is_some());
}

#[test]
fn rollback_signal_retries_then_succeeds() {
    let opts = small_opts(4096);
    let (repo, _clock, journal) = mem_journal(opts);

    let attempts = AtomicUsize::new(0);
    let value = run_transaction(&journal, |tx| {
        if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
            return Err(JournalError::Rollback);
        }
        tx.store(TreeHandle(1), &key(b"retried"), b"3")?;
        Ok(42)
    })
    .unwrap();
    assert_eq!(value, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    drop(journal);

    let mut plan = RecoveryPlan::scan(repo, opts).unwrap();
    let mut listener = MapListener::default();
    let stats = plan.apply_committed_transactions(&mut listener);
    // The rolled-back attempts left no plan entries behind.
    assert_eq!(stats.size, 1);
    assert_eq!(listener.get(1, b"retried"), Some(&b"3"[..]));
}

#[test]
fn endless_rollback_becomes_transaction_failed() {
    let opts = small_opts(4096);
    let (_repo, _clock, journal) = mem_journal(opts);

    let result: Result<(), _> = run_transaction(&journal, |tx| {
        tx.store(TreeHandle(1), &key(b"doomed"), b"x")?;
        Err(JournalError::Rollback)
    });
    assert!(matches!(
        result,
        Err(JournalError::TransactionFailed { attempts: 10 })
    ));
    assert_eq!(journal.stats().live_transactions, 0);
}

#[test]
fn journal_stats_track_the_append_path() {
    let opts = small_opts(4096);
    let (_repo, _clock, journal) = mem_journal(opts);

    let before = journal.stats();
    let mut tx = journal.begin_transaction();
    tx.store(TreeHandle(1), &key(b"s"), b"v").unwrap();
    tx.commit().unwrap();
    let after = journal.stats();

    assert!(after.current_address > before.current_address);
    assert!(after.appended_bytes > before.appended_bytes);
    assert_eq!(after.live_transactions, 1);

    journal.checkpoint(None).unwrap().expect("nothing in flight");
    journal.prune_obsolete_transactions();
    assert_eq!(journal.stats().live_transactions, 0);
    assert!(journal.last_checkpoint().is_some());
}
