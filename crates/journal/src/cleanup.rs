//! Background cleanup: a bounded queue of deferred B-tree maintenance
//! actions drained by a periodic worker.
//!
//! Foreground operations that discover deferred work (a pending range
//! tombstone, obsolete versions, an index hole) offer an action and move
//! on; the worker executes batches sorted by `(kind, tree, page)` so
//! consecutive actions hit the same tree and page. Arrival order is *not*
//! preserved. Failed actions are dropped, not retried: the underlying
//! condition re-enqueues through a later discovery.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use tanoak_core::metrics::MetricsSink;
use tanoak_core::page::{PageAddress, PageStore, TreeHandle};

use crate::error::JournalError;
use crate::journal::Journal;
use crate::repo::Repo;

/// Default worker tick interval.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_millis(1000);

/// Default bound of the action queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50_000;

/// Most actions drained per tick.
pub const WORKLIST_LENGTH: usize = 500;

/// One deferred maintenance action.
///
/// The derived order is `(kind, tree, page[, level])`: all actions of one
/// kind cluster, then group by tree and page. Batches are executed in this
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CleanupAction {
    /// Materialize pending range tombstones on the leaf page's left edge.
    PruneAntiValue { tree: TreeHandle, page: PageAddress },
    /// Remove obsolete versions from the page.
    PrunePage { tree: TreeHandle, page: PageAddress },
    /// Repair an index-level inconsistency left by a prior split or
    /// delete.
    FixIndexHole {
        tree: TreeHandle,
        page: PageAddress,
        level: u32,
    },
}

/// The B-tree entry points cleanup actions re-enter.
///
/// Implementations own whatever per-caller exchange caching they need;
/// the manager passes no ambient state.
pub trait TreeMaintenance: Send + Sync {
    fn prune_anti_value(&self, tree: TreeHandle, page: PageAddress) -> anyhow::Result<()>;

    fn prune_page(&self, tree: TreeHandle, page: PageAddress) -> anyhow::Result<()>;

    fn repair_index_hole(&self, tree: TreeHandle, page: PageAddress, level: u32) -> anyhow::Result<()>;
}

/// Journal duties performed between drains of the action queue.
pub trait JournalMaintenance: Send + Sync {
    fn checkpoint_if_due(&self) -> Result<(), JournalError>;

    fn prune_obsolete_transactions(&self) -> usize;
}

/// Adapter wiring a journal and its page store into the maintenance tick.
pub struct JournalTick<R: Repo> {
    pub journal: Arc<Journal<R>>,
    pub pages: Option<Arc<dyn PageStore>>,
}

impl<R> JournalMaintenance for JournalTick<R>
where
    R: Repo + Send + Sync,
    R::File: Send + Sync,
{
    fn checkpoint_if_due(&self) -> Result<(), JournalError> {
        self.journal.checkpoint_if_due(self.pages.as_deref()).map(drop)
    }

    fn prune_obsolete_transactions(&self) -> usize {
        self.journal.prune_obsolete_transactions()
    }
}

/// Counters operators read to watch the cleanup pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CleanupStats {
    pub accepted: u64,
    pub refused: u64,
    pub performed: u64,
    pub errors: u64,
    /// Actions currently waiting in the queue.
    pub enqueued: usize,
}

struct Shared {
    queue: ArrayQueue<CleanupAction>,
    closed: AtomicBool,
    flush_on_close: AtomicBool,
    interval_ms: AtomicU64,
    accepted: AtomicU64,
    refused: AtomicU64,
    performed: AtomicU64,
    errors: AtomicU64,
    gate: Mutex<()>,
    wake: Condvar,
    trees: Arc<dyn TreeMaintenance>,
    journal: Arc<dyn JournalMaintenance>,
    metrics: Arc<dyn MetricsSink>,
}

impl Shared {
    fn tick(&self) {
        self.metrics.poll();
        if let Err(e) = self.journal.checkpoint_if_due() {
            self.metrics.report("checkpoint", &e);
        }
        let pruned = self.journal.prune_obsolete_transactions();
        if pruned > 0 {
            debug!("pruned {pruned} obsolete transactions");
        }
        self.drain_batch();
    }

    /// Drain up to [`WORKLIST_LENGTH`] actions, sort, execute in order.
    /// Returns how many were drained.
    fn drain_batch(&self) -> usize {
        let mut batch = Vec::with_capacity(WORKLIST_LENGTH.min(self.queue.len()));
        while batch.len() < WORKLIST_LENGTH {
            let Some(action) = self.queue.pop() else {
                break;
            };
            batch.push(action);
        }
        if batch.is_empty() {
            return 0;
        }
        batch.sort_unstable();
        for action in &batch {
            match self.execute(action) {
                Ok(()) => {
                    self.performed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    self.metrics.report("cleanup", &format!("{action:?}: {e:#}"));
                }
            }
        }
        batch.len()
    }

    fn execute(&self, action: &CleanupAction) -> anyhow::Result<()> {
        match *action {
            CleanupAction::PruneAntiValue { tree, page } => self.trees.prune_anti_value(tree, page),
            CleanupAction::PrunePage { tree, page } => self.trees.prune_page(tree, page),
            CleanupAction::FixIndexHole { tree, page, level } => self.trees.repair_index_hole(tree, page, level),
        }
    }
}

/// The background cleanup engine.
pub struct CleanupManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupManager {
    pub fn new(
        trees: Arc<dyn TreeMaintenance>,
        journal: Arc<dyn JournalMaintenance>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY, trees, journal, metrics)
    }

    pub fn with_capacity(
        capacity: usize,
        trees: Arc<dyn TreeMaintenance>,
        journal: Arc<dyn JournalMaintenance>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: ArrayQueue::new(capacity),
                closed: AtomicBool::new(false),
                flush_on_close: AtomicBool::new(false),
                interval_ms: AtomicU64::new(DEFAULT_CLEANUP_INTERVAL.as_millis() as u64),
                accepted: AtomicU64::new(0),
                refused: AtomicU64::new(0),
                performed: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                gate: Mutex::new(()),
                wake: Condvar::new(),
                trees,
                journal,
                metrics,
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start (or, after [`close`](Self::close), restart) the worker.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.flush_on_close.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("tanoak-cleanup".into())
            .spawn(move || worker_loop(shared))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Offer an action. Non-blocking: a full queue refuses the action.
    pub fn offer(&self, action: CleanupAction) -> bool {
        if self.shared.queue.push(action).is_ok() {
            self.shared.accepted.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.shared.refused.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Run one maintenance tick inline, regardless of the worker.
    pub fn poll_once(&self) {
        self.shared.tick();
    }

    pub fn minimum_pruning_delay(&self) -> Duration {
        Duration::from_millis(self.shared.interval_ms.load(Ordering::SeqCst))
    }

    pub fn set_minimum_pruning_delay(&self, delay: Duration) {
        self.shared.interval_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn stats(&self) -> CleanupStats {
        CleanupStats {
            accepted: self.shared.accepted.load(Ordering::Relaxed),
            refused: self.shared.refused.load(Ordering::Relaxed),
            performed: self.shared.performed.load(Ordering::Relaxed),
            errors: self.shared.errors.load(Ordering::Relaxed),
            enqueued: self.shared.queue.len(),
        }
    }

    /// Stop the worker at the next tick boundary and join it.
    ///
    /// With `flush`, pending actions are drained best-effort before the
    /// worker exits. [`start`](Self::start) afterwards is permitted.
    pub fn close(&self, flush: bool) {
        self.shared.flush_on_close.store(flush, Ordering::SeqCst);
        self.shared.closed.store(true, Ordering::SeqCst);
        {
            let _gate = self.shared.gate.lock();
            self.shared.wake.notify_all();
        }
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("cleanup worker panicked");
            }
        }
    }
}

impl Drop for CleanupManager {
    fn drop(&mut self) {
        self.close(false);
    }
}

fn worker_loop(shared: Arc<Shared>) {
    debug!("cleanup worker running");
    loop {
        {
            let mut gate = shared.gate.lock();
            if !shared.closed.load(Ordering::SeqCst) {
                let interval = Duration::from_millis(shared.interval_ms.load(Ordering::SeqCst));
                shared.wake.wait_for(&mut gate, interval);
            }
        }
        if shared.closed.load(Ordering::SeqCst) {
            if shared.flush_on_close.load(Ordering::SeqCst) {
                while shared.drain_batch() > 0 {}
            }
            debug!("cleanup worker stopped");
            return;
        }
        shared.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use pretty_assertions::assert_eq;
    use tanoak_core::metrics::LogSink;

    #[derive(Default)]
    struct RecordingTrees {
        executed: PlMutex<Vec<CleanupAction>>,
        fail_prune_page: bool,
    }

    impl TreeMaintenance for RecordingTrees {
        fn prune_anti_value(&self, tree: TreeHandle, page: PageAddress) -> anyhow::Result<()> {
            self.executed.lock().push(CleanupAction::PruneAntiValue { tree, page });
            Ok(())
        }

        fn prune_page(&self, tree: TreeHandle, page: PageAddress) -> anyhow::Result<()> {
            if self.fail_prune_page {
                anyhow::bail!("page busy");
            }
            self.executed.lock().push(CleanupAction::PrunePage { tree, page });
            Ok(())
        }

        fn repair_index_hole(&self, tree: TreeHandle, page: PageAddress, level: u32) -> anyhow::Result<()> {
            self.executed.lock().push(CleanupAction::FixIndexHole { tree, page, level });
            Ok(())
        }
    }

    #[derive(Default)]
    struct IdleJournal;

    impl JournalMaintenance for IdleJournal {
        fn checkpoint_if_due(&self) -> Result<(), JournalError> {
            Ok(())
        }

        fn prune_obsolete_transactions(&self) -> usize {
            0
        }
    }

    fn manager(trees: Arc<RecordingTrees>, capacity: usize) -> CleanupManager {
        CleanupManager::with_capacity(capacity, trees, Arc::new(IdleJournal), Arc::new(LogSink))
    }

    fn prune_page(tree: u32, page: u64) -> CleanupAction {
        CleanupAction::PrunePage {
            tree: TreeHandle(tree),
            page,
        }
    }

    fn prune_anti_value(tree: u32, page: u64) -> CleanupAction {
        CleanupAction::PruneAntiValue {
            tree: TreeHandle(tree),
            page,
        }
    }

    #[test]
    fn batches_run_in_action_order_not_arrival_order() {
        let trees = Arc::new(RecordingTrees::default());
        let manager = manager(Arc::clone(&trees), 16);

        assert!(manager.offer(prune_page(1, 20)));
        assert!(manager.offer(prune_anti_value(1, 10)));
        assert!(manager.offer(prune_page(2, 5)));
        assert!(manager.offer(prune_page(1, 10)));
        manager.poll_once();

        assert_eq!(
            *trees.executed.lock(),
            vec![
                prune_anti_value(1, 10),
                prune_page(1, 10),
                prune_page(1, 20),
                prune_page(2, 5),
            ]
        );
        assert_eq!(manager.stats().performed, 4);
    }

    #[test]
    fn full_queue_refuses_and_counts() {
        let trees = Arc::new(RecordingTrees::default());
        let manager = manager(trees, 2);

        assert!(manager.offer(prune_page(1, 1)));
        assert!(manager.offer(prune_page(1, 2)));
        assert!(!manager.offer(prune_page(1, 3)));

        let stats = manager.stats();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.refused, 1);
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.accepted + stats.refused, 3);
    }

    #[test]
    fn failed_actions_are_dropped_not_retried() {
        let trees = Arc::new(RecordingTrees {
            executed: PlMutex::new(Vec::new()),
            fail_prune_page: true,
        });
        let manager = manager(Arc::clone(&trees), 16);

        manager.offer(prune_page(1, 1));
        manager.offer(prune_anti_value(1, 1));
        manager.poll_once();

        let stats = manager.stats();
        assert_eq!(stats.performed, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.enqueued, 0);

        // Nothing re-runs on the next tick.
        manager.poll_once();
        assert_eq!(manager.stats().errors, 1);
    }

    #[test]
    fn close_with_flush_drains_the_queue() {
        let trees = Arc::new(RecordingTrees::default());
        let manager = manager(Arc::clone(&trees), 2048);
        manager.start().unwrap();

        for page in 0..1200 {
            assert!(manager.offer(prune_page(1, page)));
        }
        manager.close(true);

        assert_eq!(manager.stats().enqueued, 0);
        assert_eq!(trees.executed.lock().len(), 1200);
    }

    #[test]
    fn restart_after_close_is_permitted() {
        let trees = Arc::new(RecordingTrees::default());
        let manager = manager(Arc::clone(&trees), 16);

        manager.start().unwrap();
        manager.close(false);
        manager.start().unwrap();

        manager.offer(prune_page(3, 3));
        manager.poll_once();
        assert_eq!(trees.executed.lock().len(), 1);
        manager.close(false);
    }

    #[test]
    fn action_order_clusters_kinds_first() {
        let mut actions = vec![
            CleanupAction::FixIndexHole {
                tree: TreeHandle(0),
                page: 0,
                level: 0,
            },
            prune_page(0, 0),
            prune_anti_value(9, 9),
        ];
        actions.sort_unstable();
        assert!(matches!(actions[0], CleanupAction::PruneAntiValue { .. }));
        assert!(matches!(actions[1], CleanupAction::PrunePage { .. }));
        assert!(matches!(actions[2], CleanupAction::FixIndexHole { .. }));
    }
}
