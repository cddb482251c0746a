//! Shared/exclusive claims over engine resources.
//!
//! A [`SharedResource`] is the holder-side handle of a many-reader /
//! one-writer latch. [`ReentrantClaim`] layers a per-holder counter on top
//! so the same holder can claim the resource repeatedly without deadlocking
//! against itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ClaimError {
    #[error("operation requires a claim that is not held")]
    InvalidState,
    #[error("claim acquisition timed out")]
    InUse,
}

/// Holder-side handle of a claimable resource.
///
/// Each holder owns its own handle; the handles of one resource coordinate
/// through shared state behind them.
pub trait SharedResource {
    /// Acquire a reader (or, with `writer`, an exclusive) claim, waiting at
    /// most `timeout`. Returns `false` on timeout; a timed-out acquisition
    /// never leaves a partial claim behind.
    fn claim(&mut self, writer: bool, timeout: Duration) -> bool;

    /// Atomically promote a held reader claim to a writer claim.
    ///
    /// Returns `false` without giving up the reader claim if promotion is
    /// impossible (other readers present, or no reader claim held).
    fn upgrade_claim(&mut self) -> bool;

    /// Release the held claim.
    fn release(&mut self);

    /// `true` if this holder currently holds the writer claim.
    fn is_writer(&self) -> bool;
}

/// Re-entrant wrapper over a [`SharedResource`].
///
/// The first `claim` acquires the underlying resource; nested claims only
/// bump a counter. A writer request while holding a reader claim attempts
/// promotion, and a failed promotion leaves the counter untouched. The
/// underlying resource is released when the counter returns to zero.
#[derive(Debug)]
pub struct ReentrantClaim<R> {
    resource: R,
    count: u32,
}

impl<R: SharedResource> ReentrantClaim<R> {
    pub fn new(resource: R) -> Self {
        Self { resource, count: 0 }
    }

    pub fn claim(&mut self, writer: bool, timeout: Duration) -> bool {
        if self.count == 0 {
            if !self.resource.claim(writer, timeout) {
                return false;
            }
        } else if writer && !self.resource.is_writer() && !self.resource.upgrade_claim() {
            return false;
        }
        self.count += 1;
        true
    }

    pub fn release(&mut self) -> Result<(), ClaimError> {
        if self.count == 0 {
            return Err(ClaimError::InvalidState);
        }
        self.count -= 1;
        if self.count == 0 {
            self.resource.release();
        }
        Ok(())
    }

    pub fn is_writer(&self) -> bool {
        self.count > 0 && self.resource.is_writer()
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Assertion hook for scope exit: every claim must have been released.
    pub fn verify_released(&self) -> Result<(), ClaimError> {
        if self.count != 0 {
            return Err(ClaimError::InvalidState);
        }
        Ok(())
    }
}

#[derive(Default)]
struct LatchState {
    readers: usize,
    writer: bool,
}

#[derive(Default)]
struct LatchCore {
    state: Mutex<LatchState>,
    available: Condvar,
}

/// What this holder's handle currently holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Held {
    None,
    Reader,
    Writer,
}

/// A many-reader / one-writer latch with timed acquisition and atomic
/// reader-to-writer promotion for a sole reader.
///
/// Promotion never passes through an unlocked window: a failed promotion
/// leaves the reader claim in place.
pub struct Latch {
    core: Arc<LatchCore>,
    held: Held,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            core: Arc::new(LatchCore::default()),
            held: Held::None,
        }
    }

    /// A fresh holder handle of the same latch.
    pub fn handle(&self) -> Latch {
        Latch {
            core: Arc::clone(&self.core),
            held: Held::None,
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedResource for Latch {
    fn claim(&mut self, writer: bool, timeout: Duration) -> bool {
        if self.held != Held::None {
            return false;
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.core.state.lock();
        loop {
            let free = if writer {
                !state.writer && state.readers == 0
            } else {
                !state.writer
            };
            if free {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.core.available.wait_for(&mut state, deadline - now);
        }
        if writer {
            state.writer = true;
            self.held = Held::Writer;
        } else {
            state.readers += 1;
            self.held = Held::Reader;
        }
        true
    }

    fn upgrade_claim(&mut self) -> bool {
        if self.held != Held::Reader {
            return false;
        }
        let mut state = self.core.state.lock();
        if state.readers == 1 && !state.writer {
            state.readers = 0;
            state.writer = true;
            self.held = Held::Writer;
            true
        } else {
            false
        }
    }

    fn release(&mut self) {
        {
            let mut state = self.core.state.lock();
            match self.held {
                Held::Reader => state.readers -= 1,
                Held::Writer => state.writer = false,
                Held::None => return,
            }
            self.held = Held::None;
        }
        self.core.available.notify_all();
    }

    fn is_writer(&self) -> bool {
        self.held == Held::Writer
    }
}

impl Drop for Latch {
    fn drop(&mut self) {
        if self.held != Held::None {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    const SHORT: Duration = Duration::from_millis(10);
    const LONG: Duration = Duration::from_secs(5);

    /// Records net acquisitions so tests can check the wrapper's accounting.
    #[derive(Clone, Default)]
    struct Probe {
        acquired: Rc<Cell<u32>>,
        writer: Rc<Cell<bool>>,
        refuse_upgrade: Rc<Cell<bool>>,
    }

    impl SharedResource for Probe {
        fn claim(&mut self, writer: bool, _timeout: Duration) -> bool {
            self.acquired.set(self.acquired.get() + 1);
            self.writer.set(writer);
            true
        }

        fn upgrade_claim(&mut self) -> bool {
            if self.refuse_upgrade.get() {
                return false;
            }
            self.writer.set(true);
            true
        }

        fn release(&mut self) {
            self.acquired.set(self.acquired.get() - 1);
            self.writer.set(false);
        }

        fn is_writer(&self) -> bool {
            self.writer.get()
        }
    }

    #[test]
    fn nested_claims_acquire_once() {
        let probe = Probe::default();
        let mut claim = ReentrantClaim::new(probe.clone());

        assert!(claim.claim(false, SHORT));
        assert!(claim.claim(false, SHORT));
        assert!(claim.claim(false, SHORT));
        assert_eq!(probe.acquired.get(), 1);
        assert_eq!(claim.count(), 3);

        claim.release().unwrap();
        claim.release().unwrap();
        assert_eq!(probe.acquired.get(), 1);
        claim.release().unwrap();
        assert_eq!(probe.acquired.get(), 0);
        claim.verify_released().unwrap();
    }

    #[test]
    fn release_without_claim_is_invalid() {
        let mut claim = ReentrantClaim::new(Probe::default());
        assert_eq!(claim.release(), Err(ClaimError::InvalidState));
    }

    #[test]
    fn writer_request_upgrades_reader_claim() {
        let probe = Probe::default();
        let mut claim = ReentrantClaim::new(probe.clone());

        assert!(claim.claim(false, SHORT));
        assert!(!claim.is_writer());
        assert!(claim.claim(true, SHORT));
        assert!(claim.is_writer());
        assert_eq!(probe.acquired.get(), 1);
        assert_eq!(claim.count(), 2);
    }

    #[test]
    fn failed_upgrade_leaves_counter_untouched() {
        let probe = Probe::default();
        probe.refuse_upgrade.set(true);
        let mut claim = ReentrantClaim::new(probe.clone());

        assert!(claim.claim(false, SHORT));
        assert!(!claim.claim(true, SHORT));
        assert_eq!(claim.count(), 1);
        assert!(!claim.is_writer());
        assert_eq!(probe.acquired.get(), 1);
    }

    #[test]
    fn latch_timeout_returns_false() {
        let writer_side = Latch::new();
        let mut writer = writer_side.handle();
        assert!(writer.claim(true, SHORT));

        let mut reader = writer_side.handle();
        assert!(!reader.claim(false, SHORT));
        assert!(!reader.is_writer());

        writer.release();
        assert!(reader.claim(false, SHORT));
    }

    #[test]
    fn latch_promotes_sole_reader_only() {
        let latch = Latch::new();
        let mut a = latch.handle();
        let mut b = latch.handle();

        assert!(a.claim(false, SHORT));
        assert!(b.claim(false, SHORT));
        assert!(!a.upgrade_claim());
        assert!(!a.is_writer());

        b.release();
        assert!(a.upgrade_claim());
        assert!(a.is_writer());
    }

    #[test]
    fn latch_blocks_concurrent_writers() {
        let latch = Latch::new();
        let mut holder = latch.handle();
        assert!(holder.claim(true, SHORT));

        let contender_core = latch.handle();
        let handle = std::thread::spawn(move || {
            let mut contender = contender_core;
            contender.claim(true, LONG)
        });

        std::thread::sleep(SHORT);
        holder.release();
        assert!(handle.join().unwrap());
    }
}
