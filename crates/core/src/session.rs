//! Per-caller session identity and cooperative interruption.
//!
//! A [`SessionContext`] names one caller of the engine. It may be bound to a
//! [`ControlToken`], an `Arc` the caller of control holds for as long as it
//! is alive, and carries the caller's pending-interrupt flag. Interruption
//! is an explicit signal consumed by the I/O layer, never a property of OS
//! threads.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one caller of control.
///
/// The caller keeps the `Arc` alive for as long as it is; liveness of
/// anything bound to the token is observed through a `Weak`.
pub struct ControlToken {
    id: u64,
}

impl ControlToken {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for ControlToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ControlToken").field(&self.id).finish()
    }
}

#[derive(Debug)]
struct SessionInner {
    id: u32,
    owner: Mutex<Weak<ControlToken>>,
    interrupted: AtomicBool,
}

/// A per-caller identity binding a transaction context.
///
/// Cheap to clone; clones share the same id, owner binding and interrupt
/// flag. Equality and hash are by id.
#[derive(Clone)]
pub struct SessionContext {
    inner: Arc<SessionInner>,
}

impl SessionContext {
    /// A fresh, unowned session.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                owner: Mutex::new(Weak::new()),
                interrupted: AtomicBool::new(false),
            }),
        }
    }

    /// A fresh session owned by `token`.
    pub fn owned_by(token: &Arc<ControlToken>) -> Self {
        let session = Self::new();
        session.bind(token);
        session
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Rebind the session to a new caller of control, e.g. on request
    /// handoff.
    pub fn bind(&self, token: &Arc<ControlToken>) {
        *self.inner.owner.lock() = Arc::downgrade(token);
    }

    pub fn owner(&self) -> Option<Arc<ControlToken>> {
        self.inner.owner.lock().upgrade()
    }

    /// `true` while the current owner is alive.
    pub fn is_alive(&self) -> bool {
        self.owner().is_some()
    }

    /// Signal the current owner, unless `by` *is* the current owner.
    ///
    /// Returns `true` if the signal was delivered.
    pub fn interrupt(&self, by: &Arc<ControlToken>) -> bool {
        match self.owner() {
            Some(owner) if !Arc::ptr_eq(&owner, by) => {
                self.inner.interrupted.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Peek at the pending-interrupt flag without consuming it.
    pub fn interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Consume the pending-interrupt flag. Each delivered interrupt is
    /// observed at most once.
    pub fn take_interrupt(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::SeqCst)
    }
}

impl Default for SessionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.inner.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl PartialEq for SessionContext {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for SessionContext {}

impl Hash for SessionContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}
