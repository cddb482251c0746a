//! Shared vocabulary of the tanoak storage engine.
//!
//! Everything here is free of I/O: logical clocks, key encodings, session
//! identities, claim primitives and the seams (page store, metrics) through
//! which the journal talks to its collaborators.

pub mod buf;
pub mod claim;
pub mod clock;
pub mod key;
pub mod metrics;
pub mod page;
pub mod policy;
pub mod registry;
pub mod session;

pub use crate::{
    clock::{Timestamp, TimestampAllocator},
    key::{AntiValue, Key, KeyError, KeyState, MAX_KEY_LENGTH},
    page::{PageAddress, PageError, PageStore, TreeDescriptor, TreeHandle, VolumeDescriptor, VolumeHandle},
    session::{ControlToken, SessionContext},
};
