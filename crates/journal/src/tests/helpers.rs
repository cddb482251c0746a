use std::collections::BTreeMap;
use std::sync::Arc;

use tanoak_core::clock::{Timestamp, TimestampAllocator};
use tanoak_core::key::Key;
use tanoak_core::page::{TreeDescriptor, TreeHandle, VolumeDescriptor, VolumeHandle};

use crate::error::JournalError;
use crate::journal::Journal;
use crate::player::ReplayListener;
use crate::record::{AccumulatorKind, JournalAddress};
use crate::repo::Memory;
use crate::Options;

pub fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

pub fn small_opts(block_size: u64) -> Options {
    Options {
        block_size,
        ..Options::default()
    }
}

/// A journal over a fresh in-memory repo, with one volume (handle 1) and
/// one tree (handle 1) installed.
pub fn mem_journal(opts: Options) -> (Memory, Arc<TimestampAllocator>, Journal<Memory>) {
    let repo = Memory::new();
    let clock = Arc::new(TimestampAllocator::new());
    let journal = Journal::open(repo.clone(), Arc::clone(&clock), opts).unwrap();
    journal
        .install_volume(VolumeDescriptor {
            handle: VolumeHandle(1),
            id: 0xda7a,
            name: "main".into(),
        })
        .unwrap();
    journal
        .install_tree(TreeDescriptor {
            handle: TreeHandle(1),
            volume: VolumeHandle(1),
            name: "fruit".into(),
        })
        .unwrap();
    (repo, clock, journal)
}

pub fn key(bytes: &[u8]) -> Key {
    Key::from_encoded(bytes).unwrap()
}

/// What a replayed transaction did, in call order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Start {
        start_ts: Timestamp,
        commit_ts: Timestamp,
    },
    Store {
        tree: TreeHandle,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    RemoveRange {
        tree: TreeHandle,
        key1: Vec<u8>,
        key2: Vec<u8>,
    },
    RemoveTree {
        tree: TreeHandle,
    },
    Delta {
        tree: TreeHandle,
        accumulator: AccumulatorKind,
        index: u32,
        value: i64,
    },
    End {
        start_ts: Timestamp,
    },
}

/// Listener maintaining a flat `(tree, key) -> value` image of the store,
/// and recording every call for ordering assertions.
///
/// Updates against a directory tree route to a per-volume directory image
/// instead of the user-tree image, the way the engine routes them to the
/// volume's directory exchange.
#[derive(Default)]
pub struct MapListener {
    pub data: BTreeMap<(TreeHandle, Vec<u8>), Vec<u8>>,
    pub directory: BTreeMap<(VolumeHandle, Vec<u8>), Vec<u8>>,
    pub events: Vec<Event>,
}

impl MapListener {
    pub fn get(&self, tree: u32, key: &[u8]) -> Option<&[u8]> {
        self.data.get(&(TreeHandle(tree), key.to_vec())).map(|v| v.as_slice())
    }

    pub fn get_directory(&self, volume: u32, key: &[u8]) -> Option<&[u8]> {
        self.directory
            .get(&(VolumeHandle(volume), key.to_vec()))
            .map(|v| v.as_slice())
    }
}

impl ReplayListener for MapListener {
    fn start_transaction(
        &mut self,
        _addr: JournalAddress,
        start_ts: Timestamp,
        commit_ts: Timestamp,
    ) -> Result<(), JournalError> {
        self.events.push(Event::Start { start_ts, commit_ts });
        Ok(())
    }

    fn store(
        &mut self,
        _addr: JournalAddress,
        _ts: Timestamp,
        tree: &TreeDescriptor,
        key: &Key,
        value: &[u8],
    ) -> Result<(), JournalError> {
        self.events.push(Event::Store {
            tree: tree.handle,
            key: key.encoded().to_vec(),
            value: value.to_vec(),
        });
        if tree.is_directory() {
            self.directory
                .insert((tree.volume, key.encoded().to_vec()), value.to_vec());
        } else {
            self.data.insert((tree.handle, key.encoded().to_vec()), value.to_vec());
        }
        Ok(())
    }

    fn remove_key_range(
        &mut self,
        _addr: JournalAddress,
        _ts: Timestamp,
        tree: &TreeDescriptor,
        key1: &Key,
        key2: &Key,
    ) -> Result<(), JournalError> {
        self.events.push(Event::RemoveRange {
            tree: tree.handle,
            key1: key1.encoded().to_vec(),
            key2: key2.encoded().to_vec(),
        });
        if tree.is_directory() {
            let low = (tree.volume, key1.encoded().to_vec());
            let high = (tree.volume, key2.encoded().to_vec());
            self.directory.retain(|entry, _| entry < &low || entry > &high);
        } else {
            let low = (tree.handle, key1.encoded().to_vec());
            let high = (tree.handle, key2.encoded().to_vec());
            self.data.retain(|entry, _| entry < &low || entry > &high);
        }
        Ok(())
    }

    fn remove_tree(
        &mut self,
        _addr: JournalAddress,
        _ts: Timestamp,
        tree: &TreeDescriptor,
    ) -> Result<(), JournalError> {
        self.events.push(Event::RemoveTree { tree: tree.handle });
        if tree.is_directory() {
            let volume = tree.volume;
            self.directory.retain(|(v, _), _| *v != volume);
        } else {
            let handle = tree.handle;
            self.data.retain(|(t, _), _| *t != handle);
        }
        Ok(())
    }

    fn delta(
        &mut self,
        _addr: JournalAddress,
        _ts: Timestamp,
        tree: &TreeDescriptor,
        accumulator: AccumulatorKind,
        index: u32,
        value: i64,
    ) -> Result<(), JournalError> {
        self.events.push(Event::Delta {
            tree: tree.handle,
            accumulator,
            index,
            value,
        });
        Ok(())
    }

    fn end_transaction(&mut self, _addr: JournalAddress, start_ts: Timestamp) -> Result<(), JournalError> {
        self.events.push(Event::End { start_ts });
        Ok(())
    }
}
