//! In-memory implementation of [`Repo`].

use std::collections::{btree_map, BTreeMap};
use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};
use tanoak_core::session::SessionContext;

use crate::error::ChannelError;
use crate::repo::{JournalFile, Repo};

type SharedBytes = Arc<RwLock<Vec<u8>>>;

/// A journal segment backed by a `Vec<u8>`.
///
/// Interruption is not modeled here; sessions are accepted and ignored.
/// Tests that need interrupt behavior go through the mediated file.
#[derive(Clone, Debug, Default)]
pub struct Segment {
    buf: SharedBytes,
}

impl Segment {
    /// Mutable access to the raw bytes, for tests that deliberately
    /// corrupt or truncate segment data.
    pub fn buf_mut(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.buf.write()
    }
}

impl From<SharedBytes> for Segment {
    fn from(buf: SharedBytes) -> Self {
        Self { buf }
    }
}

impl JournalFile for Segment {
    fn read_at(&self, _cx: &SessionContext, pos: u64, buf: &mut [u8]) -> Result<usize, ChannelError> {
        let inner = self.buf.read();
        let pos = pos as usize;
        if pos >= inner.len() {
            return Ok(0);
        }
        let n = buf.len().min(inner.len() - pos);
        buf[..n].copy_from_slice(&inner[pos..pos + n]);
        Ok(n)
    }

    fn write_all_at(&self, _cx: &SessionContext, pos: u64, buf: &[u8]) -> Result<(), ChannelError> {
        let mut inner = self.buf.write();
        let end = pos as usize + buf.len();
        if inner.len() < end {
            inner.resize(end, 0);
        }
        inner[pos as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&self, _cx: &SessionContext, len: u64) -> Result<(), ChannelError> {
        let mut inner = self.buf.write();
        inner.resize(len as usize, 0);
        Ok(())
    }

    fn len(&self, _cx: &SessionContext) -> Result<u64, ChannelError> {
        Ok(self.buf.read().len() as u64)
    }

    fn sync(&self, _cx: &SessionContext, _metadata: bool) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// In-memory [`Repo`].
#[derive(Clone, Debug, Default)]
pub struct Memory(Arc<RwLock<BTreeMap<u64, SharedBytes>>>);

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Display for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<memory>")
    }
}

impl Repo for Memory {
    type File = Segment;

    fn create(&self, generation: u64) -> io::Result<Self::File> {
        let mut inner = self.0.write();
        match inner.entry(generation) {
            btree_map::Entry::Occupied(entry) => {
                let buf = entry.get();
                if buf.read().is_empty() {
                    Ok(Segment::from(Arc::clone(buf)))
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("segment {generation} already exists"),
                    ))
                }
            }
            btree_map::Entry::Vacant(entry) => {
                let buf = entry.insert(Default::default());
                Ok(Segment::from(Arc::clone(buf)))
            }
        }
    }

    fn open(&self, generation: u64) -> io::Result<Self::File> {
        let inner = self.0.read();
        let Some(buf) = inner.get(&generation) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {generation} does not exist"),
            ));
        };
        Ok(Segment::from(Arc::clone(buf)))
    }

    fn remove(&self, generation: u64) -> io::Result<()> {
        let mut inner = self.0.write();
        if inner.remove(&generation).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("segment {generation} does not exist"),
            ));
        }
        Ok(())
    }

    fn existing_generations(&self) -> io::Result<Vec<u64>> {
        Ok(self.0.read().keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_positional_io() {
        let cx = SessionContext::new();
        let segment = Segment::default();

        segment.write_all_at(&cx, 0, b"alonso").unwrap();
        segment.write_all_at(&cx, 8, b"!").unwrap();
        assert_eq!(segment.len(&cx).unwrap(), 9);

        let mut buf = [0; 6];
        segment.read_exact_at(&cx, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"alonso");

        // Reads past the gap see the zero fill.
        let mut buf = [1; 3];
        segment.read_exact_at(&cx, 6, &mut buf).unwrap();
        assert_eq!(&buf, &[0, 0, b'!']);

        // Reads past EOF return 0.
        assert_eq!(segment.read_at(&cx, 9, &mut buf).unwrap(), 0);
    }

    #[test]
    fn create_is_exclusive_unless_empty() {
        let repo = Memory::new();
        let cx = SessionContext::new();

        let first = repo.create(0).unwrap();
        // Still empty, create is permitted again.
        repo.create(0).unwrap();

        first.write_all_at(&cx, 0, b"x").unwrap();
        assert_eq!(repo.create(0).unwrap_err().kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn generations_are_sorted() {
        let repo = Memory::new();
        for generation in [3, 0, 7] {
            repo.create(generation).unwrap();
        }
        assert_eq!(repo.existing_generations().unwrap(), vec![0, 3, 7]);
        repo.remove(3).unwrap();
        assert_eq!(repo.existing_generations().unwrap(), vec![0, 7]);
        assert_eq!(repo.remove(3).unwrap_err().kind(), io::ErrorKind::NotFound);
    }
}
