//! Storage repositories for journal segments.
//!
//! A [`Repo`] hands out generation-keyed segment files. The filesystem
//! implementation is the real one; the in-memory implementation exists so
//! recovery and replay can be exercised without touching disk.

use std::io;

use tanoak_core::session::SessionContext;

use crate::error::ChannelError;

pub(crate) mod fs;
pub mod mem;

pub use fs::Fs;
pub use mem::Memory;

/// Positional file surface of one journal segment.
///
/// All operations are positional; there is no seek state. Every call names
/// the session on whose behalf it runs, so interruption of that session is
/// observed by the I/O layer and never by anyone else.
pub trait JournalFile: std::fmt::Debug {
    fn read_at(&self, cx: &SessionContext, pos: u64, buf: &mut [u8]) -> Result<usize, ChannelError>;

    fn read_exact_at(&self, cx: &SessionContext, mut pos: u64, mut buf: &mut [u8]) -> Result<(), ChannelError> {
        while !buf.is_empty() {
            match self.read_at(cx, pos, buf)? {
                0 => {
                    return Err(ChannelError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    )))
                }
                n => {
                    pos += n as u64;
                    buf = &mut buf[n..];
                }
            }
        }
        Ok(())
    }

    fn write_all_at(&self, cx: &SessionContext, pos: u64, buf: &[u8]) -> Result<(), ChannelError>;

    fn truncate(&self, cx: &SessionContext, len: u64) -> Result<(), ChannelError>;

    fn len(&self, cx: &SessionContext) -> Result<u64, ChannelError>;

    /// Flush buffered data; with `metadata`, file metadata too.
    fn sync(&self, cx: &SessionContext, metadata: bool) -> Result<(), ChannelError>;
}

/// A repository of journal segment files, keyed by generation.
///
/// Mainly an internal seam so recovery and the journal manager can be
/// tested against an in-memory representation.
pub trait Repo: Clone {
    type File: JournalFile;

    /// Create the segment for `generation`.
    ///
    /// Must create atomically and return [`io::ErrorKind::AlreadyExists`]
    /// if the segment already exists, unless it is completely empty (a
    /// previous create got no further than the bare file).
    fn create(&self, generation: u64) -> io::Result<Self::File>;

    /// Open the existing segment for `generation`, or
    /// [`io::ErrorKind::NotFound`].
    fn open(&self, generation: u64) -> io::Result<Self::File>;

    /// Remove the segment for `generation`, or [`io::ErrorKind::NotFound`].
    fn remove(&self, generation: u64) -> io::Result<()>;

    /// All generations present, ascending.
    fn existing_generations(&self) -> io::Result<Vec<u64>>;
}
