//! A file handle that survives caller interruption.
//!
//! Interrupting a caller blocked on file I/O invalidates the shared handle.
//! [`MediatedFile`] repairs that transparently: the interrupted caller's
//! operation reopens the file before it reports
//! [`ChannelError::Interrupted`], so every other caller keeps running
//! against a valid handle. Reopening is coalesced: concurrent repairs
//! collapse into one `open(2)`.
//!
//! The surface is strictly positional. Interruption is an explicit signal
//! on the calling [`SessionContext`], not an OS thread property.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tanoak_core::session::SessionContext;
use tanoak_paths::lock_sidecar;

use crate::error::ChannelError;
use crate::repo::JournalFile;

#[cfg(unix)]
fn read_at(file: &File, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::unix::fs::FileExt::read_at(file, buf, pos)
}

#[cfg(unix)]
fn write_all_at(file: &File, pos: u64, buf: &[u8]) -> io::Result<()> {
    std::os::unix::fs::FileExt::write_all_at(file, buf, pos)
}

#[cfg(windows)]
fn read_at(file: &File, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
    std::os::windows::fs::FileExt::seek_read(file, buf, pos)
}

#[cfg(windows)]
fn write_all_at(file: &File, pos: u64, mut buf: &[u8]) -> io::Result<()> {
    let mut pos = pos;
    while !buf.is_empty() {
        let n = std::os::windows::fs::FileExt::seek_write(file, buf, pos)?;
        pos += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

#[derive(Default, Debug)]
struct Slot {
    file: Option<Arc<File>>,
}

/// File channel wrapper with transparent reopen and advisory locking.
#[derive(Debug)]
pub struct MediatedFile {
    path: PathBuf,
    slot: Mutex<Slot>,
    closed: AtomicBool,
    /// Sidecar handle; holding it keeps the advisory lock alive.
    lock: Mutex<Option<File>>,
}

impl MediatedFile {
    /// Create the file, failing with [`io::ErrorKind::AlreadyExists`]
    /// unless an existing file is completely empty.
    pub fn create_new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = match OpenOptions::new().read(true).write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let file = OpenOptions::new().read(true).write(true).open(&path)?;
                if file.metadata()?.len() != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} already exists and is non-empty", path.display()),
                    ));
                }
                file
            }
            Err(e) => return Err(e),
        };
        Ok(Self::with_file(path, file))
    }

    /// Open an existing file.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self::with_file(path, file))
    }

    fn with_file(path: PathBuf, file: File) -> Self {
        Self {
            path,
            slot: Mutex::new(Slot {
                file: Some(Arc::new(file)),
            }),
            closed: AtomicBool::new(false),
            lock: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current handle, reopening if a prior invalidation left none.
    /// Concurrent reopens coalesce under the slot lock.
    fn handle(&self) -> Result<Arc<File>, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut slot = self.slot.lock();
        if let Some(file) = &slot.file {
            return Ok(Arc::clone(file));
        }
        debug!("reopening {}", self.path.display());
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let file = Arc::new(file);
        slot.file = Some(Arc::clone(&file));
        Ok(file)
    }

    /// Drop the current handle so the next operation reopens.
    pub(crate) fn invalidate(&self) {
        self.slot.lock().file = None;
    }

    /// Run `op` against the current handle, repairing the handle as needed.
    ///
    /// If the calling session has a pending interrupt, the handle is
    /// invalidated (the interrupt closed it), reopened on behalf of the
    /// other callers, and `Interrupted` is returned exactly once per
    /// delivered interrupt.
    fn run<T>(&self, cx: &SessionContext, mut op: impl FnMut(&File) -> io::Result<T>) -> Result<T, ChannelError> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ChannelError::Closed);
            }
            if cx.take_interrupt() {
                self.invalidate();
                // Restore the handle before reporting, so other callers
                // never observe the closure.
                let _ = self.handle();
                return Err(ChannelError::Interrupted);
            }
            let file = self.handle()?;
            match op(&file) {
                Ok(val) => return Ok(val),
                // Interrupted syscall: retry against a fresh handle.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }

    /// Try to take the advisory lock through the `.lck` sidecar.
    ///
    /// Returns `Ok(false)` if another process holds a conflicting lock.
    /// A shared request that cannot create the sidecar (read-only media)
    /// silently succeeds without enforcing anything.
    pub fn try_lock(&self, shared: bool) -> Result<bool, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed);
        }
        let mut lock = self.lock.lock();
        if lock.is_none() {
            let sidecar = lock_sidecar(&self.path);
            match OpenOptions::new().read(true).write(true).create(true).open(&sidecar) {
                Ok(file) => *lock = Some(file),
                Err(e) if shared => {
                    debug!("no lock sidecar for {}: {e}", self.path.display());
                    return Ok(true);
                }
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
        let file = lock.as_ref().expect("sidecar was just ensured");
        // Called via the trait so the std inherent lock methods (with their
        // different signatures) can never shadow these.
        let result = if shared {
            fs2::FileExt::try_lock_shared(file)
        } else {
            fs2::FileExt::try_lock_exclusive(file)
        };
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(ChannelError::Io(e)),
        }
    }

    /// Blocking locks are not supported by design; use [`Self::try_lock`].
    pub fn lock(&self, _shared: bool) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported)
    }

    /// Close the channel. Sticky: no operation will reopen it afterwards.
    pub fn close(&self) -> Result<(), ChannelError> {
        self.closed.store(true, Ordering::SeqCst);
        self.slot.lock().file = None;
        if let Some(lock) = self.lock.lock().take() {
            let _ = fs2::FileExt::unlock(&lock);
        }
        Ok(())
    }
}

impl JournalFile for MediatedFile {
    fn read_at(&self, cx: &SessionContext, pos: u64, buf: &mut [u8]) -> Result<usize, ChannelError> {
        self.run(cx, |file| read_at(file, pos, buf))
    }

    fn write_all_at(&self, cx: &SessionContext, pos: u64, buf: &[u8]) -> Result<(), ChannelError> {
        self.run(cx, |file| write_all_at(file, pos, buf))
    }

    fn truncate(&self, cx: &SessionContext, len: u64) -> Result<(), ChannelError> {
        self.run(cx, |file| file.set_len(len))
    }

    fn len(&self, cx: &SessionContext) -> Result<u64, ChannelError> {
        self.run(cx, |file| file.metadata().map(|m| m.len()))
    }

    fn sync(&self, cx: &SessionContext, metadata: bool) -> Result<(), ChannelError> {
        self.run(cx, |file| if metadata { file.sync_all() } else { file.sync_data() })
    }
}
