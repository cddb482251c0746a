//! Filesystem implementation of [`Repo`].

use std::fmt;
use std::fs;
use std::io;

use log::warn;
use tanoak_paths::JournalBase;

use crate::channel::MediatedFile;
use crate::repo::Repo;

/// A segment repository storing generations as ordinary files named
/// `<base>.<generation>`, accessed through [`MediatedFile`] so segment I/O
/// tolerates caller interruption.
#[derive(Clone)]
pub struct Fs {
    base: JournalBase,
}

impl Fs {
    /// A repository rooted at `base`. The containing directory must exist
    /// and be writable.
    pub fn new(base: JournalBase) -> Self {
        Self { base }
    }

    pub fn base(&self) -> &JournalBase {
        &self.base
    }
}

impl fmt::Display for Fs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)
    }
}

impl Repo for Fs {
    type File = MediatedFile;

    fn create(&self, generation: u64) -> io::Result<Self::File> {
        MediatedFile::create_new(self.base.segment(generation).into_path_buf())
    }

    fn open(&self, generation: u64) -> io::Result<Self::File> {
        MediatedFile::open(self.base.segment(generation).into_path_buf())
    }

    fn remove(&self, generation: u64) -> io::Result<()> {
        let segment = self.base.segment(generation);
        let sidecar = tanoak_paths::lock_sidecar(segment.as_ref());
        if sidecar.exists() {
            if let Err(e) = fs::remove_file(&sidecar) {
                warn!("repo {}: failed to remove lock sidecar of {generation}: {e}", self);
            }
        }
        fs::remove_file(segment.as_ref())
    }

    fn existing_generations(&self) -> io::Result<Vec<u64>> {
        let mut generations = Vec::new();
        for entry in fs::read_dir(self.base.dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(generation) = self.base.generation_of(&entry.path()) {
                generations.push(generation);
            }
        }
        generations.sort_unstable();
        Ok(generations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::JournalFile as _;
    use tanoak_core::session::SessionContext;

    fn repo() -> (tempfile::TempDir, Fs) {
        let dir = tempfile::tempdir().unwrap();
        let base = JournalBase::new(dir.path().join("journal"));
        (dir, Fs::new(base))
    }

    #[test]
    fn create_open_remove() {
        let (_dir, repo) = repo();
        let cx = SessionContext::new();

        let file = repo.create(0).unwrap();
        file.write_all_at(&cx, 0, b"zero").unwrap();
        repo.create(1).unwrap();
        assert_eq!(repo.existing_generations().unwrap(), vec![0, 1]);

        assert_eq!(repo.create(0).unwrap_err().kind(), io::ErrorKind::AlreadyExists);

        let mut buf = [0; 4];
        repo.open(0).unwrap().read_exact_at(&cx, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"zero");

        repo.remove(0).unwrap();
        assert_eq!(repo.open(0).unwrap_err().kind(), io::ErrorKind::NotFound);
        assert_eq!(repo.existing_generations().unwrap(), vec![1]);
    }

    #[test]
    fn foreign_files_are_ignored() {
        let (dir, repo) = repo();
        repo.create(2).unwrap();
        fs::write(dir.path().join("journal.lck"), b"").unwrap();
        fs::write(dir.path().join("unrelated"), b"").unwrap();

        assert_eq!(repo.existing_generations().unwrap(), vec![2]);
    }
}
