//! Typed filesystem locations used across the tanoak crates.
//!
//! Wrapping paths in newtypes keeps the journal, volume and sidecar naming
//! rules in one place, so callers cannot accidentally hand a volume path to
//! a routine expecting a journal segment.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

/// Number of decimal digits in a segment file suffix.
const GENERATION_DIGITS: usize = 12;

/// Extension of the advisory lock sidecar, appended to the primary file name.
const LOCK_SIDECAR_EXT: &str = "lck";

/// Name prefix of temporary volume files. Never recovered.
pub const TEMP_VOLUME_PREFIX: &str = "tanoak_tempvol_";

/// Name prefix of lock volume files. Behave like temporary volumes but are
/// visible to all sessions of the owning process. Never recovered.
pub const LOCK_VOLUME_PREFIX: &str = "tanoak_lockvol_";

/// The base path of a journal: segment files are derived from it by
/// appending a zero-padded generation number.
///
/// E.g. a base of `/var/db/tanoak_journal` yields segments
/// `/var/db/tanoak_journal.000000000000`, `.000000000001` and so on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalBase(PathBuf);

impl JournalBase {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The directory containing the segment files.
    pub fn dir(&self) -> &Path {
        self.0.parent().unwrap_or_else(|| Path::new("."))
    }

    /// The file name prefix shared by all segments of this journal.
    pub fn file_prefix(&self) -> OsString {
        let mut prefix = self.0.file_name().map(OsString::from).unwrap_or_default();
        prefix.push(".");
        prefix
    }

    /// Path of the segment file holding `generation`.
    pub fn segment(&self, generation: u64) -> SegmentFile {
        let mut name = self.0.clone().into_os_string();
        name.push(format!(".{generation:0width$}", width = GENERATION_DIGITS));
        SegmentFile(PathBuf::from(name))
    }

    /// Inverse of [`Self::segment`]: the generation encoded in `path`, or
    /// `None` if `path` is not a segment of this journal.
    pub fn generation_of(&self, path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let prefix = self.file_prefix();
        let suffix = name.strip_prefix(prefix.to_str()?)?;
        if suffix.len() != GENERATION_DIGITS || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }
}

impl fmt::Display for JournalBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Path of a single journal segment file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentFile(PathBuf);

impl SegmentFile {
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl AsRef<Path> for SegmentFile {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for SegmentFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Path of a volume file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeFile(PathBuf);

impl VolumeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// The advisory lock sidecar guarding this volume.
    pub fn lock_sidecar(&self) -> PathBuf {
        lock_sidecar(&self.0)
    }

    /// `true` if this volume was created as a temporary or lock volume and
    /// must not be recovered.
    pub fn is_ephemeral(&self) -> bool {
        self.0
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(TEMP_VOLUME_PREFIX) || n.starts_with(LOCK_VOLUME_PREFIX))
    }
}

impl AsRef<Path> for VolumeFile {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for VolumeFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Sibling lock-sidecar path for an arbitrary file.
///
/// The sidecar carries the advisory range locks so the primary file's own
/// lock table is never perturbed.
pub fn lock_sidecar(path: &Path) -> PathBuf {
    let mut name = path.to_path_buf().into_os_string();
    name.push(".");
    name.push(LOCK_SIDECAR_EXT);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_naming_roundtrip() {
        let base = JournalBase::new("/var/db/tanoak_journal");
        for generation in [0, 1, 42, 999_999_999_999] {
            let segment = base.segment(generation);
            assert_eq!(base.generation_of(segment.as_ref()), Some(generation));
        }
    }

    #[test]
    fn segment_name_is_zero_padded() {
        let base = JournalBase::new("/var/db/j");
        assert_eq!(
            base.segment(7).as_ref(),
            Path::new("/var/db/j.000000000007")
        );
    }

    #[test]
    fn foreign_files_have_no_generation() {
        let base = JournalBase::new("/var/db/j");
        for name in [
            "/var/db/j",
            "/var/db/j.lck",
            "/var/db/k.000000000007",
            "/var/db/j.7",
            "/var/db/j.00000000000x",
        ] {
            assert_eq!(base.generation_of(Path::new(name)), None, "{name}");
        }
    }

    #[test]
    fn sidecar_appends_extension() {
        assert_eq!(
            lock_sidecar(Path::new("/data/main.vol")),
            PathBuf::from("/data/main.vol.lck")
        );
    }

    #[test]
    fn ephemeral_volume_detection() {
        assert!(VolumeFile::new("/tmp/tanoak_tempvol_1").is_ephemeral());
        assert!(VolumeFile::new("/tmp/tanoak_lockvol_1").is_ephemeral());
        assert!(!VolumeFile::new("/data/main.vol").is_ephemeral());
    }
}
