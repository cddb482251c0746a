//! Handles and seams of the paged volume storage.
//!
//! The page layout itself (key blocks, splits, joins) lives elsewhere; the
//! journal only needs to name volumes, trees and pages, and to push page
//! images back into a volume through [`PageStore`].

use std::fmt;
use std::io;

use thiserror::Error;

/// Address of a page within its volume.
pub type PageAddress = u64;

/// Journal-scoped handle of a volume, bound by an `IV` record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeHandle(pub u32);

impl fmt::Display for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "volume#{}", self.0)
    }
}

/// Journal-scoped handle of a tree, bound by an `IT` record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TreeHandle(pub u32);

impl fmt::Display for TreeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tree#{}", self.0)
    }
}

/// Name of the directory tree every volume carries; operations against it
/// route to the volume's directory rather than a user tree.
pub const DIRECTORY_TREE_NAME: &str = "_directory";

/// Identity a volume handle resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeDescriptor {
    pub handle: VolumeHandle,
    /// Persistent volume id, verified when the volume is looked up by name.
    pub id: u64,
    pub name: String,
}

/// Identity a tree handle resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeDescriptor {
    pub handle: TreeHandle,
    pub volume: VolumeHandle,
    pub name: String,
}

impl TreeDescriptor {
    pub fn is_directory(&self) -> bool {
        self.name == DIRECTORY_TREE_NAME
    }
}

#[derive(Debug, Error)]
pub enum PageError {
    #[error("volume is full")]
    VolumeFull,
    #[error("volume is closed")]
    VolumeClosed,
    #[error("volume is read-only")]
    ReadOnlyVolume,
    #[error("invalid page address {0}")]
    InvalidPageAddress(PageAddress),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The paged volume storage the journal copies page images back into.
pub trait PageStore: Send + Sync {
    fn read_page(&self, volume: &VolumeDescriptor, page: PageAddress, buf: &mut Vec<u8>) -> Result<(), PageError>;

    fn write_page(&self, volume: &VolumeDescriptor, page: PageAddress, data: &[u8]) -> Result<(), PageError>;

    fn allocate_page(&self, volume: &VolumeDescriptor) -> Result<PageAddress, PageError>;

    /// Flush all dirty pages to stable storage.
    fn sync(&self) -> Result<(), PageError>;
}
