//! Error kinds surfaced by the filesystem core.
//!
//! Every fallible operation in this crate returns `Result<T, FsError>`. There
//! is deliberately no panic-on-recoverable-condition path here; the one kind
//! that *is* fatal (`DeviceError`) is only ever raised by the core itself
//! (e.g. a geometry sanity check at `init`), since a `BlockDevice`
//! implementation is contractually expected to panic rather than return on
//! I/O failure (see `device.rs`).

use std::fmt;

use thiserror::Error;

use crate::inode::Inum;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    /// The inode table has no free entry left.
    #[error("no inode available")]
    NoInodeAvailable,

    /// The free map ran out of sectors while fixing up a write; the write
    /// that triggered this is still completed up to the point of exhaustion
    /// (a short write), this variant exists so internal callers can tell the
    /// difference between "ran out" and "really done".
    #[error("no free sector available")]
    NoFreeSector,

    /// `offset >= DID_LIMIT * SECTOR_SIZE`.
    #[error("offset {offset} exceeds maximum file size")]
    FileTooLarge { offset: u64 },

    /// A path component does not exist.
    #[error("path not found: {path}")]
    NotFound { path: String },

    /// A non-final path component is not a directory.
    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    /// `Directory::add` found the name already bound.
    #[error("name already in use: {name}")]
    NameInUse { name: String },

    /// `Directory::remove` on a directory with entries other than `.`/`..`.
    #[error("directory not empty: inode {inum}")]
    DirNotEmpty { inum: Inum },

    /// Either of two conditions that share one error because both mean "this
    /// handle no longer names anything live": a `lookup`/`add`/`remove`
    /// against a directory whose `removed` flag is set (its name is gone
    /// from its own parent, so the tree can no longer reach it), or any call
    /// on a `FileHandle` that has already been closed.
    #[error("stale handle: inode {inum}")]
    Stale { inum: Inum },

    /// A write was attempted while the inode's deny-write count is nonzero.
    #[error("write denied: inode {inum} is mapped for execution")]
    DenyWrite { inum: Inum },

    /// A name component failed the `1..=NAME_MAX`, no-`/` grammar.
    #[error("invalid path component: {component:?}")]
    InvalidName { component: String },

    /// An empty path string was passed to the resolver.
    #[error("empty path")]
    EmptyPath,

    /// A geometry or device inconsistency the core detected on its own,
    /// before ever handing the condition to the device (which would
    /// otherwise have panicked). Always fatal; never returned from a normal
    /// read/write/lookup path.
    #[error("device error: {0}")]
    DeviceError(String),
}

impl FsError {
    pub fn not_found(path: impl fmt::Display) -> Self {
        FsError::NotFound { path: path.to_string() }
    }

    pub fn not_a_directory(path: impl fmt::Display) -> Self {
        FsError::NotADirectory { path: path.to_string() }
    }

    pub fn invalid_name(component: impl fmt::Display) -> Self {
        FsError::InvalidName { component: component.to_string() }
    }
}
