//! A UNIX-like on-disk filesystem core, layered over an abstract sector
//! `BlockDevice`.
//!
//! The stack bottom to top: a `BufferCache` of fixed-size sectors with
//! clock eviction and background write-back; a `FreeMap` bitmap pinned in
//! the cache as an external extent; a fixed-size `InodeStore` with direct,
//! single-indirect, and double-indirect block pointers; an `OpenInodeTable`
//! sharing one in-memory handle per open inode; `FileOps` for byte-ranged
//! read/write through an inode; `Directory` for the on-disk entry format;
//! `PathResolver` for `/`-separated lookups; and `Filesystem`/`FileHandle`
//! at the top, the crate's public surface.

mod cache;
mod device;
mod dir;
mod error;
mod file;
mod freemap;
mod fs;
mod geometry;
mod inode;
mod lock;
mod open_table;
mod path;

pub use cache::BufferCache;
pub use device::{BlockDevice, MemBlockDevice};
pub use error::{FsError, Result};
pub use fs::{FileHandle, Filesystem};
pub use geometry::{CacheConfig, Geometry, MAX_FILE_SIZE, NAME_MAX, SECTOR_SIZE};
pub use inode::{Inum, ROOT_INUM};
