//! Directories: a flat sequence of fixed-size entries stored in a regular
//! inode's data, the same way the teacher represents them.
//!
//! Grounded in the teacher's `Dirent`/`dirlookup`/`dirlink`/`is_dir_empty`
//! (`fs/ufs/mod.rs`): entries are `(name, inum)` pairs packed into sectors,
//! scanned linearly, with a zeroed/sentinel `inum` marking a free slot that
//! `add` reuses before it extends the file. The one departure from the
//! teacher's xv6-derived layout is the free-slot sentinel: xv6 reserves
//! inode number 0 as "invalid", but this design's inode numbering starts at
//! 0 for the root directory, so a dedicated sentinel (`u32::MAX`) is used
//! instead (see DESIGN.md).

use std::sync::Arc;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::cache::BufferCache;
use crate::error::{FsError, Result};
use crate::file::FileOps;
use crate::freemap::FreeMap;
use crate::geometry::NAME_MAX;
use crate::inode::{InodeHandle, InodeStore, Inum};

/// Bytes reserved for a name inside one directory entry. Kept a multiple of
/// 4 so `DiskDirEntry` has no interior padding after `inum`.
const NAME_FIELD_BYTES: usize = 16;

const_assert!(NAME_MAX < NAME_FIELD_BYTES);

/// Sentinel `inum` marking an unused slot. Real inode numbers never reach
/// this value in practice (the inode table is far smaller), but the point
/// is simply that it can never collide with `Inum(0)`, the root.
const FREE_INUM: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
#[repr(C)]
struct DiskDirEntry {
    inum: u32,
    name: [u8; NAME_FIELD_BYTES],
}

pub const DIRENT_SIZE: usize = std::mem::size_of::<DiskDirEntry>();

impl DiskDirEntry {
    fn free() -> Self {
        Self {
            inum: FREE_INUM,
            name: [0; NAME_FIELD_BYTES],
        }
    }

    fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        std::str::from_utf8(&self.name[..end]).expect("directory names are always valid UTF-8")
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
        return Err(FsError::invalid_name(name));
    }
    Ok(())
}

fn make_entry(name: &str, inum: Inum) -> DiskDirEntry {
    let mut bytes = [0u8; NAME_FIELD_BYTES];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    DiskDirEntry { inum: inum.0, name: bytes }
}

/// One open directory: a thin veneer over `FileOps` that understands the
/// entry format instead of raw bytes.
pub struct Directory {
    file: FileOps,
}

impl Directory {
    /// Wraps an already-open directory inode. Returns `NotADirectory` if
    /// the inode is in fact a regular file.
    pub fn open(
        cache: Arc<BufferCache>,
        store: Arc<InodeStore>,
        freemap: Arc<FreeMap>,
        inode: Arc<InodeHandle>,
    ) -> Result<Self> {
        if !inode.is_dir() {
            return Err(FsError::not_a_directory(format!("inode {}", inode.inum)));
        }
        Ok(Self { file: FileOps::new(cache, store, freemap, inode) })
    }

    /// Initializes a freshly allocated directory inode (`InodeStore::alloc`
    /// with `is_dir = true`) with `.` and `..` entries, self-linking and
    /// linking to `parent` respectively. The caller still has to `add` the
    /// new directory's name into its parent separately.
    pub fn init(
        cache: Arc<BufferCache>,
        store: Arc<InodeStore>,
        freemap: Arc<FreeMap>,
        inode: Arc<InodeHandle>,
        parent: Inum,
    ) -> Result<Self> {
        debug_assert!(inode.is_dir());
        let dir = Self { file: FileOps::new(cache, store, freemap, inode) };
        let self_inum = dir.file.inode.inum;
        dir.append_entry(".", self_inum)?;
        dir.append_entry("..", parent)?;
        Ok(dir)
    }

    pub fn inum(&self) -> Inum {
        self.file.inode.inum
    }

    /// Fails with `Stale` if this directory has been unlinked (§4.6: a
    /// removed directory's inode lives on for handles that already have it
    /// open, but no further `lookup`/`add` against it succeeds).
    fn check_not_removed(&self) -> Result<()> {
        if self.file.inode.is_removed() {
            return Err(FsError::Stale { inum: self.file.inode.inum });
        }
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Option<Inum>> {
        self.check_not_removed()?;
        let _guard = self.file.inode.dir_lock.lock();
        Ok(self.lookup_locked(name))
    }

    fn lookup_locked(&self, name: &str) -> Option<Inum> {
        self.scan(|entry| if entry.name_str() == name { Some(Inum(entry.inum)) } else { None })
    }

    /// Binds `name` to `inum`, reusing a free slot if one exists. Fails
    /// with `NameInUse` if the name is already bound in this directory.
    pub fn add(&self, name: &str, inum: Inum) -> Result<()> {
        self.check_not_removed()?;
        validate_name(name)?;
        let _guard = self.file.inode.dir_lock.lock();
        if self.lookup_locked(name).is_some() {
            return Err(FsError::NameInUse { name: name.to_string() });
        }
        self.append_entry(name, inum)
    }

    /// Writes a new entry into the first free slot, or extends the
    /// directory's length by one entry if none is free. Does not check for
    /// an existing binding — used both by `add` (which already has) and by
    /// `init` for `.`/`..`.
    fn append_entry(&self, name: &str, inum: Inum) -> Result<()> {
        let entry = make_entry(name, inum);
        let length = self.file.length() as u64;
        let mut buf = [0u8; DIRENT_SIZE];
        let mut pos = 0u64;
        while pos < length {
            let n = self.file.read_at(pos, &mut buf);
            if n < DIRENT_SIZE {
                break;
            }
            let existing = DiskDirEntry::read_from(&buf[..]).expect("sector-sized slice");
            if existing.inum == FREE_INUM {
                return self.write_entry(pos, &entry);
            }
            pos += DIRENT_SIZE as u64;
        }
        self.write_entry(length, &entry)
    }

    fn write_entry(&self, pos: u64, entry: &DiskDirEntry) -> Result<()> {
        let written = self.file.write_at(pos, entry.as_bytes())?;
        if written < DIRENT_SIZE {
            return Err(FsError::NoFreeSector);
        }
        Ok(())
    }

    /// Unbinds `name`, marking its slot free without shrinking the
    /// directory. Fails with `NotFound` if the name is not bound.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.check_not_removed()?;
        let _guard = self.file.inode.dir_lock.lock();
        let length = self.file.length() as u64;
        let mut buf = [0u8; DIRENT_SIZE];
        let mut pos = 0u64;
        while pos < length {
            let n = self.file.read_at(pos, &mut buf);
            if n < DIRENT_SIZE {
                break;
            }
            let entry = DiskDirEntry::read_from(&buf[..]).expect("sector-sized slice");
            if entry.inum != FREE_INUM && entry.name_str() == name {
                self.write_entry(pos, &DiskDirEntry::free())?;
                return Ok(());
            }
            pos += DIRENT_SIZE as u64;
        }
        Err(FsError::not_found(name))
    }

    /// True once every bound entry is `.` or `..` — the precondition for
    /// removing the directory itself (§4.6: "refuse to unlink a non-empty
    /// directory").
    pub fn is_empty(&self) -> Result<bool> {
        self.check_not_removed()?;
        let _guard = self.file.inode.dir_lock.lock();
        Ok(self
            .scan(|entry| {
                let name = entry.name_str();
                if name != "." && name != ".." {
                    Some(())
                } else {
                    None
                }
            })
            .is_none())
    }

    /// Every bound `(name, inum)` pair, in on-disk order.
    pub fn readdir(&self) -> Result<Vec<(String, Inum)>> {
        self.check_not_removed()?;
        let _guard = self.file.inode.dir_lock.lock();
        let mut out = Vec::new();
        self.scan(|entry| {
            out.push((entry.name_str().to_string(), Inum(entry.inum)));
            None::<()>
        });
        Ok(out)
    }

    /// Linear scan helper: calls `f` on every in-use entry, short-circuiting
    /// on the first `Some`.
    fn scan<T>(&self, mut f: impl FnMut(&DiskDirEntry) -> Option<T>) -> Option<T> {
        let length = self.file.length() as u64;
        let mut buf = [0u8; DIRENT_SIZE];
        let mut pos = 0u64;
        while pos < length {
            let n = self.file.read_at(pos, &mut buf);
            if n < DIRENT_SIZE {
                break;
            }
            let entry = DiskDirEntry::read_from(&buf[..]).expect("sector-sized slice");
            if entry.inum != FREE_INUM {
                if let Some(v) = f(&entry) {
                    return Some(v);
                }
            }
            pos += DIRENT_SIZE as u64;
        }
        None
    }
}
