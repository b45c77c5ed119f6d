//! The public filesystem API: ties `BufferCache`, `FreeMap`, `InodeStore`,
//! `OpenInodeTable`, `Directory`, and `PathResolver` together behind
//! `Filesystem`/`FileHandle`.
//!
//! Grounded in the teacher's `fs/mod.rs` (the `Ufs` struct bundling its
//! subsystems behind `init`/`fs()`) for the top-level shape, and
//! `sysfile.rs`'s `sys_open`/`sys_mkdir`/`sys_unlink` for the operation
//! sequencing (resolve parent, check/alloc, link, open).

use std::sync::Arc;

use log::info;

use crate::cache::BufferCache;
use crate::device::BlockDevice;
use crate::dir::Directory;
use crate::error::{FsError, Result};
use crate::file::FileOps;
use crate::freemap::FreeMap;
use crate::geometry::{CacheConfig, Geometry};
use crate::inode::{InodeHandle, InodeStore, Inum, ROOT_INUM};
use crate::open_table::OpenInodeTable;
use crate::path::PathResolver;

struct Inner {
    cache: Arc<BufferCache>,
    store: Arc<InodeStore>,
    freemap: Arc<FreeMap>,
    open_table: Arc<OpenInodeTable>,
    resolver: PathResolver,
}

/// The filesystem core. Cheap to clone (an `Arc` underneath); every clone
/// shares the same cache, free map, and open-inode table.
#[derive(Clone)]
pub struct Filesystem {
    inner: Arc<Inner>,
}

impl Filesystem {
    /// Brings the filesystem up over `device`. When `format` is true the
    /// free map and inode table are wiped and a fresh root directory is
    /// created; otherwise both are taken as already initialized (§9:
    /// "format=false reuses the on-disk layout verbatim").
    pub fn init(device: Arc<dyn BlockDevice>, cache_config: CacheConfig, format: bool) -> Result<Self> {
        let sector_count = device.sector_count();
        let geometry = Geometry::new(sector_count);
        if geometry.reserved_sectors() >= sector_count {
            return Err(FsError::DeviceError(format!(
                "device has only {} sectors, needs at least {} for inode table and free map",
                sector_count,
                geometry.reserved_sectors()
            )));
        }

        let cache = BufferCache::new(device, cache_config);
        let freemap = Arc::new(FreeMap::open(cache.clone(), &geometry));
        let store = Arc::new(InodeStore::new(cache.clone(), geometry));

        if format {
            info!("filesystem: formatting {} sectors", sector_count);
            freemap.format(geometry.reserved_sectors());
            let root_inode = store.alloc(true)?;
            debug_assert_eq!(root_inode.inum, ROOT_INUM);
            Directory::init(cache.clone(), store.clone(), freemap.clone(), root_inode, ROOT_INUM)?;
        }

        let open_table = Arc::new(OpenInodeTable::new(store.clone(), freemap.clone()));
        let resolver = PathResolver::new(cache.clone(), store.clone(), freemap.clone(), open_table.clone());

        Ok(Self {
            inner: Arc::new(Inner { cache, store, freemap, open_table, resolver }),
        })
    }

    /// Writes every dirty sector and the free map back to the device
    /// without shutting anything down; useful for callers that want a
    /// durability checkpoint mid-session.
    pub fn sync(&self) {
        self.inner.cache.flush_once();
    }

    /// Flushes everything, closes the free map, and stops the cache's
    /// background threads, in that order (§9's documented shutdown
    /// sequence: "flush cache, close free map, destroy cache").
    pub fn done(self) {
        self.inner.cache.flush_once();
        self.inner.freemap.close();
        self.inner.cache.shutdown();
    }

    fn open_directory(&self, inum: Inum) -> Result<(Arc<InodeHandle>, Directory)> {
        let inode = self.inner.open_table.open(inum);
        match Directory::open(
            self.inner.cache.clone(),
            self.inner.store.clone(),
            self.inner.freemap.clone(),
            inode.clone(),
        ) {
            Ok(dir) => Ok((inode, dir)),
            Err(e) => {
                self.inner.open_table.close(inum);
                Err(e)
            }
        }
    }

    /// Creates a new file or directory at `path`; the parent directory must
    /// already exist. `initial_size` sets the new file's length up front
    /// without allocating any data sectors for it — those are still fixed
    /// up lazily on first write, so the bytes in `[0, initial_size)` read as
    /// zero until overwritten (§3, "length is the high-water mark of any
    /// completed write, not the count of allocated sectors"). Fails with
    /// `NameInUse` if the final component is already bound. The caller
    /// still has to `open` the path to get a `FileHandle`.
    pub fn create(&self, path: &str, initial_size: u32, is_dir: bool) -> Result<()> {
        let (parent_inum, name) = self.inner.resolver.resolve_parent(path)?;
        let (parent_handle, parent_dir) = self.open_directory(parent_inum)?;

        match parent_dir.lookup(&name) {
            Ok(Some(_)) => {
                self.inner.open_table.close(parent_inum);
                return Err(FsError::NameInUse { name });
            }
            Ok(None) => {}
            Err(e) => {
                self.inner.open_table.close(parent_inum);
                return Err(e);
            }
        }

        let new_inode = match self.inner.store.alloc(is_dir) {
            Ok(i) => i,
            Err(e) => {
                self.inner.open_table.close(parent_inum);
                return Err(e);
            }
        };
        if is_dir {
            if let Err(e) = Directory::init(
                self.inner.cache.clone(),
                self.inner.store.clone(),
                self.inner.freemap.clone(),
                new_inode.clone(),
                parent_inum,
            ) {
                self.inner.open_table.close(parent_inum);
                return Err(e);
            }
        } else if initial_size > 0 {
            let mut disk = new_inode.data.lock().unwrap();
            disk.length = initial_size;
            self.inner.store.write_disk_inode(new_inode.inum, &disk);
        }

        if let Err(e) = parent_dir.add(&name, new_inode.inum) {
            self.inner.open_table.close(parent_inum);
            return Err(e);
        }
        self.inner.open_table.close(parent_inum);
        drop(parent_handle);
        Ok(())
    }

    /// Opens an existing file or directory.
    pub fn open(&self, path: &str) -> Result<FileHandle> {
        let inum = self.inner.resolver.resolve(path)?;
        let inode = self.inner.open_table.open(inum);
        Ok(FileHandle::new(self.clone(), inode, inum))
    }

    /// Unbinds `path` from its parent directory. If this was the last
    /// reference to the inode, its storage is released immediately;
    /// otherwise release is deferred to the last `FileHandle::close` (§3,
    /// invariant 4: "unlink-while-open" survives until the last close).
    /// Removing a non-empty directory fails with `DirNotEmpty`.
    pub fn remove(&self, path: &str) -> Result<()> {
        let (parent_inum, name) = self.inner.resolver.resolve_parent(path)?;
        let (_parent_handle, parent_dir) = self.open_directory(parent_inum)?;

        let target_inum = match parent_dir.lookup(&name) {
            Ok(Some(i)) => i,
            Ok(None) => {
                self.inner.open_table.close(parent_inum);
                return Err(FsError::not_found(&name));
            }
            Err(e) => {
                self.inner.open_table.close(parent_inum);
                return Err(e);
            }
        };

        let target_inode = self.inner.open_table.open(target_inum);
        if target_inode.is_dir() {
            let target_dir = match Directory::open(
                self.inner.cache.clone(),
                self.inner.store.clone(),
                self.inner.freemap.clone(),
                target_inode.clone(),
            ) {
                Ok(d) => d,
                Err(e) => {
                    self.inner.open_table.close(target_inum);
                    self.inner.open_table.close(parent_inum);
                    return Err(e);
                }
            };
            match target_dir.is_empty() {
                Ok(true) => {}
                Ok(false) => {
                    self.inner.open_table.close(target_inum);
                    self.inner.open_table.close(parent_inum);
                    return Err(FsError::DirNotEmpty { inum: target_inum });
                }
                Err(e) => {
                    self.inner.open_table.close(target_inum);
                    self.inner.open_table.close(parent_inum);
                    return Err(e);
                }
            }
        }

        let result = parent_dir.remove(&name);
        if result.is_ok() {
            target_inode.mark_removed();
        }
        self.inner.open_table.close(target_inum);
        self.inner.open_table.close(parent_inum);
        result
    }
}

/// One open file or directory description: an inode plus (for regular
/// files) an independent byte cursor.
pub struct FileHandle {
    fs: Filesystem,
    inum: Inum,
    inode: Arc<InodeHandle>,
    ops: FileOps,
    closed: std::sync::atomic::AtomicBool,
}

impl FileHandle {
    fn new(fs: Filesystem, inode: Arc<InodeHandle>, inum: Inum) -> Self {
        let ops = FileOps::new(fs.inner.cache.clone(), fs.inner.store.clone(), fs.inner.freemap.clone(), inode.clone());
        Self {
            fs,
            inum,
            inode,
            ops,
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn inumber(&self) -> Inum {
        self.inum
    }

    pub fn is_dir(&self) -> bool {
        self.inode.is_dir()
    }

    pub fn length(&self) -> u32 {
        self.ops.length()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(FsError::Stale { inum: self.inum });
        }
        Ok(())
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_open()?;
        if self.inode.is_dir() {
            return Err(FsError::not_a_directory(self.inum));
        }
        Ok(self.ops.read(buf))
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.check_open()?;
        if self.inode.is_dir() {
            return Err(FsError::not_a_directory(self.inum));
        }
        self.ops.write(buf)
    }

    pub fn seek(&self, from: std::io::SeekFrom) -> Result<u64> {
        self.check_open()?;
        self.ops.seek(from)
    }

    pub fn tell(&self) -> Result<u64> {
        self.check_open()?;
        Ok(self.ops.tell())
    }

    pub fn deny_write(&self) {
        self.ops.deny_write();
    }

    pub fn allow_write(&self) {
        self.ops.allow_write();
    }

    /// Every `(name, inum)` entry bound in this directory. Fails with
    /// `NotADirectory` on a regular file.
    pub fn readdir(&self) -> Result<Vec<(String, Inum)>> {
        self.check_open()?;
        if !self.inode.is_dir() {
            return Err(FsError::not_a_directory(self.inum));
        }
        let dir = Directory::open(
            self.fs.inner.cache.clone(),
            self.fs.inner.store.clone(),
            self.fs.inner.freemap.clone(),
            self.inode.clone(),
        )?;
        dir.readdir()
    }

    /// Drops this handle's reference to the inode. Idempotent; safe to
    /// call more than once (and called automatically on `Drop` if the
    /// caller never called it explicitly).
    pub fn close(&self) {
        if !self.closed.swap(true, std::sync::atomic::Ordering::AcqRel) {
            self.fs.inner.open_table.close(self.inum);
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;

    fn fs(sector_count: u32) -> Filesystem {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemBlockDevice::new(sector_count));
        Filesystem::init(dev, CacheConfig::default(), true).unwrap()
    }

    #[test]
    fn create_write_close_reopen_read_round_trips() {
        let fs = fs(4096);
        fs.create("/greeting.txt", 0, false).unwrap();
        {
            let f = fs.open("/greeting.txt").unwrap();
            f.write(b"hi there").unwrap();
        }
        let f = fs.open("/greeting.txt").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(f.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hi there");
        fs.done();
    }

    #[test]
    fn mkdir_then_list_root() {
        let fs = fs(4096);
        fs.create("/sub", 0, true).unwrap();
        let root = fs.open("/").unwrap();
        let names: Vec<String> = root.readdir().unwrap().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"sub".to_string()));
        fs.done();
    }

    #[test]
    fn create_with_initial_size_reads_as_a_zero_hole_until_written() {
        let fs = fs(4096);
        fs.create("/presized", 10, false).unwrap();
        let f = fs.open("/presized").unwrap();
        assert_eq!(f.length(), 10);
        let mut buf = [0xffu8; 10];
        assert_eq!(f.read(&mut buf).unwrap(), 10);
        assert_eq!(buf, [0u8; 10]);
        fs.done();
    }

    #[test]
    fn remove_unlinked_open_file_survives_until_last_close() {
        let fs = fs(4096);
        fs.create("/doomed.txt", 0, false).unwrap();
        let handle = fs.open("/doomed.txt").unwrap();
        handle.write(b"still here").unwrap();
        fs.remove("/doomed.txt").unwrap();

        // The name is gone...
        assert!(matches!(fs.open("/doomed.txt"), Err(FsError::NotFound { .. })));
        // ...but the already-open handle keeps working until it closes.
        let mut buf = [0u8; 10];
        handle.seek(std::io::SeekFrom::Start(0)).unwrap();
        assert_eq!(handle.read(&mut buf).unwrap(), 10);
        let inum = handle.inumber();
        drop(handle);
        assert!(!fs.inner.open_table.is_open(inum));
        fs.done();
    }

    #[test]
    fn remove_non_empty_directory_fails() {
        let fs = fs(4096);
        fs.create("/sub", 0, true).unwrap();
        fs.create("/sub/child.txt", 0, false).unwrap();
        assert!(matches!(fs.remove("/sub"), Err(FsError::DirNotEmpty { .. })));
        fs.done();
    }

    #[test]
    fn create_duplicate_name_fails() {
        let fs = fs(4096);
        fs.create("/a.txt", 0, false).unwrap();
        assert!(matches!(fs.create("/a.txt", 0, false), Err(FsError::NameInUse { .. })));
        fs.done();
    }

    #[test]
    fn deny_write_is_honored_across_handles_to_same_inode() {
        let fs = fs(4096);
        fs.create("/exe", 0, false).unwrap();
        let h1 = fs.open("/exe").unwrap();
        h1.write(b"code").unwrap();
        h1.deny_write();
        let h2 = fs.open("/exe").unwrap();
        assert!(matches!(h2.write(b"x"), Err(FsError::DenyWrite { .. })));
        h1.allow_write();
        assert!(h2.write(b"x").is_ok());
        fs.done();
    }
}
