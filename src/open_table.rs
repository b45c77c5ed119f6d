//! System-wide table of currently-open inodes: ensures every open `Inum`
//! maps to exactly one `InodeHandle`, refcounted across every caller that
//! has it open, and releases storage through `InodeStore`/`FreeMap` when the
//! last reference to a removed inode drops.
//!
//! Grounded in the teacher's `Itable` (`fs/ufs/inode.rs`): a
//! `HashMap`-backed table under a single lock, `get`/`put` bumping and
//! dropping a refcount, with the removed-and-unreferenced case triggering
//! `itrunc`. Here that collapses to `InodeStore::release`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::freemap::FreeMap;
use crate::inode::{InodeHandle, InodeStore, Inum};

pub struct OpenInodeTable {
    store: Arc<InodeStore>,
    freemap: Arc<FreeMap>,
    table: Mutex<HashMap<Inum, Arc<InodeHandle>>>,
}

impl OpenInodeTable {
    pub fn new(store: Arc<InodeStore>, freemap: Arc<FreeMap>) -> Self {
        Self {
            store,
            freemap,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the shared handle for `inum`, creating it (by reading the
    /// on-disk inode) if this is the first open. Every caller that opens the
    /// same `inum` concurrently observes the same `InodeHandle` (invariant 1
    /// of §3).
    pub fn open(&self, inum: Inum) -> Arc<InodeHandle> {
        let mut table = self.table.lock().unwrap();
        if let Some(handle) = table.get(&inum) {
            handle.incref();
            return handle.clone();
        }
        let handle = self.store.open(inum);
        table.insert(inum, handle.clone());
        trace!("open table: first open of inum {}", inum);
        handle
    }

    /// Inserts a handle for an inode this caller just allocated via
    /// `InodeStore::alloc`, which already starts with refcount 1.
    pub fn install(&self, handle: Arc<InodeHandle>) {
        let mut table = self.table.lock().unwrap();
        table.insert(handle.inum, handle);
    }

    /// Drops one reference to `inum`. If this was the last reference and the
    /// inode was marked removed, its storage is released and the table
    /// entry is dropped.
    pub fn close(&self, inum: Inum) {
        let mut table = self.table.lock().unwrap();
        let last = match table.get(&inum) {
            Some(handle) => handle.decref(),
            None => return,
        };
        if !last {
            return;
        }
        let handle = table.remove(&inum).expect("just observed present");
        // Drop the table lock before doing any cache/freemap I/O so a
        // concurrent open of a *different* inode is never blocked on it.
        drop(table);
        if handle.is_removed() {
            self.store.release(&handle, &self.freemap);
            trace!("open table: released storage for removed inum {}", inum);
        }
    }

    /// True if `inum` currently has at least one open reference.
    pub fn is_open(&self, inum: Inum) -> bool {
        self.table.lock().unwrap().contains_key(&inum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::BufferCache;
    use crate::device::MemBlockDevice;
    use crate::geometry::{CacheConfig, Geometry};

    fn setup() -> OpenInodeTable {
        let sector_count = 4096;
        let dev: Arc<dyn crate::device::BlockDevice> = Arc::new(MemBlockDevice::new(sector_count));
        let geometry = Geometry::new(sector_count);
        let cache = BufferCache::new(dev, CacheConfig::default());
        let freemap = Arc::new(FreeMap::open(cache.clone(), &geometry));
        freemap.format(geometry.reserved_sectors());
        let store = Arc::new(InodeStore::new(cache, geometry));
        OpenInodeTable::new(store, freemap)
    }

    #[test]
    fn concurrent_opens_of_same_inum_share_one_handle() {
        let table = setup();
        let h1 = table.store.alloc(false).unwrap();
        table.install(h1.clone());
        let h2 = table.open(h1.inum);
        assert!(Arc::ptr_eq(&h1, &h2));
    }

    #[test]
    fn close_on_non_removed_inode_keeps_storage() {
        let table = setup();
        let h = table.store.alloc(false).unwrap();
        table.install(h.clone());
        table.close(h.inum);
        assert!(table.store.read_disk_inode(h.inum).is_in_use());
        assert!(!table.is_open(h.inum));
    }

    #[test]
    fn close_last_ref_on_removed_inode_releases_storage() {
        let table = setup();
        let h = table.store.alloc(false).unwrap();
        table.install(h.clone());
        h.mark_removed();
        let h2 = table.open(h.inum);
        table.close(h.inum);
        assert!(table.store.read_disk_inode(h.inum).is_in_use());
        table.close(h2.inum);
        assert!(!table.store.read_disk_inode(h.inum).is_in_use());
    }
}
