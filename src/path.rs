//! Path resolution: splits a `/`-separated path into components and walks
//! them one directory at a time.
//!
//! Grounded in the teacher's `Path`/`FileName` and `skipelem` (`fs/path.rs`):
//! components are peeled off one at a time rather than resolved via an
//! allocated `Vec` of substrings there, but the walking logic — look the
//! next component up in the current directory, open it, close the
//! previous one, repeat — is the same. This version does allocate the
//! component list up front, the idiomatic hosted-Rust way to write the
//! teacher's iterator (`str::split` instead of a hand-rolled byte scanner
//! written for a `no_std` target with no `std::str` to call into).

use std::sync::Arc;

use crate::cache::BufferCache;
use crate::dir::Directory;
use crate::error::{FsError, Result};
use crate::freemap::FreeMap;
use crate::inode::{InodeStore, Inum, ROOT_INUM};
use crate::open_table::OpenInodeTable;

pub struct PathResolver {
    cache: Arc<BufferCache>,
    store: Arc<InodeStore>,
    freemap: Arc<FreeMap>,
    open_table: Arc<OpenInodeTable>,
}

impl PathResolver {
    pub fn new(
        cache: Arc<BufferCache>,
        store: Arc<InodeStore>,
        freemap: Arc<FreeMap>,
        open_table: Arc<OpenInodeTable>,
    ) -> Self {
        Self { cache, store, freemap, open_table }
    }

    /// Resolves an absolute (or, if it doesn't start with `/`, root-relative)
    /// path to the inode it names.
    pub fn resolve(&self, path: &str) -> Result<Inum> {
        self.resolve_from(ROOT_INUM, path)
    }

    /// Resolves `path` starting from `start` when it does not begin with
    /// `/`; a leading `/` always restarts from the root regardless of
    /// `start`, matching ordinary Unix path semantics.
    pub fn resolve_from(&self, start: Inum, path: &str) -> Result<Inum> {
        let (mut cur, components, _) = self.split(start, path)?;
        for name in &components {
            cur = self.step(cur, name)?;
        }
        Ok(cur)
    }

    /// Resolves every component but the last, returning `(parent_inum,
    /// final_name)`. Used by operations that need to modify the parent
    /// directory's entry list themselves (`create`, `remove`).
    ///
    /// A trailing `/` (e.g. `"/d/e/"`) forces the preceding component to be
    /// treated as a directory: the whole path is resolved through `e` and
    /// the result is `(inum_of_e, ".")` rather than `(inum_of_d, "e")`, so a
    /// caller that looks `"."` up inside a non-directory `e` gets the usual
    /// "not a directory" error instead of silently operating on `e` itself.
    pub fn resolve_parent(&self, path: &str) -> Result<(Inum, String)> {
        self.resolve_parent_from(ROOT_INUM, path)
    }

    pub fn resolve_parent_from(&self, start: Inum, path: &str) -> Result<(Inum, String)> {
        let (start_inum, mut components, trailing_slash) = self.split(start, path)?;
        if trailing_slash {
            let mut cur = start_inum;
            for name in &components {
                cur = self.step(cur, name)?;
            }
            return Ok((cur, ".".to_string()));
        }
        let last = components.pop().ok_or(FsError::EmptyPath)?;
        let mut cur = start_inum;
        for name in &components {
            cur = self.step(cur, name)?;
        }
        Ok((cur, last))
    }

    /// Splits `path` into a base inode and its non-empty components, plus
    /// whether the path carried a trailing `/` beyond a bare `"/"`.
    fn split(&self, start: Inum, path: &str) -> Result<(Inum, Vec<String>, bool)> {
        if path.is_empty() {
            return Err(FsError::EmptyPath);
        }
        let base = if path.starts_with('/') { ROOT_INUM } else { start };
        let trailing_slash = path.len() > 1 && path.ends_with('/');
        let components = path.split('/').filter(|s| !s.is_empty()).map(String::from).collect();
        Ok((base, components, trailing_slash))
    }

    /// Looks `name` up inside directory `cur`, opening and closing `cur`
    /// only for the duration of the lookup.
    fn step(&self, cur: Inum, name: &str) -> Result<Inum> {
        let inode = self.open_table.open(cur);
        let dir = Directory::open(self.cache.clone(), self.store.clone(), self.freemap.clone(), inode);
        let result = match dir {
            Ok(dir) => match dir.lookup(name) {
                Ok(Some(inum)) => Ok(inum),
                Ok(None) => Err(FsError::not_found(name)),
                Err(e) => Err(e),
            },
            Err(_) => Err(FsError::not_a_directory(cur)),
        };
        self.open_table.close(cur);
        result
    }
}
