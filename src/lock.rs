//! Core synchronization primitives the rest of the crate is built from.
//!
//! The teacher expresses its buffer cache and sleep locks as thin wrappers
//! around a `RawLock` trait (`lock/sleeplock.rs`, `lock/spinlock.rs`) backed
//! by a condvar-like `Sleepablelock`. That design exists because the teacher
//! runs with no OS underneath it and has to build blocking and spinning
//! locks itself out of atomics and a scheduler hook. Hosted on a real OS,
//! the equivalent building block is `std::sync::{Mutex, Condvar}`; this
//! module keeps the teacher's *shape* (a small generic lock type plus a
//! guard, with explicit promote/demote and reentrant variants the stdlib
//! doesn't provide) while building it on those primitives instead of
//! reimplementing spin/sleep from scratch.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// A reader/writer lock that additionally supports *promoting* a read guard
/// into a write guard and *demoting* a write guard back into a read guard
/// without an intervening window where another thread could sneak in and
/// observe the slot in neither state — this is the core primitive
/// `BufferCache` relies on (see design note in §9 of the spec: promotion
/// reclassifies a reader that decided to mutate the slot; demotion runs
/// after writeback to let other readers back in immediately).
pub struct PromotableRwLock<T> {
    state: Mutex<RwState>,
    cond: Condvar,
    data: UnsafeCell<T>,
}

#[derive(Default)]
struct RwState {
    readers: u32,
    writer: bool,
}

// SAFETY: access to `data` is only ever granted through a guard obtained
// while holding `state`, so `T: Send` is enough to make the lock itself
// `Sync`.
unsafe impl<T: Send> Sync for PromotableRwLock<T> {}
unsafe impl<T: Send> Send for PromotableRwLock<T> {}

impl<T> PromotableRwLock<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(RwState::default()),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn read(&self) -> RwReadGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while state.writer {
            state = self.cond.wait(state).unwrap();
        }
        state.readers += 1;
        RwReadGuard { lock: self }
    }

    /// Non-blocking variant used by the eviction clock, which must skip a
    /// slot rather than stall on it.
    pub fn try_write(&self) -> Option<RwWriteGuard<'_, T>> {
        let mut state = self.state.lock().unwrap();
        if state.writer || state.readers > 0 {
            return None;
        }
        state.writer = true;
        Some(RwWriteGuard { lock: self })
    }

    pub fn write(&self) -> RwWriteGuard<'_, T> {
        let mut state = self.state.lock().unwrap();
        while state.writer || state.readers > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.writer = true;
        RwWriteGuard { lock: self }
    }
}

pub struct RwReadGuard<'a, T> {
    lock: &'a PromotableRwLock<T>,
}

impl<'a, T> RwReadGuard<'a, T> {
    /// Consumes the read guard and blocks until it can be upgraded to a
    /// write guard. Other readers may interleave between the release of the
    /// read claim and the acquisition of the write claim.
    pub fn promote(self) -> RwWriteGuard<'a, T> {
        let lock = self.lock;
        // Release our own reader slot without running the `Drop` impl's
        // notify twice; we immediately re-lock below.
        std::mem::forget(self);
        let mut state = lock.state.lock().unwrap();
        state.readers -= 1;
        lock.cond.notify_all();
        while state.writer || state.readers > 0 {
            state = lock.cond.wait(state).unwrap();
        }
        state.writer = true;
        RwWriteGuard { lock }
    }
}

impl<T> Deref for RwReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding a read claim guarantees no writer is active.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            self.lock.cond.notify_all();
        }
    }
}

pub struct RwWriteGuard<'a, T> {
    lock: &'a PromotableRwLock<T>,
}

impl<'a, T> RwWriteGuard<'a, T> {
    /// Consumes the write guard and hands back a read guard, letting queued
    /// readers in immediately instead of waiting for the writer to fully
    /// unwind out of the cache's calling code.
    pub fn demote(self) -> RwReadGuard<'a, T> {
        let lock = self.lock;
        std::mem::forget(self);
        let mut state = lock.state.lock().unwrap();
        state.writer = false;
        state.readers = 1;
        lock.cond.notify_all();
        RwReadGuard { lock }
    }
}

impl<T> Deref for RwWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.writer = false;
        self.lock.cond.notify_all();
    }
}

/// A mutex that the owning thread may reacquire without deadlocking itself,
/// tracking the owner by `ThreadId` and refcounting nested acquisitions (see
/// design note in §9: "a lock that records owning thread id and refcounts
/// nested acquisitions"). Used for `Directory`'s `dir_lock`, so that `add`
/// can call `lookup` internally while already holding the lock.
pub struct ReentrantMutex<T> {
    state: Mutex<ReentrantState>,
    cond: Condvar,
    data: UnsafeCell<T>,
}

struct ReentrantState {
    owner: Option<ThreadId>,
    count: u32,
}

unsafe impl<T: Send> Sync for ReentrantMutex<T> {}
unsafe impl<T: Send> Send for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            state: Mutex::new(ReentrantState { owner: None, count: 0 }),
            cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> ReentrantGuard<'_, T> {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                Some(owner) if owner == me => {
                    state.count += 1;
                    break;
                }
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    break;
                }
                Some(_) => {
                    state = self.cond.wait(state).unwrap();
                }
            }
        }
        ReentrantGuard { lock: self }
    }
}

pub struct ReentrantGuard<'a, T> {
    lock: &'a ReentrantMutex<T>,
}

impl<T> Deref for ReentrantGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ReentrantGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ReentrantGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock().unwrap();
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.lock.cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn rwlock_allows_concurrent_readers() {
        let lock = Arc::new(PromotableRwLock::new(0));
        let a = lock.read();
        let b = lock.read();
        assert_eq!(*a, 0);
        assert_eq!(*b, 0);
    }

    #[test]
    fn rwlock_write_excludes_readers() {
        let lock = PromotableRwLock::new(0);
        {
            let mut w = lock.write();
            *w = 42;
        }
        assert_eq!(*lock.read(), 42);
    }

    #[test]
    fn promote_then_demote_round_trips() {
        let lock = PromotableRwLock::new(1);
        let r = lock.read();
        assert_eq!(*r, 1);
        let mut w = r.promote();
        *w += 1;
        let r2 = w.demote();
        assert_eq!(*r2, 2);
    }

    #[test]
    fn try_write_fails_while_reader_held() {
        let lock = PromotableRwLock::new(0);
        let _r = lock.read();
        assert!(lock.try_write().is_none());
    }

    #[test]
    fn reentrant_mutex_allows_nested_acquire_by_owner() {
        let lock = ReentrantMutex::new(0);
        let mut outer = lock.lock();
        *outer += 1;
        {
            let mut inner = lock.lock();
            *inner += 1;
        }
        assert_eq!(*outer, 2);
    }

    #[test]
    fn reentrant_mutex_excludes_other_threads() {
        let lock = Arc::new(ReentrantMutex::new(0));
        let l2 = lock.clone();
        let _guard = lock.lock();
        let handle = thread::spawn(move || {
            let _g = l2.lock();
        });
        // Give the other thread a moment to block on the lock; it must not
        // have completed while we still hold `_guard`.
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!handle.is_finished());
        drop(_guard);
        handle.join().unwrap();
    }
}
