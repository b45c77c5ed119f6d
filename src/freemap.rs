//! A bitmap of free sectors, pinned in memory via the buffer cache's
//! external-extent bypass and written back by the periodic flush.
//!
//! Grounded in the teacher's `balloc`/`bfree` (`fs/ufs/mod.rs`), which scans
//! bitmap blocks bit-by-bit through the ordinary cache; here the bitmap is
//! pinned as one extent instead (per §4.2) but the bit-twiddling itself is
//! the same hand-rolled shift/mask arithmetic the teacher uses rather than
//! reaching for a fixed-size bitmap crate, since the map's length is only
//! known at runtime (`BlockDevice::sector_count()`), not at compile time.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use log::trace;

use crate::cache::{BufferCache, ExternalExtentHandle};
use crate::error::{FsError, Result};
use crate::geometry::Geometry;

pub struct FreeMap {
    cache: Arc<BufferCache>,
    handle: ExternalExtentHandle,
    data: Arc<Mutex<Vec<u8>>>,
    dirty: Arc<AtomicBool>,
    total_bits: u32,
    lock: Mutex<()>,
}

fn bit(data: &[u8], i: u32) -> bool {
    data[(i / 8) as usize] & (1 << (i % 8)) != 0
}

fn set_bit(data: &mut [u8], i: u32, value: bool) {
    let byte = &mut data[(i / 8) as usize];
    let mask = 1 << (i % 8);
    if value {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

impl FreeMap {
    /// Registers the free map's extent with the cache. Does not itself
    /// decide whether the region is freshly formatted; call `format` after
    /// construction when `Filesystem::init(format = true)`.
    pub fn open(cache: Arc<BufferCache>, geometry: &Geometry) -> Self {
        let (handle, data, dirty) =
            cache.register_external(geometry.free_map_start, geometry.free_map_sectors);
        Self {
            cache,
            handle,
            data,
            dirty,
            total_bits: geometry.sector_count,
            lock: Mutex::new(()),
        }
    }

    /// Clears every bit, then marks `[0, reserved)` used — the inode table
    /// and the free map's own sectors never participate in allocation.
    pub fn format(&self, reserved: u32) {
        let _guard = self.lock.lock().unwrap();
        let mut data = self.data.lock().unwrap();
        data.iter_mut().for_each(|b| *b = 0);
        for i in 0..reserved.min(self.total_bits) {
            set_bit(&mut data, i, true);
        }
        drop(data);
        self.cache.dirty_external(&self.handle);
    }

    /// Finds `count` consecutive cleared bits, sets them, and returns the
    /// first index. Scans from the start every time — simple and correct;
    /// the inode table equivalent (linear scan) makes the same trade-off.
    pub fn allocate(&self, count: u32) -> Result<u32> {
        assert!(count > 0);
        let _guard = self.lock.lock().unwrap();
        let mut data = self.data.lock().unwrap();

        let mut run_start = None;
        let mut run_len = 0u32;
        for i in 0..self.total_bits {
            if bit(&data, i) {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(i);
            }
            run_len += 1;
            if run_len == count {
                let start = run_start.unwrap();
                for j in start..start + count {
                    set_bit(&mut data, j, true);
                }
                drop(data);
                self.cache.dirty_external(&self.handle);
                trace!("free map: allocated [{}, {})", start, start + count);
                return Ok(start);
            }
        }
        Err(FsError::NoFreeSector)
    }

    /// Clears `count` bits starting at `start`. Every bit must have been
    /// set; violating this indicates a double free, a programming error
    /// elsewhere in the crate.
    pub fn release(&self, start: u32, count: u32) {
        let _guard = self.lock.lock().unwrap();
        let mut data = self.data.lock().unwrap();
        for i in start..start + count {
            assert!(bit(&data, i), "freemap: releasing already-free sector {}", i);
            set_bit(&mut data, i, false);
        }
        drop(data);
        self.cache.dirty_external(&self.handle);
        trace!("free map: released [{}, {})", start, start + count);
    }

    pub fn count_free(&self) -> u32 {
        let data = self.data.lock().unwrap();
        (0..self.total_bits).filter(|&i| !bit(&data, i)).count() as u32
    }

    pub fn count_used(&self) -> u32 {
        self.total_bits - self.count_free()
    }

    /// Writes the extent back one last time and unregisters it. Must run
    /// after the cache's final flush and before the cache itself is torn
    /// down (§9: "flush cache → close free map → destroy cache").
    pub fn close(&self) {
        self.cache.free_external(&self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemBlockDevice;
    use crate::geometry::CacheConfig;

    fn setup(sector_count: u32) -> (Arc<BufferCache>, Geometry) {
        let dev: Arc<dyn crate::device::BlockDevice> = Arc::new(MemBlockDevice::new(sector_count));
        let geometry = Geometry::new(sector_count);
        let cache = BufferCache::new(dev, CacheConfig::default());
        (cache, geometry)
    }

    #[test]
    fn allocate_then_release_round_trips() {
        let (cache, geometry) = setup(2000);
        let fm = FreeMap::open(cache.clone(), &geometry);
        fm.format(geometry.reserved_sectors());
        let before = fm.count_free();
        let start = fm.allocate(4).unwrap();
        assert!(start >= geometry.reserved_sectors());
        assert_eq!(fm.count_free(), before - 4);
        fm.release(start, 4);
        assert_eq!(fm.count_free(), before);
        fm.close();
        cache.shutdown();
    }

    #[test]
    fn reserved_region_is_never_allocated() {
        let (cache, geometry) = setup(2000);
        let fm = FreeMap::open(cache.clone(), &geometry);
        fm.format(geometry.reserved_sectors());
        for _ in 0..10 {
            let s = fm.allocate(1).unwrap();
            assert!(s >= geometry.reserved_sectors());
        }
        fm.close();
        cache.shutdown();
    }

    #[test]
    fn exhaustion_reports_no_free_sector() {
        let (cache, geometry) = setup(2000);
        let fm = FreeMap::open(cache.clone(), &geometry);
        fm.format(geometry.reserved_sectors());
        let free = fm.count_free();
        fm.allocate(free).unwrap();
        assert!(matches!(fm.allocate(1), Err(FsError::NoFreeSector)));
        fm.close();
        cache.shutdown();
    }

    #[test]
    #[should_panic(expected = "releasing already-free sector")]
    fn double_release_panics() {
        let (cache, geometry) = setup(2000);
        let fm = FreeMap::open(cache.clone(), &geometry);
        fm.format(geometry.reserved_sectors());
        let start = fm.allocate(1).unwrap();
        fm.release(start, 1);
        fm.release(start, 1);
    }
}
