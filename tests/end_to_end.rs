//! Cross-module scenarios exercising `Filesystem`/`FileHandle` end to end,
//! against an in-memory `BlockDevice`.

use std::io::SeekFrom;
use std::sync::Arc;
use std::thread;

use sectorfs::{BlockDevice, CacheConfig, FsError, MemBlockDevice, Filesystem};

fn device(sector_count: u32) -> Arc<dyn BlockDevice> {
    Arc::new(MemBlockDevice::new(sector_count))
}

#[test]
fn create_write_close_reopen_read() {
    let fs = Filesystem::init(device(4096), CacheConfig::default(), true).unwrap();
    fs.create("/a", 0, false).unwrap();
    {
        let f = fs.open("/a").unwrap();
        assert_eq!(f.write(b"hello").unwrap(), 5);
    }
    let f = fs.open("/a").unwrap();
    let mut buf = [0u8; 5];
    assert_eq!(f.read(&mut buf).unwrap(), 5);
    assert_eq!(&buf, b"hello");
    assert_eq!(f.length(), 5);
    fs.done();
}

#[test]
fn removing_a_directory_does_not_disturb_its_still_open_children() {
    let fs = Filesystem::init(device(4096), CacheConfig::default(), true).unwrap();
    fs.create("/d", 0, true).unwrap();
    fs.create("/d/x", 0, false).unwrap();

    // Removing a non-empty directory is rejected outright...
    assert!(matches!(fs.remove("/d"), Err(FsError::DirNotEmpty { .. })));
    // ...so the child is always reachable through the normal path.
    assert!(fs.open("/d/x").is_ok());
    fs.done();
}

#[test]
fn large_file_round_trips_through_every_indirection_tier() {
    let fs = Filesystem::init(device(8192), CacheConfig::default(), true).unwrap();
    fs.create("/big", 0, false).unwrap();
    let f = fs.open("/big").unwrap();

    let size = 1024 * 1024usize;
    let pattern: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
    assert_eq!(f.write(&pattern).unwrap(), size);
    drop(f);

    let f = fs.open("/big").unwrap();
    let mut out = vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = f.read(&mut out[done..]).unwrap();
        assert!(n > 0, "short read before EOF at {done}");
        done += n;
    }
    assert_eq!(out, pattern);
    assert_eq!(f.length() as usize, size);
    fs.done();
}

#[test]
fn concurrent_appenders_leave_a_contiguous_prefix_of_one_writer() {
    let fs = Filesystem::init(device(4096), CacheConfig::default(), true).unwrap();
    fs.create("/shared", 0, false).unwrap();

    let chunk = 4096usize;
    let a = vec![b'a'; chunk];
    let b = vec![b'b'; chunk];

    let fs1 = fs.clone();
    let a2 = a.clone();
    let t1 = thread::spawn(move || {
        let f = fs1.open("/shared").unwrap();
        f.write(&a2).unwrap();
    });
    let fs2 = fs.clone();
    let b2 = b.clone();
    let t2 = thread::spawn(move || {
        let f = fs2.open("/shared").unwrap();
        f.write(&b2).unwrap();
    });
    t1.join().unwrap();
    t2.join().unwrap();

    let f = fs.open("/shared").unwrap();
    assert_eq!(f.length() as usize, chunk);
    let mut out = vec![0u8; chunk];
    assert_eq!(f.read(&mut out).unwrap(), chunk);
    assert!(out == a || out == b, "surviving bytes must be one writer's whole buffer");
    fs.done();
}

#[test]
fn removing_even_files_leaves_odd_files_readable() {
    let fs = Filesystem::init(device(16384), CacheConfig::default(), true).unwrap();
    for i in 0..100 {
        let path = format!("/f{i}");
        fs.create(&path, 0, false).unwrap();
        let f = fs.open(&path).unwrap();
        f.write(&vec![i as u8; 4096]).unwrap();
    }
    for i in (0..100).step_by(2) {
        fs.remove(&format!("/f{i}")).unwrap();
    }
    for i in (1..100).step_by(2) {
        let f = fs.open(&format!("/f{i}")).unwrap();
        let mut buf = vec![0u8; 4096];
        f.read(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == i as u8));
    }
    for i in (0..100).step_by(2) {
        assert!(matches!(fs.open(&format!("/f{i}")), Err(FsError::NotFound { .. })));
    }
    fs.done();
}

#[test]
fn data_survives_a_shutdown_and_reinit_without_format() {
    let dev = device(4096);
    let fs = Filesystem::init(dev.clone(), CacheConfig::default(), true).unwrap();
    fs.create("/d", 0, true).unwrap();
    fs.create("/d/e", 0, true).unwrap();
    fs.create("/d/e/f", 0, false).unwrap();
    {
        let f = fs.open("/d/e/f").unwrap();
        f.write(b"x").unwrap();
    }
    fs.done();

    let fs = Filesystem::init(dev, CacheConfig::default(), false).unwrap();
    let f = fs.open("/d/e/f").unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(f.read(&mut buf).unwrap(), 1);
    assert_eq!(&buf, b"x");
    fs.done();
}

#[test]
fn reads_past_length_are_short_not_an_error() {
    let fs = Filesystem::init(device(4096), CacheConfig::default(), true).unwrap();
    fs.create("/short", 0, false).unwrap();
    let f = fs.open("/short").unwrap();
    f.write(b"abc").unwrap();
    f.seek(SeekFrom::Start(0)).unwrap();
    let mut buf = [0xffu8; 10];
    assert_eq!(f.read(&mut buf).unwrap(), 3);
    fs.done();
}

#[test]
fn create_remove_create_yields_a_logically_fresh_inode() {
    let fs = Filesystem::init(device(4096), CacheConfig::default(), true).unwrap();
    fs.create("/p", 0, false).unwrap();
    {
        let f = fs.open("/p").unwrap();
        f.write(b"stale data").unwrap();
    }
    fs.remove("/p").unwrap();
    fs.create("/p", 0, false).unwrap();
    let f = fs.open("/p").unwrap();
    assert_eq!(f.length(), 0);
    fs.done();
}
