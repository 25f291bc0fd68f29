//! End-to-end backup scenarios: an application workload drives the
//! manager's intercepted operations while backups run, and the
//! destination tree is checked against the source at seal time.

use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use calque::BackupCallbacks;
use calque::Manager;
use calque::QuietCallbacks;
use calque::SeekFrom;

struct Dirs {
    _source: tempfile::TempDir,
    _dest: tempfile::TempDir,
    source: PathBuf,
    dest: PathBuf,
}

fn setup_dirs() -> Dirs {
    let source = tempfile::tempdir().expect("source dir");
    let dest = tempfile::tempdir().expect("dest dir");
    let source_path = source.path().to_path_buf();
    let dest_path = dest.path().to_path_buf();
    Dirs {
        _source: source,
        _dest: dest,
        source: source_path,
        dest: dest_path,
    }
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn spawn_backup(
    manager: &Arc<Manager>,
    source: &Path,
    dest: &Path,
    calls: Arc<dyn BackupCallbacks>,
) -> std::thread::JoinHandle<calque::Result<()>> {
    let manager = Arc::clone(manager);
    let source = source.to_path_buf();
    let dest = dest.to_path_buf();
    std::thread::spawn(move || manager.do_backup(&source, &dest, calls))
}

#[test]
fn empty_file_round_trips() {
    // S1: one empty regular file.
    let dirs = setup_dirs();
    std::fs::write(dirs.source.join("a"), b"").expect("seed");

    let manager = Manager::default();
    manager
        .do_backup(&dirs.source, &dirs.dest, Arc::new(QuietCallbacks))
        .expect("backup must succeed");

    let meta = std::fs::metadata(dirs.dest.join("a")).expect("dest/a must exist");
    assert_eq!(meta.len(), 0);
}

#[test]
fn concurrent_append_lands_in_the_backup() {
    // S2: the application appends while the backup runs; the sealed
    // destination carries the appended bytes.
    let dirs = setup_dirs();
    let big = dirs.source.join("big");
    std::fs::write(&big, vec![0xAAu8; 4 << 20]).expect("seed");

    let manager = Arc::new(Manager::default());
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&big)
        .expect("open big");
    let fd = file.as_raw_fd();
    manager.open(fd, &big).expect("register open");
    manager.lseek(fd, SeekFrom::End(0)).expect("seek to end");

    manager.set_keep_capturing(true);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("copy to finish", || manager.is_done_copying());

    // Capture is still enabled: this append must be mirrored.
    manager.write(fd, &vec![0x55u8; 1 << 20]).expect("append");

    manager.set_keep_capturing(false);
    backup
        .join()
        .expect("backup thread")
        .expect("backup must succeed");
    manager.close(fd);

    let sealed = std::fs::read(dirs.dest.join("big")).expect("dest/big");
    let live = std::fs::read(&big).expect("source/big");
    assert_eq!(live.len(), 5 << 20);
    assert_eq!(sealed, live);
}

#[test]
fn rename_during_walk_lands_under_the_new_name() {
    // S3: rename the file before the copier reaches it.
    let dirs = setup_dirs();
    let old = dirs.source.join("x");
    std::fs::write(&old, vec![0x42u8; 1024]).expect("seed");

    let manager = Arc::new(Manager::default());
    manager.set_start_copying(false);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("capture to come up", || manager.is_capturing());

    manager
        .rename(&old, &dirs.source.join("y"))
        .expect("rename must succeed");

    manager.set_start_copying(true);
    backup
        .join()
        .expect("backup thread")
        .expect("backup must succeed");

    assert!(!dirs.dest.join("x").exists());
    assert_eq!(
        std::fs::read(dirs.dest.join("y")).expect("dest/y"),
        vec![0x42u8; 1024]
    );
}

#[test]
fn unlink_during_walk_leaves_no_corpse() {
    // S4: unlink before the copier opens the file.
    let dirs = setup_dirs();
    let gone = dirs.source.join("gone");
    std::fs::write(&gone, vec![0x13u8; 1 << 20]).expect("seed");

    let manager = Arc::new(Manager::default());
    manager.set_start_copying(false);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("capture to come up", || manager.is_capturing());

    manager.unlink(&gone).expect("unlink must succeed");
    assert!(!gone.exists());

    manager.set_start_copying(true);
    backup
        .join()
        .expect("backup thread")
        .expect("backup must succeed");

    assert!(!dirs.dest.join("gone").exists());
}

#[test]
fn overlapping_writes_seal_identically() {
    // S5: two writers hammer overlapping ranges through two opens of
    // the same file; at seal, destination equals source byte-exactly.
    const ITERATIONS: usize = 10_000;

    let dirs = setup_dirs();
    let path = dirs.source.join("f");
    std::fs::write(&path, vec![0u8; 2048]).expect("seed");

    let manager = Arc::new(Manager::default());
    let file_a = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open a");
    let file_b = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open b");
    let fd_a = file_a.as_raw_fd();
    let fd_b = file_b.as_raw_fd();
    manager.open(fd_a, &path).expect("register a");
    manager.open(fd_b, &path).expect("register b");

    manager.set_keep_capturing(true);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("copy to finish", || manager.is_done_copying());

    let writer_a = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            let buf = [0x11u8; 1024];
            for _ in 0..ITERATIONS {
                manager.pwrite(fd_a, &buf, 0).expect("pwrite a");
            }
        })
    };
    let writer_b = {
        let manager = Arc::clone(&manager);
        std::thread::spawn(move || {
            let buf = [0x22u8; 1024];
            for _ in 0..ITERATIONS {
                manager.pwrite(fd_b, &buf, 512).expect("pwrite b");
            }
        })
    };
    writer_a.join().expect("writer a");
    writer_b.join().expect("writer b");

    manager.set_keep_capturing(false);
    backup
        .join()
        .expect("backup thread")
        .expect("backup must succeed");
    manager.close(fd_a);
    manager.close(fd_b);

    assert_eq!(
        std::fs::read(dirs.dest.join("f")).expect("dest/f"),
        std::fs::read(&path).expect("source/f")
    );
}

#[test]
fn throttled_copy_takes_its_budgeted_time() {
    // S6: a throttled copy must pace itself and keep polling.
    struct Throttled {
        polls: AtomicUsize,
    }

    impl BackupCallbacks for Throttled {
        fn poll(&self, _fraction: f64, _message: &str) -> i32 {
            self.polls.fetch_add(1, Ordering::SeqCst);
            0
        }
        fn report_error(&self, _errnum: i32, _message: &str) {}
        fn get_throttle(&self) -> u64 {
            2 << 20 // 2 MiB/s
        }
    }

    let dirs = setup_dirs();
    std::fs::write(dirs.source.join("k"), vec![0x77u8; 6 << 20]).expect("seed");

    let manager = Manager::default();
    let calls = Arc::new(Throttled {
        polls: AtomicUsize::new(0),
    });

    let start = Instant::now();
    let callbacks: Arc<dyn BackupCallbacks> = calls.clone();
    manager
        .do_backup(&dirs.source, &dirs.dest, callbacks)
        .expect("backup must succeed");
    let elapsed = start.elapsed();

    // 6 MiB at 2 MiB/s budgets 3 seconds.
    assert!(
        elapsed.as_secs_f64() >= 2.0,
        "copy finished in {:?}, faster than the throttle allows",
        elapsed
    );
    // Sleeps are sliced so polling continues about once per second.
    assert!(calls.polls.load(Ordering::SeqCst) as u64 >= elapsed.as_secs());
    assert_eq!(
        std::fs::read(dirs.dest.join("k")).expect("dest/k"),
        vec![0x77u8; 6 << 20]
    );
}

#[test]
fn concurrent_backup_gets_ebusy() {
    // Only one backup at a time; the loser sees EBUSY immediately.
    let dirs = setup_dirs();
    std::fs::write(dirs.source.join("a"), b"data").expect("seed");

    let manager = Arc::new(Manager::default());
    manager.set_keep_capturing(true);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("first backup to hold the run", || manager.is_done_copying());

    let second_dest = tempfile::tempdir().expect("second dest");
    let err = manager
        .do_backup(&dirs.source, second_dest.path(), Arc::new(QuietCallbacks))
        .expect_err("second backup must be rejected");
    assert_eq!(err.errnum, rustix::io::Errno::BUSY.raw_os_error());

    manager.set_keep_capturing(false);
    backup
        .join()
        .expect("backup thread")
        .expect("first backup must succeed");
}

#[test]
fn poll_abort_lands_within_a_second() {
    // A nonzero poll return must stop a throttled copy within the
    // one-second sleep bound.
    struct AbortSwitch {
        code: AtomicI32,
    }

    impl BackupCallbacks for AbortSwitch {
        fn poll(&self, _fraction: f64, _message: &str) -> i32 {
            self.code.load(Ordering::SeqCst)
        }
        fn report_error(&self, _errnum: i32, _message: &str) {}
        fn get_throttle(&self) -> u64 {
            1 << 20 // slow enough that the copy far outlives the abort
        }
    }

    let dirs = setup_dirs();
    std::fs::write(dirs.source.join("slow"), vec![0x99u8; 16 << 20]).expect("seed");

    let manager = Arc::new(Manager::default());
    let calls = Arc::new(AbortSwitch {
        code: AtomicI32::new(0),
    });
    let callbacks: Arc<dyn BackupCallbacks> = calls.clone();
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, callbacks);

    std::thread::sleep(Duration::from_millis(500));
    let aborted_at = Instant::now();
    calls.code.store(77, Ordering::SeqCst);

    let err = backup
        .join()
        .expect("backup thread")
        .expect_err("abort must fail the backup");
    assert_eq!(err.errnum, 77);
    assert!(
        aborted_at.elapsed() < Duration::from_secs(2),
        "abort took {:?}",
        aborted_at.elapsed()
    );
}

#[test]
fn file_created_before_capture_is_mirrored_through_its_open() {
    // A file opened before the backup starts is prepared at session
    // setup; writes during the capture window land in the mirror.
    let dirs = setup_dirs();
    let path = dirs.source.join("live");
    std::fs::write(&path, b"before").expect("seed");

    let manager = Arc::new(Manager::default());
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open");
    let fd = file.as_raw_fd();
    manager.open(fd, &path).expect("register");

    manager.set_keep_capturing(true);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("copy to finish", || manager.is_done_copying());

    manager.pwrite(fd, b"AFTER!", 0).expect("pwrite");

    manager.set_keep_capturing(false);
    backup
        .join()
        .expect("backup thread")
        .expect("backup must succeed");
    manager.close(fd);

    assert_eq!(std::fs::read(dirs.dest.join("live")).expect("read"), b"AFTER!");
}

#[test]
fn truncate_by_path_is_mirrored() {
    let dirs = setup_dirs();
    let path = dirs.source.join("shrink");
    std::fs::write(&path, vec![0x31u8; 4096]).expect("seed");

    let manager = Arc::new(Manager::default());
    manager.set_keep_capturing(true);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("copy to finish", || manager.is_done_copying());

    manager.truncate(&path, 100).expect("truncate");

    manager.set_keep_capturing(false);
    backup
        .join()
        .expect("backup thread")
        .expect("backup must succeed");

    assert_eq!(
        std::fs::metadata(dirs.dest.join("shrink")).expect("stat").len(),
        100
    );
    assert_eq!(std::fs::metadata(&path).expect("stat").len(), 100);
}

#[test]
fn mkdir_during_capture_is_mirrored() {
    let dirs = setup_dirs();
    std::fs::write(dirs.source.join("seed"), b"x").expect("seed");

    let manager = Arc::new(Manager::default());
    manager.set_keep_capturing(true);
    let backup = spawn_backup(&manager, &dirs.source, &dirs.dest, Arc::new(QuietCallbacks));
    wait_until("copy to finish", || manager.is_done_copying());

    let fresh = dirs.source.join("fresh-dir");
    std::fs::create_dir(&fresh).expect("real mkdir");
    manager.mkdir(&fresh).expect("mirror mkdir");

    manager.set_keep_capturing(false);
    backup
        .join()
        .expect("backup thread")
        .expect("backup must succeed");

    assert!(dirs.dest.join("fresh-dir").is_dir());
}
