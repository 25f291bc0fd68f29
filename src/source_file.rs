//! A `SourceFile` is the canonical, path-keyed object representing a
//! live file on disk.  Every open description of that path shares the
//! same `SourceFile`, which is what lets the engine serialize
//! overlapping mutations: the pair (source write, destination mirror)
//! is not one atomic step, so both sides happen under an exclusive
//! hold on the affected byte range.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::RwLock;

/// Upper bound used by truncation: `ftruncate(len)` must exclude every
/// concurrent write past `len`, so it locks `[len, RANGE_MAX)`.
pub(crate) const RANGE_MAX: u64 = i64::MAX as u64;

#[derive(Debug)]
pub(crate) struct SourceFile {
    // Canonical absolute path.  Read-locked to observe the name,
    // write-locked by rename, which mutates it in place so that
    // outstanding descriptions stay valid.
    name: RwLock<PathBuf>,

    // Live references: one per bound description, plus transient
    // holds taken by path-based operations.  The table entry itself
    // is not counted.
    refcount: AtomicUsize,

    // Sorted, non-overlapping active byte ranges `[start, end)`.
    ranges: Mutex<Vec<(u64, u64)>>,
    range_freed: Condvar,

    unlinked: AtomicBool,
}

/// Exclusive hold on `[start, end)` of one `SourceFile`.  Dropping
/// the guard removes the range and wakes every waiter; each re-checks
/// its own overlap, so no waiter starves once the contending ranges
/// become disjoint.
#[derive(Debug)]
pub(crate) struct RangeLockGuard<'a> {
    file: &'a SourceFile,
    start: u64,
    end: u64,
}

impl Drop for RangeLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.file.ranges.lock().unwrap();
        match held.iter().position(|r| *r == (self.start, self.end)) {
            Some(idx) => {
                held.remove(idx);
            }
            None => debug_assert!(false, "range lock vanished before unlock"),
        }
        self.file.range_freed.notify_all();
    }
}

/// Returns true iff `[a_start, a_end)` and `[b_start, b_end)` share
/// at least one byte.  Empty ranges share none.
fn ranges_overlap(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
    a_start.max(b_start) < a_end.min(b_end)
}

fn assert_disjoint(held: &[(u64, u64)]) {
    if cfg!(debug_assertions) {
        for window in held.windows(2) {
            let (a, b) = (window[0], window[1]);
            assert!(
                !ranges_overlap(a.0, a.1, b.0, b.1),
                "overlapping ranges held: [{}, {}) and [{}, {})",
                a.0,
                a.1,
                b.0,
                b.1
            );
        }
    }
}

impl SourceFile {
    pub fn new(canonical_path: PathBuf) -> SourceFile {
        SourceFile {
            name: RwLock::new(canonical_path),
            refcount: AtomicUsize::new(0),
            ranges: Mutex::new(Vec::new()),
            range_freed: Condvar::new(),
            unlinked: AtomicBool::new(false),
        }
    }

    /// Returns the current canonical name.  The name is only stable
    /// while the caller prevents renames (e.g. under the table lock),
    /// so we hand out an owned copy.
    pub fn name(&self) -> PathBuf {
        self.name.read().unwrap().clone()
    }

    /// Rewrites the canonical name in place.  Caller must hold the
    /// table's rename lock so lookups never observe a half-moved
    /// entry.
    pub(crate) fn set_name(&self, new_name: PathBuf) {
        *self.name.write().unwrap() = new_name;
    }

    pub fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops one reference; returns the count that remains.
    pub fn release(&self) -> usize {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "source file over-released");
        prev - 1
    }

    pub fn ref_count(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    /// Records that the path was unlinked.  The object stays live
    /// until the last reference drops; only the table entry goes
    /// away.
    pub fn mark_unlinked(&self) {
        self.unlinked.store(true, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) fn is_unlinked(&self) -> bool {
        self.unlinked.load(Ordering::SeqCst)
    }

    /// Blocks until no held range overlaps `[start, end)`, then takes
    /// the range.  Empty ranges are legal and never contend.
    pub fn lock_range(&self, start: u64, end: u64) -> RangeLockGuard<'_> {
        debug_assert!(start <= end, "inverted range [{}, {})", start, end);

        let mut held = self.ranges.lock().unwrap();
        while held
            .iter()
            .any(|&(s, e)| ranges_overlap(s, e, start, end))
        {
            held = self.range_freed.wait(held).unwrap();
        }

        let idx = held.partition_point(|&(s, _)| s < start);
        held.insert(idx, (start, end));
        assert_disjoint(&held);

        RangeLockGuard {
            file: self,
            start,
            end,
        }
    }

    #[cfg(test)]
    pub(crate) fn held_ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_overlap_predicate_matches_byte_model() {
        // Compare against a brute-force byte intersection over a
        // small universe.
        for a_start in 0..8u64 {
            for a_end in a_start..8 {
                for b_start in 0..8u64 {
                    for b_end in b_start..8 {
                        let brute = (a_start..a_end).any(|b| (b_start..b_end).contains(&b));
                        assert_eq!(
                            ranges_overlap(a_start, a_end, b_start, b_end),
                            brute,
                            "[{}, {}) vs [{}, {})",
                            a_start,
                            a_end,
                            b_start,
                            b_end
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_disjoint_ranges_do_not_block() {
        let file = SourceFile::new(PathBuf::from("/tmp/f"));
        let a = file.lock_range(0, 10);
        let b = file.lock_range(10, 20);
        let c = file.lock_range(100, RANGE_MAX);
        assert_eq!(file.held_ranges().len(), 3);
        drop(b);
        drop(a);
        drop(c);
        assert!(file.held_ranges().is_empty());
    }

    #[test]
    fn test_empty_range_is_a_no_op() {
        let file = SourceFile::new(PathBuf::from("/tmp/f"));
        let _wide = file.lock_range(0, RANGE_MAX);
        // An empty range inside a held range must not block.
        let empty = file.lock_range(5, 5);
        drop(empty);
    }

    #[test]
    fn test_overlap_blocks_until_release() {
        let file = Arc::new(SourceFile::new(PathBuf::from("/tmp/f")));
        let held = file.lock_range(0, 100);

        let contender = {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                let _guard = file.lock_range(50, 150);
                file.held_ranges()
            })
        };

        // Give the contender a moment to reach the wait.
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(file.held_ranges(), vec![(0, 100)]);

        drop(held);
        let seen = contender.join().expect("contender must finish");
        assert_eq!(seen, vec![(50, 150)]);
    }

    #[test]
    fn test_concurrent_overlaps_never_share_a_byte() {
        use rand::Rng;

        // Each thread repeatedly locks a random range and paints its
        // id over the covered bytes of a shared board; any observed
        // mix of ids inside one hold means two overlapping ranges
        // were held at once.
        const BYTES: usize = 256;
        const THREADS: usize = 8;
        const ITERATIONS: usize = 500;

        let file = Arc::new(SourceFile::new(PathBuf::from("/tmp/f")));
        let board = Arc::new(
            (0..BYTES)
                .map(|_| AtomicUsize::new(usize::MAX))
                .collect::<Vec<_>>(),
        );

        let workers: Vec<_> = (0..THREADS)
            .map(|id| {
                let file = Arc::clone(&file);
                let board = Arc::clone(&board);
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for _ in 0..ITERATIONS {
                        let start = rng.gen_range(0..BYTES as u64);
                        let end = rng.gen_range(start..=BYTES as u64);
                        let guard = file.lock_range(start, end);

                        for byte in &board[start as usize..end as usize] {
                            let prev = byte.swap(id, Ordering::SeqCst);
                            assert_eq!(prev, usize::MAX, "byte already owned");
                        }
                        for byte in &board[start as usize..end as usize] {
                            byte.store(usize::MAX, Ordering::SeqCst);
                        }

                        drop(guard);
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().expect("worker must not panic");
        }
        assert!(file.held_ranges().is_empty());
    }

    #[test]
    fn test_refcount_round_trip() {
        let file = SourceFile::new(PathBuf::from("/tmp/f"));
        file.retain();
        file.retain();
        assert_eq!(file.ref_count(), 2);
        assert_eq!(file.release(), 1);
        assert_eq!(file.release(), 0);
    }

    #[test]
    fn test_unlinked_marker_outlives_the_path() {
        let file = SourceFile::new(PathBuf::from("/tmp/f"));
        assert!(!file.is_unlinked());
        file.retain();
        file.mark_unlinked();
        // Still referenced, still live, just doomed.
        assert!(file.is_unlinked());
        assert_eq!(file.ref_count(), 1);
    }
}
