//! The `FileMap` maps the application's dense file descriptor numbers
//! to their per-open `Description`s.  It shadows the process's fd
//! table, so a plain growable vector indexed by fd is the right
//! shape.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::sync::Mutex;

use crate::description::Description;

#[derive(Debug, Default)]
pub(crate) struct FileMap {
    entries: Mutex<Vec<Option<Arc<Description>>>>,
}

impl FileMap {
    pub fn new() -> FileMap {
        FileMap::default()
    }

    /// Installs `description` for `fd`, growing the table as needed.
    /// A stale entry for a recycled fd is replaced; the kernel only
    /// recycles a descriptor after the application closed it.
    pub fn put(&self, fd: RawFd, description: Arc<Description>) {
        let idx = fd as usize;
        let mut entries = self.entries.lock().unwrap();
        if idx >= entries.len() {
            entries.resize_with(idx + 1, || None);
        }
        entries[idx] = Some(description);
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Description>> {
        let entries = self.entries.lock().unwrap();
        entries.get(fd as usize)?.clone()
    }

    /// Removes and returns the entry for `fd`, letting the caller
    /// drive reference-count release before the description drops.
    pub fn erase(&self, fd: RawFd) -> Option<Arc<Description>> {
        let mut entries = self.entries.lock().unwrap();
        entries.get_mut(fd as usize)?.take()
    }

    /// Snapshots every live description.  Used to prepare and later
    /// disable all already-open files around a session; the snapshot
    /// is taken under the map lock, so no open or close can interleave
    /// with the sweep itself.
    pub fn live_descriptions(&self) -> Vec<Arc<Description>> {
        let entries = self.entries.lock().unwrap();
        entries.iter().flatten().cloned().collect()
    }
}
