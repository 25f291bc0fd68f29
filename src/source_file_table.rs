//! The `SourceFileTable` maps canonical source paths to their shared
//! `SourceFile` objects.  Its lock doubles as the rename lock: a
//! rename relocates the entry and rewrites the file's name in one
//! critical section, so lookups never observe a half-moved file.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::source_file::SourceFile;

#[derive(Debug, Default)]
pub(crate) struct SourceFileTable {
    files: Mutex<HashMap<PathBuf, Arc<SourceFile>>>,
}

impl SourceFileTable {
    pub fn new() -> SourceFileTable {
        SourceFileTable::default()
    }

    /// Returns the `SourceFile` for `canonical_path`, creating it on
    /// first lookup.  The returned reference is already retained for
    /// the caller.
    pub fn get_or_create(&self, canonical_path: &Path) -> Arc<SourceFile> {
        let mut files = self.files.lock().unwrap();
        let file = files
            .entry(canonical_path.to_path_buf())
            .or_insert_with(|| Arc::new(SourceFile::new(canonical_path.to_path_buf())));
        file.retain();
        Arc::clone(file)
    }

    /// Returns the `SourceFile` for `canonical_path` with an extra
    /// reference, or None when the path has never been opened.
    pub fn get(&self, canonical_path: &Path) -> Option<Arc<SourceFile>> {
        let files = self.files.lock().unwrap();
        let file = files.get(canonical_path)?;
        file.retain();
        Some(Arc::clone(file))
    }

    /// Atomically relocates the entry for `old_path` to `new_path`,
    /// rewriting the file's stored name in place so outstanding
    /// descriptions stay valid.  A no-op when `old_path` was never
    /// opened.
    pub fn rename(&self, old_path: &Path, new_path: &Path) {
        let mut files = self.files.lock().unwrap();
        if let Some(file) = files.remove(old_path) {
            file.set_name(new_path.to_path_buf());
            files.insert(new_path.to_path_buf(), file);
        }
    }

    /// Drops the table entry for `file` if nothing else refers to it.
    /// Holding the table lock here is what makes the check-then-remove
    /// atomic against concurrent lookups.
    pub fn try_to_remove(&self, file: &Arc<SourceFile>) {
        let mut files = self.files.lock().unwrap();
        if file.ref_count() == 0 {
            files.remove(&file.name());
        }
    }

    /// Holds the table closed while the caller completes a compound
    /// operation (e.g. unlink's source-unlink + destination-unlink +
    /// removal check).
    pub fn guard(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<SourceFile>>> {
        self.files.lock().unwrap()
    }
}
