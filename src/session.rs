//! A `Session` is the live state of one backup run: the canonical
//! source and destination roots, the prefix translation between them,
//! the callbacks, the cooperative abort flag, and the copier's todo
//! list of relative paths pending copy.

use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::callbacks::BackupCallbacks;

#[derive(Clone)]
pub(crate) struct Session {
    source: PathBuf,
    dest: PathBuf,
    calls: Arc<dyn BackupCallbacks>,
    aborted: Arc<AtomicBool>,

    // Depth-first stack of paths relative to the roots.  Shared with
    // the capture layer: rename pushes a path here when the
    // destination copy does not exist yet.
    todo: Arc<Mutex<Vec<PathBuf>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Session")
            .field("source", &self.source)
            .field("dest", &self.dest)
            .field("aborted", &self.aborted)
            .finish()
    }
}

impl Session {
    pub fn new(source: PathBuf, dest: PathBuf, calls: Arc<dyn BackupCallbacks>) -> Session {
        Session {
            source,
            dest,
            calls,
            aborted: Arc::new(AtomicBool::new(false)),
            todo: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    pub fn calls(&self) -> &Arc<dyn BackupCallbacks> {
        &self.calls
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Returns true when `path` (canonical) lies under the source
    /// root.
    pub fn is_prefix(&self, path: &Path) -> bool {
        path.starts_with(&self.source)
    }

    /// Maps a canonical source path to its destination counterpart by
    /// substituting the source prefix with the destination prefix.
    /// None when `path` is outside the source tree.
    pub fn translate(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(&self.source).ok()?;
        Some(self.dest.join(relative))
    }

    /// Queues `relative` for the copier.  Paths are relative to both
    /// roots, so a single entry names the pair.
    pub fn push_todo(&self, relative: PathBuf) {
        self.todo.lock().unwrap().push(relative);
    }

    /// Pops the next pending path, reporting how many remain known.
    pub fn pop_todo(&self) -> Option<(PathBuf, usize)> {
        let mut todo = self.todo.lock().unwrap();
        let n_known = todo.len();
        todo.pop().map(|path| (path, n_known))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::QuietCallbacks;

    fn session(source: &str, dest: &str) -> Session {
        Session::new(
            PathBuf::from(source),
            PathBuf::from(dest),
            Arc::new(QuietCallbacks),
        )
    }

    #[test]
    fn test_translate_substitutes_the_prefix() {
        let session = session("/data/live", "/backup/run1");

        assert_eq!(
            session.translate(Path::new("/data/live/a/b")),
            Some(PathBuf::from("/backup/run1/a/b"))
        );
        assert_eq!(
            session.translate(Path::new("/data/live")),
            Some(PathBuf::from("/backup/run1"))
        );
        assert_eq!(session.translate(Path::new("/data/other/a")), None);
    }

    #[test]
    fn test_is_prefix_does_not_match_siblings() {
        let session = session("/data/live", "/backup/run1");

        assert!(session.is_prefix(Path::new("/data/live/x")));
        assert!(session.is_prefix(Path::new("/data/live")));
        // A sibling sharing the string prefix is not inside the tree.
        assert!(!session.is_prefix(Path::new("/data/liveblog/x")));
    }

    #[test]
    fn test_todo_is_a_stack() {
        let session = session("/s", "/d");
        session.push_todo(PathBuf::from("a"));
        session.push_todo(PathBuf::from("b"));

        assert_eq!(session.pop_todo(), Some((PathBuf::from("b"), 2)));
        assert_eq!(session.pop_todo(), Some((PathBuf::from("a"), 1)));
        assert_eq!(session.pop_todo(), None);
    }
}

#[cfg(test)]
mod translation_properties {
    use super::*;
    use crate::callbacks::QuietCallbacks;
    use proptest::prelude::*;

    proptest! {
        // Any path under the source root translates to the same
        // relative location under the destination root, and the
        // relative path survives the substitution unchanged.
        #[test]
        fn translation_preserves_relative_paths(
            segments in proptest::collection::vec("[a-z]{1,8}", 0..6),
        ) {
            let session = Session::new(
                PathBuf::from("/data/live"),
                PathBuf::from("/backup/run1"),
                Arc::new(QuietCallbacks),
            );

            let mut source_path = PathBuf::from("/data/live");
            for segment in &segments {
                source_path.push(segment);
            }

            let translated = session.translate(&source_path).expect("under the prefix");
            let relative = translated
                .strip_prefix("/backup/run1")
                .expect("under the destination");
            prop_assert_eq!(
                relative,
                source_path.strip_prefix("/data/live").expect("under the source")
            );
        }
    }
}
