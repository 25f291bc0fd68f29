//! A `Description` holds the per-open-handle state for one
//! application file descriptor: the logical offset, the binding to
//! the shared `SourceFile`, and, while a backup session covers the
//! file, the destination handle that captured mutations are mirrored
//! into.

use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::chain_error;
use crate::fresh_error;
use crate::result::Result;
use crate::source_file::SourceFile;

/// Destination files are created private to the invoking user; the
/// engine never chmods afterwards.
const DEST_FILE_MODE: u32 = 0o700;

/// Offset-coupled state, guarded by the description mutex.  The
/// manager holds the guard across composite operations (real write +
/// offset update) so the recorded offset always equals the kernel's.
#[derive(Debug)]
pub(crate) struct State {
    pub offset: u64,
    dest: Option<File>,
    dest_path: Option<PathBuf>,
}

impl State {
    pub fn increment_offset(&mut self, nbyte: u64) {
        self.offset += nbyte;
    }

    /// Records the offset the real lseek just returned.  No syscall
    /// here; the manager performs the real lseek before the call.
    pub fn lseek(&mut self, new_offset: u64) {
        self.offset = new_offset;
    }
}

#[derive(Debug)]
pub(crate) struct Description {
    source: Arc<SourceFile>,

    // Set while this open lies under an active session's source
    // prefix.  Once cleared, the description never touches the
    // destination again.
    in_source_dir: AtomicBool,

    inner: Mutex<State>,
}

impl Description {
    pub fn new(source: Arc<SourceFile>) -> Description {
        Description {
            source,
            in_source_dir: AtomicBool::new(false),
            inner: Mutex::new(State {
                offset: 0,
                dest: None,
                dest_path: None,
            }),
        }
    }

    pub fn source(&self) -> &Arc<SourceFile> {
        &self.source
    }

    /// Serializes offset-coupled composite operations (write, read,
    /// lseek).
    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock().unwrap()
    }

    /// Stores the destination pathname and marks this description as
    /// covered by the session.
    pub fn prepare_for_backup(&self, dest_path: PathBuf) {
        let mut state = self.inner.lock().unwrap();
        state.dest_path = Some(dest_path);
        drop(state);
        self.in_source_dir.store(true, Ordering::SeqCst);
    }

    /// Clears the covered flag; further `pwrite`/`truncate` become
    /// no-ops.  The destination handle, if any, stays open until the
    /// description is destroyed.
    pub fn disable_from_backup(&self) {
        self.in_source_dir.store(false, Ordering::SeqCst);
    }

    pub fn is_in_source_dir(&self) -> bool {
        self.in_source_dir.load(Ordering::SeqCst)
    }

    /// Opens the prepared destination file, expecting it to exist.
    /// A missing file delegates to `create_dest`; directories succeed
    /// silently without recording a handle, since directories need no
    /// byte mirroring.
    pub fn open_dest(&self) -> Result<()> {
        use std::io::ErrorKind;

        let mut state = self.inner.lock().unwrap();
        let path = match &state.dest_path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };

        match OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                state.dest = Some(file);
                Ok(())
            }
            Err(e) if is_directory_error(&e) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                drop(state);
                self.create_dest()
            }
            Err(e) => Err(chain_error!(e, "failed to open backup file", ?path)),
        }
    }

    /// Creates the prepared destination file, expecting it to not
    /// exist.  An existing file delegates to a plain open; directories
    /// succeed silently.
    pub fn create_dest(&self) -> Result<()> {
        use std::io::ErrorKind;

        let mut state = self.inner.lock().unwrap();
        let path = match &state.dest_path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(DEST_FILE_MODE)
            .open(&path)
        {
            Ok(file) => {
                state.dest = Some(file);
                Ok(())
            }
            Err(e) if is_directory_error(&e) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match OpenOptions::new().write(true).open(&path) {
                    Ok(file) => {
                        state.dest = Some(file);
                        Ok(())
                    }
                    Err(e) if is_directory_error(&e) => Ok(()),
                    Err(e) => Err(chain_error!(
                        e,
                        "failed to reopen existing backup file",
                        ?path
                    )),
                }
            }
            Err(e) => Err(chain_error!(e, "failed to create backup file", ?path)),
        }
    }

    /// Mirrors `buf` into the destination at `offset`, writing fully
    /// or reporting a destination error.  A no-op when this
    /// description is not covered or the destination was never
    /// opened.
    pub fn pwrite(&self, buf: &[u8], offset: u64) -> Result<()> {
        if !self.is_in_source_dir() {
            return Ok(());
        }

        let state = self.inner.lock().unwrap();
        let dest = match &state.dest {
            Some(dest) => dest,
            None => return Ok(()),
        };

        let mut written = 0usize;
        while written < buf.len() {
            match dest.write_at(&buf[written..], offset + written as u64) {
                Ok(0) => {
                    // A zero-byte write should not happen; treat it as
                    // a destination I/O error rather than spin.
                    return Err(fresh_error!(
                        -1,
                        "pwrite inexplicably returned zero",
                        ?state.dest_path
                    ));
                }
                Ok(n) => written += n,
                Err(e) => return Err(chain_error!(e, "failed to pwrite backup file", ?state.dest_path)),
            }
        }

        Ok(())
    }

    /// Truncates the destination to `length`; a no-op when not
    /// covered.
    pub fn truncate(&self, length: u64) -> Result<()> {
        if !self.is_in_source_dir() {
            return Ok(());
        }

        let state = self.inner.lock().unwrap();
        match &state.dest {
            Some(dest) => dest.set_len(length).map_err(|e| {
                chain_error!(e, "failed to truncate backup file", ?state.dest_path)
            }),
            None => Ok(()),
        }
    }
}

/// EISDIR means the application opened a directory (e.g. to fsync
/// it); there is nothing to mirror byte-wise, so we succeed without a
/// handle.
fn is_directory_error(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(rustix::io::Errno::ISDIR.raw_os_error())
}
