//! The `Manager` is the engine's top-level orchestrator.  The
//! interposition shim owns exactly one and routes every intercepted
//! syscall through it; `do_backup` runs the session state machine
//! (validate, prepare, capture + copy, drain, tear down) while the
//! intercepted operations keep the destination mirror coherent with
//! whatever the application does meanwhile.

use std::os::unix::io::RawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::sync::TryLockError;

use crate::callbacks::BackupCallbacks;
use crate::chain_error;
use crate::config::EngineConfig;
use crate::copier::Copier;
use crate::copier::CopyInterrupt;
use crate::description::Description;
use crate::fd_ops;
use crate::fd_ops::SeekFrom;
use crate::file_map::FileMap;
use crate::fresh_error;
use crate::fresh_warn;
use crate::result::Result;
use crate::session::Session;
use crate::source_file::RANGE_MAX;
use crate::source_file_table::SourceFileTable;

/// First-error latch.  Only the first backup error of a run is kept;
/// it is reported through the callbacks and returned when `do_backup`
/// unwinds.
#[derive(Debug, Default)]
struct ErrorLatch {
    happened: bool,
    errnum: i32,
    message: String,
}

/// Pause and observation points for concurrency tests, compiled out
/// of release builds.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug)]
struct TestGates {
    start_copying: AtomicBool,
    keep_capturing: AtomicBool,
    is_capturing: AtomicBool,
    done_copying: AtomicBool,
}

#[cfg(any(test, feature = "test-support"))]
impl Default for TestGates {
    fn default() -> TestGates {
        TestGates {
            start_copying: AtomicBool::new(true),
            keep_capturing: AtomicBool::new(false),
            is_capturing: AtomicBool::new(false),
            done_copying: AtomicBool::new(false),
        }
    }
}

pub struct Manager {
    // Held for the entirety of `do_backup`; at most one backup runs
    // at a time.
    run_mutex: Mutex<()>,

    // Readers held across any operation that consults the session;
    // the writer only installs or tears the session down.
    session: RwLock<Option<Session>>,

    // The capture gate.  Read relaxed: mirroring re-checks under its
    // own locks, so a stale "on" merely costs a no-op mirror.
    capture_enabled: AtomicBool,

    // Tells the in-flight copier that a capture-side error already
    // sank the run.
    abort_copy: Arc<AtomicBool>,

    dead: AtomicBool,
    throttle: AtomicU64,
    error: Mutex<ErrorLatch>,

    table: SourceFileTable,
    map: FileMap,
    copier: Copier,
    config: EngineConfig,

    #[cfg(any(test, feature = "test-support"))]
    gates: TestGates,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Manager")
            .field("capture_enabled", &self.capture_enabled)
            .field("dead", &self.dead)
            .finish()
    }
}

impl Default for Manager {
    fn default() -> Manager {
        Manager::new()
    }
}

impl Manager {
    pub fn new() -> Manager {
        Manager::with_config(EngineConfig::from_env())
    }

    pub fn with_config(config: EngineConfig) -> Manager {
        Manager {
            run_mutex: Mutex::new(()),
            session: RwLock::new(None),
            capture_enabled: AtomicBool::new(false),
            abort_copy: Arc::new(AtomicBool::new(false)),
            dead: AtomicBool::new(false),
            throttle: AtomicU64::new(u64::MAX),
            error: Mutex::new(ErrorLatch::default()),
            table: SourceFileTable::new(),
            map: FileMap::new(),
            copier: Copier::new(),
            config,
            #[cfg(any(test, feature = "test-support"))]
            gates: TestGates::default(),
        }
    }

    ///////////////////////////////////////////////////////////////////
    // Backup entry point.

    /// Produces a consistent point-in-time copy of `source` under the
    /// empty directory `dest` while the application keeps mutating
    /// `source` through the intercepted operations.
    pub fn do_backup(
        &self,
        source: &Path,
        dest: &Path,
        calls: Arc<dyn BackupCallbacks>,
    ) -> Result<()> {
        if self.is_dead() {
            calls.report_error(-1, "Backup system is dead");
            return Err(fresh_error!(-1, "backup system is dead"));
        }

        let r = calls.poll(0.0, "Preparing backup");
        if r != 0 {
            calls.report_error(r, "User aborted backup");
            return Err(fresh_warn!(r, "user aborted backup"));
        }

        let _run = match self.run_mutex.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => {
                let errnum = rustix::io::Errno::BUSY.raw_os_error();
                calls.report_error(errnum, "Another backup is in progress.");
                return Err(fresh_warn!(errnum, "another backup is in progress"));
            }
            Err(TryLockError::Poisoned(_)) => {
                self.fatal_error(-1, "backup run lock poisoned".to_string());
                return Err(fresh_error!(-1, "backup run lock poisoned"));
            }
        };

        {
            let mut latch = self.error.lock().unwrap();
            *latch = ErrorLatch::default();
        }
        self.abort_copy.store(false, Ordering::Relaxed);
        #[cfg(any(test, feature = "test-support"))]
        {
            self.gates.is_capturing.store(false, Ordering::SeqCst);
            self.gates.done_copying.store(false, Ordering::SeqCst);
        }

        self.run_backup(source, dest, &calls);

        // Report and return the first latched error, if any.
        let latched = {
            let latch = self.error.lock().unwrap();
            if latch.happened {
                Some((latch.errnum, latch.message.clone()))
            } else {
                None
            }
        };
        match latched {
            Some((errnum, message)) => {
                calls.report_error(errnum, &message);
                Err(fresh_error!(errnum, "backup failed"))
            }
            None => Ok(()),
        }
    }

    /// The session state machine.  Every failure latches; the caller
    /// turns the latch into the run's result.
    fn run_backup(&self, source: &Path, dest: &Path, calls: &Arc<dyn BackupCallbacks>) {
        let source = match std::fs::canonicalize(source) {
            Ok(canonical) => canonical,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(
                    errnum,
                    format!("Problem with source directory {}: {}", source.display(), e),
                );
                return;
            }
        };
        if !source.is_dir() {
            self.backup_error(
                rustix::io::Errno::INVAL.raw_os_error(),
                format!("Source {} is not a directory", source.display()),
            );
            return;
        }

        let dest = match std::fs::canonicalize(dest) {
            Ok(canonical) => canonical,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(
                    errnum,
                    format!("Problem stat()ing backup directory {}: {}", dest.display(), e),
                );
                return;
            }
        };
        if !self.validate_dest(&dest) {
            return;
        }

        let session = Session::new(source, dest, Arc::clone(calls));
        {
            let mut slot = self.session.write().unwrap();
            *slot = Some(session.clone());
        }
        tracing::info!(source=%session.source().display(), dest=%session.dest().display(),
                       "hot backup started");

        let prepared = self.prepare_open_descriptions(&session);
        match prepared {
            Ok(()) => {
                self.enable_capture();

                #[cfg(any(test, feature = "test-support"))]
                {
                    self.gates.is_capturing.store(true, Ordering::SeqCst);
                    while !self.gates.start_copying.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                }

                let copied =
                    self.copier
                        .run(session.clone(), self.config.clone(), Arc::clone(&self.abort_copy));
                match copied {
                    Ok(()) => {}
                    Err(CopyInterrupt::Aborted(code)) => {
                        self.backup_error(code, "User aborted backup".to_string());
                    }
                    Err(CopyInterrupt::Failed(errnum)) => {
                        self.backup_error(errnum, "Backup copy failed".to_string());
                    }
                }
            }
            Err(e) => {
                session.abort();
                self.backup_error(e.errnum, "Failed to prepare files for backup".to_string());
            }
        }

        #[cfg(any(test, feature = "test-support"))]
        {
            self.gates.done_copying.store(true, Ordering::SeqCst);
            while self.gates.keep_capturing.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        }

        self.disable_capture();
        for description in self.map.live_descriptions() {
            description.disable_from_backup();
        }

        #[cfg(any(test, feature = "test-support"))]
        self.gates.is_capturing.store(false, Ordering::SeqCst);

        {
            let mut slot = self.session.write().unwrap();
            *slot = None;
        }
        tracing::info!("hot backup finished");
    }

    /// The destination must be an empty directory; anything else
    /// fails the run before any state is created.
    fn validate_dest(&self, dest: &Path) -> bool {
        let meta = match std::fs::metadata(dest) {
            Ok(meta) => meta,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(
                    errnum,
                    format!("Problem stat()ing backup directory {}: {}", dest.display(), e),
                );
                return false;
            }
        };

        if !meta.is_dir() {
            self.backup_error(
                rustix::io::Errno::INVAL.raw_os_error(),
                format!("Backup destination {} is not a directory", dest.display()),
            );
            return false;
        }

        let entries = match std::fs::read_dir(dest) {
            Ok(entries) => entries,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(
                    errnum,
                    format!("Problem opening backup directory {}: {}", dest.display(), e),
                );
                return false;
            }
        };

        for entry in entries {
            match entry {
                Ok(_) => {
                    self.backup_error(
                        rustix::io::Errno::INVAL.raw_os_error(),
                        format!("Backup directory {} is not empty", dest.display()),
                    );
                    return false;
                }
                Err(e) => {
                    let errnum = e.raw_os_error().unwrap_or(-1);
                    self.backup_error(
                        errnum,
                        format!(
                            "Problem readdir()ing backup directory {}: {}",
                            dest.display(),
                            e
                        ),
                    );
                    return false;
                }
            }
        }

        true
    }

    /// Binds every already-open description under the source prefix
    /// to its destination file, creating it (and its parents) so
    /// capture can mirror from the first enabled instant.
    fn prepare_open_descriptions(&self, session: &Session) -> Result<()> {
        for description in self.map.live_descriptions() {
            let source_name = description.source().name();
            let dest_name = match session.translate(&source_name) {
                Some(dest_name) => dest_name,
                None => continue,
            };

            description.prepare_for_backup(dest_name.clone());
            ensure_parent_dirs(&dest_name)?;
            description.create_dest()?;
        }

        Ok(())
    }

    ///////////////////////////////////////////////////////////////////
    // Capture gate and error model.

    fn enable_capture(&self) {
        self.capture_enabled.store(true, Ordering::Relaxed);
    }

    fn disable_capture(&self) {
        self.capture_enabled.store(false, Ordering::Relaxed);
    }

    pub fn capture_is_enabled(&self) -> bool {
        self.capture_enabled.load(Ordering::Relaxed)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Latches the first backup error of the run, disables capture,
    /// and winds down the copier.  The application's own operations
    /// are unaffected.
    pub(crate) fn backup_error(&self, errnum: i32, message: String) {
        self.disable_capture();
        self.abort_copy.store(true, Ordering::Relaxed);

        let mut latch = self.error.lock().unwrap();
        if !latch.happened {
            tracing::error!(errnum, message=%message, "backup error latched");
            latch.happened = true;
            latch.errnum = errnum;
            latch.message = message;
        }
    }

    /// A broken internal invariant: latch the error and kill the
    /// engine.  Every subsequent `do_backup` fails immediately.
    pub fn fatal_error(&self, errnum: i32, message: String) {
        self.dead.store(true, Ordering::SeqCst);
        self.backup_error(errnum, message);
    }

    ///////////////////////////////////////////////////////////////////
    // Throttle plumbing.

    pub fn set_throttle(&self, bytes_per_second: u64) {
        self.throttle.store(bytes_per_second, Ordering::Relaxed);
    }

    pub fn get_throttle(&self) -> u64 {
        self.throttle.load(Ordering::Relaxed)
    }

    ///////////////////////////////////////////////////////////////////
    // Intercepted operations.  The shim calls these around (or in
    // place of) the real syscalls; application-visible results come
    // straight from the source side.

    /// Notification that the application opened an existing file.
    /// Binds the fd to its source file and, under a live session,
    /// opens the destination twin.
    pub fn open(&self, fd: RawFd, path: &Path) -> Result<()> {
        self.register_open(fd, path, false)
    }

    /// Notification that the application created a file.
    pub fn create(&self, fd: RawFd, path: &Path) -> Result<()> {
        self.register_open(fd, path, true)
    }

    fn register_open(&self, fd: RawFd, path: &Path, created: bool) -> Result<()> {
        // A recycled fd means we missed the close; drop the stale
        // binding first.
        if self.map.get(fd).is_some() {
            self.close(fd);
        }

        let canonical = std::fs::canonicalize(path)
            .map_err(|e| chain_error!(e, "failed to canonicalize opened path", ?path))?;

        let source = self.table.get_or_create(&canonical);
        let description = Arc::new(Description::new(source));
        self.map.put(fd, Arc::clone(&description));

        let slot = self.session.read().unwrap();
        if let Some(session) = &*slot {
            let name = description.source().name();
            if let Some(dest_name) = session.translate(&name) {
                description.prepare_for_backup(dest_name.clone());

                let opened = ensure_parent_dirs(&dest_name).and_then(|()| {
                    if created {
                        description.create_dest()
                    } else {
                        description.open_dest()
                    }
                });
                if let Err(e) = opened {
                    let errnum = e.errnum;
                    self.backup_error(
                        errnum,
                        format!("Could not open backup file {}", dest_name.display()),
                    );
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Notification that the application is closing `fd`.  The engine
    /// never closes the application's handle; it only drops its own
    /// destination handle and bookkeeping.
    pub fn close(&self, fd: RawFd) {
        if let Some(description) = self.map.erase(fd) {
            let source = Arc::clone(description.source());
            drop(description);
            if source.release() == 0 {
                self.table.try_to_remove(&source);
            }
        }
    }

    /// The read itself has no destination effect; it only moves the
    /// recorded offset in step with the kernel's.
    pub fn read(&self, fd: RawFd, buf: &mut [u8]) -> rustix::io::Result<usize> {
        let description = match self.map.get(fd) {
            Some(description) => description,
            None => return fd_ops::real_read(fd, buf),
        };

        let mut state = description.lock();
        let result = fd_ops::real_read(fd, buf);
        if let Ok(n) = result {
            state.increment_offset(n as u64);
        }
        result
    }

    /// Performs the real write under the description lock (the offset
    /// names the affected range) and the source file's range lock
    /// (the write + mirror pair must be atomic against overlapping
    /// writers).
    pub fn write(&self, fd: RawFd, buf: &[u8]) -> rustix::io::Result<usize> {
        let description = match self.map.get(fd) {
            Some(description) => description,
            None => return fd_ops::real_write(fd, buf),
        };
        let source = Arc::clone(description.source());

        let mut state = description.lock();
        let offset = state.offset;
        let range = source.lock_range(offset, offset + buf.len() as u64);

        let result = fd_ops::real_write(fd, buf);
        if let Ok(n) = result {
            state.increment_offset(n as u64);
        }
        // The offset is settled; stop blocking other operations on
        // this description while we mirror.
        drop(state);

        if let Ok(n) = result {
            if n > 0 && self.capture_is_enabled() {
                if let Err(e) = description.pwrite(&buf[..n], offset) {
                    self.backup_error(e.errnum, "Failed to mirror write to backup".to_string());
                }
            }
        }

        drop(range);
        result
    }

    /// Positional write: same locking as `write`, but the offset
    /// comes from the caller and the description offset is untouched.
    pub fn pwrite(&self, fd: RawFd, buf: &[u8], offset: u64) -> rustix::io::Result<usize> {
        let description = match self.map.get(fd) {
            Some(description) => description,
            None => return fd_ops::real_pwrite(fd, buf, offset),
        };
        let source = Arc::clone(description.source());

        let range = source.lock_range(offset, offset + buf.len() as u64);
        let result = fd_ops::real_pwrite(fd, buf, offset);

        if let Ok(n) = result {
            if n > 0 && self.capture_is_enabled() {
                if let Err(e) = description.pwrite(&buf[..n], offset) {
                    self.backup_error(e.errnum, "Failed to mirror pwrite to backup".to_string());
                }
            }
        }

        drop(range);
        result
    }

    /// Performs the real lseek and records the resulting offset.
    pub fn lseek(&self, fd: RawFd, pos: SeekFrom) -> rustix::io::Result<u64> {
        let description = match self.map.get(fd) {
            Some(description) => description,
            None => return fd_ops::real_lseek(fd, pos),
        };

        let mut state = description.lock();
        let result = fd_ops::real_lseek(fd, pos);
        if let Ok(new_offset) = result {
            state.lseek(new_offset);
        }
        result
    }

    /// Truncation affects every byte past `length`, so it locks
    /// `[length, RANGE_MAX)` around the real call and the mirror.
    pub fn ftruncate(&self, fd: RawFd, length: u64) -> rustix::io::Result<()> {
        let description = match self.map.get(fd) {
            Some(description) => description,
            None => return fd_ops::real_ftruncate(fd, length),
        };
        let source = Arc::clone(description.source());

        let range = source.lock_range(length, RANGE_MAX);
        let result = fd_ops::real_ftruncate(fd, length);

        if result.is_ok() && self.capture_is_enabled() {
            if let Err(e) = description.truncate(length) {
                self.backup_error(e.errnum, "Failed to truncate backup file".to_string());
            }
        }

        drop(range);
        result
    }

    /// Path-level truncate.  The source file is looked up by the
    /// source's canonical path; the destination truncate goes through
    /// the translated path, since no description need be open.
    pub fn truncate(&self, path: &Path, length: u64) -> rustix::io::Result<()> {
        let canonical = match std::fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(
                    errnum,
                    format!("Failed to truncate backup file {}", path.display()),
                );
                return fd_ops::real_truncate(path, length);
            }
        };

        let slot = self.session.read().unwrap();
        let session = match &*slot {
            Some(session) if session.is_prefix(&canonical) => session,
            _ => return fd_ops::real_truncate(path, length),
        };

        let file = self.table.get_or_create(&canonical);
        let range = file.lock_range(length, RANGE_MAX);

        let result = fd_ops::real_truncate(&canonical, length);
        if result.is_ok() && self.capture_is_enabled() {
            if let Some(dest) = session.translate(&canonical) {
                if let Err(e) = truncate_dest(&dest, length) {
                    let errnum = e.raw_os_error().unwrap_or(-1);
                    self.backup_error(
                        errnum,
                        format!("Could not truncate backup file {}", dest.display()),
                    );
                }
            }
        }

        drop(range);
        if file.release() == 0 {
            self.table.try_to_remove(&file);
        }
        result
    }

    /// Rename relocates the table entry first (so lookups under the
    /// rename lock always see one consistent name), then performs the
    /// source rename, then moves the destination twin.  A missing
    /// destination means the copier has not produced the file yet;
    /// queueing the new name guarantees the walk will.
    pub fn rename(&self, old: &Path, new: &Path) -> rustix::io::Result<()> {
        let full_old = match std::fs::canonicalize(old) {
            Ok(canonical) => canonical,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(errnum, format!("Could not rename {}", old.display()));
                return fd_ops::real_rename(old, new);
            }
        };
        let full_new = match canonicalize_for_create(new) {
            Ok(canonical) => canonical,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(errnum, format!("Could not rename to {}", new.display()));
                return fd_ops::real_rename(old, new);
            }
        };

        self.table.rename(&full_old, &full_new);

        let slot = self.session.read().unwrap();
        let session = match &*slot {
            Some(session)
                if self.capture_is_enabled()
                    && session.is_prefix(&full_old)
                    && session.is_prefix(&full_new) =>
            {
                session
            }
            _ => return fd_ops::real_rename(old, new),
        };

        let result = fd_ops::real_rename(old, new);
        if result.is_ok() {
            let dest_old = session.translate(&full_old).expect("old path is in prefix");
            let dest_new = session.translate(&full_new).expect("new path is in prefix");

            match std::fs::rename(&dest_old, &dest_new) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // Not copied yet; the old name may still sit in
                    // the todo list and will vanish as ENOENT.  Queue
                    // the new name so the walk produces it.
                    if let Ok(relative) = full_new.strip_prefix(session.source()) {
                        session.push_todo(relative.to_path_buf());
                    }
                }
                Err(e) => {
                    let errnum = e.raw_os_error().unwrap_or(-1);
                    self.backup_error(errnum, "rename() on backup copy failed".to_string());
                }
            }
        }

        result
    }

    /// Unlink removes the source file and, under capture, its
    /// destination twin.  The table stays locked across the compound
    /// operation so neither the copier nor a rename can resurrect the
    /// entry mid-removal.
    pub fn unlink(&self, path: &Path) -> rustix::io::Result<()> {
        let canonical = match std::fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(errnum, format!("Could not unlink {}", path.display()));
                return fd_ops::real_unlink(path);
            }
        };

        let slot = self.session.read().unwrap();
        let mut files = self.table.guard();
        let file = files.get(&canonical).cloned();

        let result = fd_ops::real_unlink(path);

        if result.is_ok() && self.capture_is_enabled() {
            if let Some(session) = &*slot {
                if let Some(dest) = session.translate(&canonical) {
                    match std::fs::remove_file(&dest) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            let errnum = e.raw_os_error().unwrap_or(-1);
                            self.backup_error(
                                errnum,
                                format!("Could not unlink backup copy {}", dest.display()),
                            );
                        }
                    }
                }
            }
        }

        if result.is_ok() {
            if let Some(file) = file {
                file.mark_unlinked();
                if file.ref_count() == 0 {
                    files.remove(&file.name());
                }
            }
        }

        result
    }

    /// Notification that the application created a directory; mirror
    /// it into the destination tree.
    pub fn mkdir(&self, path: &Path) -> Result<()> {
        let slot = self.session.read().unwrap();
        let session = match &*slot {
            Some(session) => session,
            None => return Ok(()),
        };

        let canonical = std::fs::canonicalize(path)
            .map_err(|e| chain_error!(e, "failed to canonicalize created directory", ?path))?;
        let dest = match session.translate(&canonical) {
            Some(dest) => dest,
            None => return Ok(()),
        };

        match std::fs::create_dir(&dest) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                self.backup_error(errnum, format!("failed mkdir creating {}", dest.display()));
                Err(chain_error!(e, "failed to mirror mkdir", ?dest))
            }
        }
    }

    ///////////////////////////////////////////////////////////////////
    // Glass-box gates (tests only).

    /// Blocks the copier launch until `set_start_copying(true)`.
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_start_copying(&self, start_copying: bool) {
        self.gates
            .start_copying
            .store(start_copying, Ordering::SeqCst);
    }

    /// Keeps capture enabled after the copier finishes until cleared,
    /// so tests can exercise the capture window deterministically.
    #[cfg(any(test, feature = "test-support"))]
    pub fn set_keep_capturing(&self, keep_capturing: bool) {
        self.gates
            .keep_capturing
            .store(keep_capturing, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn is_capturing(&self) -> bool {
        self.gates.is_capturing.load(Ordering::SeqCst)
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn is_done_copying(&self) -> bool {
        self.gates.done_copying.load(Ordering::SeqCst)
    }
}

/// The destination twin of a file may live in a directory the copier
/// has not walked yet.
fn ensure_parent_dirs(dest: &Path) -> Result<()> {
    match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)
            .map_err(|e| chain_error!(e, "failed to create backup directories", ?parent)),
        _ => Ok(()),
    }
}

/// Canonicalizes a path whose final component may not exist yet
/// (rename targets usually don't).
fn canonicalize_for_create(path: &Path) -> std::io::Result<PathBuf> {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return Ok(canonical);
    }

    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    Ok(std::fs::canonicalize(parent)?.join(file_name))
}

/// Path-level destination truncate; the destination file may not be
/// open anywhere.
fn truncate_dest(dest: &Path, length: u64) -> std::io::Result<()> {
    match std::fs::OpenOptions::new().write(true).open(dest) {
        Ok(file) => file.set_len(length),
        // Not copied yet; the walk will seal the truncated contents.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
