//! The copier module implements a thread that is responsible for
//! walking a session's source tree and producing the destination
//! mirror, throttled to the callbacks' byte rate.  Live mutations to
//! already-walked files are the capture layer's job; the copier only
//! has to guarantee that every regular file present at walk time gets
//! sealed into the destination.

use std::fs::File;
use std::fs::OpenOptions;
use std::io::Read;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::config::EngineConfig;
use crate::session::Session;

/// Mirrored regular files are created private to the invoking user.
const DEST_FILE_MODE: u32 = 0o700;

/// Why a walk stopped early.  Aborts come from the callbacks' `poll`;
/// failures carry the errno of the operation that sank the copy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CopyInterrupt {
    Aborted(i32),
    Failed(i32),
}

type CopyResult = Result<(), CopyInterrupt>;

/// A `Copier` is only a message-passing handle to a background worker
/// thread.
///
/// When all the underlying `Sender` have been dropped, the thread
/// will be notified and commence shutdown.
#[derive(Clone, Debug)]
pub(crate) struct Copier {
    jobs: crossbeam_channel::Sender<CopyJob>,
}

struct CopyJob {
    session: Session,
    config: EngineConfig,
    // Set by the engine when a capture-side error sinks the run; the
    // walk winds down quietly, the error is already latched.
    engine_abort: Arc<AtomicBool>,
    done: crossbeam_channel::Sender<CopyResult>,
}

impl Copier {
    /// Returns a handle for a fresh copier worker.
    pub fn new() -> Copier {
        let (sender, receiver) = crossbeam_channel::bounded::<CopyJob>(1);
        std::thread::spawn(move || handle_jobs(receiver));

        Copier { jobs: sender }
    }

    /// Runs one full tree walk for `session` and blocks until it
    /// finishes.
    pub fn run(
        &self,
        session: Session,
        config: EngineConfig,
        engine_abort: Arc<AtomicBool>,
    ) -> CopyResult {
        let (done, finished) = crossbeam_channel::bounded(1);
        let job = CopyJob {
            session,
            config,
            engine_abort,
            done,
        };

        if self.jobs.send(job).is_err() {
            // The worker died; nothing was copied.
            return Err(CopyInterrupt::Failed(-1));
        }

        finished.recv().unwrap_or(Err(CopyInterrupt::Failed(-1)))
    }
}

fn handle_jobs(receiver: crossbeam_channel::Receiver<CopyJob>) {
    while let Ok(job) = receiver.recv() {
        let result = walk_tree(&job.session, &job.config, &job.engine_abort);
        let _ = job.done.send(result);
    }
}

/// Drives the depth-first walk.  The todo list lives in the session
/// because the capture layer's rename handler may queue paths the
/// walk has not produced yet.
fn walk_tree(session: &Session, config: &EngineConfig, engine_abort: &AtomicBool) -> CopyResult {
    session.push_todo(PathBuf::from("."));

    let calls = session.calls().clone();
    let mut n_done: usize = 0;

    while let Some((relative, n_known)) = session.pop_todo() {
        if session.is_aborted() || engine_abort.load(Ordering::Relaxed) {
            // Whatever sank the run has already been latched.
            return Ok(());
        }

        let message = format!(
            "Copying file number {} of {} seen so far ({})",
            n_done,
            n_known,
            relative.display()
        );
        let fraction = n_done as f64 / (n_done + n_known) as f64;
        let r = calls.poll(fraction, &message);
        if r != 0 {
            return Err(CopyInterrupt::Aborted(r));
        }

        copy_entry(session, config, &relative)?;
        n_done += 1;
    }

    Ok(())
}

/// Copies one relative path: directories are created and expanded
/// into the todo list, regular files are copied, symlinks are skipped
/// with a warning, anything else is ignored.
fn copy_entry(session: &Session, config: &EngineConfig, relative: &Path) -> CopyResult {
    let calls = session.calls();
    let (source, dest) = if relative == Path::new(".") {
        (session.source().to_path_buf(), session.dest().to_path_buf())
    } else {
        (
            session.source().join(relative),
            session.dest().join(relative),
        )
    };

    // lstat: symbolic links must be seen as links, not their targets.
    let meta = match std::fs::symlink_metadata(&source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Deleted (or renamed away) since it was queued.
            return Ok(());
        }
        Err(e) => {
            let errnum = e.raw_os_error().unwrap_or(-1);
            calls.report_error(
                errnum,
                &format!("error stat(\"{}\"): {}", source.display(), e),
            );
            return Ok(());
        }
    };

    let file_type = meta.file_type();
    if file_type.is_dir() {
        copy_directory(session, &source, &dest, relative)
    } else if file_type.is_file() {
        copy_regular_file(session, config, &source, &dest)
    } else if file_type.is_symlink() {
        tracing::warn!(path=%source.display(), "symbolic link found, but not copied");
        Ok(())
    } else {
        // Devices, sockets, fifos: not our problem.
        Ok(())
    }
}

fn copy_directory(session: &Session, source: &Path, dest: &Path, relative: &Path) -> CopyResult {
    let calls = session.calls();

    if let Err(e) = std::fs::create_dir(dest) {
        if e.kind() != std::io::ErrorKind::AlreadyExists {
            let errnum = e.raw_os_error().unwrap_or(-1);
            calls.report_error(
                errnum,
                &format!("error mkdir(\"{}\"): {}", dest.display(), e),
            );
            return Err(CopyInterrupt::Failed(errnum));
        }
    }

    let entries = match std::fs::read_dir(source) {
        Ok(entries) => entries,
        Err(e) => {
            let errnum = e.raw_os_error().unwrap_or(-1);
            calls.report_error(
                errnum,
                &format!("error opendir(\"{}\"): {}", source.display(), e),
            );
            return Err(CopyInterrupt::Failed(errnum));
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                calls.report_error(
                    errnum,
                    &format!("error readdir(\"{}\"): {}", source.display(), e),
                );
                return Err(CopyInterrupt::Failed(errnum));
            }
        };

        let name = entry.file_name();
        if name == "." || name == ".." {
            continue;
        }

        if relative == Path::new(".") {
            session.push_todo(PathBuf::from(&name));
        } else {
            session.push_todo(relative.join(&name));
        }
    }

    Ok(())
}

fn copy_regular_file(
    session: &Session,
    config: &EngineConfig,
    source: &Path,
    dest: &Path,
) -> CopyResult {
    let calls = session.calls();

    let mut src = match File::open(source) {
        Ok(src) => src,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Unlinked after the walk queued it; the backup simply
            // does not contain it.
            return Ok(());
        }
        Err(e) => {
            let errnum = e.raw_os_error().unwrap_or(-1);
            calls.report_error(
                errnum,
                &format!("error opening \"{}\": {}", source.display(), e),
            );
            return Ok(());
        }
    };

    let mut dst = match open_dest_for_copy(dest) {
        Ok(dst) => dst,
        Err(e) => {
            let errnum = e.raw_os_error().unwrap_or(-1);
            calls.report_error(
                errnum,
                &format!("error creating backup copy \"{}\": {}", dest.display(), e),
            );
            return Err(CopyInterrupt::Failed(errnum));
        }
    };

    copy_file_data(session, config, &mut src, &mut dst, source, dest)
}

fn open_dest_for_copy(dest: &Path) -> std::io::Result<File> {
    match OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(DEST_FILE_MODE)
        .open(dest)
    {
        Ok(dst) => Ok(dst),
        // Capture may have created the file already (the open was
        // intercepted after capture came up); just reopen it.
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            OpenOptions::new().write(true).open(dest)
        }
        Err(e) => Err(e),
    }
}

/// The bulk loop: read to EOF, write fully, and between iterations
/// sleep off any throttle debt in increments short enough that
/// progress polling still happens about once per second.
fn copy_file_data(
    session: &Session,
    config: &EngineConfig,
    src: &mut File,
    dst: &mut File,
    source_path: &Path,
    dest_path: &Path,
) -> CopyResult {
    let calls = session.calls();
    let source_size = src.metadata().map(|m| m.len()).unwrap_or(0);
    let mut buf = vec![0u8; config.copy_buffer_size];
    let mut total_written: u64 = 0;
    let start = Instant::now();

    loop {
        let n_read = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let errnum = e.raw_os_error().unwrap_or(-1);
                calls.report_error(
                    errnum,
                    &format!("error reading \"{}\": {}", source_path.display(), e),
                );
                return Err(CopyInterrupt::Failed(errnum));
            }
        };

        let mut written_this_buf = 0usize;
        while written_this_buf < n_read {
            let message = format!(
                "Copying file: {}/{} bytes done of {} to {}.",
                total_written,
                source_size,
                source_path.display(),
                dest_path.display()
            );
            let r = calls.poll(0.0, &message);
            if r != 0 {
                return Err(CopyInterrupt::Aborted(r));
            }

            match dst.write(&buf[written_this_buf..n_read]) {
                Ok(n) => {
                    written_this_buf += n;
                    total_written += n as u64;
                }
                Err(e) => {
                    let errnum = e.raw_os_error().unwrap_or(-1);
                    calls.report_error(
                        errnum,
                        &format!("error writing to \"{}\": {}", dest_path.display(), e),
                    );
                    return Err(CopyInterrupt::Failed(errnum));
                }
            }
        }

        throttle(
            session,
            config,
            total_written,
            source_size,
            source_path,
            dest_path,
            start,
        )?;
    }

    Ok(())
}

/// Sleeps until the bytes written so far fit the budgeted rate,
/// re-polling at least once per poll interval so aborts land quickly.
fn throttle(
    session: &Session,
    config: &EngineConfig,
    total_written: u64,
    source_size: u64,
    source_path: &Path,
    dest_path: &Path,
    start: Instant,
) -> CopyResult {
    let calls = session.calls();

    loop {
        let throttle = calls.get_throttle();
        if throttle == u64::MAX || throttle == 0 {
            return Ok(());
        }

        let actual_time = start.elapsed().as_secs_f64();
        let budgeted_time = total_written as f64 / throttle as f64;
        if budgeted_time <= actual_time {
            return Ok(());
        }

        let sleep_time = budgeted_time - actual_time;
        let message = format!(
            "Backup throttled: copied {}/{} bytes of {} to {}. Sleeping {:.2}s for throttling.",
            total_written,
            source_size,
            source_path.display(),
            dest_path.display(),
            sleep_time
        );
        let r = calls.poll(0.0, &message);
        if r != 0 {
            return Err(CopyInterrupt::Aborted(r));
        }

        let max_slice = config.poll_interval().as_secs_f64();
        std::thread::sleep(std::time::Duration::from_secs_f64(sleep_time.min(max_slice)));
    }
}
