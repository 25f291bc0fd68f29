//! The engine reports progress and failures through a caller-supplied
//! `BackupCallbacks` collaborator, and reads the copy throttle from
//! it.  The interposition shim typically adapts these to C function
//! pointers; tests implement the trait directly.

/// Progress polling, error reporting, and throttling for one backup
/// run.
///
/// Implementations must be safe to call from the copier worker thread
/// and from any application thread that trips the capture layer.
pub trait BackupCallbacks: Send + Sync {
    /// Reports progress.  `fraction` is in `[0, 1]` and deliberately
    /// coarse; `message` is human-readable.
    ///
    /// A nonzero return value aborts the backup with that code.
    fn poll(&self, fraction: f64, message: &str) -> i32;

    /// Reports an error.  Fire-and-forget: the engine keeps running
    /// (or not) regardless of what the callee does with the report.
    fn report_error(&self, errnum: i32, message: &str);

    /// Returns the copier's bulk-throughput cap in bytes per second.
    /// `u64::MAX` means unthrottled.  Re-read between copy iterations,
    /// so the cap may change mid-run.
    fn get_throttle(&self) -> u64;
}

/// Callbacks that accept everything and never throttle.  Useful as a
/// base for tests and for callers that only want the destination
/// tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct QuietCallbacks;

impl BackupCallbacks for QuietCallbacks {
    fn poll(&self, _fraction: f64, _message: &str) -> i32 {
        0
    }

    fn report_error(&self, errnum: i32, message: &str) {
        tracing::error!(errnum, message, "backup error reported");
    }

    fn get_throttle(&self) -> u64 {
        u64::MAX
    }
}
