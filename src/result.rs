//! Calque uses `Result`s with a simple error type, and relies on
//! tracing / logging to track information about provenance and to map
//! low-level errors to higher-level operations.
//!
//! Every `Error` carries the numeric OS error at the root of its
//! chain, because the backup entry point ultimately reports failures
//! to its caller as an errno-style code.
pub use tracing::Level;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Emit a backtrace whenever we capture an error at least as severe
/// as BACKTRACE_SEVERITY.
const BACKTRACE_SEVERITY: Level = Level::ERROR;

/// An `Error` is a lightweight struct that relies on the `tracing`
/// crate to stitch up context together after an error.
///
/// `errnum` is the OS error code at the root of the chain, or `-1`
/// when the failure did not come from a syscall.
#[derive(Debug)]
pub struct Error {
    // The uuid for the initial ("root") error.
    initial_id: Uuid,
    pub errnum: i32,
    pub message: &'static str,
}

impl Error {
    /// Creates a new `Error` struct; this constructor should only
    /// be called via the macros.
    #[allow(dead_code)]
    #[inline(always)]
    pub fn new(initial_id: Uuid, errnum: i32, message: &'static str) -> Self {
        Error {
            initial_id,
            errnum,
            message,
        }
    }

    /// Converts `self` to a `std::io::Error`.
    #[allow(dead_code)]
    pub fn to_io(&self) -> std::io::Error {
        if self.errnum > 0 {
            std::io::Error::from_raw_os_error(self.errnum)
        } else {
            std::io::Error::new(std::io::ErrorKind::Other, self.message)
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{:?}", self)
    }
}

/// Only exported for macro use.
///
/// Computes a backtrace if `level` is severe enough.
#[inline(always)]
pub fn __maybe_compute_backtrace(level: Level) -> Option<backtrace::Backtrace> {
    if level > BACKTRACE_SEVERITY {
        return None;
    }

    Some(backtrace::Backtrace::new())
}

/// Only exported for macro use.
///
/// Extracts the OS error code buried in `x`, if there is one.
#[inline(always)]
pub fn __extract_errnum<T: std::any::Any>(x: &T) -> i32 {
    use std::any::Any;

    let any = x as &dyn Any;
    if let Some(as_error) = any.downcast_ref::<Error>() {
        return as_error.errnum;
    }

    if let Some(as_io) = any.downcast_ref::<std::io::Error>() {
        return as_io.raw_os_error().unwrap_or(-1);
    }

    if let Some(as_errno) = any.downcast_ref::<rustix::io::Errno>() {
        return as_errno.raw_os_error();
    }

    -1
}

/// Only exported for macro use.
///
/// If `T == Error`, returns `x`'s `initial_id`, errnum, and `(None, None)`.
/// Otherwise, returns a fresh uuid, the extracted error code, `x`, and
/// potentially a backtrace.
#[inline(always)]
pub fn __extract_cause_info<T: std::any::Any>(
    x: T,
    level: Level,
) -> (Uuid, i32, Option<T>, Option<backtrace::Backtrace>) {
    use std::any::Any;

    let errnum = __extract_errnum(&x);
    match (&x as &dyn Any).downcast_ref::<Error>() {
        Some(as_error) => (as_error.initial_id, errnum, None, None),
        None => (
            Uuid::new_v4(),
            errnum,
            Some(x),
            __maybe_compute_backtrace(level),
        ),
    }
}

/// If `value` evaluates to `Err`, matches the error payload against
/// the patterns, evaluates the corresponding handling expression, and
/// drops the result.
#[macro_export]
macro_rules! drop_result {
    ($value:expr, $($($pattern:pat_param)|+ $(if $guard:expr)? => $handler:expr),+) => {
        if let Err(name) = $value {
            match name {
                $($($pattern)|+ $(if $guard)? => { let _ = $handler; }),+
            }
        }
    };
}

/// Returns a fresh `Error` struct with error code `errnum`, after
/// tracing it at level `level`, with `message` and additional fields
/// passed as a `tracing::event`.
#[macro_export]
macro_rules! fresh {
    ($level:expr, $errnum:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let errnum: i32 = $errnum;
        let message = $message;
        let ret = $crate::result::Error::new(root_id, errnum, message);

        tracing::event!(LEVEL, %root_id, errnum, ?bt, $message);
        ret
    }};
    ($level:expr, $errnum:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let errnum: i32 = $errnum;
        let message = $message;
        let ret = $crate::result::Error::new(root_id, errnum, message);

        tracing::event!(LEVEL, $($fields)+, %root_id, errnum, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! fresh_error {
    ($($errnum_message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::ERROR, $($errnum_message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_warn {
    ($($errnum_message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::WARN, $($errnum_message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_info {
    ($($errnum_message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::INFO, $($errnum_message_and_fields)+) };
}

/// Returns an `Error` struct derived from `initial`, after tracing it
/// at level `level`, with `message` and additional fields passed as a
/// `tracing::event`.  The root error code travels with the chain.
#[macro_export]
macro_rules! chain {
    ($initial:expr, $level:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, errnum, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, errnum, message);

        tracing::event!(LEVEL, %root_id, errnum, ?cause, ?bt, $message);
        ret
    }};
    ($initial:expr, $level:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, errnum, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, errnum, message);

        tracing::event!(LEVEL, $($fields)+, %root_id, errnum, ?cause, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! chain_error {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_warn {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::WARN, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_info {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::INFO, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_debug {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::DEBUG, $($message_and_fields)+) };
}

/// Logs and creates a fresh `Error` struct from the last OS error.
#[macro_export]
macro_rules! from_os {
    ($level:expr, $($message_and_fields:tt)+) => {
        $crate::chain!(std::io::Error::last_os_error(), $level, $($message_and_fields)+)
    };
}

#[macro_export]
macro_rules! error_from_os {
    ($($message_and_fields:tt)+) => { $crate::from_os!(tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! warn_from_os {
    ($($message_and_fields:tt)+) => { $crate::from_os!(tracing::Level::WARN, $($message_and_fields)+) };
}

/// Creates a fresh `Error` struct from the `std::io::Error` `error`,
/// and logs it at a dynamic level: if the error's kind matches
/// the pattern, the level is `benign_level`, otherwise it's `ERROR`.
#[macro_export]
macro_rules! filtered_io_error {
    ($error:expr, $($benign_kind:pat_param)|+ $(if $guard:expr)? => $benign_level:expr, $($message_and_fields:tt)+) => {{
        let err = $error;
        match err.kind() {
            $($benign_kind)|+ $(if $guard)? => $crate::chain!(err, $benign_level, $($message_and_fields)+),
            _ => $crate::chain!(err, tracing::Level::ERROR, $($message_and_fields)+),
        }
    }};
}

#[test]
fn test_errnum_extraction() {
    let io = std::io::Error::from_raw_os_error(rustix::io::Errno::NOENT.raw_os_error());
    assert_eq!(
        __extract_errnum(&io),
        rustix::io::Errno::NOENT.raw_os_error()
    );

    assert_eq!(
        __extract_errnum(&rustix::io::Errno::BUSY),
        rustix::io::Errno::BUSY.raw_os_error()
    );

    let opaque = std::io::Error::new(std::io::ErrorKind::Other, "no os code");
    assert_eq!(__extract_errnum(&opaque), -1);

    let chained = Error::new(Uuid::new_v4(), 17, "probe");
    assert_eq!(__extract_errnum(&chained), 17);
}

#[test]
fn test_chain_preserves_root_code() {
    let io = std::io::Error::from_raw_os_error(rustix::io::Errno::EXIST.raw_os_error());
    let first = chain_warn!(io, "destination already present");
    assert_eq!(first.errnum, rustix::io::Errno::EXIST.raw_os_error());

    let second = chain_error!(first, "copy failed");
    assert_eq!(second.errnum, rustix::io::Errno::EXIST.raw_os_error());
}
