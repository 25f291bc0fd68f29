//! Calque is a hot backup engine: while an application keeps reading
//! and writing files under a source directory, the engine produces a
//! consistent point-in-time copy of that tree in an empty destination
//! directory.
//!
//! Three activities run concurrently: the application workload, whose
//! filesystem operations enter through the [`Manager`]'s intercepted
//! methods; a background copier walking the source tree; and a
//! capture layer that mirrors live mutations into the destination.
//! Per-file byte-range locks serialize the (source write, destination
//! mirror) pair against overlapping writers, so the destination
//! observes overlapping writes in the same byte-serial order as the
//! source.
//!
//! The syscall interception shim itself is not part of this crate: it
//! owns one [`Manager`] value, calls the matching method for each
//! intercepted operation, and drives backups through
//! [`Manager::do_backup`] with a [`BackupCallbacks`] implementation
//! for progress polling, error reporting, and throttling.

mod callbacks;
mod config;
mod copier;
mod description;
mod fd_ops;
mod file_map;
mod manager;
pub mod result;
mod session;
mod source_file;
mod source_file_table;

pub use callbacks::BackupCallbacks;
pub use callbacks::QuietCallbacks;
pub use config::EngineConfig;
pub use fd_ops::SeekFrom;
pub use manager::Manager;
pub use result::Error;
pub use result::Result;
