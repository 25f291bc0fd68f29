//! Thin wrappers around the syscalls the engine performs on
//! application-owned file descriptors.
//!
//! The interposition shim owns these descriptors; the engine only
//! borrows them for the duration of one intercepted call, the same
//! way the shim side shares a C-owned fd with Rust.  Results carry
//! the raw `Errno` so the application-visible error is exactly the
//! syscall's.

use std::os::unix::io::BorrowedFd;
use std::os::unix::io::RawFd;

pub use rustix::fs::SeekFrom;

/// Borrows `fd` for one syscall.
///
/// The shim guarantees the descriptor stays open for the duration of
/// the intercepted call that handed it to us.
#[inline]
fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    unsafe { BorrowedFd::borrow_raw(fd) }
}

#[inline]
pub(crate) fn real_read(fd: RawFd, buf: &mut [u8]) -> rustix::io::Result<usize> {
    rustix::io::read(borrow(fd), buf)
}

#[inline]
pub(crate) fn real_write(fd: RawFd, buf: &[u8]) -> rustix::io::Result<usize> {
    rustix::io::write(borrow(fd), buf)
}

#[inline]
pub(crate) fn real_pwrite(fd: RawFd, buf: &[u8], offset: u64) -> rustix::io::Result<usize> {
    rustix::io::pwrite(borrow(fd), buf, offset)
}

#[inline]
pub(crate) fn real_lseek(fd: RawFd, pos: SeekFrom) -> rustix::io::Result<u64> {
    rustix::fs::seek(borrow(fd), pos)
}

#[inline]
pub(crate) fn real_ftruncate(fd: RawFd, length: u64) -> rustix::io::Result<()> {
    rustix::fs::ftruncate(borrow(fd), length)
}

#[inline]
pub(crate) fn real_rename(old: &std::path::Path, new: &std::path::Path) -> rustix::io::Result<()> {
    rustix::fs::rename(old, new)
}

#[inline]
pub(crate) fn real_unlink(path: &std::path::Path) -> rustix::io::Result<()> {
    rustix::fs::unlink(path)
}

/// Path-level truncate.  Opening write-only surfaces the same errno
/// set as truncate(2) for the cases we care about (ENOENT, EACCES,
/// EISDIR).
pub(crate) fn real_truncate(path: &std::path::Path, length: u64) -> rustix::io::Result<()> {
    use rustix::fs::Mode;
    use rustix::fs::OFlags;

    let fd = rustix::fs::open(path, OFlags::WRONLY, Mode::empty())?;
    rustix::fs::ftruncate(&fd, length)
}
