//! Durable sync shim
//!
//! `force`, `close` and the compaction swap must not return before the bytes
//! are on stable storage, and the cheapest call that guarantees this differs
//! per OS. Linux gets fdatasync (fsync minus the metadata flush the log does
//! not need); Apple platforms need F_FULLFSYNC because plain fsync stops at
//! the drive's volatile cache; Windows uses FlushFileBuffers.

use std::fs::File;
use std::io;

/// Flush `file`'s data to persistent storage with the strongest primitive
/// the platform offers. Blocks until the device acknowledges; callers hold
/// the storage lock across it.
pub fn durable_sync(file: &File) -> io::Result<()> {
    sync_impl(file)
}

#[cfg(target_os = "linux")]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd comes from a live File borrow, so it is open.
    if unsafe { libc::fdatasync(file.as_raw_fd()) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd comes from a live File borrow, so it is open.
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_FULLFSYNC) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "windows")]
fn sync_impl(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use winapi::um::fileapi::FlushFileBuffers;
    // SAFETY: the handle comes from a live File borrow, so it is open.
    if unsafe { FlushFileBuffers(file.as_raw_handle() as *mut _) } != 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "windows"
)))]
fn sync_impl(file: &File) -> io::Result<()> {
    file.sync_data()
}
