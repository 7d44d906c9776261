//! Cross-thread wake-up for a blocked read.
//!
//! POSIX uses a self-pipe whose read end sits in the reader's `poll` set.
//! Windows uses an auto-reset event waited on next to the console handle.
//! Either way a posted wake persists until the next wait consumes it, and
//! several posts before that wait coalesce into one.

use std::fmt;
use std::sync::Arc;

use super::error::{Result, TtyError};

#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

#[cfg(windows)]
use windows::core::PCWSTR;
#[cfg(windows)]
use windows::Win32::Foundation::{CloseHandle, FALSE, HANDLE};
#[cfg(windows)]
use windows::Win32::System::Threading::{CreateEventW, SetEvent};

#[cfg(unix)]
pub(crate) struct InterruptChannel {
    read: OwnedFd,
    write: OwnedFd,
}

#[cfg(unix)]
impl InterruptChannel {
    pub(crate) fn new() -> Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(TtyError::last_os("pipe"));
        }
        // SAFETY: pipe() just created both descriptors and nothing else owns them.
        let (read, write) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        // Neither end may block: the writer may be a signal handler and the
        // reader drains until empty. Dropping on error closes both ends.
        set_nonblocking_cloexec(read.as_raw_fd())?;
        set_nonblocking_cloexec(write.as_raw_fd())?;

        Ok(Self { read, write })
    }

    pub(crate) fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Post a wake. Async-signal-safe: one `write(2)`, no allocation.
    pub(crate) fn signal(&self) -> Result<()> {
        let byte = [b' '];
        loop {
            let written = unsafe { libc::write(self.write.as_raw_fd(), byte.as_ptr().cast(), 1) };
            if written >= 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                // Pipe full: a wake is already pending.
                code if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return Ok(()),
                code => return Err(TtyError::from_code("write", code)),
            }
        }
    }

    /// Consume every pending wake so the next wait blocks again.
    pub(crate) fn drain(&self) -> Result<()> {
        let mut scratch = [0u8; 64];
        loop {
            let count = unsafe {
                libc::read(self.read.as_raw_fd(), scratch.as_mut_ptr().cast(), scratch.len())
            };
            if count > 0 {
                continue;
            }
            if count == 0 {
                return Ok(());
            }
            match errno() {
                libc::EINTR => continue,
                code if code == libc::EAGAIN || code == libc::EWOULDBLOCK => return Ok(()),
                code => return Err(TtyError::from_code("read", code)),
            }
        }
    }

    /// Close both ends, reporting the first failure.
    pub(crate) fn close(self) -> Result<()> {
        let Self { read, write } = self;
        let read = close_fd(read);
        let write = close_fd(write);
        read.and(write)
    }
}

/// Close `fd`, reporting the error `OwnedFd`'s drop would swallow.
#[cfg(unix)]
pub(crate) fn close_fd(fd: OwnedFd) -> Result<()> {
    if unsafe { libc::close(fd.into_raw_fd()) } != 0 {
        return Err(TtyError::last_os("close"));
    }
    Ok(())
}

#[cfg(unix)]
fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            return Err(TtyError::last_os("fcntl"));
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) != 0 {
            return Err(TtyError::last_os("fcntl"));
        }
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(windows)]
pub(crate) struct InterruptChannel {
    event: HANDLE,
}

// SAFETY: event handles may be signalled and waited on from any thread.
#[cfg(windows)]
unsafe impl Send for InterruptChannel {}
#[cfg(windows)]
unsafe impl Sync for InterruptChannel {}

#[cfg(windows)]
impl InterruptChannel {
    pub(crate) fn new() -> Result<Self> {
        // Auto-reset, initially unsignalled.
        let event = unsafe { CreateEventW(None, FALSE, FALSE, PCWSTR::null()) }
            .map_err(|e| TtyError::win32("CreateEventW", e))?;
        Ok(Self { event })
    }

    pub(crate) fn handle(&self) -> HANDLE {
        self.event
    }

    pub(crate) fn signal(&self) -> Result<()> {
        unsafe { SetEvent(self.event) }.map_err(|e| TtyError::win32("SetEvent", e))
    }

    pub(crate) fn close(self) -> Result<()> {
        let event = self.event;
        std::mem::forget(self);
        unsafe { CloseHandle(event) }.map_err(|e| TtyError::win32("CloseHandle", e))
    }
}

#[cfg(windows)]
impl Drop for InterruptChannel {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.event);
        }
    }
}

/// Handle for waking the thread blocked in [`Tty::read`](crate::Tty::read).
///
/// Cheap to clone and usable from any thread. On POSIX it may also be used
/// from a [`TtyCallback`](crate::TtyCallback) running in the `SIGWINCH`
/// handler. The underlying channel stays open while any handle is alive.
#[derive(Clone)]
pub struct Interrupter {
    channel: Arc<InterruptChannel>,
}

impl Interrupter {
    pub(crate) fn new(channel: Arc<InterruptChannel>) -> Self {
        Self { channel }
    }

    /// Make the current or next read return [`ReadOutcome::NoData`](crate::ReadOutcome::NoData).
    pub fn interrupt(&self) -> Result<()> {
        self.channel.signal()
    }
}

impl fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupter").finish_non_exhaustive()
    }
}
