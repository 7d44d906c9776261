//! Error type shared by every tty operation.
//!
//! Platform failures keep the raw OS code (`errno` on POSIX, `GetLastError`
//! on Windows) so callers can report platform-specific diagnostics.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TtyError {
    /// Another [`Tty`](crate::Tty) already owns the process-wide terminal binding.
    #[error("Another tty is already bound to this process")]
    AlreadyBound,

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, TtyError>;

impl TtyError {
    pub(crate) fn os(op: &'static str, source: io::Error) -> Self {
        TtyError::Os { op, source }
    }

    /// Capture `errno` / `GetLastError` for the call that just failed.
    pub(crate) fn last_os(op: &'static str) -> Self {
        Self::os(op, io::Error::last_os_error())
    }

    pub(crate) fn from_code(op: &'static str, code: i32) -> Self {
        Self::os(op, io::Error::from_raw_os_error(code))
    }

    /// Convert an error from the `windows` crate back into the Win32 code it wraps.
    #[cfg(windows)]
    pub(crate) fn win32(op: &'static str, error: windows::core::Error) -> Self {
        Self::from_code(op, win32_code(error.code().0))
    }

    /// The raw platform error code, if this error came from the OS.
    pub fn code(&self) -> Option<u32> {
        match self {
            TtyError::AlreadyBound => None,
            TtyError::Os { source, .. } => source.raw_os_error().map(|code| code as u32),
        }
    }

    /// The name of the platform call that failed.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            TtyError::AlreadyBound => None,
            TtyError::Os { op, .. } => Some(op),
        }
    }
}

/// `HRESULT_FROM_WIN32` wraps a Win32 code as `0x8007xxxx`; undo that so the
/// verbatim `GetLastError` value is reported.
#[cfg_attr(not(windows), allow(dead_code))]
fn win32_code(hresult: i32) -> i32 {
    let bits = hresult as u32;
    if bits & 0xFFFF_0000 == 0x8007_0000 {
        (bits & 0xFFFF) as i32
    } else {
        hresult
    }
}
