//! Saving, entering and restoring raw terminal mode.
//!
//! Raw mode per termios(3): input is available byte by byte, echo is off and
//! no special processing happens on input or output. On Windows the console is
//! additionally switched to VT input/output, mouse and window events, and the
//! UTF-8 output code page.

use super::error::{Result, TtyError};

#[cfg(unix)]
use std::mem::MaybeUninit;
#[cfg(unix)]
use std::os::fd::RawFd;

#[cfg(windows)]
use windows::Win32::Foundation::HANDLE;
#[cfg(windows)]
use windows::Win32::System::Console::{
    GetConsoleMode, GetConsoleOutputCP, SetConsoleMode, SetConsoleOutputCP, CONSOLE_MODE,
    DISABLE_NEWLINE_AUTO_RETURN, ENABLE_EXTENDED_FLAGS, ENABLE_LVB_GRID_WORLDWIDE,
    ENABLE_MOUSE_INPUT, ENABLE_PROCESSED_OUTPUT, ENABLE_VIRTUAL_TERMINAL_INPUT,
    ENABLE_VIRTUAL_TERMINAL_PROCESSING, ENABLE_WINDOW_INPUT,
};

/// Snapshot of the terminal configuration from before raw mode.
///
/// [`restore`](Self::restore) reports errors; dropping without it restores
/// best-effort.
#[cfg(unix)]
pub(crate) struct SavedTerminalConfig {
    fd: RawFd,
    saved: Option<libc::termios>,
}

#[cfg(unix)]
impl SavedTerminalConfig {
    pub(crate) fn enter(fd: RawFd) -> Result<Self> {
        let mut saved = MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, saved.as_mut_ptr()) } != 0 {
            return Err(TtyError::last_os("tcgetattr"));
        }
        // SAFETY: tcgetattr succeeded and filled the struct.
        let saved = unsafe { saved.assume_init() };

        let raw = raw_attributes(&saved);
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &raw) } != 0 {
            let err = TtyError::last_os("tcsetattr");
            // tcsetattr may have applied part of the change.
            unsafe {
                libc::tcsetattr(fd, libc::TCSAFLUSH, &saved);
            }
            return Err(err);
        }

        Ok(Self {
            fd,
            saved: Some(saved),
        })
    }

    pub(crate) fn restore(mut self) -> Result<()> {
        match self.saved.take() {
            Some(saved) if unsafe { libc::tcsetattr(self.fd, libc::TCSAFLUSH, &saved) } != 0 => {
                Err(TtyError::last_os("tcsetattr"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
impl Drop for SavedTerminalConfig {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            unsafe {
                libc::tcsetattr(self.fd, libc::TCSAFLUSH, &saved);
            }
        }
    }
}

/// The "Raw mode" flags of termios(3), plus a blocking read of at least one
/// byte with no inter-byte timer.
#[cfg(unix)]
pub(crate) fn raw_attributes(original: &libc::termios) -> libc::termios {
    let mut raw = *original;
    raw.c_iflag &= !(libc::BRKINT
        | libc::ICRNL
        | libc::IGNBRK
        | libc::IGNCR
        | libc::INLCR
        | libc::ISTRIP
        | libc::IXON
        | libc::PARMRK);
    raw.c_oflag &= !libc::OPOST;
    // ECHONL is meaningless without ICANON but cfmakeraw clears it too.
    raw.c_lflag &= !(libc::ECHO | libc::ECHONL | libc::ICANON | libc::IEXTEN | libc::ISIG);
    raw.c_cflag &= !(libc::CSIZE | libc::PARENB);
    raw.c_cflag |= libc::CS8;
    raw.c_cc[libc::VMIN] = 1;
    raw.c_cc[libc::VTIME] = 0;
    raw
}

// https://learn.microsoft.com/en-us/windows/console/setconsolemode
#[cfg(windows)]
const RAW_INPUT_MODE: CONSOLE_MODE = CONSOLE_MODE(
    // Disables quick edit mode.
    ENABLE_EXTENDED_FLAGS.0
        | ENABLE_MOUSE_INPUT.0
        | ENABLE_VIRTUAL_TERMINAL_INPUT.0
        | ENABLE_WINDOW_INPUT.0,
);

#[cfg(windows)]
const RAW_OUTPUT_MODE: CONSOLE_MODE = CONSOLE_MODE(
    DISABLE_NEWLINE_AUTO_RETURN.0
        | ENABLE_LVB_GRID_WORLDWIDE.0
        | ENABLE_PROCESSED_OUTPUT.0
        | ENABLE_VIRTUAL_TERMINAL_PROCESSING.0,
);

/// https://learn.microsoft.com/en-us/windows/win32/intl/code-page-identifiers
#[cfg(windows)]
const UTF8_CODE_PAGE: u32 = 65001;

#[cfg(windows)]
pub(crate) struct SavedTerminalConfig {
    input: HANDLE,
    output: HANDLE,
    input_mode: CONSOLE_MODE,
    output_mode: CONSOLE_MODE,
    output_code_page: u32,
    restored: bool,
}

// SAFETY: console handles are process-wide and usable from any thread.
#[cfg(windows)]
unsafe impl Send for SavedTerminalConfig {}

/// Puts a console mode back unless disarmed.
#[cfg(windows)]
struct ConsoleModeGuard {
    handle: HANDLE,
    mode: CONSOLE_MODE,
    armed: bool,
}

#[cfg(windows)]
impl ConsoleModeGuard {
    fn new(handle: HANDLE, mode: CONSOLE_MODE) -> Self {
        Self {
            handle,
            mode,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

#[cfg(windows)]
impl Drop for ConsoleModeGuard {
    fn drop(&mut self) {
        if self.armed {
            unsafe {
                let _ = SetConsoleMode(self.handle, self.mode);
            }
        }
    }
}

#[cfg(windows)]
impl SavedTerminalConfig {
    pub(crate) fn enter(input: HANDLE, output: HANDLE) -> Result<Self> {
        let mut input_mode = CONSOLE_MODE::default();
        let mut output_mode = CONSOLE_MODE::default();
        unsafe {
            GetConsoleMode(input, &mut input_mode)
                .map_err(|e| TtyError::win32("GetConsoleMode", e))?;
            GetConsoleMode(output, &mut output_mode)
                .map_err(|e| TtyError::win32("GetConsoleMode", e))?;
        }
        let output_code_page = unsafe { GetConsoleOutputCP() };
        if output_code_page == 0 {
            return Err(TtyError::last_os("GetConsoleOutputCP"));
        }

        unsafe {
            SetConsoleMode(input, RAW_INPUT_MODE)
                .map_err(|e| TtyError::win32("SetConsoleMode", e))?;
            let input_guard = ConsoleModeGuard::new(input, input_mode);

            SetConsoleMode(output, RAW_OUTPUT_MODE)
                .map_err(|e| TtyError::win32("SetConsoleMode", e))?;
            let output_guard = ConsoleModeGuard::new(output, output_mode);

            SetConsoleOutputCP(UTF8_CODE_PAGE)
                .map_err(|e| TtyError::win32("SetConsoleOutputCP", e))?;

            input_guard.disarm();
            output_guard.disarm();
        }

        Ok(Self {
            input,
            output,
            input_mode,
            output_mode,
            output_code_page,
            restored: false,
        })
    }

    pub(crate) fn restore(mut self) -> Result<()> {
        self.restored = true;
        let mut result = Ok(());
        unsafe {
            if let Err(e) = SetConsoleMode(self.input, self.input_mode) {
                result = Err(TtyError::win32("SetConsoleMode", e));
            }
            if let Err(e) = SetConsoleMode(self.output, self.output_mode) {
                if result.is_ok() {
                    result = Err(TtyError::win32("SetConsoleMode", e));
                }
            }
            if let Err(e) = SetConsoleOutputCP(self.output_code_page) {
                if result.is_ok() {
                    result = Err(TtyError::win32("SetConsoleOutputCP", e));
                }
            }
        }
        result
    }
}

#[cfg(windows)]
impl Drop for SavedTerminalConfig {
    fn drop(&mut self) {
        if !self.restored {
            unsafe {
                let _ = SetConsoleMode(self.input, self.input_mode);
                let _ = SetConsoleMode(self.output, self.output_mode);
                let _ = SetConsoleOutputCP(self.output_code_page);
            }
        }
    }
}
