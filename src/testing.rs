//! A loopback [`Tty`] for tests.
//!
//! [`TestTty`] wires a real `Tty` to an input source the test can write into,
//! so reads, interrupts and resize delivery behave exactly as they do on a
//! terminal. POSIX backs it with a pipe. Windows uses a console input buffer
//! opened once per process and reused, since opening and closing `CONIN$`
//! repeatedly eventually fails.

use std::sync::{Mutex, PoisonError};

use crate::core::callback::{TerminalSize, TtyCallback};
use crate::core::error::{Result, TtyError};
use crate::core::tty::Tty;

#[cfg(unix)]
use crate::core::interrupt::{close_fd, errno};
#[cfg(unix)]
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

#[cfg(windows)]
use windows::core::w;
#[cfg(windows)]
use windows::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, HANDLE};
#[cfg(windows)]
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAGS_AND_ATTRIBUTES, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
#[cfg(windows)]
use windows::Win32::System::Console::{
    FlushConsoleInputBuffer, GetStdHandle, SetConsoleMode, WriteConsoleInputW, CONSOLE_MODE, COORD,
    ENABLE_EXTENDED_FLAGS, ENABLE_MOUSE_INPUT, ENABLE_WINDOW_INPUT, FOCUS_EVENT, INPUT_RECORD,
    KEY_EVENT, STD_ERROR_HANDLE, STD_OUTPUT_HANDLE, WINDOW_BUFFER_SIZE_EVENT,
};

/// A [`Tty`] reading from an injectable input source.
pub struct TestTty {
    // Declared first so the Tty is dropped before its input closes.
    tty: Tty,
    #[cfg(unix)]
    reader: OwnedFd,
    #[cfg(unix)]
    writer: Option<OwnedFd>,
    /// The shared console input buffer
    #[cfg(windows)]
    input: HANDLE,
}

// SAFETY: console handles are process-wide and usable from any thread.
#[cfg(windows)]
unsafe impl Send for TestTty {}

impl TestTty {
    pub fn tty(&self) -> &Tty {
        &self.tty
    }

    pub fn tty_mut(&mut self) -> &mut Tty {
        &mut self.tty
    }

    /// Synthetic keyboard event. Not decoded yet, so nothing is injected.
    pub fn key_event(&self) -> Result<()> {
        Ok(())
    }

    /// Synthetic mouse event. Not decoded yet, so nothing is injected.
    pub fn mouse_event(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl TestTty {
    /// The `Tty` starts unbound; enabling resize events claims the binding.
    pub fn new() -> Result<Self> {
        let mut fds: [RawFd; 2] = [-1; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(TtyError::last_os("pipe"));
        }
        // SAFETY: pipe() just created both descriptors and nothing else owns them.
        let (reader, writer) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        set_cloexec(reader.as_raw_fd())?;
        set_cloexec(writer.as_raw_fd())?;

        // SAFETY: `reader` is owned by the TestTty and outlives the Tty.
        let tty = unsafe {
            Tty::from_raw_fds(reader.as_raw_fd(), libc::STDOUT_FILENO, libc::STDERR_FILENO)
        }?;

        Ok(Self {
            tty,
            reader,
            writer: Some(writer),
        })
    }

    /// Queue `bytes` as terminal input. Blocks if the pipe fills up.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| TtyError::from_code("write", libc::EBADF))?;

        let mut remaining = bytes;
        while !remaining.is_empty() {
            let written = unsafe {
                libc::write(writer.as_raw_fd(), remaining.as_ptr().cast(), remaining.len())
            };
            if written < 0 {
                match errno() {
                    libc::EINTR => continue,
                    code => return Err(TtyError::from_code("write", code)),
                }
            }
            remaining = &remaining[written as usize..];
        }
        Ok(())
    }

    /// Focus changes arrive as escape sequences on POSIX; nothing to inject.
    pub fn focus_event(&self, _focused: bool) -> Result<()> {
        Ok(())
    }

    /// Deliver a resize to the callback synchronously, as the signal handler would.
    pub fn resize_event(&self, size: TerminalSize) -> Result<()> {
        self.tty.callback_slot().on_resize(size);
        Ok(())
    }

    /// Close the writing end so reads observe end of stream once drained.
    pub fn close_input(&mut self) -> Result<()> {
        match self.writer.take() {
            Some(writer) => close_fd(writer),
            None => Ok(()),
        }
    }

    /// Free the tty, then close the pipe, reporting the first failure.
    pub fn free(self) -> Result<()> {
        let Self {
            tty,
            reader,
            writer,
        } = self;

        let mut result = tty.free();
        let closed = close_fd(reader).and(writer.map_or(Ok(()), close_fd));
        if result.is_ok() {
            result = closed;
        }
        result
    }
}

#[cfg(unix)]
fn set_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) != 0 {
            return Err(TtyError::last_os("fcntl"));
        }
    }
    Ok(())
}

#[cfg(windows)]
struct SharedConsoleInput(HANDLE);

// SAFETY: console handles are process-wide and usable from any thread.
#[cfg(windows)]
unsafe impl Send for SharedConsoleInput {}

/// Opened on first use and never closed.
#[cfg(windows)]
static CONSOLE_INPUT: Mutex<Option<SharedConsoleInput>> = Mutex::new(None);

#[cfg(windows)]
fn console_input() -> Result<HANDLE> {
    let mut shared = CONSOLE_INPUT
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    let handle = match shared.as_ref() {
        Some(input) => input.0,
        None => {
            // The inherited standard input is unusable under a test runner.
            let handle = unsafe {
                CreateFileW(
                    w!("CONIN$"),
                    (GENERIC_READ | GENERIC_WRITE).0,
                    FILE_SHARE_READ | FILE_SHARE_WRITE,
                    None,
                    OPEN_EXISTING,
                    FILE_FLAGS_AND_ATTRIBUTES(0),
                    HANDLE::default(),
                )
            }
            .map_err(|e| TtyError::win32("CreateFileW", e))?;

            let mode = CONSOLE_MODE(
                ENABLE_WINDOW_INPUT.0 | ENABLE_MOUSE_INPUT.0 | ENABLE_EXTENDED_FLAGS.0,
            );
            unsafe { SetConsoleMode(handle, mode) }
                .map_err(|e| TtyError::win32("SetConsoleMode", e))?;

            *shared = Some(SharedConsoleInput(handle));
            handle
        }
    };

    // Leftovers from a previous TestTty must not leak into this one.
    unsafe { FlushConsoleInputBuffer(handle) }
        .map_err(|e| TtyError::win32("FlushConsoleInputBuffer", e))?;
    Ok(handle)
}

#[cfg(windows)]
impl TestTty {
    /// The `Tty` starts unbound; enabling resize events claims the binding.
    pub fn new() -> Result<Self> {
        let input = console_input()?;
        let std_handle = |kind| {
            unsafe { GetStdHandle(kind) }.map_err(|e| TtyError::win32("GetStdHandle", e))
        };
        let output = std_handle(STD_OUTPUT_HANDLE)?;
        let error = std_handle(STD_ERROR_HANDLE)?;

        // SAFETY: the shared console input is never closed.
        let tty = unsafe { Tty::from_raw_handles(input, output, error) }?;
        Ok(Self { tty, input })
    }

    /// Queue `bytes` as character key records, one per byte.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let records: Vec<INPUT_RECORD> = bytes
            .iter()
            .map(|&byte| {
                let mut record = INPUT_RECORD {
                    EventType: KEY_EVENT as u16,
                    ..Default::default()
                };
                record.Event.KeyEvent.uChar.UnicodeChar = u16::from(byte);
                record
            })
            .collect();
        write_records(self.input, &records)
    }

    pub fn focus_event(&self, focused: bool) -> Result<()> {
        let mut record = INPUT_RECORD {
            EventType: FOCUS_EVENT as u16,
            ..Default::default()
        };
        record.Event.FocusEvent.bSetFocus = focused.into();
        write_records(self.input, &[record])
    }

    /// Queue a buffer-size record. Pixel dimensions are not representable.
    pub fn resize_event(&self, size: TerminalSize) -> Result<()> {
        let mut record = INPUT_RECORD {
            EventType: WINDOW_BUFFER_SIZE_EVENT as u16,
            ..Default::default()
        };
        // COORD is signed; clamp rather than wrap into negative sizes.
        record.Event.WindowBufferSizeEvent.dwSize = COORD {
            X: i16::try_from(size.columns).unwrap_or(i16::MAX),
            Y: i16::try_from(size.rows).unwrap_or(i16::MAX),
        };
        write_records(self.input, &[record])
    }

    /// Free the tty. The shared console input stays open for the next TestTty.
    pub fn free(self) -> Result<()> {
        self.tty.free()
    }
}

#[cfg(windows)]
fn write_records(input: HANDLE, mut records: &[INPUT_RECORD]) -> Result<()> {
    while !records.is_empty() {
        let mut written = 0u32;
        unsafe { WriteConsoleInputW(input, records, &mut written) }
            .map_err(|e| TtyError::win32("WriteConsoleInputW", e))?;
        records = &records[written as usize..];
    }
    Ok(())
}

/// A callback invocation captured by [`RecordingCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackEvent {
    Focus(bool),
    Key,
    Mouse,
    Resize(TerminalSize),
}

/// Records every invocation for later assertions.
///
/// Takes a lock, so it is not async-signal-safe. Feed it through
/// [`TestTty::resize_event`] rather than a real `SIGWINCH`.
#[derive(Debug, Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<CallbackEvent>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.lock().clone()
    }

    /// Drain and return everything recorded so far.
    pub fn take(&self) -> Vec<CallbackEvent> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CallbackEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: CallbackEvent) {
        self.lock().push(event);
    }
}

impl TtyCallback for RecordingCallback {
    fn on_focus(&self, focused: bool) {
        self.record(CallbackEvent::Focus(focused));
    }

    fn on_key(&self) {
        self.record(CallbackEvent::Key);
    }

    fn on_mouse(&self) {
        self.record(CallbackEvent::Mouse);
    }

    fn on_resize(&self, size: TerminalSize) {
        self.record(CallbackEvent::Resize(size));
    }
}
