//! Terminal size queries and asynchronous resize delivery.
//!
//! On POSIX a `SIGWINCH` handler has to find the live tty without any
//! arguments, so the owning [`Tty`](crate::Tty) publishes itself in a
//! process-wide slot. Claiming the slot is a compare-and-swap: a second owner
//! is rejected with [`TtyError::AlreadyBound`] rather than replacing the first.
//!
//! On Windows resize arrives as console input records and is handled by the
//! read loop; the slot only enforces the single owner.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use super::callback::{CallbackSlot, TerminalSize};
use super::error::{Result, TtyError};

#[cfg(unix)]
use std::os::fd::RawFd;

#[cfg(windows)]
use windows::Win32::Foundation::HANDLE;
#[cfg(windows)]
use windows::Win32::System::Console::{GetConsoleScreenBufferInfo, CONSOLE_SCREEN_BUFFER_INFO};

/// What the signal handler needs from the owning tty.
pub(crate) struct BoundTty {
    #[cfg(unix)]
    input: RawFd,
    #[cfg_attr(windows, allow(dead_code))]
    callback: Arc<CallbackSlot>,
}

static ACTIVE: AtomicPtr<BoundTty> = AtomicPtr::new(ptr::null_mut());
/// Number of signal handlers currently reading `ACTIVE`.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Ownership of the process-wide slot. Released on drop.
pub(crate) struct Binding {
    target: NonNull<BoundTty>,
}

// SAFETY: the target is only freed by the owning Binding, after it is unpublished.
unsafe impl Send for Binding {}

impl Binding {
    pub(crate) fn acquire(#[cfg(unix)] input: RawFd, callback: Arc<CallbackSlot>) -> Result<Self> {
        let target = NonNull::from(Box::leak(Box::new(BoundTty {
            #[cfg(unix)]
            input,
            callback,
        })));

        match ACTIVE.compare_exchange(
            ptr::null_mut(),
            target.as_ptr(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(Self { target }),
            Err(_) => {
                // SAFETY: never published, still exclusively ours.
                unsafe { drop(Box::from_raw(target.as_ptr())) };
                Err(TtyError::AlreadyBound)
            }
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        let _ = ACTIVE.compare_exchange(
            self.target.as_ptr(),
            ptr::null_mut(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        // A handler on another thread may have loaded the pointer before it was
        // cleared. Handlers enter IN_FLIGHT before loading, so once it reads zero
        // nobody can still see the target.
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        // SAFETY: unpublished and no handler holds a reference.
        unsafe { drop(Box::from_raw(self.target.as_ptr())) };
    }
}

/// Run `f` against the bound tty, if any. Async-signal-safe.
#[cfg(unix)]
fn with_active(f: impl FnOnce(&BoundTty)) {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let active = ACTIVE.load(Ordering::SeqCst);
    // SAFETY: Binding::drop waits for IN_FLIGHT to reach zero before freeing.
    if let Some(bound) = unsafe { active.as_ref() } {
        f(bound);
    }
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
}

/// The installed `SIGWINCH` disposition. Dropping restores the previous one.
#[cfg(unix)]
pub(crate) struct ResizeHandler {
    previous: Option<libc::sigaction>,
}

#[cfg(unix)]
impl ResizeHandler {
    pub(crate) fn install() -> Result<Self> {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = on_sigwinch as extern "C" fn(libc::c_int) as libc::sighandler_t;
        // Let unrelated blocking calls elsewhere in the process resume.
        action.sa_flags = libc::SA_RESTART;

        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
            if libc::sigaction(libc::SIGWINCH, &action, &mut previous) != 0 {
                return Err(TtyError::last_os("sigaction"));
            }
        }
        Ok(Self {
            previous: Some(previous),
        })
    }

    pub(crate) fn uninstall(mut self) -> Result<()> {
        match self.previous.take() {
            Some(previous)
                if unsafe { libc::sigaction(libc::SIGWINCH, &previous, ptr::null_mut()) } != 0 =>
            {
                Err(TtyError::last_os("sigaction"))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
impl Drop for ResizeHandler {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            unsafe {
                libc::sigaction(libc::SIGWINCH, &previous, ptr::null_mut());
            }
        }
    }
}

/// Runs in signal context: only the size ioctl and the callback.
#[cfg(unix)]
extern "C" fn on_sigwinch(_signal: libc::c_int) {
    let saved_errno = super::interrupt::errno();
    with_active(|bound| {
        if let Some(size) = winsize(bound.input) {
            bound.callback.on_resize(size);
        }
    });
    set_errno(saved_errno);
}

#[cfg(unix)]
fn winsize(fd: RawFd) -> Option<TerminalSize> {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut size) } == -1 {
        return None;
    }
    Some(TerminalSize::with_pixels(
        size.ws_col,
        size.ws_row,
        size.ws_xpixel,
        size.ws_ypixel,
    ))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_errno(value: i32) {
    unsafe { *libc::__errno_location() = value };
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
fn set_errno(value: i32) {
    unsafe { *libc::__error() = value };
}

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    ))
))]
fn set_errno(_value: i32) {}

/// Current size of the terminal behind `fd`, pixels included.
#[cfg(unix)]
pub(crate) fn query_size(fd: RawFd) -> Result<TerminalSize> {
    winsize(fd).ok_or_else(|| TtyError::last_os("ioctl(TIOCGWINSZ)"))
}

/// Current console buffer size. Windows does not report pixels.
#[cfg(windows)]
pub(crate) fn query_size(output: HANDLE) -> Result<TerminalSize> {
    let mut info = CONSOLE_SCREEN_BUFFER_INFO::default();
    unsafe { GetConsoleScreenBufferInfo(output, &mut info) }
        .map_err(|e| TtyError::win32("GetConsoleScreenBufferInfo", e))?;
    Ok(TerminalSize::new(
        info.dwSize.X.max(0) as u16,
        info.dwSize.Y.max(0) as u16,
    ))
}

/// Serializes tests which claim the process-wide slot.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
pub(crate) fn test_lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::callback::TtyCallback;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct LastSize {
        packed: AtomicU32,
    }

    impl TtyCallback for LastSize {
        fn on_focus(&self, _focused: bool) {}

        fn on_resize(&self, size: TerminalSize) {
            let packed = (u32::from(size.columns) << 16) | u32::from(size.rows);
            self.packed.store(packed, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_second_binding_is_rejected() {
        let _guard = test_lock();
        let first = Binding::acquire(0, Arc::new(CallbackSlot::new(None))).unwrap();

        let second = Binding::acquire(0, Arc::new(CallbackSlot::new(None)));
        assert!(matches!(second, Err(TtyError::AlreadyBound)));

        drop(first);
        let third = Binding::acquire(0, Arc::new(CallbackSlot::new(None)));
        assert!(third.is_ok());
    }

    #[test]
    fn test_query_size_on_pipe_fails() {
        let mut fds = [-1; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        let err = query_size(fds[0]).unwrap_err();
        assert_eq!(err.code(), Some(libc::ENOTTY as u32));

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_query_size_reports_new_dimensions() {
        use crate::core::test_pty::PseudoTerminal;
        use std::os::fd::AsRawFd;

        let pty = PseudoTerminal::open();
        pty.set_size(TerminalSize::with_pixels(120, 40, 960, 640));

        let size = query_size(pty.slave.as_raw_fd()).unwrap();
        assert_eq!(size, TerminalSize::with_pixels(120, 40, 960, 640));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sigwinch_invokes_bound_callback() {
        use crate::core::test_pty::PseudoTerminal;
        use std::os::fd::AsRawFd;

        let _guard = test_lock();
        let pty = PseudoTerminal::open();
        pty.set_size(TerminalSize::new(120, 40));

        let recorder = Arc::new(LastSize::default());
        let slot = Arc::new(CallbackSlot::new(Some(recorder.clone())));
        let binding = Binding::acquire(pty.slave.as_raw_fd(), slot).unwrap();
        let handler = ResizeHandler::install().unwrap();

        // raise() runs the handler on this thread before returning.
        assert_eq!(unsafe { libc::raise(libc::SIGWINCH) }, 0);
        assert_eq!(recorder.packed.load(Ordering::SeqCst), (120 << 16) | 40);

        handler.uninstall().unwrap();
        drop(binding);
    }

    #[test]
    fn test_sigwinch_without_binding_is_harmless() {
        let _guard = test_lock();
        let handler = ResizeHandler::install().unwrap();
        assert_eq!(unsafe { libc::raise(libc::SIGWINCH) }, 0);
        handler.uninstall().unwrap();
    }
}
