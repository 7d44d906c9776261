//! Side-channel notifications delivered outside the byte stream.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Terminal dimensions in cells, plus pixels where the platform reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    pub columns: u16,
    pub rows: u16,
    /// Width in pixels, 0 when unknown (always on Windows)
    pub width: u16,
    /// Height in pixels, 0 when unknown (always on Windows)
    pub height: u16,
}

impl TerminalSize {
    /// A size with unknown pixel dimensions.
    pub const fn new(columns: u16, rows: u16) -> Self {
        Self {
            columns,
            rows,
            width: 0,
            height: 0,
        }
    }

    pub const fn with_pixels(columns: u16, rows: u16, width: u16, height: u16) -> Self {
        Self {
            columns,
            rows,
            width,
            height,
        }
    }
}

/// Receiver for events which do not travel as raw input bytes.
///
/// On POSIX, [`on_resize`](TtyCallback::on_resize) is invoked from the
/// `SIGWINCH` handler once resize events are enabled. Implementations must be
/// async-signal-safe there: no locking, no allocation, no logging. Storing
/// into atomics and calling [`Interrupter::interrupt`](crate::Interrupter::interrupt)
/// are both fine.
///
/// On Windows every method runs on the thread blocked in
/// [`Tty::read`](crate::Tty::read).
pub trait TtyCallback: Send + Sync {
    fn on_focus(&self, focused: bool);

    /// Reserved. Key records are not decoded yet.
    fn on_key(&self) {}

    /// Reserved. Mouse records are not decoded yet.
    fn on_mouse(&self) {}

    fn on_resize(&self, size: TerminalSize);
}

/// A callback which ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallback;

impl TtyCallback for NoopCallback {
    fn on_focus(&self, _focused: bool) {}

    fn on_resize(&self, _size: TerminalSize) {}
}

pub(crate) type SharedCallback = Arc<dyn TtyCallback>;

/// Lock-free holder for the current callback.
///
/// Readers (the read loop and the signal handler) only load a pointer.
/// Replaced callbacks are parked in `retired` rather than dropped because a
/// signal handler may still be running them; they are released with the slot.
pub(crate) struct CallbackSlot {
    current: AtomicPtr<SharedCallback>,
    retired: Mutex<Vec<RetiredCallback>>,
}

struct RetiredCallback(NonNull<SharedCallback>);

// SAFETY: the pointee is an `Arc<dyn TtyCallback>` which is `Send + Sync`.
unsafe impl Send for RetiredCallback {}

impl Drop for RetiredCallback {
    fn drop(&mut self) {
        // SAFETY: produced by `Box::into_raw` in `CallbackSlot::set` and owned only here.
        unsafe { drop(Box::from_raw(self.0.as_ptr())) };
    }
}

impl CallbackSlot {
    pub(crate) fn new(callback: Option<SharedCallback>) -> Self {
        let slot = Self {
            current: AtomicPtr::new(ptr::null_mut()),
            retired: Mutex::new(Vec::new()),
        };
        if let Some(callback) = callback {
            slot.set(callback);
        }
        slot
    }

    /// The previous callback joins `retired`, which only shrinks on drop.
    pub(crate) fn set(&self, callback: SharedCallback) {
        let fresh = Box::into_raw(Box::new(callback));
        let previous = self.current.swap(fresh, Ordering::AcqRel);
        if let Some(previous) = NonNull::new(previous) {
            self.retired
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(RetiredCallback(previous));
        }
    }

    /// Run `f` against the current callback. Async-signal-safe.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&dyn TtyCallback) -> R) -> Option<R> {
        let current = self.current.load(Ordering::Acquire);
        // SAFETY: every pointer stored in `current` stays allocated until the
        // slot itself is dropped (see `retired`).
        unsafe { current.as_ref() }.map(|callback| f(callback.as_ref()))
    }

    pub(crate) fn on_focus(&self, focused: bool) {
        self.with(|callback| callback.on_focus(focused));
    }

    pub(crate) fn on_resize(&self, size: TerminalSize) {
        self.with(|callback| callback.on_resize(size));
    }
}

impl Drop for CallbackSlot {
    fn drop(&mut self) {
        let current = self.current.swap(ptr::null_mut(), Ordering::AcqRel);
        if let Some(current) = NonNull::new(current) {
            drop(RetiredCallback(current));
        }
    }
}
