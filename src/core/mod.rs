//! Core terminal input components.
//!
//! - **tty**: the [`Tty`] handle and its read engine
//! - **raw_mode**: saving, entering and restoring raw terminal mode
//! - **interrupt**: the cross-thread wake-up for a blocked read
//! - **resize**: size queries, the process-wide binding and `SIGWINCH`
//! - **records**: decoding of Windows console input records
//! - **callback**: the notification trait and its lock-free slot
//! - **error**: [`TtyError`] with the raw platform code
//!
//! # Architecture
//!
//! ```text
//! Tty
//! ├── input / output / error (borrowed)
//! ├── InterruptChannel (self-pipe | auto-reset event)
//! │   └── Interrupter (cloneable, any thread)
//! ├── SavedTerminalConfig (after enable_raw_mode)
//! ├── CallbackSlot ──── TtyCallback
//! └── Binding ───────── process-wide slot ◄── SIGWINCH handler
//! ```

pub mod callback;
pub mod error;
pub mod interrupt;
pub(crate) mod raw_mode;
pub(crate) mod records;
pub(crate) mod resize;
pub mod tty;

#[cfg(all(test, target_os = "linux"))]
pub(crate) mod test_pty;

pub use callback::{NoopCallback, TerminalSize, TtyCallback};
pub use error::{Result, TtyError};
pub use interrupt::Interrupter;
pub use tty::{ReadOutcome, Tty};
