//! ttyio - raw terminal input with interruptible reads
//!
//! ttyio puts a terminal into raw mode and hands its input to the caller as
//! raw bytes. Focus and resize notifications go to a [`TtyCallback`] instead
//! of the byte stream. A blocking read can be bounded by a timeout and
//! cancelled from any thread through an [`Interrupter`].
//!
//! # Example
//!
//! ```no_run
//! use ttyio::{ReadOutcome, Tty};
//!
//! # fn main() -> ttyio::Result<()> {
//! let mut tty = Tty::new()?;
//! tty.enable_raw_mode()?;
//!
//! let mut buf = [0u8; 64];
//! while let ReadOutcome::Bytes(n) = tty.read(&mut buf)? {
//!     tty.write_output(&buf[..n])?;
//! }
//! tty.free()
//! # }
//! ```
//!
//! # Platforms
//!
//! | | POSIX | Windows |
//! |---|---|---|
//! | Input | file descriptor, `poll` | console handle, `WaitForMultipleObjects` |
//! | Interrupt | self-pipe | auto-reset event |
//! | Resize | `SIGWINCH` handler | `WINDOW_BUFFER_SIZE_EVENT` records |

pub mod config;
pub mod core;
pub mod testing;

pub use crate::core::{
    Interrupter, NoopCallback, ReadOutcome, Result, TerminalSize, Tty, TtyCallback, TtyError,
};
