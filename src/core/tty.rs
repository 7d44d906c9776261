//! The terminal handle.
//!
//! A [`Tty`] multiplexes three things behind one blocking read: bytes from the
//! input source, a wake-up posted through an [`Interrupter`], and resize
//! notifications delivered to the installed [`TtyCallback`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use super::callback::{CallbackSlot, TerminalSize, TtyCallback};
use super::error::{Result, TtyError};
use super::interrupt::{InterruptChannel, Interrupter};
use super::raw_mode::SavedTerminalConfig;
use super::resize::{self, Binding};

#[cfg(unix)]
use super::interrupt::errno;
#[cfg(unix)]
use super::resize::ResizeHandler;
#[cfg(unix)]
use std::os::fd::RawFd;

#[cfg(windows)]
use super::records::{decode_records, InputRecord, RECORD_BATCH};
#[cfg(windows)]
use windows::Win32::Foundation::{FALSE, HANDLE, WAIT_FAILED, WAIT_OBJECT_0};
#[cfg(windows)]
use windows::Win32::Storage::FileSystem::WriteFile;
#[cfg(windows)]
use windows::Win32::System::Console::{
    GetStdHandle, ReadConsoleInputW, INPUT_RECORD, STD_ERROR_HANDLE, STD_INPUT_HANDLE,
    STD_OUTPUT_HANDLE,
};
#[cfg(windows)]
use windows::Win32::System::Threading::{WaitForMultipleObjects, INFINITE};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct TtyState: u8 {
        const RAW_MODE = 0b0001;
        const RESIZE_EVENTS = 0b0010;
        const BOUND = 0b0100;
    }
}

/// Result of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadOutcome {
    /// Bytes were copied into the buffer. Only zero for an empty buffer.
    Bytes(usize),
    /// The read was interrupted or timed out.
    NoData,
    /// The input source reached end-of-file.
    EndOfStream,
}

impl ReadOutcome {
    /// Numeric form: the byte count, `0` for no data, `-1` for end of stream.
    pub fn count(self) -> isize {
        match self {
            ReadOutcome::Bytes(n) => n as isize,
            ReadOutcome::NoData => 0,
            ReadOutcome::EndOfStream => -1,
        }
    }
}

/// Raw terminal input with interruptible reads.
///
/// Reads take `&mut self`, so there is exactly one reader. Other threads wake
/// it through [`interrupter`](Self::interrupter). The input and output
/// descriptors are borrowed and never closed by the `Tty`.
pub struct Tty {
    /// Input source
    #[cfg(unix)]
    input: RawFd,
    /// Standard output sink
    #[cfg(unix)]
    output: RawFd,
    /// Standard error sink
    #[cfg(unix)]
    error: RawFd,
    #[cfg(windows)]
    input: HANDLE,
    #[cfg(windows)]
    output: HANDLE,
    #[cfg(windows)]
    error: HANDLE,
    /// Reused `ReadConsoleInputW` buffer
    #[cfg(windows)]
    records: Vec<INPUT_RECORD>,
    #[cfg(windows)]
    decoded: Vec<InputRecord>,
    /// Taken on release
    interrupt: Option<Arc<InterruptChannel>>,
    callback: Arc<CallbackSlot>,
    saved: Option<SavedTerminalConfig>,
    #[cfg(unix)]
    resize_handler: Option<ResizeHandler>,
    binding: Option<Binding>,
    state: TtyState,
}

// SAFETY: console handles are process-wide and usable from any thread.
#[cfg(windows)]
unsafe impl Send for Tty {}

impl Tty {
    /// Open the process's standard streams and claim the process-wide binding.
    ///
    /// Fails with [`TtyError::AlreadyBound`] while another bound `Tty` is alive.
    pub fn new() -> Result<Self> {
        Self::open_bound(None)
    }

    /// Like [`new`](Self::new), with a callback installed up front.
    pub fn with_callback(callback: Arc<dyn TtyCallback>) -> Result<Self> {
        Self::open_bound(Some(callback))
    }

    fn open_bound(callback: Option<Arc<dyn TtyCallback>>) -> Result<Self> {
        #[cfg(unix)]
        // SAFETY: the standard descriptors live as long as the process.
        let mut tty = unsafe {
            Self::from_raw_fds(libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO)
        }?;

        #[cfg(windows)]
        let mut tty = {
            let std_handle = |kind| {
                unsafe { GetStdHandle(kind) }.map_err(|e| TtyError::win32("GetStdHandle", e))
            };
            let input = std_handle(STD_INPUT_HANDLE)?;
            let output = std_handle(STD_OUTPUT_HANDLE)?;
            let error = std_handle(STD_ERROR_HANDLE)?;
            // SAFETY: standard handles live as long as the process.
            unsafe { Self::from_raw_handles(input, output, error) }?
        };

        if let Some(callback) = callback {
            tty.set_callback(callback);
        }
        tty.bind()?;
        Ok(tty)
    }

    /// Build an unbound `Tty` over existing descriptors.
    ///
    /// # Safety
    ///
    /// All three descriptors must stay open for the lifetime of the `Tty`.
    #[cfg(unix)]
    pub unsafe fn from_raw_fds(input: RawFd, output: RawFd, error: RawFd) -> Result<Self> {
        let interrupt = InterruptChannel::new()?;
        debug!("Tty created over fd {}", input);
        Ok(Self {
            input,
            output,
            error,
            interrupt: Some(Arc::new(interrupt)),
            callback: Arc::new(CallbackSlot::new(None)),
            saved: None,
            resize_handler: None,
            binding: None,
            state: TtyState::empty(),
        })
    }

    /// Build an unbound `Tty` over existing console handles.
    ///
    /// # Safety
    ///
    /// All three handles must stay open for the lifetime of the `Tty`.
    #[cfg(windows)]
    pub unsafe fn from_raw_handles(input: HANDLE, output: HANDLE, error: HANDLE) -> Result<Self> {
        let interrupt = InterruptChannel::new()?;
        debug!("Tty created over console handle {:?}", input);
        Ok(Self {
            input,
            output,
            error,
            records: vec![INPUT_RECORD::default(); RECORD_BATCH],
            decoded: Vec::with_capacity(RECORD_BATCH),
            interrupt: Some(Arc::new(interrupt)),
            callback: Arc::new(CallbackSlot::new(None)),
            saved: None,
            binding: None,
            state: TtyState::empty(),
        })
    }

    fn bind(&mut self) -> Result<()> {
        if self.binding.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        let binding = Binding::acquire(self.input, self.callback.clone())?;
        #[cfg(windows)]
        let binding = Binding::acquire(self.callback.clone())?;

        self.binding = Some(binding);
        self.state.insert(TtyState::BOUND);
        Ok(())
    }

    fn unbind(&mut self) {
        if self.state.contains(TtyState::BOUND) {
            self.binding = None;
            self.state.remove(TtyState::BOUND);
            debug!("Released process-wide tty binding");
        }
    }

    /// Install or replace the callback. Takes effect for the next event.
    ///
    /// A signal handler may still be running the replaced callback, so it is
    /// kept alive until the `Tty` is dropped. Every replacement therefore holds
    /// on to one more callback; install once and keep state inside it rather
    /// than swapping callbacks in a loop.
    pub fn set_callback(&self, callback: Arc<dyn TtyCallback>) {
        self.callback.set(callback);
    }

    #[cfg(unix)]
    pub(crate) fn callback_slot(&self) -> &CallbackSlot {
        &self.callback
    }

    fn channel(&self) -> Result<&InterruptChannel> {
        self.interrupt
            .as_deref()
            .ok_or_else(|| TtyError::from_code("interrupt", RELEASED_CODE))
    }

    /// Block until input arrives, the read is interrupted, or the input ends.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        self.read_until(buf, None)
    }

    /// Like [`read`](Self::read), giving up with [`ReadOutcome::NoData`] after
    /// `timeout`. A zero timeout polls without blocking.
    pub fn read_with_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadOutcome> {
        // Too far in the future to represent means never.
        let deadline = Instant::now().checked_add(timeout);
        self.read_until(buf, deadline)
    }

    #[cfg(unix)]
    fn read_until(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Bytes(0));
        }
        let channel = self.channel()?;

        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.input,
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: channel.read_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), 2, poll_timeout(deadline)) };
            if ready < 0 {
                match errno() {
                    // SIGWINCH lands here; wait out the remaining time.
                    libc::EINTR => continue,
                    code => return Err(TtyError::from_code("poll", code)),
                }
            }
            if ready == 0 {
                trace!("Read timed out");
                return Ok(ReadOutcome::NoData);
            }

            let [input, wake] = fds;
            if (input.revents | wake.revents) & libc::POLLNVAL != 0 {
                return Err(TtyError::from_code("poll", libc::EBADF));
            }
            // Input first: a pending wake survives for the next call.
            if input.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                return read_fd(self.input, buf);
            }
            if wake.revents != 0 {
                channel.drain()?;
                trace!("Read interrupted");
                return Ok(ReadOutcome::NoData);
            }
        }
    }

    #[cfg(windows)]
    fn read_until(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Bytes(0));
        }
        let handles = [self.input, self.channel()?.handle()];

        loop {
            let waited = unsafe { WaitForMultipleObjects(&handles, FALSE, wait_timeout(deadline)) };
            if waited == WAIT_FAILED {
                return Err(TtyError::last_os("WaitForMultipleObjects"));
            }
            if waited != WAIT_OBJECT_0 {
                // Interrupt event (auto-reset) or timeout.
                trace!("Read interrupted or timed out");
                return Ok(ReadOutcome::NoData);
            }

            let request = RECORD_BATCH.min(buf.len());
            let mut read = 0u32;
            unsafe { ReadConsoleInputW(self.input, &mut self.records[..request], &mut read) }
                .map_err(|e| TtyError::win32("ReadConsoleInputW", e))?;

            self.decoded.clear();
            self.decoded
                .extend(self.records[..read as usize].iter().map(InputRecord::from));
            let resize_events = self.state.contains(TtyState::RESIZE_EVENTS);
            let count = decode_records(&self.decoded, buf, &self.callback, resize_events);

            // Zero would look like an interrupt; only events arrived, so wait again.
            if count > 0 {
                trace!("Read {} bytes from {} records", count, read);
                return Ok(ReadOutcome::Bytes(count));
            }
        }
    }

    /// Wake the current or next read. See [`Interrupter::interrupt`].
    pub fn interrupt(&self) -> Result<()> {
        self.channel()?.signal()
    }

    /// A handle for interrupting reads from other threads.
    pub fn interrupter(&self) -> Result<Interrupter> {
        let channel = self
            .interrupt
            .clone()
            .ok_or_else(|| TtyError::from_code("interrupt", RELEASED_CODE))?;
        Ok(Interrupter::new(channel))
    }

    /// Write once to the output sink, returning the count written.
    pub fn write_output(&self, buf: &[u8]) -> Result<usize> {
        write_once(self.output, buf)
    }

    /// Write once to the error sink, returning the count written.
    pub fn write_error(&self, buf: &[u8]) -> Result<usize> {
        write_once(self.error, buf)
    }

    /// Switch the terminal to raw mode. Later calls do nothing.
    ///
    /// The previous configuration comes back on [`free`](Self::free) or drop.
    pub fn enable_raw_mode(&mut self) -> Result<()> {
        if self.saved.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        let saved = SavedTerminalConfig::enter(self.input)?;
        #[cfg(windows)]
        let saved = SavedTerminalConfig::enter(self.input, self.output)?;

        self.saved = Some(saved);
        self.state.insert(TtyState::RAW_MODE);
        debug!("Raw mode enabled");
        Ok(())
    }

    pub fn is_raw_mode_enabled(&self) -> bool {
        self.state.contains(TtyState::RAW_MODE)
    }

    /// Start delivering resize notifications to the callback.
    ///
    /// Claims the process-wide binding if this `Tty` does not hold it yet.
    /// Later calls do nothing.
    pub fn enable_window_resize_events(&mut self) -> Result<()> {
        #[cfg(unix)]
        let result = self.start_resize_events(ResizeHandler::install);
        #[cfg(windows)]
        let result = self.start_resize_events();
        result
    }

    /// A failed install leaves the binding as it was before the call.
    #[cfg(unix)]
    fn start_resize_events(
        &mut self,
        install: impl FnOnce() -> Result<ResizeHandler>,
    ) -> Result<()> {
        if self.state.contains(TtyState::RESIZE_EVENTS) {
            return Ok(());
        }
        let newly_bound = self.binding.is_none();
        self.bind()?;
        match install() {
            Ok(handler) => self.resize_handler = Some(handler),
            Err(e) => {
                if newly_bound {
                    self.unbind();
                }
                return Err(e);
            }
        }
        self.state.insert(TtyState::RESIZE_EVENTS);
        debug!("Window resize events enabled");
        Ok(())
    }

    /// Resize records arrive through the read loop; only the binding is needed.
    #[cfg(windows)]
    fn start_resize_events(&mut self) -> Result<()> {
        if self.state.contains(TtyState::RESIZE_EVENTS) {
            return Ok(());
        }
        self.bind()?;
        self.state.insert(TtyState::RESIZE_EVENTS);
        debug!("Window resize events enabled");
        Ok(())
    }

    /// Query the terminal size now, whether or not resize events are enabled.
    pub fn current_terminal_size(&self) -> Result<TerminalSize> {
        #[cfg(unix)]
        let size = resize::query_size(self.input);
        #[cfg(windows)]
        let size = resize::query_size(self.output);
        size
    }

    /// Restore the terminal and release every resource, reporting the first
    /// failure. Every step is attempted regardless.
    pub fn free(mut self) -> Result<()> {
        let result = self.release();
        debug!("Tty freed");
        result
    }

    fn release(&mut self) -> Result<()> {
        let mut result = Ok(());

        if let Some(channel) = self.interrupt.take() {
            // Outstanding interrupters keep the channel open until they go.
            if let Ok(channel) = Arc::try_unwrap(channel) {
                keep_first(&mut result, channel.close());
            }
        }
        #[cfg(unix)]
        if let Some(handler) = self.resize_handler.take() {
            keep_first(&mut result, handler.uninstall());
        }
        if let Some(saved) = self.saved.take() {
            keep_first(&mut result, saved.restore());
        }
        self.unbind();
        self.state = TtyState::empty();

        result
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release tty: {}", e);
        }
    }
}

fn keep_first(result: &mut Result<()>, step: Result<()>) {
    if let Err(e) = step {
        if result.is_ok() {
            *result = Err(e);
        }
    }
}

#[cfg(unix)]
const RELEASED_CODE: i32 = libc::EBADF;
/// ERROR_INVALID_HANDLE
#[cfg(windows)]
const RELEASED_CODE: i32 = 6;

/// Milliseconds until `deadline` for `poll`, rounded up so it never wakes early.
#[cfg(unix)]
fn poll_timeout(deadline: Option<Instant>) -> libc::c_int {
    match deadline {
        None => -1,
        Some(deadline) => millis_until(deadline).min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

#[cfg(windows)]
fn wait_timeout(deadline: Option<Instant>) -> u32 {
    match deadline {
        None => INFINITE,
        // INFINITE itself is u32::MAX.
        Some(deadline) => millis_until(deadline).min(u128::from(INFINITE - 1)) as u32,
    }
}

fn millis_until(deadline: Instant) -> u128 {
    let nanos = deadline.saturating_duration_since(Instant::now()).as_nanos();
    (nanos + 999_999) / 1_000_000
}

#[cfg(unix)]
fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<ReadOutcome> {
    loop {
        let count = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if count > 0 {
            trace!("Read {} bytes", count);
            return Ok(ReadOutcome::Bytes(count as usize));
        }
        if count == 0 {
            trace!("Input reached end of stream");
            return Ok(ReadOutcome::EndOfStream);
        }
        match errno() {
            libc::EINTR => continue,
            code => return Err(TtyError::from_code("read", code)),
        }
    }
}

#[cfg(unix)]
fn write_once(fd: RawFd, buf: &[u8]) -> Result<usize> {
    loop {
        let count = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if count >= 0 {
            return Ok(count as usize);
        }
        match errno() {
            libc::EINTR => continue,
            code => return Err(TtyError::from_code("write", code)),
        }
    }
}

#[cfg(windows)]
fn write_once(handle: HANDLE, buf: &[u8]) -> Result<usize> {
    let mut written = 0u32;
    unsafe { WriteFile(handle, Some(buf), Some(&mut written), None) }
        .map_err(|e| TtyError::win32("WriteFile", e))?;
    Ok(written as usize)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::resize::test_lock;
    use crate::testing::TestTty;
    use std::thread;

    fn read_exactly(tty: &mut Tty, len: usize, chunk: usize) -> Vec<u8> {
        let mut collected = Vec::new();
        let mut buf = vec![0u8; chunk];
        while collected.len() < len {
            match tty.read(&mut buf).unwrap() {
                ReadOutcome::Bytes(n) => collected.extend_from_slice(&buf[..n]),
                other => panic!("unexpected {:?}", other),
            }
        }
        collected
    }

    #[test]
    fn test_read_outcome_counts() {
        assert_eq!(ReadOutcome::Bytes(5).count(), 5);
        assert_eq!(ReadOutcome::NoData.count(), 0);
        assert_eq!(ReadOutcome::EndOfStream.count(), -1);
    }

    #[test]
    fn test_bytes_survive_any_chunking() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();

        for (write_chunk, read_chunk) in [(1, 1), (7, 5), (64, 3), (1000, 128)] {
            let mut test_tty = TestTty::new().unwrap();
            for piece in data.chunks(write_chunk) {
                test_tty.write(piece).unwrap();
            }
            let received = read_exactly(test_tty.tty_mut(), data.len(), read_chunk);
            assert_eq!(received, data);
        }
    }

    #[test]
    fn test_interrupt_before_read_is_not_lost() {
        let mut test_tty = TestTty::new().unwrap();
        test_tty.tty().interrupt().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(test_tty.tty_mut().read(&mut buf).unwrap(), ReadOutcome::NoData);
    }

    #[test]
    fn test_interrupts_coalesce_into_one_wake() {
        let mut test_tty = TestTty::new().unwrap();
        for _ in 0..3 {
            test_tty.tty().interrupt().unwrap();
        }

        let mut buf = [0u8; 8];
        let tty = test_tty.tty_mut();
        assert_eq!(tty.read(&mut buf).unwrap(), ReadOutcome::NoData);
        assert_eq!(
            tty.read_with_timeout(&mut buf, Duration::ZERO).unwrap(),
            ReadOutcome::NoData
        );
    }

    #[test]
    fn test_interrupt_wakes_blocked_read_from_other_thread() {
        let mut test_tty = TestTty::new().unwrap();
        let interrupter = test_tty.tty().interrupter().unwrap();

        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            interrupter.interrupt().unwrap();
        });

        let mut buf = [0u8; 8];
        assert_eq!(test_tty.tty_mut().read(&mut buf).unwrap(), ReadOutcome::NoData);
        waker.join().unwrap();

        // Input arriving after the wake is still delivered.
        test_tty.write(b"late").unwrap();
        assert_eq!(test_tty.tty_mut().read(&mut buf).unwrap(), ReadOutcome::Bytes(4));
        assert_eq!(&buf[..4], b"late");
    }

    #[test]
    fn test_input_wins_over_pending_interrupt() {
        let mut test_tty = TestTty::new().unwrap();
        test_tty.write(b"ab").unwrap();
        test_tty.tty().interrupt().unwrap();

        let mut buf = [0u8; 8];
        let tty = test_tty.tty_mut();
        assert_eq!(tty.read(&mut buf).unwrap(), ReadOutcome::Bytes(2));
        assert_eq!(tty.read(&mut buf).unwrap(), ReadOutcome::NoData);
    }

    #[test]
    fn test_timeout_returns_no_data() {
        let mut test_tty = TestTty::new().unwrap();
        let mut buf = [0u8; 8];

        let started = Instant::now();
        let outcome = test_tty
            .tty_mut()
            .read_with_timeout(&mut buf, Duration::from_millis(50))
            .unwrap();
        assert_eq!(outcome, ReadOutcome::NoData);
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_zero_timeout_polls() {
        let mut test_tty = TestTty::new().unwrap();
        let mut buf = [0u8; 8];
        let tty = test_tty.tty_mut();

        assert_eq!(
            tty.read_with_timeout(&mut buf, Duration::ZERO).unwrap(),
            ReadOutcome::NoData
        );
        test_tty.write(b"x").unwrap();
        assert_eq!(
            test_tty
                .tty_mut()
                .read_with_timeout(&mut buf, Duration::ZERO)
                .unwrap(),
            ReadOutcome::Bytes(1)
        );
    }

    #[test]
    fn test_empty_buffer_returns_immediately() {
        let mut test_tty = TestTty::new().unwrap();
        let mut buf = [0u8; 0];
        assert_eq!(test_tty.tty_mut().read(&mut buf).unwrap(), ReadOutcome::Bytes(0));
    }

    #[test]
    fn test_end_of_stream_is_distinct() {
        let mut test_tty = TestTty::new().unwrap();
        test_tty.write(b"bye").unwrap();
        test_tty.close_input().unwrap();

        let mut buf = [0u8; 8];
        let tty = test_tty.tty_mut();
        assert_eq!(tty.read(&mut buf).unwrap(), ReadOutcome::Bytes(3));
        let end = tty.read(&mut buf).unwrap();
        assert_eq!(end, ReadOutcome::EndOfStream);
        assert_eq!(end.count(), -1);
    }

    #[test]
    fn test_raw_mode_on_pipe_fails() {
        let mut test_tty = TestTty::new().unwrap();
        let err = test_tty.tty_mut().enable_raw_mode().unwrap_err();
        assert_eq!(err.code(), Some(libc::ENOTTY as u32));
        assert!(!test_tty.tty().is_raw_mode_enabled());
        test_tty.free().unwrap();
    }

    #[test]
    fn test_second_bound_tty_is_rejected() {
        let _guard = test_lock();
        let first = Tty::new().unwrap();
        assert!(matches!(Tty::new(), Err(TtyError::AlreadyBound)));
        first.free().unwrap();

        let again = Tty::new().unwrap();
        drop(again);
    }

    #[test]
    fn test_enabling_resize_binds_test_tty() {
        let _guard = test_lock();
        let mut test_tty = TestTty::new().unwrap();
        test_tty.tty_mut().enable_window_resize_events().unwrap();
        test_tty.tty_mut().enable_window_resize_events().unwrap();

        assert!(matches!(Tty::new(), Err(TtyError::AlreadyBound)));
        test_tty.free().unwrap();
        drop(Tty::new().unwrap());
    }

    fn failing_install() -> Result<ResizeHandler> {
        Err(TtyError::from_code("sigaction", libc::EINVAL))
    }

    #[test]
    fn test_failed_handler_install_releases_new_binding() {
        let _guard = test_lock();
        let mut test_tty = TestTty::new().unwrap();

        let err = test_tty
            .tty_mut()
            .start_resize_events(failing_install)
            .unwrap_err();
        assert_eq!(err.operation(), Some("sigaction"));

        drop(Tty::new().unwrap());
        test_tty.tty_mut().enable_window_resize_events().unwrap();
        test_tty.free().unwrap();
    }

    #[test]
    fn test_failed_handler_install_keeps_prior_binding() {
        let _guard = test_lock();
        let mut tty = Tty::new().unwrap();

        tty.start_resize_events(failing_install).unwrap_err();
        assert!(matches!(Tty::new(), Err(TtyError::AlreadyBound)));
        tty.free().unwrap();
    }

    #[test]
    fn test_interrupter_outlives_free() {
        let test_tty = TestTty::new().unwrap();
        let interrupter = test_tty.tty().interrupter().unwrap();
        test_tty.free().unwrap();
        interrupter.interrupt().unwrap();
    }

    #[test]
    fn test_write_output_reports_count() {
        let test_tty = TestTty::new().unwrap();
        assert_eq!(test_tty.tty().write_output(b"").unwrap(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_signal_during_read_is_not_surfaced() {
        let _guard = test_lock();
        let mut test_tty = TestTty::new().unwrap();
        test_tty.tty_mut().enable_window_resize_events().unwrap();
        let interrupter = test_tty.tty().interrupter().unwrap();
        let reader = unsafe { libc::pthread_self() };

        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            unsafe { libc::pthread_kill(reader, libc::SIGWINCH) };
            thread::sleep(Duration::from_millis(50));
            interrupter.interrupt().unwrap();
        });

        let started = Instant::now();
        let mut buf = [0u8; 8];
        assert_eq!(test_tty.tty_mut().read(&mut buf).unwrap(), ReadOutcome::NoData);
        assert!(started.elapsed() >= Duration::from_millis(70));
        signaller.join().unwrap();
        test_tty.free().unwrap();
    }

    #[cfg(target_os = "linux")]
    mod terminal {
        use super::*;
        use crate::core::raw_mode::raw_attributes;
        use crate::core::test_pty::{same_attributes, PseudoTerminal};
        use std::os::fd::AsRawFd;

        fn tty_over(pty: &PseudoTerminal) -> Tty {
            let fd = pty.slave.as_raw_fd();
            unsafe { Tty::from_raw_fds(fd, fd, fd) }.unwrap()
        }

        #[test]
        fn test_raw_mode_is_idempotent_and_restored_once() {
            let pty = PseudoTerminal::open();
            let before = pty.attributes();
            let mut tty = tty_over(&pty);

            tty.enable_raw_mode().unwrap();
            let once = pty.attributes();
            tty.enable_raw_mode().unwrap();
            assert!(tty.is_raw_mode_enabled());
            assert!(same_attributes(&pty.attributes(), &once));
            assert!(same_attributes(&once, &raw_attributes(&before)));

            tty.free().unwrap();
            assert!(same_attributes(&pty.attributes(), &before));
        }

        #[test]
        fn test_drop_restores_terminal() {
            let pty = PseudoTerminal::open();
            let before = pty.attributes();

            let mut tty = tty_over(&pty);
            tty.enable_raw_mode().unwrap();
            drop(tty);
            assert!(same_attributes(&pty.attributes(), &before));
        }

        #[test]
        fn test_current_size_follows_resize() {
            let pty = PseudoTerminal::open();
            let tty = tty_over(&pty);

            pty.set_size(TerminalSize::new(120, 40));
            let size = tty.current_terminal_size().unwrap();
            assert_eq!((size.columns, size.rows), (120, 40));

            pty.set_size(TerminalSize::new(80, 24));
            let size = tty.current_terminal_size().unwrap();
            assert_eq!((size.columns, size.rows), (80, 24));
        }

        fn sigwinch_disposition() -> libc::sighandler_t {
            let mut current: libc::sigaction = unsafe { std::mem::zeroed() };
            let status =
                unsafe { libc::sigaction(libc::SIGWINCH, std::ptr::null(), &mut current) };
            assert_eq!(status, 0);
            current.sa_sigaction
        }

        #[test]
        fn test_free_continues_past_failed_restore() {
            let _guard = test_lock();
            let pty = PseudoTerminal::open();
            let fd = unsafe { libc::dup(pty.slave.as_raw_fd()) };
            assert!(fd >= 0);
            let mut tty = unsafe { Tty::from_raw_fds(fd, fd, fd) }.unwrap();

            let before = sigwinch_disposition();
            tty.enable_raw_mode().unwrap();
            tty.enable_window_resize_events().unwrap();
            assert_ne!(sigwinch_disposition(), before);

            // Same descriptor number, no longer a terminal.
            let null = unsafe { libc::open(b"/dev/null\0".as_ptr().cast(), libc::O_RDWR) };
            assert!(null >= 0);
            assert_eq!(unsafe { libc::dup2(null, fd) }, fd);

            let err = tty.free().unwrap_err();
            assert_eq!(err.operation(), Some("tcsetattr"));
            assert_eq!(err.code(), Some(libc::ENOTTY as u32));
            assert_eq!(sigwinch_disposition(), before);
            drop(Tty::new().unwrap());

            unsafe {
                libc::close(null);
                libc::close(fd);
            }
        }

        #[test]
        fn test_raw_bytes_pass_through() {
            let pty = PseudoTerminal::open();
            let mut tty = tty_over(&pty);
            tty.enable_raw_mode().unwrap();

            let typed = [0x03u8, b'\r', 0x1b, b'[', b'A'];
            let written = unsafe {
                libc::write(pty.master.as_raw_fd(), typed.as_ptr().cast(), typed.len())
            };
            assert_eq!(written, typed.len() as isize);

            let received = read_exactly(&mut tty, typed.len(), 16);
            assert_eq!(received, typed);
        }
    }
}
