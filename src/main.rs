//! ttyio - show what a terminal really sends
//!
//! Puts the terminal into raw mode and prints every byte read as hex, along
//! with focus and resize notifications.
//!
//! # Quick Start
//!
//! ```text
//! ttyio              # Raw mode, resize events, block until input
//! ttyio -t 500       # Report a timeout every 500ms of silence
//! ttyio --no-raw     # Keep line editing and echo
//! ```
//!
//! Press `q` or Ctrl+C, or close the input, to quit.

use std::env;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ttyio::config::Config;
use ttyio::{Interrupter, ReadOutcome, TerminalSize, Tty, TtyCallback};

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

const CTRL_C: u8 = 0x03;

fn print_version() {
    eprintln!("ttyio {}", VERSION);
}

fn print_help() {
    eprintln!("ttyio {} - Echo raw terminal input as hex", VERSION);
    eprintln!();
    eprintln!("Usage: ttyio [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -t, --timeout <MS>    Give up waiting for input after MS milliseconds");
    eprintln!("  -b, --buffer <N>      Read at most N bytes at a time");
    eprintln!("  --no-raw              Leave the terminal in cooked mode");
    eprintln!("  --no-resize           Do not report window resizes");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Configuration is read from ~/.ttyio/config.toml; options override it.");
    eprintln!("Press q or Ctrl+C to quit.");
}

/// Apply command line overrides to `config`
fn parse_args(config: &mut Config) -> Result<(), String> {
    let args: Vec<String> = env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-t" | "--timeout" => {
                i += 1;
                let value = args.get(i).ok_or("Missing timeout argument")?;
                let millis: u64 = value
                    .parse()
                    .map_err(|_| format!("Invalid timeout: {}", value))?;
                config.read_timeout_ms = Some(millis);
            }
            "-b" | "--buffer" => {
                i += 1;
                let value = args.get(i).ok_or("Missing buffer size argument")?;
                match value.parse::<usize>() {
                    Ok(size) if size > 0 => config.buffer_size = size,
                    _ => return Err(format!("Invalid buffer size: {}", value)),
                }
            }
            "--no-raw" => {
                config.raw_mode = false;
            }
            "--no-resize" => {
                config.resize_events = false;
            }
            arg => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
        }
        i += 1;
    }

    Ok(())
}

const FOCUS_UNCHANGED: u8 = 0;
const FOCUS_LOST: u8 = 1;
const FOCUS_GAINED: u8 = 2;

/// Stashes notifications and wakes the read loop to print them.
///
/// Resize arrives in a signal handler on POSIX, so only atomics are touched.
struct Notifications {
    interrupter: Interrupter,
    resized: AtomicBool,
    size: AtomicU32,
    focus: AtomicU8,
}

impl Notifications {
    fn new(interrupter: Interrupter) -> Self {
        Self {
            interrupter,
            resized: AtomicBool::new(false),
            size: AtomicU32::new(0),
            focus: AtomicU8::new(FOCUS_UNCHANGED),
        }
    }

    fn take_resize(&self) -> Option<(u16, u16)> {
        if !self.resized.swap(false, Ordering::AcqRel) {
            return None;
        }
        let packed = self.size.load(Ordering::Acquire);
        Some(((packed >> 16) as u16, packed as u16))
    }

    fn take_focus(&self) -> Option<bool> {
        match self.focus.swap(FOCUS_UNCHANGED, Ordering::AcqRel) {
            FOCUS_LOST => Some(false),
            FOCUS_GAINED => Some(true),
            _ => None,
        }
    }
}

impl TtyCallback for Notifications {
    fn on_focus(&self, focused: bool) {
        let state = if focused { FOCUS_GAINED } else { FOCUS_LOST };
        self.focus.store(state, Ordering::Release);
        let _ = self.interrupter.interrupt();
    }

    fn on_resize(&self, size: TerminalSize) {
        let packed = (u32::from(size.columns) << 16) | u32::from(size.rows);
        self.size.store(packed, Ordering::Release);
        self.resized.store(true, Ordering::Release);
        let _ = self.interrupter.interrupt();
    }
}

/// Write all of `text` to the tty's output
fn print(tty: &Tty, text: &str) -> ttyio::Result<()> {
    let mut remaining = text.as_bytes();
    while !remaining.is_empty() {
        let written = tty.write_output(remaining)?;
        remaining = &remaining[written..];
    }
    Ok(())
}

fn hex_line(bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}\r\n", hex.join(" "))
}

fn init_logging(config: &Config) {
    let log_path = Config::log_path();

    // Open log file (append mode)
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .ok();

    if let Some(file) = log_file {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.level().to_string()));
        let subscriber = FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    }
}

fn main() -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Err(e) = parse_args(&mut config) {
        eprintln!("Error: {}", e);
        eprintln!("Use --help for usage information");
        std::process::exit(1);
    }

    init_logging(&config);
    info!("ttyio {} starting...", VERSION);

    let mut tty = Tty::new()?;
    let notifications = Arc::new(Notifications::new(tty.interrupter()?));
    tty.set_callback(notifications.clone());

    if config.raw_mode {
        tty.enable_raw_mode()?;
    }
    if config.resize_events {
        tty.enable_window_resize_events()?;
    }

    let result = run(&mut tty, &config, &notifications);
    if let Err(e) = &result {
        error!("Read loop failed: {}", e);
    }

    tty.free()?;
    info!("ttyio finished");
    result
}

fn run(tty: &mut Tty, config: &Config, notifications: &Notifications) -> anyhow::Result<()> {
    match tty.current_terminal_size() {
        Ok(size) => {
            info!("Terminal size: {}x{}", size.columns, size.rows);
            print(tty, &format!("size {}x{}\r\n", size.columns, size.rows))?;
        }
        Err(e) => info!("Terminal size unavailable: {}", e),
    }
    print(tty, "press q or Ctrl+C to quit\r\n")?;

    let mut buf = vec![0u8; config.buffer_size.max(1)];
    loop {
        let outcome = match config.read_timeout() {
            Some(timeout) => tty.read_with_timeout(&mut buf, timeout)?,
            None => tty.read(&mut buf)?,
        };

        match outcome {
            ReadOutcome::Bytes(n) => {
                let bytes = &buf[..n];
                print(tty, &hex_line(bytes))?;
                if bytes.iter().any(|&b| b == b'q' || b == CTRL_C) {
                    return Ok(());
                }
            }
            ReadOutcome::NoData => {
                let mut reported = false;
                if let Some(focused) = notifications.take_focus() {
                    print(tty, if focused { "focus gained\r\n" } else { "focus lost\r\n" })?;
                    reported = true;
                }
                if let Some((columns, rows)) = notifications.take_resize() {
                    info!("Resize: {}x{}", columns, rows);
                    print(tty, &format!("resize {}x{}\r\n", columns, rows))?;
                    reported = true;
                }
                if !reported {
                    print(tty, "timeout\r\n")?;
                }
            }
            ReadOutcome::EndOfStream => {
                print(tty, "end of input\r\n")?;
                return Ok(());
            }
        }
    }
}
