//! Decoding of console input records into raw bytes and callback events.
//!
//! Windows delivers keyboard, mouse, focus and resize input as a stream of
//! `INPUT_RECORD`s. They are converted into [`InputRecord`] first so the
//! decoding rules can be exercised on any platform.

#![cfg_attr(not(windows), allow(dead_code))]

use super::callback::{CallbackSlot, TerminalSize};

/// Most records fetched by one `ReadConsoleInputW` call.
pub(crate) const RECORD_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InputRecord {
    Key {
        virtual_key_code: u16,
        unicode_char: u16,
    },
    Mouse,
    Focus(bool),
    Resize {
        columns: u16,
        rows: u16,
    },
    Other,
}

/// Decode `records` into `buf`, dispatching focus and resize to `callback`.
///
/// Returns the number of bytes written. Zero means the batch carried only
/// events and the caller should wait again rather than report an empty read.
/// At most one byte is produced per record, so `buf` must hold at least
/// `records.len()` bytes.
pub(crate) fn decode_records(
    records: &[InputRecord],
    buf: &mut [u8],
    callback: &CallbackSlot,
    resize_events: bool,
) -> usize {
    let mut written = 0;
    for record in records {
        match *record {
            // Character-producing keys only. Other keys need escape encoding.
            InputRecord::Key {
                virtual_key_code: 0,
                unicode_char,
            } => {
                if let Some(slot) = buf.get_mut(written) {
                    *slot = unicode_char as u8;
                    written += 1;
                }
            }
            InputRecord::Key { .. } | InputRecord::Mouse | InputRecord::Other => {}
            InputRecord::Focus(focused) => callback.on_focus(focused),
            InputRecord::Resize { columns, rows } => {
                if resize_events {
                    callback.on_resize(TerminalSize::new(columns, rows));
                }
            }
        }
    }
    written
}

#[cfg(windows)]
impl From<&windows::Win32::System::Console::INPUT_RECORD> for InputRecord {
    fn from(record: &windows::Win32::System::Console::INPUT_RECORD) -> Self {
        use windows::Win32::System::Console::{
            FOCUS_EVENT, KEY_EVENT, MOUSE_EVENT, WINDOW_BUFFER_SIZE_EVENT,
        };

        // SAFETY: each union field is read only under its matching EventType.
        unsafe {
            match u32::from(record.EventType) {
                KEY_EVENT => InputRecord::Key {
                    virtual_key_code: record.Event.KeyEvent.wVirtualKeyCode,
                    unicode_char: record.Event.KeyEvent.uChar.UnicodeChar,
                },
                MOUSE_EVENT => InputRecord::Mouse,
                FOCUS_EVENT => InputRecord::Focus(record.Event.FocusEvent.bSetFocus.as_bool()),
                WINDOW_BUFFER_SIZE_EVENT => {
                    let size = record.Event.WindowBufferSizeEvent.dwSize;
                    InputRecord::Resize {
                        columns: size.X.max(0) as u16,
                        rows: size.Y.max(0) as u16,
                    }
                }
                _ => InputRecord::Other,
            }
        }
    }
}
