// ── Debugger-channel logger ───────────────────────────────────────────────────
//
// The binary runs under the windows subsystem, so there is no console to
// print to.  Log records go out through `OutputDebugStringW`, where DebugView
// or an attached debugger picks them up.

#![allow(unsafe_code)]

use log::{LevelFilter, Log, Metadata, Record};
use windows::core::PCWSTR;
use windows::Win32::System::Diagnostics::Debug::OutputDebugStringW;

struct DebugOutputLogger;

static LOGGER: DebugOutputLogger = DebugOutputLogger;

/// Install the logger.  Call once, before anything logs.
///
/// Debug builds include per-entry `debug!` records (skipped handles, dropped
/// ticks); release builds keep `info!` and above.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }
}

impl Log for DebugOutputLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let line = format!("[d2r-handle-closer] {:<5} {}\r\n", record.level(), record.args());
        let wide: Vec<u16> = line.encode_utf16().chain(std::iter::once(0)).collect();

        // SAFETY: wide is a valid null-terminated UTF-16 string that remains
        // allocated for the duration of the OutputDebugStringW call.
        unsafe { OutputDebugStringW(PCWSTR(wide.as_ptr())) };
    }

    fn flush(&self) {}
}
