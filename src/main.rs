// ── Safety policy ────────────────────────────────────────────────────────────
// Unsafe code is forbidden everywhere except:
//   • `platform::win32` – Win32 / NT FFI (handle table, duplication, tray)
// Each unsafe block in that module MUST carry a `// SAFETY:` comment.
#![deny(unsafe_code)]

// Release builds run as a GUI application (no console window).
// Debug builds keep the console attached for test runs and tooling.
#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

mod error;
mod platform;
mod scan;

fn main() {
    platform::win32::dbgout::init();

    if let Err(e) = platform::win32::tray::run() {
        // Startup failed before or during the message loop — most commonly
        // missing privileges for the system handle-table query.
        // Show a modal error dialog — the only safe output path in a GUI app.
        log::warn!("startup failed: {e}");
        platform::win32::tray::show_error_dialog(&e.to_string());
        std::process::exit(1);
    }
}
