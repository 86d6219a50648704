// ── Platform abstraction layer ────────────────────────────────────────────────
//
// This module defines the interface that the rest of the codebase uses to
// talk to the OS.  No `unsafe` lives here; all Win32 / NT FFI is confined to
// the `win32` sub-module and never leaks outward — the scan core sees only
// the `scan::HandleOps` trait, which `win32::handles` implements.

pub mod win32;
