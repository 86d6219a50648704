// ── Win32 platform implementation ─────────────────────────────────────────────
//
// This is the only module in the codebase where `unsafe` code is permitted.
// Every `unsafe` block MUST carry a `// SAFETY:` comment that states:
//   • which invariant makes the operation sound, and
//   • what the caller is responsible for maintaining.
//
// Nothing in this module is `pub` beyond what callers genuinely need; keep
// the unsafe surface as small as possible.

#![allow(unsafe_code)]

// ── Sub-modules ───────────────────────────────────────────────────────────────

pub mod dbgout; // log backend → OutputDebugStringW
pub mod tray; // hidden window, tray icon, timer-driven scan cycle

pub(crate) mod handles; // native HandleOps: snapshot, name resolution, remote close
pub(crate) mod ntdll; // NT query layer: FFI decls, grow routine, raw decoding
pub(crate) mod process; // pid enumeration via Toolhelp snapshot
