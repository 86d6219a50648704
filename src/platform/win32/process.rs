// ── Process enumeration ───────────────────────────────────────────────────────
//
// Resolves the OS process list via a Toolhelp snapshot.  Ran fresh at the
// start of every scan cycle; nothing is cached.

#![allow(unsafe_code)]

use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};

use super::handles::OwnedHandle;
use crate::scan::ProcessIdentity;

/// Every process currently running, with pid and executable base name.
///
/// A failed snapshot yields an empty list; the scan cycle then takes its
/// target-not-running fast path and retries on the next tick.
pub(crate) fn running_processes() -> Vec<ProcessIdentity> {
    // SAFETY: CreateToolhelp32Snapshot has no preconditions; failure surfaces
    // as Err and no handle is produced.
    let Ok(snapshot) = (unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }) else {
        return Vec::new();
    };
    // Closed on every return path below.
    let snapshot = OwnedHandle::from_raw(snapshot);

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };

    let mut out = Vec::new();
    // SAFETY: snapshot is a live toolhelp handle; entry.dwSize is initialised
    // as Process32FirstW requires; entry outlives the call.
    if unsafe { Process32FirstW(snapshot.as_raw(), &mut entry) }.is_err() {
        return out;
    }
    loop {
        out.push(ProcessIdentity {
            pid: entry.th32ProcessID,
            image_base_name: image_from_buf(&entry.szExeFile),
        });
        // SAFETY: same invariants as Process32FirstW above.
        if unsafe { Process32NextW(snapshot.as_raw(), &mut entry) }.is_err() {
            break;
        }
    }
    out
}

/// Convert a null-terminated UTF-16 buffer to a `String`.
fn image_from_buf(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    String::from_utf16_lossy(&buf[..len])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_stops_at_the_null_terminator() {
        let mut buf = [0u16; 16];
        for (i, u) in "D2R.exe".encode_utf16().enumerate() {
            buf[i] = u;
        }
        buf[8] = u16::from(b'X'); // garbage past the terminator
        assert_eq!(image_from_buf(&buf), "D2R.exe");
    }

    #[test]
    fn unterminated_image_name_uses_the_whole_buffer() {
        let buf: Vec<u16> = "abc".encode_utf16().collect();
        assert_eq!(image_from_buf(&buf), "abc");
    }
}
