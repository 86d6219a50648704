// ── Native HandleOps ──────────────────────────────────────────────────────────
//
// Implements the `scan::HandleOps` capability trait against the real OS:
// handle-table snapshot, cross-process name resolution, and remote close via
// duplicate-with-close-source.  Every kernel handle acquired here is held by
// an RAII wrapper so it is released exactly once on every exit path.

#![allow(unsafe_code)]

use std::ffi::c_void;

use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_CLOSE_SOURCE, DUPLICATE_HANDLE_OPTIONS,
    DUPLICATE_SAME_ACCESS, HANDLE, STATUS_BUFFER_OVERFLOW, STATUS_INFO_LENGTH_MISMATCH,
};
use windows::Win32::System::Threading::{
    GetCurrentProcess, OpenProcess, PROCESS_DUP_HANDLE, PROCESS_QUERY_LIMITED_INFORMATION,
};

use super::ntdll::{
    decode_handle_table, decode_object_name, query_with_growth, NtQueryObject,
    NtQuerySystemInformation, OBJECT_NAME_INFORMATION, SYSTEM_EXTENDED_HANDLE_INFORMATION,
};
use super::process;
use crate::error::Result;
use crate::scan::{HandleOps, HandleTableEntry, ProcessIdentity};

// ── Buffer sizing ─────────────────────────────────────────────────────────────

/// First-guess size for the system handle table (it routinely needs megabytes;
/// the grow routine takes it the rest of the way).
const TABLE_BUF_INITIAL: usize = 0x10000;

/// First-guess size for an object-name query.
const NAME_BUF_INITIAL: usize = 0x1000;

// ── RAII wrappers ─────────────────────────────────────────────────────────────

/// A kernel handle owned by this process; closed exactly once on drop.
pub(crate) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub(crate) fn from_raw(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub(crate) fn as_raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        // SAFETY: self.0 was obtained from a successful handle-returning API
        // and ownership was never given away; this is the single CloseHandle
        // for it.  A failure here leaves nothing to recover.
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// An open handle to another process, holding exactly the rights the scan
/// needs: duplicate-handle plus limited query.
pub(crate) struct ProcessHandle(OwnedHandle);

impl ProcessHandle {
    /// `None` (process exited, access denied) is a normal per-entry outcome.
    fn open(pid: u32) -> Option<Self> {
        // SAFETY: OpenProcess has no memory preconditions; a failing call
        // surfaces as Err and no handle is produced.
        let handle = unsafe {
            OpenProcess(
                PROCESS_DUP_HANDLE | PROCESS_QUERY_LIMITED_INFORMATION,
                false.into(),
                pid,
            )
        }
        .ok()?;
        Some(Self(OwnedHandle::from_raw(handle)))
    }

    fn as_raw(&self) -> HANDLE {
        self.0.as_raw()
    }
}

// ── Duplication helper ────────────────────────────────────────────────────────

/// Issue `DuplicateHandle` from `source`'s table into the current process.
///
/// `Some` on API success, carrying the local duplicate — which can be a null
/// handle for a close-source call that requested no access.  The caller owns
/// any non-null result.
fn duplicate_into_current(
    source: &ProcessHandle,
    handle_value: usize,
    options: DUPLICATE_HANDLE_OPTIONS,
) -> Option<HANDLE> {
    let mut local = HANDLE::default();

    // SAFETY: source holds PROCESS_DUP_HANDLE; handle_value is interpreted by
    // the kernel inside source's handle table, never dereferenced here.
    // GetCurrentProcess returns the process pseudo-handle, which needs no
    // close.  `local` outlives the call.
    let ok = unsafe {
        DuplicateHandle(
            source.as_raw(),
            HANDLE(handle_value as *mut c_void),
            GetCurrentProcess(),
            &mut local,
            0,
            false.into(),
            options,
        )
    };

    ok.ok().map(|()| local)
}

// ── Capability implementation ─────────────────────────────────────────────────

pub(crate) struct Win32HandleOps;

impl HandleOps for Win32HandleOps {
    type Process = ProcessHandle;

    fn running_processes(&self) -> Vec<ProcessIdentity> {
        process::running_processes()
    }

    fn snapshot_handle_table(&self) -> Result<Vec<HandleTableEntry>> {
        let buf = query_with_growth(
            "NtQuerySystemInformation",
            TABLE_BUF_INITIAL,
            &[STATUS_INFO_LENGTH_MISMATCH],
            |buf, needed| {
                // SAFETY: buf is valid for writes of buf.len() bytes for the
                // duration of the call; needed is a valid out pointer.
                unsafe {
                    NtQuerySystemInformation(
                        SYSTEM_EXTENDED_HANDLE_INFORMATION,
                        buf.as_mut_ptr().cast(),
                        buf.len() as u32,
                        needed,
                    )
                }
            },
        )?;
        Ok(decode_handle_table(&buf))
    }

    fn open_for_duplication(&self, pid: u32) -> Option<ProcessHandle> {
        ProcessHandle::open(pid)
    }

    fn object_name(&self, process: &ProcessHandle, entry: &HandleTableEntry) -> Option<String> {
        // Duplicate with same access so the duplicate can be queried locally.
        let local = duplicate_into_current(process, entry.handle_value, DUPLICATE_SAME_ACCESS)?;
        if local.is_invalid() {
            return None;
        }
        // Closed when `local` goes out of scope — on the query-failure paths
        // just as on success.
        let local = OwnedHandle::from_raw(local);

        // NtQueryObject reports too-small with either status depending on the
        // object type; both mean retry.  Any other failure is "no name":
        // names are best-effort and transiently unqueryable objects are normal.
        let buf = query_with_growth(
            "NtQueryObject",
            NAME_BUF_INITIAL,
            &[STATUS_INFO_LENGTH_MISMATCH, STATUS_BUFFER_OVERFLOW],
            |buf, needed| {
                // SAFETY: local is a live handle owned by this process; buf is
                // valid for writes of buf.len() bytes for the call's duration.
                unsafe {
                    NtQueryObject(
                        local.as_raw(),
                        OBJECT_NAME_INFORMATION,
                        buf.as_mut_ptr().cast(),
                        buf.len() as u32,
                        needed,
                    )
                }
            },
        )
        .ok()?;

        decode_object_name(&buf)
    }

    fn close_in_owner(&self, process: &ProcessHandle, entry: &HandleTableEntry) -> bool {
        // DUPLICATE_CLOSE_SOURCE closes the handle inside the owning process
        // as a side effect of the duplication.
        match duplicate_into_current(process, entry.handle_value, DUPLICATE_CLOSE_SOURCE) {
            Some(byproduct) => {
                // The local duplicate is an unwanted by-product of the close;
                // drop it immediately.
                if !byproduct.is_invalid() {
                    drop(OwnedHandle::from_raw(byproduct));
                }
                true
            }
            None => false,
        }
    }
}
