// ── NT query layer ────────────────────────────────────────────────────────────
//
// The one place where opaque kernel buffers are interpreted.  Everything here
// validates lengths before touching bytes and hands out only owned,
// bounds-checked values; callers never see a raw pointer.
//
// `NtQuerySystemInformation(SystemExtendedHandleInformation)` and
// `NtQueryObject(ObjectNameInformation)` are not surfaced by the windows
// crate, so they are declared against ntdll directly.  Struct layouts follow
// the documented x64 shapes (SYSTEM_HANDLE_INFORMATION_EX and friends).

#![allow(unsafe_code)]

use std::ffi::c_void;

use windows::Win32::Foundation::{HANDLE, NTSTATUS, STATUS_SUCCESS, UNICODE_STRING};

use crate::error::{CloserError, Result};
use crate::scan::HandleTableEntry;

// ── NT constants ──────────────────────────────────────────────────────────────

/// SYSTEM_INFORMATION_CLASS value for the extended (64-bit-clean) handle table.
pub(crate) const SYSTEM_EXTENDED_HANDLE_INFORMATION: u32 = 64;

/// OBJECT_INFORMATION_CLASS value for ObjectNameInformation.
pub(crate) const OBJECT_NAME_INFORMATION: u32 = 1;

// ── FFI ───────────────────────────────────────────────────────────────────────

#[link(name = "ntdll.dll", kind = "raw-dylib", modifiers = "+verbatim")]
extern "system" {
    pub(crate) fn NtQuerySystemInformation(
        system_information_class: u32,
        system_information: *mut c_void,
        system_information_length: u32,
        return_length: *mut u32,
    ) -> NTSTATUS;

    pub(crate) fn NtQueryObject(
        handle: HANDLE,
        object_information_class: u32,
        object_information: *mut c_void,
        object_information_length: u32,
        return_length: *mut u32,
    ) -> NTSTATUS;
}

// ── Raw kernel structs ────────────────────────────────────────────────────────

/// Header of the SystemExtendedHandleInformation buffer; followed
/// immediately by `number_of_handles` contiguous fixed-size entries.
#[repr(C)]
pub(crate) struct SystemHandleInformationEx {
    pub(crate) number_of_handles: usize,
    pub(crate) reserved: usize,
}

/// SYSTEM_HANDLE_TABLE_ENTRY_INFO_EX.
#[repr(C)]
pub(crate) struct SystemHandleTableEntryInfoEx {
    pub(crate) object: *const c_void,
    pub(crate) unique_process_id: usize,
    pub(crate) handle_value: usize,
    pub(crate) granted_access: u32,
    pub(crate) creator_back_trace_index: u16,
    pub(crate) object_type_index: u16,
    pub(crate) handle_attributes: u32,
    pub(crate) reserved: u32,
}

// ── Grow-on-too-small query ───────────────────────────────────────────────────

/// Run a variable-length NT query, growing the buffer until it fits.
///
/// `query` receives the buffer and a slot for the reported required size.
/// On any status in `retry_statuses` the buffer grows to at least the
/// reported size (doubling as a floor) and the query is reissued; there is
/// no retry bound besides success or a genuine error.  Any other failing
/// status propagates as the fatal `CloserError::NtStatus`.
pub(crate) fn query_with_growth(
    function: &'static str,
    initial_len: usize,
    retry_statuses: &[NTSTATUS],
    mut query: impl FnMut(&mut [u8], &mut u32) -> NTSTATUS,
) -> Result<Vec<u8>> {
    let mut len = initial_len.max(1);

    loop {
        let mut buf = vec![0u8; len];
        let mut needed: u32 = 0;

        let status = query(&mut buf, &mut needed);
        if status == STATUS_SUCCESS {
            return Ok(buf);
        }
        if retry_statuses.contains(&status) {
            // The kernel's reported size can already be stale by the next
            // call (the handle table keeps changing), hence the doubling floor.
            len = (len * 2).max(needed as usize);
            continue;
        }
        return Err(CloserError::NtStatus {
            function,
            status: status.0,
        });
    }
}

// ── Positional decoders ───────────────────────────────────────────────────────

/// Decode a SystemExtendedHandleInformation buffer into owned entries.
///
/// The entry count is clamped to what the buffer can actually hold, so a
/// short or corrupt buffer can never cause an out-of-bounds read.
pub(crate) fn decode_handle_table(buf: &[u8]) -> Vec<HandleTableEntry> {
    const HEADER: usize = std::mem::size_of::<SystemHandleInformationEx>();
    const ENTRY: usize = std::mem::size_of::<SystemHandleTableEntryInfoEx>();

    if buf.len() < HEADER {
        return Vec::new();
    }

    // SAFETY: buf holds at least HEADER bytes (checked above); the struct is
    // plain old data and read_unaligned has no alignment requirement.
    let header: SystemHandleInformationEx =
        unsafe { std::ptr::read_unaligned(buf.as_ptr().cast()) };

    let available = (buf.len() - HEADER) / ENTRY;
    let count = header.number_of_handles.min(available);

    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        // SAFETY: HEADER + (i + 1) * ENTRY <= buf.len() for all i < count by
        // the clamp above; plain-old-data unaligned read.
        let raw: SystemHandleTableEntryInfoEx =
            unsafe { std::ptr::read_unaligned(buf.as_ptr().add(HEADER + i * ENTRY).cast()) };

        entries.push(HandleTableEntry {
            owner_pid: raw.unique_process_id as u32,
            handle_value: raw.handle_value,
            object_address: raw.object as usize,
            granted_access: raw.granted_access,
            object_type_index: raw.object_type_index,
            attributes: raw.handle_attributes,
        });
    }
    entries
}

/// Decode an ObjectNameInformation buffer (a counted UTF-16 string).
///
/// The buffer starts with a `UNICODE_STRING` whose `Buffer` points back into
/// the same allocation; exactly `Length / 2` code units are converted.
/// Returns `None` — the normal "no name" outcome — for a zero length, a null
/// pointer, or a pointer/length pair that does not fall inside `buf`.
pub(crate) fn decode_object_name(buf: &[u8]) -> Option<String> {
    if buf.len() < std::mem::size_of::<UNICODE_STRING>() {
        return None;
    }

    // SAFETY: buf holds at least a UNICODE_STRING (checked above);
    // plain-old-data unaligned read.
    let us: UNICODE_STRING = unsafe { std::ptr::read_unaligned(buf.as_ptr().cast()) };

    if us.Length == 0 || us.Buffer.is_null() {
        return None;
    }

    // The string must lie wholly within the query buffer; anything else
    // means a malformed response and is treated as unnamed.
    let offset = (us.Buffer.0 as usize).checked_sub(buf.as_ptr() as usize)?;
    let byte_len = usize::from(us.Length);
    if offset.checked_add(byte_len)? > buf.len() {
        return None;
    }

    let units: Vec<u16> = buf[offset..offset + byte_len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use windows::core::PWSTR;
    use windows::Win32::Foundation::{
        STATUS_ACCESS_DENIED, STATUS_BUFFER_OVERFLOW, STATUS_INFO_LENGTH_MISMATCH,
    };

    // ── grow routine ──────────────────────────────────────────────────────────

    #[test]
    fn growth_succeeds_immediately_when_buffer_fits() {
        let buf = query_with_growth("test", 64, &[STATUS_INFO_LENGTH_MISMATCH], |b, _| {
            assert_eq!(b.len(), 64);
            STATUS_SUCCESS
        })
        .unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn growth_retries_to_at_least_the_reported_size() {
        let calls = Cell::new(0u32);
        let buf = query_with_growth("test", 64, &[STATUS_INFO_LENGTH_MISMATCH], |b, needed| {
            calls.set(calls.get() + 1);
            if b.len() < 9000 {
                *needed = 9000;
                STATUS_INFO_LENGTH_MISMATCH
            } else {
                STATUS_SUCCESS
            }
        })
        .unwrap();

        assert_eq!(calls.get(), 2, "one too-small response, one success");
        assert!(buf.len() >= 9000);
    }

    // A retry status that reports no size still makes progress by doubling.
    #[test]
    fn growth_doubles_when_no_size_is_reported() {
        let buf = query_with_growth("test", 8, &[STATUS_BUFFER_OVERFLOW], |b, _| {
            if b.len() < 64 {
                STATUS_BUFFER_OVERFLOW
            } else {
                STATUS_SUCCESS
            }
        })
        .unwrap();
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn growth_propagates_any_other_status_as_fatal() {
        let err = query_with_growth("NtQuerySystemInformation", 64, &[STATUS_INFO_LENGTH_MISMATCH], |_, _| {
            STATUS_ACCESS_DENIED
        })
        .unwrap_err();

        match err {
            CloserError::NtStatus { function, status } => {
                assert_eq!(function, "NtQuerySystemInformation");
                assert_eq!(status, STATUS_ACCESS_DENIED.0);
            }
            other => panic!("expected NtStatus, got {other:?}"),
        }
    }

    // ── handle-table decoding ─────────────────────────────────────────────────

    fn push_bytes<T>(buf: &mut Vec<u8>, value: &T) {
        // SAFETY: T is a repr(C) plain-old-data struct in these tests; reading
        // its object representation as bytes is well defined.
        let bytes = unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
        };
        buf.extend_from_slice(bytes);
    }

    fn raw_entry(pid: usize, handle_value: usize) -> SystemHandleTableEntryInfoEx {
        SystemHandleTableEntryInfoEx {
            object: 0xFFFF_8000_DEAD_0000 as *const _,
            unique_process_id: pid,
            handle_value,
            granted_access: 0x001F_0003,
            creator_back_trace_index: 0,
            object_type_index: 17,
            handle_attributes: 0x2,
            reserved: 0,
        }
    }

    #[test]
    fn handle_table_decodes_header_then_contiguous_entries() {
        let mut buf = Vec::new();
        push_bytes(
            &mut buf,
            &SystemHandleInformationEx {
                number_of_handles: 2,
                reserved: 0,
            },
        );
        push_bytes(&mut buf, &raw_entry(4242, 0x1c8));
        push_bytes(&mut buf, &raw_entry(7, 0x4));

        let entries = decode_handle_table(&buf);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].owner_pid, 4242);
        assert_eq!(entries[0].handle_value, 0x1c8);
        assert_eq!(entries[0].granted_access, 0x001F_0003);
        assert_eq!(entries[0].object_type_index, 17);
        assert_eq!(entries[0].attributes, 0x2);
        assert_eq!(entries[1].owner_pid, 7);
    }

    // A count larger than the buffer can hold is clamped, never overread.
    #[test]
    fn handle_table_clamps_overstated_counts() {
        let mut buf = Vec::new();
        push_bytes(
            &mut buf,
            &SystemHandleInformationEx {
                number_of_handles: 5,
                reserved: 0,
            },
        );
        push_bytes(&mut buf, &raw_entry(4242, 0x1c8));

        assert_eq!(decode_handle_table(&buf).len(), 1);
    }

    #[test]
    fn handle_table_rejects_short_buffers() {
        assert!(decode_handle_table(&[]).is_empty());
        assert!(decode_handle_table(&[0u8; 4]).is_empty());
    }

    // ── object-name decoding ──────────────────────────────────────────────────

    /// Lay out a query-shaped buffer: UNICODE_STRING header, then the
    /// UTF-16 payload it points at.
    fn name_buffer(text: &str, length_override: Option<u16>) -> Vec<u8> {
        const HEADER: usize = std::mem::size_of::<UNICODE_STRING>();
        let units: Vec<u16> = text.encode_utf16().collect();
        let byte_len = (units.len() * 2) as u16;

        let mut buf = vec![0u8; HEADER + units.len() * 2];
        for (i, u) in units.iter().enumerate() {
            buf[HEADER + i * 2..HEADER + i * 2 + 2].copy_from_slice(&u.to_le_bytes());
        }

        let us = UNICODE_STRING {
            Length: length_override.unwrap_or(byte_len),
            MaximumLength: byte_len,
            // Points into buf, which is not reallocated after this point.
            Buffer: PWSTR(buf[HEADER..].as_ptr() as *mut u16),
        };
        // SAFETY: buf holds at least HEADER bytes; write_unaligned has no
        // alignment requirement and the struct is plain old data.
        unsafe { std::ptr::write_unaligned(buf.as_mut_ptr().cast(), us) };
        buf
    }

    #[test]
    fn object_name_decodes_exactly_length_over_two_units() {
        let buf = name_buffer(r"\Sessions\1\BaseNamedObjects\DiabloII Check For Other Instances", None);
        assert_eq!(
            decode_object_name(&buf).as_deref(),
            Some(r"\Sessions\1\BaseNamedObjects\DiabloII Check For Other Instances")
        );
    }

    // The byte length, not any terminator, bounds the conversion.
    #[test]
    fn object_name_honors_the_counted_length() {
        let buf = name_buffer("ABCDEF", Some(6)); // 3 code units
        assert_eq!(decode_object_name(&buf).as_deref(), Some("ABC"));
    }

    #[test]
    fn zero_length_name_is_none() {
        let buf = name_buffer("ignored", Some(0));
        assert_eq!(decode_object_name(&buf), None);
    }

    #[test]
    fn null_buffer_pointer_is_none() {
        let mut buf = vec![0u8; std::mem::size_of::<UNICODE_STRING>()];
        let us = UNICODE_STRING {
            Length: 8,
            MaximumLength: 8,
            Buffer: PWSTR::null(),
        };
        // SAFETY: buf holds exactly a UNICODE_STRING; unaligned POD write.
        unsafe { std::ptr::write_unaligned(buf.as_mut_ptr().cast(), us) };
        assert_eq!(decode_object_name(&buf), None);
    }

    // A length reaching past the buffer is a malformed response → None.
    #[test]
    fn out_of_bounds_name_is_rejected() {
        let buf = name_buffer("AB", Some(512));
        assert_eq!(decode_object_name(&buf), None);
    }

    #[test]
    fn short_buffer_is_none() {
        assert_eq!(decode_object_name(&[0u8; 4]), None);
    }
}
