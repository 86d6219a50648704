// ── Central error type ────────────────────────────────────────────────────────
//
// All fallible operations return `error::Result<T>`.  Only the fatal scan
// error ever crosses the core boundary (a failed system handle-table query
// or a failure to bring the shell up); per-entry failures inside a scan
// cycle are absorbed as `Option`/`bool` outcomes and never become a
// `CloserError`.

/// Every error the program can produce.
#[derive(Debug)]
pub enum CloserError {
    /// A Win32 API call returned a failure code.
    Win32 {
        /// The name of the failing function, for display purposes.
        function: &'static str,
        /// The raw Win32 error code (`GetLastError()` value) or HRESULT.
        code: u32,
    },

    /// An NT system service returned a failing NTSTATUS that is not part of
    /// the grow-on-too-small retry protocol.
    NtStatus {
        /// The name of the failing function, for display purposes.
        function: &'static str,
        /// The raw NTSTATUS value.
        status: i32,
    },
}

impl std::fmt::Display for CloserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Win32 { function, code } => {
                write!(f, "{function} failed (error {code:#010x})")
            }
            Self::NtStatus { function, status } => {
                write!(f, "{function} failed (NTSTATUS {status:#010x})")
            }
        }
    }
}

impl std::error::Error for CloserError {}

// Convert a windows-crate error (HRESULT) directly into a CloserError so that
// `?` can be used on `windows::core::Result<T>` throughout the platform module.
impl From<windows::core::Error> for CloserError {
    fn from(e: windows::core::Error) -> Self {
        // HRESULT.0 is i32; reinterpret bits as u32 for display purposes.
        // Win32 errors appear as 0x8007xxxx HRESULTs.
        Self::Win32 {
            function: "windows",
            code: e.code().0 as u32,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CloserError>;
