// ── Scan-and-close core ───────────────────────────────────────────────────────
//
// Pure safe Rust.  Everything OS-specific is reached through the `HandleOps`
// capability trait; the one native implementation lives in
// `platform::win32::handles` and the tests below run the same orchestration
// against a scripted fake.  No Win32 type appears in this module.

use std::cell::Cell;
use std::collections::HashSet;

use crate::error::Result;

// ── Target identity ───────────────────────────────────────────────────────────

/// Base name of the executable whose handles are scanned.
pub(crate) const TARGET_PROCESS: &str = "D2R.exe";

/// Exact NT object path of the single-instance check object.
pub(crate) const TARGET_OBJECT_PATH: &str =
    r"\Sessions\1\BaseNamedObjects\DiabloII Check For Other Instances";

/// What to look for: a process image name and the exact object path to close.
/// Fixed for the lifetime of the program.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TargetSpec {
    /// Executable base name, compared case-insensitively (Windows image
    /// names are case-insensitive).
    pub(crate) process_base_name: &'static str,
    /// NT object path, compared ordinally and case-sensitively.
    pub(crate) object_path: &'static str,
}

impl TargetSpec {
    pub(crate) fn d2r() -> Self {
        Self {
            process_base_name: TARGET_PROCESS,
            object_path: TARGET_OBJECT_PATH,
        }
    }
}

// ── Snapshot records ──────────────────────────────────────────────────────────

/// One row of the system-wide handle table, decoded into owned values.
///
/// `handle_value` is opaque and only meaningful inside the owning process's
/// handle table; the trait signatures below force every consumer to pair it
/// with an open handle to that process.  `object_address` is an opaque kernel
/// pointer used for nothing but display; it is never dereferenced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HandleTableEntry {
    pub(crate) owner_pid: u32,
    pub(crate) handle_value: usize,
    pub(crate) object_address: usize,
    pub(crate) granted_access: u32,
    pub(crate) object_type_index: u16,
    pub(crate) attributes: u32,
}

/// One running process, resolved fresh each cycle from the OS process list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProcessIdentity {
    pub(crate) pid: u32,
    /// Executable base name including extension, e.g. `"D2R.exe"`.
    pub(crate) image_base_name: String,
}

// ── Capability seam ───────────────────────────────────────────────────────────

/// The OS capabilities the scan cycle needs, and nothing more.
///
/// `Process` is an open handle to another process holding exactly the rights
/// required for handle duplication; implementations release it when the value
/// is dropped, which the orchestration loop relies on for its per-entry
/// cleanup guarantee.
pub(crate) trait HandleOps {
    type Process;

    /// Every process currently running, per the OS process list.
    fn running_processes(&self) -> Vec<ProcessIdentity>;

    /// The full, unfiltered system handle table at the time of the call.
    /// Any failure here is fatal for the current cycle.
    fn snapshot_handle_table(&self) -> Result<Vec<HandleTableEntry>>;

    /// Open `pid` with duplicate-handle and limited-query rights only.
    /// `None` (process exited, access denied) is a normal per-entry outcome.
    fn open_for_duplication(&self, pid: u32) -> Option<Self::Process>;

    /// Resolve the name of `entry`'s object by duplicating the handle into
    /// the current process and querying the duplicate.  `None` covers
    /// unnamed objects as well as every per-entry failure mode.
    fn object_name(&self, process: &Self::Process, entry: &HandleTableEntry) -> Option<String>;

    /// Close `entry`'s handle inside its owning process
    /// (duplicate-with-close-source).  Returns whether the close took effect.
    fn close_in_owner(&self, process: &Self::Process, entry: &HandleTableEntry) -> bool;
}

// ── Orchestration ─────────────────────────────────────────────────────────────

/// Run one full scan-and-close cycle; returns how many handles were closed.
///
/// Per-entry failures (process gone, duplication refused, unnamed object,
/// name mismatch) skip the entry and keep scanning.  Only a failed
/// handle-table snapshot aborts the cycle; the caller retries on its next
/// scheduled tick.
pub(crate) fn close_matching_handles<O: HandleOps>(ops: &O, spec: &TargetSpec) -> Result<u32> {
    let pids: HashSet<u32> = ops
        .running_processes()
        .into_iter()
        .filter(|p| p.image_base_name.eq_ignore_ascii_case(spec.process_base_name))
        .map(|p| p.pid)
        .collect();

    // Fast path: target not running — skip the system-wide scan entirely.
    if pids.is_empty() {
        return Ok(0);
    }

    let table = ops.snapshot_handle_table()?;
    let mut closed = 0u32;

    for entry in &table {
        // pid filter precedes any per-entry syscall: entries owned by other
        // processes are never opened.
        if !pids.contains(&entry.owner_pid) {
            continue;
        }

        let Some(process) = ops.open_for_duplication(entry.owner_pid) else {
            log::debug!(
                "pid {}: open failed, skipping handle {:#x}",
                entry.owner_pid,
                entry.handle_value
            );
            continue;
        };

        let Some(name) = ops.object_name(&process, entry) else {
            continue;
        };
        if name != spec.object_path {
            continue;
        }

        if ops.close_in_owner(&process, entry) {
            log::info!(
                "closed handle {:#x} (object {:#x}) in pid {}",
                entry.handle_value,
                entry.object_address,
                entry.owner_pid
            );
            closed += 1;
        } else {
            log::debug!(
                "pid {}: close-source duplication failed for handle {:#x} (access {:#x})",
                entry.owner_pid,
                entry.handle_value,
                entry.granted_access
            );
        }
        // `process` drops here — the per-entry process handle is released on
        // every path out of the iteration.
    }

    Ok(closed)
}

// ── Single-flight guard ───────────────────────────────────────────────────────

/// Explicit non-reentrancy guard for the timer-driven cycle.
///
/// The message loop already serialises `WM_TIMER` ticks, but the closed-count
/// accumulator and the remote handle-table mutations are not designed for
/// overlap, so the tick handler states the invariant explicitly: a tick that
/// arrives while a cycle is in flight is skipped, not queued.
pub(crate) struct SingleFlight(Cell<bool>);

impl SingleFlight {
    pub(crate) fn new() -> Self {
        Self(Cell::new(false))
    }

    /// Claim the slot.  `None` means a cycle is already running and this
    /// tick should be dropped.
    pub(crate) fn try_begin(&self) -> Option<SingleFlightGuard<'_>> {
        if self.0.replace(true) {
            None
        } else {
            Some(SingleFlightGuard(&self.0))
        }
    }
}

/// Releases the slot when dropped, including on panic-free early returns.
pub(crate) struct SingleFlightGuard<'a>(&'a Cell<bool>);

impl Drop for SingleFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
