// ── Tray shell ────────────────────────────────────────────────────────────────
//
// Responsibilities in this file (unsafe confined here):
//   • Register the (never-shown) host window class and create the window.
//   • Install the notification-area icon and its callback message.
//   • Run the Win32 message loop.
//   • Dispatch WM_TIMER (scan cycle), the tray callback, WM_COMMAND
//     (toggle / exit), and WM_DESTROY (teardown).
//   • Expose a safe error-dialog helper for use by main().
//
// The scan itself lives in `scan::close_matching_handles`; this file only
// schedules it and displays its result count.

#![allow(unsafe_code)]

use std::cell::RefCell;

use windows::{
    core::{w, PCWSTR},
    Win32::{
        Foundation::{GetLastError, HINSTANCE, HWND, LPARAM, LRESULT, POINT, WPARAM},
        System::LibraryLoader::GetModuleHandleW,
        UI::{
            Shell::{
                Shell_NotifyIconW, NIF_ICON, NIF_INFO, NIF_MESSAGE, NIF_TIP, NIIF_INFO, NIM_ADD,
                NIM_DELETE, NIM_MODIFY, NOTIFYICONDATAW, NOTIFYICONDATAW_0,
            },
            WindowsAndMessaging::{
                AppendMenuW, CreatePopupMenu, CreateWindowExW, DefWindowProcW, DestroyMenu,
                DestroyWindow, DispatchMessageW, GetCursorPos, GetMessageW, KillTimer, LoadIconW,
                MessageBoxW, PostQuitMessage, RegisterClassExW, SetForegroundWindow, SetTimer,
                TrackPopupMenu, TranslateMessage, HMENU, IDI_SHIELD, MB_ICONERROR, MB_OK,
                MF_SEPARATOR, MF_STRING, MSG, TPM_RIGHTBUTTON, WINDOW_EX_STYLE, WM_APP,
                WM_COMMAND, WM_DESTROY, WM_RBUTTONUP, WM_TIMER, WNDCLASSEXW, WS_OVERLAPPED,
            },
        },
    },
};

use super::handles::Win32HandleOps;
use crate::error::{CloserError, Result};
use crate::scan::{self, SingleFlight, TargetSpec};

// ── Window identity ───────────────────────────────────────────────────────────

/// Atom name used to register the (hidden) host window class.
const CLASS_NAME: PCWSTR = w!("D2RHandleCloserWindow");

/// Window title; never shown, but visible to tooling.
const APP_TITLE: PCWSTR = w!("D2R Handle Closer");

// ── Tray identity ─────────────────────────────────────────────────────────────

/// Callback message the shell sends for tray-icon mouse events.
const WM_TRAYICON: u32 = WM_APP + 1;

const TRAY_ICON_ID: u32 = 1;

const TOOLTIP_ON: &str = "D2R Handle Closer (On)";
const TOOLTIP_OFF: &str = "D2R Handle Closer (Off)";
const BALLOON_TITLE: &str = "D2R Handle Closer";
const BALLOON_TIMEOUT_MS: u32 = 2000;

// ── Menu command IDs ──────────────────────────────────────────────────────────

const IDM_TOGGLE: usize = 1001;
const IDM_EXIT: usize = 1002;

// ── Polling ───────────────────────────────────────────────────────────────────

const TIMER_ID: usize = 1;
const POLL_INTERVAL_MS: u32 = 3000;

// ── Shell state ───────────────────────────────────────────────────────────────

/// Everything the tick handler needs, owned by the UI thread.
struct ShellState {
    /// User toggle; ticks are ignored while paused.
    enabled: bool,
    /// Explicit non-reentrancy guard for the scan cycle.
    flight: SingleFlight,
    ops: Win32HandleOps,
    spec: TargetSpec,
}

thread_local! {
    // The window procedure has no state parameter; the shell state lives in
    // a thread-local because everything here runs on the one UI thread.
    static STATE: RefCell<Option<ShellState>> = const { RefCell::new(None) };
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Register the host window class, create the hidden window, install the
/// tray icon and polling timer, and drive the message loop until the user
/// exits from the tray menu.
pub(crate) fn run() -> Result<()> {
    // SAFETY: GetModuleHandleW(None) returns the .exe's own HMODULE, which is
    // always valid for the process lifetime and never fails in practice.
    let hmodule = unsafe { GetModuleHandleW(None) }.map_err(CloserError::from)?;
    let hinstance = HINSTANCE(hmodule.0);

    register_class(hinstance)?;
    let hwnd = create_window(hinstance)?;

    add_tray_icon(hwnd)?;

    STATE.with(|s| {
        *s.borrow_mut() = Some(ShellState {
            enabled: true,
            flight: SingleFlight::new(),
            ops: Win32HandleOps,
            spec: TargetSpec::d2r(),
        });
    });

    // SAFETY: hwnd was just created on this thread; TIMER_ID identifies the
    // timer within this window; no TIMERPROC — ticks arrive as WM_TIMER.
    let timer = unsafe { SetTimer(hwnd, TIMER_ID, POLL_INTERVAL_MS, None) };
    if timer == 0 {
        return Err(last_error("SetTimer"));
    }

    log::info!(
        "monitoring {} for {:?} every {} ms",
        scan::TARGET_PROCESS,
        scan::TARGET_OBJECT_PATH,
        POLL_INTERVAL_MS
    );

    message_loop()
}

/// Show a modal error dialog with the given message.
///
/// Safe to call from any context; performs the UTF-16 conversion internally.
/// Used by `main()` when `run()` returns an error (most commonly: started
/// without the privileges the handle-table query needs).
pub(crate) fn show_error_dialog(message: &str) {
    let msg_wide: Vec<u16> = message.encode_utf16().chain(std::iter::once(0)).collect();

    // SAFETY: msg_wide is a valid null-terminated UTF-16 string that remains
    // allocated for the duration of the MessageBoxW call.
    // HWND::default() (null) means the dialog has no owner window.
    // Return value (button pressed) is intentionally unused for an error dialog.
    unsafe {
        let _ = MessageBoxW(
            HWND::default(),
            PCWSTR(msg_wide.as_ptr()),
            w!("D2R Handle Closer — Fatal Error"),
            MB_OK | MB_ICONERROR,
        );
    }
}

// ── Window class registration ─────────────────────────────────────────────────

fn register_class(hinstance: HINSTANCE) -> Result<()> {
    // Minimal class: the window is never shown, so no icon, cursor, brush,
    // or redraw styles are needed.
    let wndclass = WNDCLASSEXW {
        // WNDCLASSEXW is ~72 bytes; the cast to u32 is always lossless.
        cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
        lpfnWndProc: Some(wnd_proc),
        hInstance: hinstance,
        lpszClassName: CLASS_NAME,
        ..Default::default()
    };

    // SAFETY: wndclass is fully initialised; CLASS_NAME is a valid
    // null-terminated UTF-16 string literal.
    let atom = unsafe { RegisterClassExW(&wndclass) };
    if atom == 0 {
        return Err(last_error("RegisterClassExW"));
    }

    Ok(())
}

// ── Window creation ───────────────────────────────────────────────────────────

fn create_window(hinstance: HINSTANCE) -> Result<HWND> {
    // SAFETY: CLASS_NAME was just registered; hinstance is the exe's module.
    // The window is created hidden (no ShowWindow call ever follows) and
    // exists only to receive tray, timer, and menu messages.
    let hwnd = unsafe {
        CreateWindowExW(
            WINDOW_EX_STYLE(0),
            CLASS_NAME,
            APP_TITLE,
            WS_OVERLAPPED,
            0,
            0,
            0,
            0,
            HWND::default(),
            HMENU::default(),
            hinstance,
            None,
        )
    };

    if hwnd == HWND::default() {
        return Err(last_error("CreateWindowExW"));
    }

    Ok(hwnd)
}

// ── Message loop ──────────────────────────────────────────────────────────────

fn message_loop() -> Result<()> {
    let mut msg = MSG::default();

    loop {
        // SAFETY: &mut msg is a valid MSG pointer; HWND::default() retrieves
        // messages for all windows on this thread; 0,0 filter accepts all.
        let ret = unsafe { GetMessageW(&mut msg, HWND::default(), 0, 0) };

        match ret.0 {
            // GetMessageW returns -1 on error.
            -1 => return Err(last_error("GetMessageW")),
            // Returns 0 when WM_QUIT is retrieved — exit the loop cleanly.
            0 => break,
            // Any other value: a normal message to dispatch.
            _ => unsafe {
                // SAFETY: msg was populated by a successful GetMessageW call.
                // TranslateMessage return value and DispatchMessageW's LRESULT
                // are intentionally unused.
                let _ = TranslateMessage(&msg);
                let _ = DispatchMessageW(&msg);
            },
        }
    }

    Ok(())
}

// ── Window procedure ──────────────────────────────────────────────────────────

// SAFETY: wnd_proc is registered as lpfnWndProc in WNDCLASSEXW.
// Windows guarantees that hwnd, msg, wparam, and lparam are valid for the
// lifetime of this call; we must not store hwnd beyond the message handler.
unsafe extern "system" fn wnd_proc(
    hwnd: HWND,
    msg: u32,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    match msg {
        // ── Scan cycle ────────────────────────────────────────────────────────
        WM_TIMER => {
            on_tick(hwnd);
            LRESULT(0)
        }

        // ── Tray icon events ──────────────────────────────────────────────────
        WM_TRAYICON => {
            // For NOTIFYICONDATAW without NIF_SHOWTIP versioning, lParam is
            // the mouse message that occurred over the icon.
            if lparam.0 as u32 & 0xFFFF == WM_RBUTTONUP {
                show_tray_menu(hwnd);
            }
            LRESULT(0)
        }

        // ── Commands ──────────────────────────────────────────────────────────
        WM_COMMAND => {
            // Low word of WPARAM is the command identifier.
            let cmd_id = wparam.0 & 0xFFFF;

            match cmd_id {
                IDM_TOGGLE => {
                    toggle_monitoring(hwnd);
                    LRESULT(0)
                }

                IDM_EXIT => {
                    // SAFETY: hwnd is the window being closed; DestroyWindow
                    // triggers WM_DESTROY, which posts WM_QUIT below.
                    let _ = DestroyWindow(hwnd);
                    LRESULT(0)
                }

                _ => DefWindowProcW(hwnd, msg, wparam, lparam),
            }
        }

        // ── Teardown ──────────────────────────────────────────────────────────
        WM_DESTROY => {
            // SAFETY: hwnd still identifies this window during WM_DESTROY;
            // the timer and tray icon are both keyed to it.
            let _ = KillTimer(hwnd, TIMER_ID);
            remove_tray_icon(hwnd);
            STATE.with(|s| *s.borrow_mut() = None);
            // SAFETY: PostQuitMessage with exit code 0 is always safe to call
            // from WM_DESTROY. It posts WM_QUIT to the thread's message queue.
            PostQuitMessage(0);
            LRESULT(0)
        }

        // Default processing for all unhandled messages.
        // SAFETY: hwnd and message parameters are valid — provided by Windows.
        _ => DefWindowProcW(hwnd, msg, wparam, lparam),
    }
}

// ── Tick handler ──────────────────────────────────────────────────────────────

/// Run one scan cycle, single-flight.  Fatal errors are logged and dropped —
/// the shell never exits on a failed cycle; the next tick retries.
fn on_tick(hwnd: HWND) {
    let outcome = STATE.with(|s| {
        let state = s.borrow();
        let state = state.as_ref()?;
        if !state.enabled {
            return None;
        }
        let _guard = state.flight.try_begin().or_else(|| {
            log::debug!("previous scan cycle still in flight; tick skipped");
            None
        })?;
        Some(scan::close_matching_handles(&state.ops, &state.spec))
    });

    match outcome {
        None | Some(Ok(0)) => {}
        Some(Ok(closed)) => {
            log::info!("cycle closed {closed} matching handle(s)");
            show_balloon(hwnd, closed);
        }
        Some(Err(e)) => log::warn!("scan cycle failed: {e}"),
    }
}

// ── Toggle ────────────────────────────────────────────────────────────────────

fn toggle_monitoring(hwnd: HWND) {
    let enabled = STATE.with(|s| {
        let mut state = s.borrow_mut();
        let Some(state) = state.as_mut() else {
            return true;
        };
        state.enabled = !state.enabled;
        state.enabled
    });

    update_tray_tip(hwnd, enabled);
    log::info!("monitoring {}", if enabled { "resumed" } else { "paused" });
}

// ── Tray menu ─────────────────────────────────────────────────────────────────

fn show_tray_menu(hwnd: HWND) {
    let enabled = STATE.with(|s| s.borrow().as_ref().map_or(true, |st| st.enabled));
    let toggle_label: Vec<u16> = if enabled { "Stop monitoring" } else { "Start monitoring" }
        .encode_utf16()
        .chain(std::iter::once(0))
        .collect();

    // SAFETY: CreatePopupMenu has no preconditions.  toggle_label outlives
    // the AppendMenuW call.  SetForegroundWindow before TrackPopupMenu is the
    // documented requirement for the menu to dismiss on an outside click.
    // The menu is destroyed on every path out of this block.
    unsafe {
        let Ok(menu) = CreatePopupMenu() else { return };

        let _ = AppendMenuW(menu, MF_STRING, IDM_TOGGLE, PCWSTR(toggle_label.as_ptr()));
        let _ = AppendMenuW(menu, MF_SEPARATOR, 0, PCWSTR::null());
        let _ = AppendMenuW(menu, MF_STRING, IDM_EXIT, w!("E&xit"));

        let _ = SetForegroundWindow(hwnd);
        let mut pt = POINT::default();
        let _ = GetCursorPos(&mut pt);
        let _ = TrackPopupMenu(menu, TPM_RIGHTBUTTON, pt.x, pt.y, 0, hwnd, None);
        let _ = DestroyMenu(menu);
    }
}

// ── Tray icon ─────────────────────────────────────────────────────────────────

fn add_tray_icon(hwnd: HWND) -> Result<()> {
    // SAFETY: LoadIconW with IDI_SHIELD loads a built-in shared icon resource,
    // which exists on all supported Windows versions.
    let icon = unsafe { LoadIconW(None, IDI_SHIELD) }.map_err(CloserError::from)?;

    let mut nid = NOTIFYICONDATAW {
        cbSize: std::mem::size_of::<NOTIFYICONDATAW>() as u32,
        hWnd: hwnd,
        uID: TRAY_ICON_ID,
        uFlags: NIF_ICON | NIF_MESSAGE | NIF_TIP,
        uCallbackMessage: WM_TRAYICON,
        hIcon: icon,
        ..Default::default()
    };
    copy_tip(&mut nid.szTip, TOOLTIP_ON);

    // SAFETY: nid is fully initialised and valid for the duration of the call.
    if !unsafe { Shell_NotifyIconW(NIM_ADD, &nid) }.as_bool() {
        return Err(last_error("Shell_NotifyIconW"));
    }
    Ok(())
}

fn update_tray_tip(hwnd: HWND, enabled: bool) {
    let mut nid = NOTIFYICONDATAW {
        cbSize: std::mem::size_of::<NOTIFYICONDATAW>() as u32,
        hWnd: hwnd,
        uID: TRAY_ICON_ID,
        uFlags: NIF_TIP,
        ..Default::default()
    };
    copy_tip(&mut nid.szTip, if enabled { TOOLTIP_ON } else { TOOLTIP_OFF });

    // SAFETY: nid is fully initialised; the icon was added in add_tray_icon.
    // A failed modify leaves a stale tooltip, which is not worth surfacing.
    unsafe {
        let _ = Shell_NotifyIconW(NIM_MODIFY, &nid);
    }
}

/// Balloon notification reporting how many handles the last cycle closed.
fn show_balloon(hwnd: HWND, closed: u32) {
    let mut nid = NOTIFYICONDATAW {
        cbSize: std::mem::size_of::<NOTIFYICONDATAW>() as u32,
        hWnd: hwnd,
        uID: TRAY_ICON_ID,
        uFlags: NIF_INFO,
        dwInfoFlags: NIIF_INFO,
        Anonymous: NOTIFYICONDATAW_0 {
            uTimeout: BALLOON_TIMEOUT_MS,
        },
        ..Default::default()
    };
    copy_tip(&mut nid.szInfoTitle, BALLOON_TITLE);
    copy_tip(&mut nid.szInfo, &format!("Closed {closed} matching handle(s)."));

    // SAFETY: nid is fully initialised; the icon was added in add_tray_icon.
    // A suppressed balloon (quiet hours, user setting) is not an error.
    unsafe {
        let _ = Shell_NotifyIconW(NIM_MODIFY, &nid);
    }
}

fn remove_tray_icon(hwnd: HWND) {
    let nid = NOTIFYICONDATAW {
        cbSize: std::mem::size_of::<NOTIFYICONDATAW>() as u32,
        hWnd: hwnd,
        uID: TRAY_ICON_ID,
        ..Default::default()
    };

    // SAFETY: nid identifies the icon added in add_tray_icon; delete is
    // idempotent and failure at teardown is unrecoverable anyway.
    unsafe {
        let _ = Shell_NotifyIconW(NIM_DELETE, &nid);
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Copy `src` into a fixed-size null-terminated UTF-16 field, truncating if
/// needed and always leaving room for the terminator.
fn copy_tip(dst: &mut [u16], src: &str) {
    let max = dst.len().saturating_sub(1);
    let mut i = 0;
    for unit in src.encode_utf16().take(max) {
        dst[i] = unit;
        i += 1;
    }
    dst[i] = 0;
}

// ── Error helpers ─────────────────────────────────────────────────────────────

/// Capture the current Win32 last-error code and wrap it in a `CloserError`.
///
/// Call immediately after a Win32 function that signals failure — `GetLastError`
/// reads thread-local state that can be overwritten by any subsequent API call.
fn last_error(function: &'static str) -> CloserError {
    // SAFETY: GetLastError reads thread-local state set by the last Win32 call.
    // It is always safe to call and never fails.
    let code = unsafe { GetLastError() };
    CloserError::Win32 {
        function,
        code: code.0,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tip_copy_truncates_and_terminates() {
        let mut buf = [0xFFFFu16; 8];
        copy_tip(&mut buf, "a very long tooltip");
        assert_eq!(buf[7], 0, "terminator must fit inside the field");
        assert_eq!(String::from_utf16_lossy(&buf[..7]), "a very ");
    }

    #[test]
    fn tip_copy_handles_short_strings() {
        let mut buf = [0xFFFFu16; 16];
        copy_tip(&mut buf, "On");
        assert_eq!(buf[0], u16::from(b'O'));
        assert_eq!(buf[2], 0);
    }
}
