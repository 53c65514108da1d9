//! Windows spawn strategies: ConPTY and the legacy winpty agent.
//!
//! # Capability probe
//!
//! The pseudoconsole entry points are looked up in `kernel32.dll` at runtime
//! so the crate still loads on Windows builds that predate ConPTY. When they
//! are missing, or the caller forces it, spawns go through `winpty.dll`,
//! which is likewise loaded on first use.

mod attr_list;
mod conpty;
mod process;
mod winpty;

pub use conpty::PseudoConsoleConnection;
pub use winpty::WinPtyConnection;

use std::io;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;
use windows::core::{s, w, HRESULT};
use windows::Win32::Foundation::{HANDLE, HMODULE};
use windows::Win32::System::Console::COORD;
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};

use crate::connection::PtyConnection;
use crate::env::Environment;
use crate::error::Result;
use crate::options::PtyOptions;
use crate::winpath::{self, Redirection};

type CreatePseudoConsoleFn =
    unsafe extern "system" fn(COORD, HANDLE, HANDLE, u32, *mut isize) -> HRESULT;
type ResizePseudoConsoleFn = unsafe extern "system" fn(isize, COORD) -> HRESULT;
type ClosePseudoConsoleFn = unsafe extern "system" fn(isize);

/// Pseudoconsole entry points of `kernel32.dll`.
pub(crate) struct ConPtyApi {
    create: CreatePseudoConsoleFn,
    resize: ResizePseudoConsoleFn,
    close: ClosePseudoConsoleFn,
}

static CONPTY: OnceLock<Option<ConPtyApi>> = OnceLock::new();

impl ConPtyApi {
    /// The pseudoconsole API, if this Windows build has one.
    pub(crate) fn get() -> Option<&'static ConPtyApi> {
        CONPTY.get_or_init(|| unsafe { Self::load() }).as_ref()
    }

    unsafe fn load() -> Option<ConPtyApi> {
        let kernel32: HMODULE = GetModuleHandleW(w!("kernel32.dll")).ok()?;
        let create = GetProcAddress(kernel32, s!("CreatePseudoConsole"))?;
        let resize = GetProcAddress(kernel32, s!("ResizePseudoConsole"))?;
        let close = GetProcAddress(kernel32, s!("ClosePseudoConsole"))?;
        Some(ConPtyApi {
            create: std::mem::transmute::<_, CreatePseudoConsoleFn>(create),
            resize: std::mem::transmute::<_, ResizePseudoConsoleFn>(resize),
            close: std::mem::transmute::<_, ClosePseudoConsoleFn>(close),
        })
    }
}

/// Whether `CreatePseudoConsole` is available.
pub fn pseudo_console_supported() -> bool {
    ConPtyApi::get().is_some()
}

/// Spawn through ConPTY.
pub fn spawn_pseudo_console(options: &PtyOptions, env: &Environment) -> Result<Box<dyn PtyConnection>> {
    conpty::spawn(options, env)
}

/// Spawn through the winpty agent.
pub fn spawn_winpty(
    options: &PtyOptions,
    env: &Environment,
    cancel: &CancellationToken,
) -> Result<Box<dyn PtyConnection>> {
    winpty::spawn(options, env, cancel)
}

/// Absolute path of the executable to launch.
fn resolve_app(options: &PtyOptions, env: &Environment) -> String {
    let process_path = std::env::var("PATH").ok();
    let path_var = env.get("PATH").or(process_path.as_deref());
    winpath::resolve_app(
        &options.app,
        &options.cwd,
        path_var,
        &Redirection::current(),
        |candidate| Path::new(candidate).is_file(),
    )
}

/// Convert a `windows` error into an `io::Error` carrying the Win32 code.
pub(crate) fn win_err(err: windows::core::Error) -> io::Error {
    let code = err.code().0 as u32;
    // HRESULT_FROM_WIN32 wraps Win32 codes in facility 7
    if code & 0xFFFF_0000 == 0x8007_0000 {
        io::Error::from_raw_os_error((code & 0xFFFF) as i32)
    } else {
        io::Error::from_raw_os_error(code as i32)
    }
}

pub(crate) fn raw_handle(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle() as _)
}

/// Take ownership of a handle returned by the OS. Null or invalid handles
/// yield `None`.
pub(crate) unsafe fn owned_handle(handle: HANDLE) -> Option<OwnedHandle> {
    if handle.is_invalid() {
        None
    } else {
        Some(OwnedHandle::from_raw_handle(handle.0 as _))
    }
}

/// Copy a NUL-terminated UTF-16 string owned by native code.
pub(crate) unsafe fn from_wide_ptr(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    String::from_utf16_lossy(std::slice::from_raw_parts(ptr, len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_win_err_unwraps_win32_codes() {
        let err = windows::core::Error::from(HRESULT(0x8007_0005_u32 as i32));
        assert_eq!(win_err(err).raw_os_error(), Some(5));
    }

    #[test]
    fn test_from_wide_ptr() {
        let wide: Vec<u16> = "pipe\\conin".encode_utf16().chain(Some(0)).collect();
        assert_eq!(unsafe { from_wide_ptr(wide.as_ptr()) }, "pipe\\conin");
        assert_eq!(unsafe { from_wide_ptr(std::ptr::null()) }, "");
    }

    #[test]
    fn test_resolve_app_uses_merged_path() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("ptylink-lookup.exe");
        std::fs::write(&exe, b"").unwrap();

        let mut env = Environment::new(crate::env::KeyComparer::OrdinalIgnoreCase);
        env.set("Path", dir.path().to_string_lossy());
        let options = PtyOptions::new("ptylink-lookup", "C:\\");
        assert_eq!(resolve_app(&options, &env), exe.to_string_lossy());
    }
}
