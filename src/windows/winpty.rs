//! winpty agent spawn strategy
//!
//! Used where ConPTY is missing or when the caller asks for the legacy
//! agent. `winpty.dll` starts a hidden console and an agent process, then
//! exposes the console through two named pipes: `conin` for input and
//! `conout` for output.
//!
//! Every winpty object is wrapped in a guard that frees it exactly once.
//! Errors reported through a winpty error object are turned into
//! [`PtyError::Spawn`] with the agent's message and code.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::ptr;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use windows::core::{w, PCSTR, PCWSTR};
use windows::Win32::Foundation::{
    ERROR_FILE_NOT_FOUND, ERROR_PIPE_BUSY, GENERIC_READ, GENERIC_WRITE, HANDLE,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_NONE, OPEN_EXISTING,
};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::Win32::System::Threading::GetProcessId;

use super::process::ChildProcess;
use super::{from_wide_ptr, owned_handle, resolve_app, win_err};
use crate::connection::{check_resize, PtyConnection, PtyReader, PtyWriter};
use crate::env::Environment;
use crate::error::{PtyError, Result};
use crate::exit::{ExitNotifier, ExitStatus, PtyExited};
use crate::options::PtyOptions;
use crate::winargs::{self, ArgumentMode};

/// Agent emits color escape sequences.
const WINPTY_FLAG_COLOR_ESCAPES: u64 = 0x4;
/// Agent shuts down when the child exits.
const WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN: u64 = 0x1;

/// Delay between attempts to open an agent pipe.
const PIPE_RETRY_DELAY: Duration = Duration::from_millis(10);

type Object = *mut c_void;
type ErrorPtr = *mut c_void;

/// Entry points of `winpty.dll`.
struct WinptyApi {
    config_new: unsafe extern "C" fn(u64, *mut ErrorPtr) -> Object,
    config_free: unsafe extern "C" fn(Object),
    config_set_initial_size: unsafe extern "C" fn(Object, i32, i32),
    open: unsafe extern "C" fn(Object, *mut ErrorPtr) -> Object,
    free: unsafe extern "C" fn(Object),
    conin_name: unsafe extern "C" fn(Object) -> *const u16,
    conout_name: unsafe extern "C" fn(Object) -> *const u16,
    spawn_config_new: unsafe extern "C" fn(
        u64,
        *const u16,
        *const u16,
        *const u16,
        *const u16,
        *mut ErrorPtr,
    ) -> Object,
    spawn_config_free: unsafe extern "C" fn(Object),
    spawn: unsafe extern "C" fn(Object, Object, *mut HANDLE, *mut HANDLE, *mut u32, *mut ErrorPtr) -> i32,
    set_size: unsafe extern "C" fn(Object, i32, i32, *mut ErrorPtr) -> i32,
    error_code: unsafe extern "C" fn(ErrorPtr) -> u32,
    error_msg: unsafe extern "C" fn(ErrorPtr) -> *const u16,
    error_free: unsafe extern "C" fn(ErrorPtr),
}

static WINPTY: OnceLock<Option<WinptyApi>> = OnceLock::new();

macro_rules! entry {
    ($module:expr, $name:literal) => {
        std::mem::transmute(GetProcAddress($module, PCSTR(concat!($name, "\0").as_ptr()))?)
    };
}

impl WinptyApi {
    fn get() -> Result<&'static WinptyApi> {
        WINPTY
            .get_or_init(|| unsafe { Self::load() })
            .as_ref()
            .ok_or_else(|| {
                PtyError::spawn(
                    "load winpty.dll",
                    io::Error::new(io::ErrorKind::NotFound, "winpty.dll or one of its exports is missing"),
                )
            })
    }

    unsafe fn load() -> Option<WinptyApi> {
        let module = LoadLibraryW(w!("winpty.dll")).ok()?;
        Some(WinptyApi {
            config_new: entry!(module, "winpty_config_new"),
            config_free: entry!(module, "winpty_config_free"),
            config_set_initial_size: entry!(module, "winpty_config_set_initial_size"),
            open: entry!(module, "winpty_open"),
            free: entry!(module, "winpty_free"),
            conin_name: entry!(module, "winpty_conin_name"),
            conout_name: entry!(module, "winpty_conout_name"),
            spawn_config_new: entry!(module, "winpty_spawn_config_new"),
            spawn_config_free: entry!(module, "winpty_spawn_config_free"),
            spawn: entry!(module, "winpty_spawn"),
            set_size: entry!(module, "winpty_set_size"),
            error_code: entry!(module, "winpty_error_code"),
            error_msg: entry!(module, "winpty_error_msg"),
            error_free: entry!(module, "winpty_error_free"),
        })
    }

    /// Render and free a winpty error object.
    unsafe fn take_error(&self, err: ErrorPtr) -> io::Error {
        if err.is_null() {
            return io::Error::new(io::ErrorKind::Other, "winpty reported no error details");
        }
        let message = from_wide_ptr((self.error_msg)(err));
        let code = (self.error_code)(err);
        (self.error_free)(err);
        io::Error::new(io::ErrorKind::Other, format!("{} ({})", message, code))
    }

    /// Run a constructor that reports failure as null plus an error object.
    unsafe fn create<F>(&'static self, step: &str, free: unsafe extern "C" fn(Object), make: F) -> Result<WinptyObject>
    where
        F: FnOnce(*mut ErrorPtr) -> Object,
    {
        let mut err: ErrorPtr = ptr::null_mut();
        let raw = make(&mut err);
        if raw.is_null() {
            return Err(PtyError::spawn(step, self.take_error(err)));
        }
        if !err.is_null() {
            (self.error_free)(err);
        }
        Ok(WinptyObject { raw, free })
    }
}

/// A winpty-allocated object, freed on drop.
struct WinptyObject {
    raw: Object,
    free: unsafe extern "C" fn(Object),
}

// SAFETY: winpty objects are plain heap allocations with no thread affinity;
// the guard is the only owner.
unsafe impl Send for WinptyObject {}

impl Drop for WinptyObject {
    fn drop(&mut self) {
        // SAFETY: `raw` came from the matching constructor and is freed once.
        unsafe { (self.free)(self.raw) };
    }
}

pub(super) fn spawn(
    options: &PtyOptions,
    env: &Environment,
    cancel: &CancellationToken,
) -> Result<Box<dyn PtyConnection>> {
    let api = WinptyApi::get()?;

    let app = resolve_app(options, env);
    let args = winargs::format(
        &options.command_line,
        ArgumentMode::from_verbatim(options.verbatim_command_line),
    );
    let command_line = winargs::command_line(&app, &args);
    let app_wide = winargs::to_wide_checked("app", &app)?;
    let command_line_wide = winargs::to_wide_checked("command line", &command_line)?;
    let cwd_wide = winargs::to_wide_checked("cwd", &options.cwd)?;
    let env_block = winargs::environment_block(env)?;

    let agent = unsafe {
        let config = api.create("create winpty config", api.config_free, |err| {
            (api.config_new)(WINPTY_FLAG_COLOR_ESCAPES, err)
        })?;
        (api.config_set_initial_size)(config.raw, i32::from(options.cols), i32::from(options.rows));
        api.create("launch winpty agent", api.free, |err| (api.open)(config.raw, err))?
    };
    debug!(cols = options.cols, rows = options.rows, "winpty agent started");


    let mut process = HANDLE::default();
    let mut thread = HANDLE::default();
    let mut create_process_error: u32 = 0;
    let mut err: ErrorPtr = ptr::null_mut();
    let spawned = unsafe {
        let spawn_config = api.create("create winpty spawn config", api.spawn_config_free, |err| {
            (api.spawn_config_new)(
                WINPTY_SPAWN_FLAG_AUTO_SHUTDOWN,
                app_wide.as_ptr(),
                command_line_wide.as_ptr(),
                cwd_wide.as_ptr(),
                env_block.as_ptr(),
                err,
            )
        })?;
        (api.spawn)(
            agent.raw,
            spawn_config.raw,
            &mut process,
            &mut thread,
            &mut create_process_error,
            &mut err,
        )
    };
    // SAFETY: handles written by winpty_spawn belong to us.
    let (process, thread) = unsafe { (owned_handle(process), owned_handle(thread)) };

    if spawned == 0 {
        if create_process_error != 0 {
            if !err.is_null() {
                // SAFETY: error object from winpty_spawn, freed once.
                unsafe { (api.error_free)(err) };
            }
            return Err(PtyError::spawn(
                format!("start winpty terminal '{}'", app),
                io::Error::from_raw_os_error(create_process_error as i32),
            ));
        }
        // SAFETY: error object from winpty_spawn.
        return Err(PtyError::spawn("start winpty terminal process", unsafe { api.take_error(err) }));
    }
    if !err.is_null() {
        // SAFETY: error object from winpty_spawn, freed once.
        unsafe { (api.error_free)(err) };
    }

    let process = process.ok_or_else(|| {
        PtyError::spawn("start winpty terminal process", io::Error::from(io::ErrorKind::InvalidData))
    })?;
    // SAFETY: process handle is open.
    let pid = unsafe { GetProcessId(super::raw_handle(&process)) };
    let child = ChildProcess::new(pid, process, thread);

    // SAFETY: pipe names are owned by the agent, which outlives these calls.
    let (conin, conout) = unsafe { ((api.conin_name)(agent.raw), (api.conout_name)(agent.raw)) };
    let writer = connect_pipe(conin, GENERIC_WRITE.0, cancel)?;
    let reader = connect_pipe(conout, GENERIC_READ.0, cancel)?;

    let (notifier, exit_rx) = ExitNotifier::new();
    let notifier = Arc::new(notifier);
    child
        .watch(notifier.clone())
        .map_err(|e| PtyError::spawn("start exit watcher", e))?;

    info!(pid, app = %app, "spawned winpty child");
    Ok(Box::new(WinPtyConnection {
        api,
        reader: Some(reader),
        writer: Some(writer),
        agent: Some(agent),
        child,
        notifier,
        exit_rx: Some(exit_rx),
        disposed: false,
    }))
}

/// Open one of the agent's named pipes, retrying while it is not ready yet.
fn connect_pipe(name: *const u16, access: u32, cancel: &CancellationToken) -> Result<File> {
    // SAFETY: name is a NUL-terminated string owned by the live agent.
    let display = unsafe { from_wide_ptr(name) };
    loop {
        if cancel.is_cancelled() {
            debug!(pipe = %display, "pipe connect cancelled");
            return Err(PtyError::Cancelled);
        }

        // SAFETY: name is valid; the returned handle is owned right away.
        let opened = unsafe {
            CreateFileW(
                PCWSTR(name),
                access,
                FILE_SHARE_NONE,
                None,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                HANDLE::default(),
            )
        };
        match opened {
            Ok(handle) => {
                // SAFETY: CreateFileW returned a fresh handle.
                let handle = unsafe { owned_handle(handle) }.ok_or_else(|| {
                    PtyError::spawn(format!("connect {}", display), io::Error::from(io::ErrorKind::InvalidData))
                })?;
                debug!(pipe = %display, "connected agent pipe");
                return Ok(File::from(handle));
            }
            Err(err) => {
                let err = win_err(err);
                let retry = matches!(
                    err.raw_os_error(),
                    Some(code) if code == ERROR_PIPE_BUSY.0 as i32 || code == ERROR_FILE_NOT_FOUND.0 as i32
                );
                if !retry {
                    return Err(PtyError::spawn(format!("connect {}", display), err));
                }
                thread::sleep(PIPE_RETRY_DELAY);
            }
        }
    }
}

/// Session over a winpty agent.
pub struct WinPtyConnection {
    api: &'static WinptyApi,
    reader: Option<File>,
    writer: Option<File>,
    agent: Option<WinptyObject>,
    child: ChildProcess,
    notifier: Arc<ExitNotifier>,
    exit_rx: Option<Receiver<PtyExited>>,
    disposed: bool,
}

impl PtyConnection for WinPtyConnection {
    fn take_reader(&mut self) -> Option<PtyReader> {
        self.reader.take().map(|file| Box::new(file) as PtyReader)
    }

    fn take_writer(&mut self) -> Option<PtyWriter> {
        self.writer.take().map(|file| Box::new(file) as PtyWriter)
    }

    fn pid(&self) -> u32 {
        self.child.pid()
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.notifier.status()
    }

    fn wait_for_exit(&self, timeout: Option<Duration>) -> bool {
        self.notifier.wait(timeout)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        check_resize(cols, rows)?;
        let agent = self.agent.as_ref().ok_or_else(|| {
            PtyError::operation("resize", io::Error::from(io::ErrorKind::NotConnected))
        })?;
        let mut err: ErrorPtr = ptr::null_mut();
        // SAFETY: the agent is alive while `self.agent` holds it.
        unsafe {
            if (self.api.set_size)(agent.raw, i32::from(cols), i32::from(rows), &mut err) == 0 {
                return Err(PtyError::operation("resize", self.api.take_error(err)));
            }
            if !err.is_null() {
                (self.api.error_free)(err);
            }
        }
        debug!(pid = self.child.pid(), cols, rows, "resized winpty console");
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        self.child
            .terminate()
            .map_err(|e| PtyError::operation("kill", e))
    }

    fn take_exit_receiver(&mut self) -> Option<Receiver<PtyExited>> {
        self.exit_rx.take()
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.reader = None;
        self.writer = None;
        self.agent = None;

        if !self.notifier.has_exited() {
            if let Err(err) = self.child.terminate() {
                warn!(pid = self.child.pid(), error = %err, "terminate during dispose failed");
            }
        }
        debug!(pid = self.child.pid(), "disposed winpty connection");
    }
}

impl Drop for WinPtyConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}
