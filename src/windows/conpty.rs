//! ConPTY spawn strategy
//!
//! Creates two anonymous pipes, attaches their child-facing ends to a new
//! pseudoconsole and starts the process with the pseudoconsole in its
//! attribute list. The caller keeps the other two ends as byte streams.

use std::ffi::c_void;
use std::fs::File;
use std::io;
use std::mem;
use std::os::windows::io::OwnedHandle;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::System::Console::COORD;
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessW, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOEXW,
};

use super::attr_list::ProcThreadAttributeList;
use super::process::ChildProcess;
use super::{owned_handle, raw_handle, resolve_app, win_err, ConPtyApi};
use crate::connection::{check_resize, PtyConnection, PtyReader, PtyWriter};
use crate::env::Environment;
use crate::error::{PtyError, Result};
use crate::exit::{ExitNotifier, ExitStatus, PtyExited};
use crate::options::PtyOptions;
use crate::winargs::{self, ArgumentMode};

/// Owned pseudoconsole handle. Closed on drop.
struct PseudoConsole {
    api: &'static ConPtyApi,
    handle: isize,
}

impl PseudoConsole {
    fn create(
        api: &'static ConPtyApi,
        cols: u16,
        rows: u16,
        input: &OwnedHandle,
        output: &OwnedHandle,
    ) -> io::Result<Self> {
        let mut handle: isize = 0;
        // SAFETY: both pipe ends are open; `handle` is a valid out-pointer.
        let size = coord(cols, rows)?;
        unsafe { (api.create)(size, raw_handle(input), raw_handle(output), 0, &mut handle) }
            .ok()
            .map_err(win_err)?;
        Ok(Self { api, handle })
    }

    fn resize(&self, cols: u16, rows: u16) -> io::Result<()> {
        let size = coord(cols, rows)?;
        // SAFETY: the pseudoconsole is open until drop.
        unsafe { (self.api.resize)(self.handle, size) }
            .ok()
            .map_err(win_err)
    }
}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        // SAFETY: created by CreatePseudoConsole and closed only here.
        unsafe { (self.api.close)(self.handle) };
    }
}

fn coord(cols: u16, rows: u16) -> io::Result<COORD> {
    match (i16::try_from(cols), i16::try_from(rows)) {
        (Ok(x), Ok(y)) => Ok(COORD { X: x, Y: y }),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("console size {}x{} does not fit in i16", cols, rows),
        )),
    }
}

fn create_pipe() -> io::Result<(OwnedHandle, OwnedHandle)> {
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    // SAFETY: out-pointers are valid; the handles are owned right after.
    unsafe {
        CreatePipe(&mut read, &mut write, None, 0).map_err(win_err)?;
        match (owned_handle(read), owned_handle(write)) {
            (Some(read), Some(write)) => Ok((read, write)),
            _ => Err(io::Error::from(io::ErrorKind::InvalidData)),
        }
    }
}

pub(super) fn spawn(options: &PtyOptions, env: &Environment) -> Result<Box<dyn PtyConnection>> {
    let api = ConPtyApi::get().ok_or_else(|| {
        PtyError::PlatformUnsupported("CreatePseudoConsole is not available".to_string())
    })?;

    let app = resolve_app(options, env);
    let args = winargs::format(
        &options.command_line,
        ArgumentMode::from_verbatim(options.verbatim_command_line),
    );
    let command_line = winargs::command_line(&app, &args);
    let mut command_line_wide = winargs::to_wide_checked("command line", &command_line)?;
    let cwd_wide = winargs::to_wide_checked("cwd", &options.cwd)?;
    let env_block = winargs::environment_block(env)?;

    // Input: we write, the console reads. Output: the console writes, we read.
    let (console_input, input_writer) =
        create_pipe().map_err(|e| PtyError::spawn("create input pipe", e))?;
    let (output_reader, console_output) =
        create_pipe().map_err(|e| PtyError::spawn("create output pipe", e))?;

    let console = PseudoConsole::create(api, options.cols, options.rows, &console_input, &console_output)
        .map_err(|e| PtyError::spawn("create pseudo console", e))?;
    debug!(cols = options.cols, rows = options.rows, "created pseudo console");

    // The console holds its own references to these ends
    drop(console_input);
    drop(console_output);

    let mut attributes = ProcThreadAttributeList::with_pseudo_console(console.handle)
        .map_err(|e| PtyError::spawn("build process attributes", e))?;

    let mut startup = STARTUPINFOEXW::default();
    startup.StartupInfo.cb = mem::size_of::<STARTUPINFOEXW>() as u32;
    startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
    startup.lpAttributeList = attributes.as_raw();

    let mut info = PROCESS_INFORMATION::default();
    debug!(command_line = %command_line, cwd = %options.cwd, "CreateProcessW");
    // SAFETY: every buffer outlives the call; the command line is mutable
    // as CreateProcessW requires.
    let created = unsafe {
        CreateProcessW(
            PCWSTR::null(),
            PWSTR(command_line_wide.as_mut_ptr()),
            None,
            None,
            false,
            EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
            Some(env_block.as_ptr() as *const c_void),
            PCWSTR(cwd_wide.as_ptr()),
            &startup.StartupInfo,
            &mut info,
        )
    };
    attributes.release();
    created.map_err(|e| PtyError::spawn(format!("start terminal process {}", command_line), win_err(e)))?;

    // SAFETY: CreateProcessW succeeded, so both handles are fresh and ours.
    let (process, thread) = unsafe { (owned_handle(info.hProcess), owned_handle(info.hThread)) };
    let process = process.ok_or_else(|| {
        PtyError::spawn("start terminal process", io::Error::from(io::ErrorKind::InvalidData))
    })?;
    let child = ChildProcess::new(info.dwProcessId, process, thread);

    let (notifier, exit_rx) = ExitNotifier::new();
    let notifier = Arc::new(notifier);
    if let Err(err) = child.watch(notifier.clone()) {
        let _ = child.terminate();
        return Err(PtyError::spawn("start exit watcher", err));
    }

    info!(pid = child.pid(), app = %app, "spawned pseudo console child");
    Ok(Box::new(PseudoConsoleConnection {
        reader: Some(File::from(output_reader)),
        writer: Some(File::from(input_writer)),
        console: Some(console),
        child,
        notifier,
        exit_rx: Some(exit_rx),
        disposed: false,
    }))
}

/// Session over a ConPTY pseudoconsole.
pub struct PseudoConsoleConnection {
    reader: Option<File>,
    writer: Option<File>,
    console: Option<PseudoConsole>,
    child: ChildProcess,
    notifier: Arc<ExitNotifier>,
    exit_rx: Option<Receiver<PtyExited>>,
    disposed: bool,
}

impl PtyConnection for PseudoConsoleConnection {
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
        let console = self.console.as_ref().ok_or_else(|| {
            PtyError::operation("resize", io::Error::from(io::ErrorKind::NotConnected))
        })?;
        console
            .resize(cols, rows)
            .map_err(|e| PtyError::operation("resize", e))?;
        debug!(pid = self.child.pid(), cols, rows, "resized pseudo console");
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
        self.console = None;

        if !self.notifier.has_exited() {
            if let Err(err) = self.child.terminate() {
                warn!(pid = self.child.pid(), error = %err, "terminate during dispose failed");
            }
        }
        debug!(pid = self.child.pid(), "disposed pseudo console connection");
    }
}

impl Drop for PseudoConsoleConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{merge, KeyComparer};
    use std::io::Read;

    fn cmd(args: &[&str]) -> PtyOptions {
        let mut options = PtyOptions::new("cmd.exe", "C:\\").args(args.iter().copied());
        options.verbatim_command_line = true;
        options
    }

    fn process_env() -> Environment {
        merge(Vec::<(String, String)>::new(), None, KeyComparer::OrdinalIgnoreCase)
    }

    #[test]
    fn test_coord_range() {
        let size = coord(120, 40).unwrap();
        assert_eq!((size.X, size.Y), (120, 40));
        assert!(coord(40_000, 40).is_err());
    }

    #[test]
    fn test_exit_code_notification() {
        if !super::super::pseudo_console_supported() {
            return;
        }
        let mut conn = spawn(&cmd(&["/c", "exit", "7"]), &process_env()).unwrap();
        let rx = conn.take_exit_receiver().unwrap();
        let exited = rx.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(exited.exit_code, 7);
        assert!(conn.wait_for_exit(None));
        assert_eq!(conn.exit_code(), Some(7));
    }

    #[test]
    fn test_output_and_dispose() {
        if !super::super::pseudo_console_supported() {
            return;
        }
        let mut conn = spawn(&cmd(&["/c", "echo", "hello"]), &process_env()).unwrap();
        let mut reader = conn.take_reader().unwrap();

        let handle = std::thread::spawn(move || {
            let mut out = Vec::new();
            let mut buf = [0u8; 1024];
            while let Ok(n) = reader.read(&mut buf) {
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
                if String::from_utf8_lossy(&out).contains("hello") {
                    break;
                }
            }
            String::from_utf8_lossy(&out).into_owned()
        });

        assert!(conn.wait_for_exit(Some(Duration::from_secs(30))));
        conn.dispose();
        conn.dispose();
        let out = handle.join().unwrap();
        assert!(out.contains("hello"), "output was {:?}", out);
    }

    #[test]
    fn test_resize_and_kill() {
        if !super::super::pseudo_console_supported() {
            return;
        }
        let conn = spawn(&cmd(&["/k"]), &process_env()).unwrap();
        conn.resize(100, 40).unwrap();
        conn.kill().unwrap();
        assert!(conn.wait_for_exit(Some(Duration::from_secs(30))));
        assert_eq!(conn.exit_code(), Some(-1));
    }
}
