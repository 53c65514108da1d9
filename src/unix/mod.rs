//! `forkpty` spawn strategy for Linux and macOS.
//!
//! # Sequence
//!
//! 1. Build the terminal modes for the host ABI.
//! 2. Prepare every C string the child needs (app, argv, envp, cwd).
//! 3. `forkpty`. The child changes directory, installs the environment and
//!    execs; on any failure it exits with the errno as its status.
//! 4. The parent marks the controller close-on-exec, duplicates it into a
//!    reader and a writer, and starts the termination watcher.
//!
//! Nothing allocates between fork and exec in the child.

mod connection;

pub use connection::UnixConnection;

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::ptr;
use std::sync::Arc;
use std::thread;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::pty::{forkpty, ForkptyResult, Winsize};
use nix::sys::signal::{self, Signal};
use nix::sys::termios::Termios;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::connection::PtyConnection;
use crate::env::Environment;
use crate::error::{PtyError, Result};
use crate::exit::ExitNotifier;
use crate::options::PtyOptions;
use crate::termios::TerminalAbi;

/// Everything the child needs, built before the fork.
struct ExecPlan {
    app: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: CString,
}

impl ExecPlan {
    fn new(options: &PtyOptions, env: &Environment) -> Result<Self> {
        let app = c_string("app", &options.app)?;
        let mut argv = Vec::with_capacity(options.command_line.len() + 1);
        argv.push(app.clone());
        for arg in &options.command_line {
            argv.push(c_string("argument", arg)?);
        }
        let envp = env
            .iter()
            .map(|(key, value)| c_string("environment entry", &format!("{}={}", key, value)))
            .collect::<Result<Vec<_>>>()?;
        let cwd = c_string("cwd", &options.cwd)?;
        Ok(Self { app, argv, envp, cwd })
    }
}

fn c_string(what: &str, value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| PtyError::Validation(format!("{} contains a NUL byte: {:?}", what, value)))
}

/// NULL-terminated pointer array over `strings`. Borrows; keep `strings` alive.
fn pointer_array(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

#[cfg(target_os = "linux")]
unsafe fn install_environment(envp: *const *const libc::c_char) {
    extern "C" {
        static mut environ: *const *const libc::c_char;
    }
    environ = envp;
}

#[cfg(target_os = "macos")]
unsafe fn install_environment(envp: *const *const libc::c_char) {
    *libc::_NSGetEnviron() = envp as *mut *mut libc::c_char;
}

/// Runs in the forked child. Never returns.
unsafe fn exec_child(
    app: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
    cwd: *const libc::c_char,
) -> ! {
    if libc::chdir(cwd) != 0 {
        libc::_exit(Errno::last_raw());
    }
    install_environment(envp);
    libc::execvp(app, argv);
    libc::_exit(Errno::last_raw())
}

/// Spawn `options.app` attached to a new pty.
///
/// `env` is the fully merged environment of the child.
pub fn spawn(options: &PtyOptions, env: &Environment) -> Result<Box<dyn PtyConnection>> {
    let abi = TerminalAbi::host().ok_or_else(|| {
        PtyError::PlatformUnsupported(std::env::consts::OS.to_string())
    })?;

    let plan = ExecPlan::new(options, env)?;
    let argv = pointer_array(&plan.argv);
    let envp = pointer_array(&plan.envp);

    let termios = Termios::from(abi.profile().to_native());
    let winsize = Winsize {
        ws_row: options.rows,
        ws_col: options.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    debug!(app = %options.app, cols = options.cols, rows = options.rows, "forkpty");
    // SAFETY: the child branch only makes async-signal-safe calls on memory
    // prepared before the fork, then execs or exits.
    let forked = unsafe { forkpty(&winsize, &termios) }
        .map_err(|e| PtyError::spawn("fork pty", io::Error::from(e)))?;

    let (child, controller) = match forked {
        // SAFETY: we are the child; every pointer references memory copied
        // from the parent at fork time.
        ForkptyResult::Child => unsafe {
            exec_child(plan.app.as_ptr(), argv.as_ptr(), envp.as_ptr(), plan.cwd.as_ptr())
        },
        ForkptyResult::Parent { child, master } => (child, master),
    };
    let pid = child.as_raw();

    match finish_parent(pid, controller, abi) {
        Ok(conn) => {
            info!(pid, app = %options.app, "spawned pty child");
            Ok(Box::new(conn))
        }
        Err(err) => {
            warn!(pid, error = %err, "pty setup failed, killing child");
            reap_after_failure(child);
            Err(err)
        }
    }
}

fn finish_parent(pid: libc::pid_t, controller: OwnedFd, abi: TerminalAbi) -> Result<UnixConnection> {
    fcntl(controller.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| PtyError::spawn("set close-on-exec", io::Error::from(e)))?;

    let reader = File::from(
        controller
            .try_clone()
            .map_err(|e| PtyError::spawn("duplicate controller for reading", e))?,
    );
    let writer = File::from(
        controller
            .try_clone()
            .map_err(|e| PtyError::spawn("duplicate controller for writing", e))?,
    );

    let (notifier, exit_rx) = ExitNotifier::new();
    let notifier = Arc::new(notifier);
    {
        let notifier = notifier.clone();
        thread::Builder::new()
            .name(format!("pty-watch-{}", pid))
            .spawn(move || connection::watch(pid, &notifier))
            .map_err(|e| PtyError::spawn("start exit watcher", e))?;
    }

    Ok(UnixConnection::new(
        pid, controller, reader, writer, notifier, exit_rx, abi,
    ))
}

fn reap_after_failure(child: Pid) {
    let _ = signal::kill(child, Signal::SIGKILL);
    while let Err(Errno::EINTR) = waitpid(child, None) {}
}
