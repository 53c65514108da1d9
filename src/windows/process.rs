//! Child process handles and the Windows exit watcher.

use std::io;
use std::os::windows::io::OwnedHandle;
use std::sync::Arc;
use std::thread;

use tracing::{info, warn};
use windows::Win32::Foundation::WAIT_OBJECT_0;
use windows::Win32::System::Threading::{
    GetExitCodeProcess, TerminateProcess, WaitForSingleObject, INFINITE,
};

use super::{raw_handle, win_err};
use crate::exit::{ExitNotifier, ExitStatus};

/// Exit code given to a process we terminate.
pub const TERMINATED_EXIT_CODE: u32 = u32::MAX;

/// A spawned child: its pid plus owned process and thread handles.
pub struct ChildProcess {
    pid: u32,
    process: OwnedHandle,
    _thread: Option<OwnedHandle>,
}

impl ChildProcess {
    pub fn new(pid: u32, process: OwnedHandle, thread: Option<OwnedHandle>) -> Self {
        Self {
            pid,
            process,
            _thread: thread,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Start a thread that waits on a duplicate of the process handle and
    /// publishes the exit code.
    pub fn watch(&self, notifier: Arc<ExitNotifier>) -> io::Result<()> {
        let process = self.process.try_clone()?;
        let pid = self.pid;
        thread::Builder::new()
            .name(format!("pty-watch-{}", pid))
            .spawn(move || wait_and_publish(pid, process, &notifier))?;
        Ok(())
    }

    pub fn terminate(&self) -> io::Result<()> {
        // SAFETY: the handle is owned and open.
        unsafe { TerminateProcess(raw_handle(&self.process), TERMINATED_EXIT_CODE) }.map_err(win_err)
    }
}

fn wait_and_publish(pid: u32, process: OwnedHandle, notifier: &ExitNotifier) {
    let handle = raw_handle(&process);
    // SAFETY: `process` stays open for the whole wait.
    let waited = unsafe { WaitForSingleObject(handle, INFINITE) };
    if waited != WAIT_OBJECT_0 {
        warn!(pid, error = %io::Error::last_os_error(), "wait on process failed, exit will not be reported");
        return;
    }

    let mut code: u32 = 0;
    // SAFETY: handle is open and `code` is a valid out-pointer.
    if let Err(err) = unsafe { GetExitCodeProcess(handle, &mut code) } {
        warn!(pid, error = %win_err(err), "could not read exit code");
        return;
    }

    let status = ExitStatus::from_code(code as i32);
    info!(pid, code = status.code, "pty child exited");
    notifier.publish(status);
}
