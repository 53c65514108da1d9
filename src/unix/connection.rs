//! Connection over a `forkpty` session and its exit watcher.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::connection::{check_resize, PtyConnection, PtyReader, PtyWriter};
use crate::error::{PtyError, Result};
use crate::exit::{ExitNotifier, ExitStatus, PtyExited};
use crate::termios::{HangupMethod, TerminalAbi};

pub struct UnixConnection {
    pid: libc::pid_t,
    controller: Option<OwnedFd>,
    reader: Option<File>,
    writer: Option<File>,
    notifier: Arc<ExitNotifier>,
    exit_rx: Option<Receiver<PtyExited>>,
    abi: TerminalAbi,
    disposed: bool,
}

impl UnixConnection {
    pub(super) fn new(
        pid: libc::pid_t,
        controller: OwnedFd,
        reader: File,
        writer: File,
        notifier: Arc<ExitNotifier>,
        exit_rx: Receiver<PtyExited>,
        abi: TerminalAbi,
    ) -> Self {
        Self {
            pid,
            controller: Some(controller),
            reader: Some(reader),
            writer: Some(writer),
            notifier,
            exit_rx: Some(exit_rx),
            abi,
            disposed: false,
        }
    }

    fn controller(&self, operation: &'static str) -> Result<&OwnedFd> {
        self.controller.as_ref().ok_or_else(|| {
            PtyError::operation(operation, io::Error::from_raw_os_error(libc::EBADF))
        })
    }
}

impl PtyConnection for UnixConnection {
    fn take_reader(&mut self) -> Option<PtyReader> {
        self.reader.take().map(|file| Box::new(file) as PtyReader)
    }

    fn take_writer(&mut self) -> Option<PtyWriter> {
        self.writer.take().map(|file| Box::new(file) as PtyWriter)
    }

    fn pid(&self) -> u32 {
        self.pid as u32
    }

    fn exit_status(&self) -> Option<ExitStatus> {
        self.notifier.status()
    }

    fn wait_for_exit(&self, timeout: Option<Duration>) -> bool {
        self.notifier.wait(timeout)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        check_resize(cols, rows)?;
        let fd = self.controller("resize")?;
        let size = libc::winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: fd is open and size outlives the call.
        let rc = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                self.abi.set_window_size_request() as _,
                &size as *const libc::winsize,
            )
        };
        if rc < 0 {
            return Err(PtyError::operation("resize", io::Error::last_os_error()));
        }
        debug!(pid = self.pid, cols, rows, "resized pty");
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        match self.abi.hangup_method() {
            HangupMethod::SignalProcess => {
                signal::kill(Pid::from_raw(self.pid), Signal::SIGHUP)
                    .map_err(|e| PtyError::operation("kill", io::Error::from(e)))?;
            }
            HangupMethod::ControllerIoctl => {
                let fd = self.controller("kill")?;
                // SAFETY: fd is open; TIOCSIG takes the signal number by value.
                let rc = unsafe {
                    libc::ioctl(fd.as_raw_fd(), self.abi.signal_request() as _, libc::SIGHUP)
                };
                if rc < 0 {
                    return Err(PtyError::operation("kill", io::Error::last_os_error()));
                }
            }
        }
        debug!(pid = self.pid, "sent hangup");
        Ok(())
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
        self.controller = None;

        if !self.notifier.has_exited() {
            // The controller is gone, so hang up by pid on every ABI.
            if let Err(err) = signal::kill(Pid::from_raw(self.pid), Signal::SIGHUP) {
                warn!(pid = self.pid, error = %err, "hangup during dispose failed");
            }
        }
        debug!(pid = self.pid, "disposed pty connection");
    }
}

impl Drop for UnixConnection {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Block until `pid` exits, then publish its status.
///
/// Interrupted waits are retried; any other failure ends the watch without a
/// notification. Uses raw `waitpid` so the status word reaches
/// [`ExitStatus::from_wait_status`] unchanged.
pub(super) fn watch(pid: libc::pid_t, notifier: &ExitNotifier) {
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid out-pointer; pid is our child.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            break;
        }
        match Errno::last() {
            Errno::EINTR => continue,
            err => {
                warn!(pid, error = %err, "waitpid failed, exit will not be reported");
                return;
            }
        }
    }

    let exit = ExitStatus::from_wait_status(status);
    info!(pid, code = exit.code, signal = exit.signal, "pty child exited");
    notifier.publish(exit);
}
