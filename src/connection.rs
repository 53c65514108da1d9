//! Unified handle over a spawned terminal session.

use std::io::{self, Read, Write};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::error::{PtyError, Result};
use crate::exit::{ExitStatus, PtyExited};
use crate::options::{size_in_range, MAX_DIMENSION};

/// Byte stream from the child.
pub type PtyReader = Box<dyn Read + Send>;
/// Byte stream to the child.
pub type PtyWriter = Box<dyn Write + Send>;

/// A live pseudoterminal session.
///
/// Streams are handed out once so they can move to their own threads.
/// Dropping a connection disposes it.
pub trait PtyConnection: Send {
    /// Output of the child. `None` once taken or after dispose.
    fn take_reader(&mut self) -> Option<PtyReader>;

    /// Input to the child. `None` once taken or after dispose.
    fn take_writer(&mut self) -> Option<PtyWriter>;

    /// OS process id of the child.
    fn pid(&self) -> u32;

    /// Exit code once the child has exited.
    fn exit_code(&self) -> Option<i32> {
        self.exit_status().map(|status| status.code)
    }

    /// Full termination record once the child has exited.
    fn exit_status(&self) -> Option<ExitStatus>;

    /// Wait for the child to exit, forever when `timeout` is `None`.
    ///
    /// Returns true iff the exit has been observed.
    fn wait_for_exit(&self, timeout: Option<Duration>) -> bool;

    /// Change the terminal size in character cells.
    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Ask the child to terminate.
    fn kill(&self) -> Result<()>;

    /// Receiver of the single exit notification. `None` once taken.
    fn take_exit_receiver(&mut self) -> Option<Receiver<PtyExited>>;

    /// Close streams, release native resources and kill the child if it is
    /// still running. Safe to call more than once.
    fn dispose(&mut self);
}

/// Reject a resize no backend can apply.
pub(crate) fn check_resize(cols: u16, rows: u16) -> Result<()> {
    if size_in_range(cols, rows) {
        return Ok(());
    }
    Err(PtyError::operation(
        "resize",
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("size {}x{} outside 1..={}", cols, rows, MAX_DIMENSION),
        ),
    ))
}
