//! Exit status decoding and one-shot exit publication.
//!
//! Every connection owns an [`ExitNotifier`]. The termination watcher of the
//! connection calls [`ExitNotifier::publish`] once the child is gone; the
//! first call wins, later calls are ignored. Status fields are stored before
//! waiters are woken and before the exit message is sent.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Payload of the exit notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtyExited {
    pub exit_code: i32,
}

/// Decoded termination record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExitStatus {
    /// Exit code. Zero when the process was terminated by a signal.
    pub code: i32,
    /// Terminating signal, 0 if the process exited on its own.
    pub signal: i32,
}

impl ExitStatus {
    /// Decode a Unix wait status word.
    ///
    /// Low 7 bits carry the terminating signal; when they are zero, bits
    /// 8..16 carry the exit code.
    pub fn from_wait_status(status: i32) -> Self {
        let signal = status & 0x7f;
        let code = if signal == 0 { (status >> 8) & 0xff } else { 0 };
        Self { code, signal }
    }

    /// Exit code reported directly by the OS (Windows).
    pub fn from_code(code: i32) -> Self {
        Self { code, signal: 0 }
    }

    pub fn success(&self) -> bool {
        self.code == 0 && self.signal == 0
    }
}

/// Single-producer completion signal for process exit.
pub struct ExitNotifier {
    status: Mutex<Option<ExitStatus>>,
    exited: Condvar,
    sender: Mutex<Option<Sender<PtyExited>>>,
}

impl ExitNotifier {
    /// Create a notifier and the receiver of its single exit message.
    pub fn new() -> (Self, Receiver<PtyExited>) {
        let (tx, rx) = mpsc::channel();
        let notifier = Self {
            status: Mutex::new(None),
            exited: Condvar::new(),
            sender: Mutex::new(Some(tx)),
        };
        (notifier, rx)
    }

    /// Record the exit status and notify. Returns false if already published.
    pub fn publish(&self, status: ExitStatus) -> bool {
        {
            let mut slot = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return false;
            }
            *slot = Some(status);
            self.exited.notify_all();
        }

        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = sender {
            // The receiver may have been dropped; that is fine
            let _ = tx.send(PtyExited {
                exit_code: status.code,
            });
        }
        true
    }

    pub fn status(&self) -> Option<ExitStatus> {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_exited(&self) -> bool {
        self.status().is_some()
    }

    /// Block until exit or until `timeout` passes (`None` waits forever).
    ///
    /// Returns true iff the exit has been published.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut slot = self.status.lock().unwrap_or_else(|e| e.into_inner());
        // Timeouts past the clock's range wait forever
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        match deadline {
            None => {
                while slot.is_none() {
                    slot = self.exited.wait(slot).unwrap_or_else(|e| e.into_inner());
                }
                true
            }
            Some(deadline) => {
                while slot.is_none() {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (next, _) = self
                        .exited
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    slot = next;
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_decode_exit_code() {
        let status = ExitStatus::from_wait_status(42 << 8);
        assert_eq!(status, ExitStatus { code: 42, signal: 0 });
        assert!(!status.success());
    }

    #[test]
    fn test_decode_signal() {
        let status = ExitStatus::from_wait_status(9);
        assert_eq!(status, ExitStatus { code: 0, signal: 9 });

        // Core dump bit does not leak into the signal
        let status = ExitStatus::from_wait_status(0x80 | 11);
        assert_eq!(status, ExitStatus { code: 0, signal: 11 });
    }

    #[test]
    fn test_decode_clean_exit() {
        assert!(ExitStatus::from_wait_status(0).success());
        assert_eq!(ExitStatus::from_code(-1).code, -1);
    }

    #[test]
    fn test_publish_once() {
        let (notifier, rx) = ExitNotifier::new();
        assert!(!notifier.has_exited());
        assert!(notifier.publish(ExitStatus::from_code(7)));
        assert!(!notifier.publish(ExitStatus::from_code(8)));

        assert_eq!(notifier.status(), Some(ExitStatus::from_code(7)));
        assert_eq!(rx.recv().unwrap(), PtyExited { exit_code: 7 });
        // Sender is gone after the first publish
        assert!(rx.recv().is_err());
    }

    #[test]
    fn test_wait_timeout() {
        let (notifier, _rx) = ExitNotifier::new();
        assert!(!notifier.wait(Some(Duration::from_millis(20))));
        assert!(!notifier.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn test_wait_huge_timeout() {
        let (notifier, _rx) = ExitNotifier::new();
        notifier.publish(ExitStatus::from_code(0));
        assert!(notifier.wait(Some(Duration::MAX)));
        assert!(notifier.wait(Some(Duration::from_millis(u64::MAX))));
    }

    #[test]
    fn test_wait_wakes_on_publish() {
        let (notifier, rx) = ExitNotifier::new();
        let notifier = Arc::new(notifier);

        let waiter = {
            let notifier = notifier.clone();
            thread::spawn(move || notifier.wait(None))
        };
        thread::sleep(Duration::from_millis(20));
        notifier.publish(ExitStatus::from_wait_status(3 << 8));

        assert!(waiter.join().unwrap());
        assert!(notifier.wait(Some(Duration::ZERO)));
        assert_eq!(rx.recv().unwrap().exit_code, 3);
    }

    #[test]
    fn test_publish_without_receiver() {
        let (notifier, rx) = ExitNotifier::new();
        drop(rx);
        assert!(notifier.publish(ExitStatus::from_code(0)));
        assert!(notifier.has_exited());
    }
}
