//! ptylink - spawn processes attached to a pseudoterminal
//!
//! One API over three terminal facilities:
//!
//! - **Unix**: `forkpty` with a fixed set of terminal modes (Linux, macOS)
//! - **ConPTY**: Windows pseudoconsoles, where available
//! - **winpty**: the legacy agent for older Windows builds
//!
//! A spawn returns a [`PtyConnection`] with a byte stream in each direction,
//! resize and kill primitives, and a one-shot exit notification. The crate
//! moves raw bytes only; escape sequences are left to the caller.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use ptylink::{PtyOptions, PtyProvider};
//!
//! let options = PtyOptions::new("/bin/sh", "/").args(["-c", "echo hi"]);
//! let mut conn = PtyProvider::new().spawn(&options)?;
//! let mut output = String::new();
//! let _ = conn.take_reader().unwrap().read_to_string(&mut output);
//! let exited = conn.take_exit_receiver().unwrap().recv().unwrap();
//! println!("{} exited with {}", conn.pid(), exited.exit_code);
//! # Ok::<(), ptylink::PtyError>(())
//! ```
//!
//! # Logging
//!
//! Native steps are traced with `tracing`; install a subscriber to see them.

pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod exit;
pub mod options;
pub mod provider;
pub mod termios;
pub mod winargs;
pub mod winpath;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod unix;
#[cfg(windows)]
pub mod windows;

pub use config::Config;
pub use connection::{PtyConnection, PtyReader, PtyWriter};
pub use env::{Environment, KeyComparer};
pub use error::{PtyError, Result};
pub use exit::{ExitStatus, PtyExited};
pub use options::PtyOptions;
pub use provider::{Platform, PtyProvider, Strategy};
pub use tokio_util::sync::CancellationToken;
