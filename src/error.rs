//! Error types shared by every spawn strategy.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    /// Launch options are missing or malformed. Never retried.
    #[error("Invalid launch options: {0}")]
    Validation(String),

    /// A native step of the session-creation sequence failed.
    #[error("Failed to {step}: {source}")]
    Spawn {
        step: String,
        #[source]
        source: io::Error,
    },

    /// A post-spawn primitive (resize, kill) failed. The connection stays usable.
    #[error("Failed to {operation} terminal: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("No pseudoterminal support for this platform: {0}")]
    PlatformUnsupported(String),

    #[error("Spawn cancelled before the terminal connected")]
    Cancelled,
}

impl PtyError {
    pub(crate) fn spawn(step: impl Into<String>, source: io::Error) -> Self {
        PtyError::Spawn {
            step: step.into(),
            source,
        }
    }

    pub(crate) fn operation(operation: &'static str, source: io::Error) -> Self {
        PtyError::Operation { operation, source }
    }

    /// Native error code behind a spawn or operation failure, if the OS reported one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            PtyError::Spawn { source, .. } | PtyError::Operation { source, .. } => {
                source.raw_os_error()
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PtyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_os_error_passthrough() {
        let err = PtyError::spawn("fork", io::Error::from_raw_os_error(11));
        assert_eq!(err.raw_os_error(), Some(11));
        assert!(err.to_string().starts_with("Failed to fork: "));

        let err = PtyError::Validation("app is empty".to_string());
        assert_eq!(err.raw_os_error(), None);
        assert_eq!(err.to_string(), "Invalid launch options: app is empty");
    }

    #[test]
    fn test_operation_message() {
        let err = PtyError::operation("resize", io::Error::from_raw_os_error(9));
        assert!(err.to_string().starts_with("Failed to resize terminal: "));
        assert_eq!(err.raw_os_error(), Some(9));
    }
}
