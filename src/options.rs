//! Launch options for a pseudoterminal session.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PtyError, Result};

/// Default terminal width when none is given.
pub const DEFAULT_COLS: u16 = 80;
/// Default terminal height when none is given.
pub const DEFAULT_ROWS: u16 = 24;
/// Largest width or height; Windows consoles store sizes as `i16`.
pub const MAX_DIMENSION: u16 = i16::MAX as u16;

/// Whether `cols` x `rows` is a size every backend can represent.
pub fn size_in_range(cols: u16, rows: u16) -> bool {
    (1..=MAX_DIMENSION).contains(&cols) && (1..=MAX_DIMENSION).contains(&rows)
}

/// What to spawn and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyOptions {
    /// Executable to run.
    pub app: String,
    /// Arguments, not including the executable itself.
    pub command_line: Vec<String>,
    /// Working directory of the child.
    pub cwd: String,
    /// Overrides applied on top of the inherited environment. An empty value
    /// removes the variable.
    pub environment: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    /// Use the winpty agent even when ConPTY is available (Windows only).
    pub force_legacy_agent: bool,
    /// Pass `command_line` through without quoting (Windows only).
    pub verbatim_command_line: bool,
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            app: String::new(),
            command_line: Vec::new(),
            cwd: String::new(),
            environment: BTreeMap::new(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            force_legacy_agent: false,
            verbatim_command_line: false,
        }
    }
}

impl PtyOptions {
    pub fn new(app: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    /// Builder-style argument list.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_line = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder-style environment override.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Check the invariants every strategy relies on.
    pub fn validate(&self) -> Result<()> {
        if self.app.is_empty() {
            return Err(PtyError::Validation("app must not be empty".to_string()));
        }
        if self.cwd.is_empty() {
            return Err(PtyError::Validation("cwd must not be empty".to_string()));
        }
        if !size_in_range(self.cols, self.rows) {
            return Err(PtyError::Validation(format!(
                "terminal size must be between 1 and {}, got {}x{}",
                MAX_DIMENSION, self.cols, self.rows
            )));
        }
        if self.environment.keys().any(|key| key.is_empty() || key.contains('=')) {
            return Err(PtyError::Validation(
                "environment keys must be non-empty and must not contain '='".to_string(),
            ));
        }

        // Native strings end at the first NUL
        let strings = [("app", &self.app), ("cwd", &self.cwd)]
            .into_iter()
            .chain(self.command_line.iter().map(|arg| ("argument", arg)))
            .chain(self.environment.iter().flat_map(|(key, value)| {
                [("environment key", key), ("environment value", value)]
            }));
        for (what, value) in strings {
            if value.contains('\0') {
                return Err(PtyError::Validation(format!(
                    "{} contains a NUL byte: {:?}",
                    what, value
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_required_fields() {
        let err = PtyOptions::new("", "/tmp").validate().unwrap_err();
        assert!(matches!(err, PtyError::Validation(ref msg) if msg.contains("app")));

        let err = PtyOptions::new("/bin/sh", "").validate().unwrap_err();
        assert!(matches!(err, PtyError::Validation(ref msg) if msg.contains("cwd")));

        assert!(PtyOptions::new("/bin/sh", "/tmp").validate().is_ok());
    }

    #[test]
    fn test_validate_size_and_env() {
        let opts = PtyOptions::new("/bin/sh", "/tmp").size(0, 24);
        assert!(opts.validate().is_err());

        let opts = PtyOptions::new("/bin/sh", "/tmp").env("A=B", "c");
        assert!(opts.validate().is_err());

        let opts = PtyOptions::new("/bin/sh", "/tmp").size(80, MAX_DIMENSION + 1);
        assert!(matches!(opts.validate(), Err(PtyError::Validation(_))));
        assert!(PtyOptions::new("/bin/sh", "/tmp").size(MAX_DIMENSION, 1).validate().is_ok());

        // Empty values are removal directives, not errors
        let opts = PtyOptions::new("/bin/sh", "/tmp").env("TERM", "");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_nul() {
        let cases = [
            PtyOptions::new("cmd\0.exe", "C:\\"),
            PtyOptions::new("cmd.exe", "C:\\\0D:\\"),
            PtyOptions::new("cmd.exe", "C:\\").args(["/c", "a\0b"]),
            PtyOptions::new("cmd.exe", "C:\\").env("FOO", "x\0y"),
        ];
        for opts in cases {
            assert!(matches!(opts.validate(), Err(PtyError::Validation(ref msg)) if msg.contains("NUL")));
        }
    }

    #[test]
    fn test_size_in_range() {
        assert!(size_in_range(1, 1));
        assert!(size_in_range(MAX_DIMENSION, MAX_DIMENSION));
        assert!(!size_in_range(0, 24));
        assert!(!size_in_range(80, u16::MAX));
    }

    #[test]
    fn test_builder() {
        let opts = PtyOptions::new("cmd.exe", "C:\\")
            .args(["/c", "dir"])
            .env("FOO", "bar")
            .size(120, 40);
        assert_eq!(opts.command_line, vec!["/c", "dir"]);
        assert_eq!(opts.environment.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!((opts.cols, opts.rows), (120, 40));
        assert!(!opts.force_legacy_agent);
    }

    #[test]
    fn test_deserialize_defaults() {
        let opts: PtyOptions = toml::from_str("app = \"/bin/echo\"\ncwd = \"/\"").unwrap();
        assert_eq!(opts.cols, DEFAULT_COLS);
        assert_eq!(opts.rows, DEFAULT_ROWS);
        assert!(opts.command_line.is_empty());
    }
}
