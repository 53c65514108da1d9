//! Configuration for the `ptylink` command-line tool.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.ptylink/config.toml`
//! - Defaults for terminal size, strategy flags and environment overrides
//! - Conversion into [`PtyOptions`] for a spawn
//!
//! # Configuration File
//!
//! ```toml
//! # Log filter for ~/.ptylink/ptylink.log
//! log_level = "info"
//!
//! # Windows only: use winpty even where ConPTY exists
//! force_legacy_agent = false
//!
//! # Windows only: pass arguments through without quoting
//! verbatim_command_line = false
//!
//! [terminal]
//! cols = 120
//! rows = 40
//!
//! # Applied after the built-in defaults; an empty value removes a variable
//! [environment]
//! EDITOR = "vim"
//! PAGER = ""
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::options::{PtyOptions, DEFAULT_COLS, DEFAULT_ROWS};

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `tracing` filter directive
    pub log_level: String,
    /// Prefer the winpty agent over ConPTY
    pub force_legacy_agent: bool,
    /// Do not quote arguments on Windows
    pub verbatim_command_line: bool,
    /// Initial terminal size
    pub terminal: TerminalConfig,
    /// Environment overrides
    pub environment: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            force_legacy_agent: false,
            verbatim_command_line: false,
            terminal: TerminalConfig::default(),
            environment: BTreeMap::new(),
        }
    }
}

/// Terminal size used when the host size is unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl Config {
    /// Load configuration from file, or defaults if it is missing or malformed
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Self::default()
    }

    /// Load from an explicit path, falling back to defaults
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring malformed config");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to `~/.ptylink/config.toml`
    pub fn save(&self) -> Result<(), String> {
        match Self::config_path() {
            Some(path) => self.save_to(&path),
            None => Err("Could not determine config path".to_string()),
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    /// Launch options for `app` with this configuration applied
    pub fn options_for(&self, app: &str, args: &[String], cwd: &str) -> PtyOptions {
        PtyOptions {
            app: app.to_string(),
            command_line: args.to_vec(),
            cwd: cwd.to_string(),
            environment: self.environment.clone(),
            cols: self.terminal.cols,
            rows: self.terminal.rows,
            force_legacy_agent: self.force_legacy_agent,
            verbatim_command_line: self.verbatim_command_line,
        }
    }

    /// `~/.ptylink`, created on first use
    pub fn data_dir() -> Option<PathBuf> {
        let dir = home_dir()?.join(".ptylink");
        if !dir.exists() {
            let _ = fs::create_dir_all(&dir);
        }
        Some(dir)
    }

    fn config_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join("config.toml"))
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
