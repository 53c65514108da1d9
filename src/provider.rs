//! Strategy selection and the spawn entry point.
//!
//! A [`PtyProvider`] is bound to a [`Platform`] detected once at
//! construction. Each spawn validates the options, builds the child
//! environment (process environment, then PTY defaults, then the caller's
//! overrides) and hands off to the strategy for that platform.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::PtyConnection;
use crate::env::{self, Environment, KeyComparer};
use crate::error::{PtyError, Result};
use crate::options::PtyOptions;

/// Terminal facility of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    /// `pseudo_console` is true when ConPTY is available.
    Windows { pseudo_console: bool },
    /// Any other OS; spawning fails.
    Unsupported { os: &'static str },
}

/// Concrete spawn path for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ForkPty,
    PseudoConsole,
    WinPty,
}

impl Platform {
    /// Probe the running host.
    pub fn detect() -> Self {
        #[cfg(windows)]
        {
            Platform::Windows {
                pseudo_console: crate::windows::pseudo_console_supported(),
            }
        }
        #[cfg(not(windows))]
        {
            match std::env::consts::OS {
                "linux" => Platform::Linux,
                "macos" => Platform::MacOs,
                os => Platform::Unsupported { os },
            }
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Platform::Linux | Platform::MacOs)
    }

    /// How environment keys compare on this platform.
    pub fn key_comparer(&self) -> KeyComparer {
        match self {
            Platform::Windows { .. } => KeyComparer::OrdinalIgnoreCase,
            _ => KeyComparer::Ordinal,
        }
    }

    /// Pick the strategy for `options`.
    pub fn strategy_for(&self, options: &PtyOptions) -> Result<Strategy> {
        match *self {
            Platform::Linux | Platform::MacOs => Ok(Strategy::ForkPty),
            Platform::Windows { pseudo_console } => {
                if pseudo_console && !options.force_legacy_agent {
                    Ok(Strategy::PseudoConsole)
                } else {
                    Ok(Strategy::WinPty)
                }
            }
            Platform::Unsupported { os } => Err(PtyError::PlatformUnsupported(os.to_string())),
        }
    }
}

/// Spawns processes attached to pseudoterminals.
#[derive(Debug, Clone)]
pub struct PtyProvider {
    platform: Platform,
}

impl Default for PtyProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl PtyProvider {
    /// Provider for the running host.
    pub fn new() -> Self {
        Self::with_platform(Platform::detect())
    }

    pub fn with_platform(platform: Platform) -> Self {
        Self { platform }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Environment the child of `options` will see.
    pub fn environment_for(&self, options: &PtyOptions) -> Environment {
        let comparer = self.platform.key_comparer();
        let defaults = env::merge(env::pty_defaults(self.platform.is_unix()), None, comparer);
        env::merge(&options.environment, Some(defaults), comparer)
    }

    /// Spawn `options.app` in a new pseudoterminal.
    pub fn spawn(&self, options: &PtyOptions) -> Result<Box<dyn PtyConnection>> {
        self.spawn_with_cancel(options, &CancellationToken::new())
    }

    /// Like [`spawn`](Self::spawn), aborting with [`PtyError::Cancelled`]
    /// if `cancel` fires while the legacy agent's pipes are connecting.
    pub fn spawn_with_cancel(
        &self,
        options: &PtyOptions,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PtyConnection>> {
        options.validate()?;
        let strategy = self.platform.strategy_for(options)?;
        let environment = self.environment_for(options);
        debug!(?strategy, app = %options.app, vars = environment.len(), "spawning");
        self.dispatch(strategy, options, &environment, cancel)
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    fn dispatch(
        &self,
        strategy: Strategy,
        options: &PtyOptions,
        environment: &Environment,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn PtyConnection>> {
        match strategy {
            Strategy::ForkPty => crate::unix::spawn(options, environment),
            other => Err(unsupported(other)),
        }
    }

    #[cfg(windows)]
    fn dispatch(
        &self,
        strategy: Strategy,
        options: &PtyOptions,
        environment: &Environment,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn PtyConnection>> {
        match strategy {
            Strategy::PseudoConsole => crate::windows::spawn_pseudo_console(options, environment),
            Strategy::WinPty => crate::windows::spawn_winpty(options, environment, cancel),
            other => Err(unsupported(other)),
        }
    }

    #[cfg(not(any(windows, target_os = "linux", target_os = "macos")))]
    fn dispatch(
        &self,
        strategy: Strategy,
        _options: &PtyOptions,
        _environment: &Environment,
        _cancel: &CancellationToken,
    ) -> Result<Box<dyn PtyConnection>> {
        Err(unsupported(strategy))
    }
}

fn unsupported(strategy: Strategy) -> PtyError {
    PtyError::PlatformUnsupported(format!(
        "{:?} is not available on {}",
        strategy,
        std::env::consts::OS
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_selection() {
        let options = PtyOptions::new("app", "dir");
        let mut legacy = options.clone();
        legacy.force_legacy_agent = true;

        let conpty = Platform::Windows { pseudo_console: true };
        assert_eq!(conpty.strategy_for(&options).unwrap(), Strategy::PseudoConsole);
        assert_eq!(conpty.strategy_for(&legacy).unwrap(), Strategy::WinPty);

        let old = Platform::Windows { pseudo_console: false };
        assert_eq!(old.strategy_for(&options).unwrap(), Strategy::WinPty);

        assert_eq!(Platform::Linux.strategy_for(&legacy).unwrap(), Strategy::ForkPty);
        assert_eq!(Platform::MacOs.strategy_for(&options).unwrap(), Strategy::ForkPty);

        let err = Platform::Unsupported { os: "freebsd" }
            .strategy_for(&options)
            .unwrap_err();
        assert!(matches!(err, PtyError::PlatformUnsupported(ref os) if os == "freebsd"));
    }

    #[test]
    fn test_detect_matches_host() {
        let platform = Platform::detect();
        if cfg!(target_os = "linux") {
            assert_eq!(platform, Platform::Linux);
        } else if cfg!(target_os = "macos") {
            assert_eq!(platform, Platform::MacOs);
        } else if cfg!(windows) {
            assert!(matches!(platform, Platform::Windows { .. }));
        }
    }

    #[test]
    fn test_validation_runs_first() {
        let provider = PtyProvider::with_platform(Platform::Unsupported { os: "plan9" });
        let err = provider.spawn(&PtyOptions::new("", "/")).err().unwrap();
        assert!(matches!(err, PtyError::Validation(_)));

        let err = provider.spawn(&PtyOptions::new("sh", "/")).err().unwrap();
        assert!(matches!(err, PtyError::PlatformUnsupported(_)));
    }

    #[test]
    fn test_unix_environment() {
        let provider = PtyProvider::with_platform(Platform::Linux);
        let options = PtyOptions::new("sh", "/")
            .env("TERM", "dumb")
            .env("PTYLINK_EXTRA", "1")
            .env("PATH", "");
        let env = provider.environment_for(&options);

        // Caller overrides win over the defaults
        assert_eq!(env.get("TERM"), Some("dumb"));
        assert_eq!(env.get("PTYLINK_EXTRA"), Some("1"));
        assert!(!env.contains_key("PATH"));
        for cleared in env::CLEARED_VARIABLES {
            assert!(!env.contains_key(cleared), "{} should be cleared", cleared);
        }
    }

    #[test]
    fn test_windows_environment_has_no_defaults() {
        let provider = PtyProvider::with_platform(Platform::Windows { pseudo_console: true });
        let options = PtyOptions::new("cmd.exe", "C:\\").env("ptylink_case", "x");
        let env = provider.environment_for(&options);
        assert_eq!(env.comparer(), KeyComparer::OrdinalIgnoreCase);
        assert_eq!(env.get("PTYLINK_CASE"), Some("x"));
        assert_eq!(env.get("TERM").map(str::to_string), std::env::var("TERM").ok());
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_spawn_through_provider() {
        use std::time::Duration;

        let provider = PtyProvider::new();
        let options = PtyOptions::new("/bin/sh", "/").args(["-c", "exit 5"]);
        let mut conn = provider.spawn(&options).unwrap();
        let rx = conn.take_exit_receiver().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap().exit_code, 5);
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_cancel_token_is_ignored_by_forkpty() {
        let provider = PtyProvider::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let options = PtyOptions::new("/bin/sh", "/").args(["-c", "exit 0"]);
        let conn = provider.spawn_with_cancel(&options, &cancel).unwrap();
        assert!(conn.wait_for_exit(Some(std::time::Duration::from_secs(10))));
    }
}
