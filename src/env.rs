//! Environment merging for spawned sessions.
//!
//! A spawn sees the current process environment, overlaid first with the
//! PTY defaults of the target platform and then with the caller's overrides.
//! An override with an empty value removes the variable instead of setting it.

use std::collections::HashMap;

/// How environment variable names are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComparer {
    /// Exact byte comparison (Unix).
    Ordinal,
    /// ASCII case-insensitive comparison (Windows).
    OrdinalIgnoreCase,
}

impl KeyComparer {
    /// Comparer used by the host OS.
    pub fn native() -> Self {
        if cfg!(windows) {
            KeyComparer::OrdinalIgnoreCase
        } else {
            KeyComparer::Ordinal
        }
    }

    fn normalize(self, key: &str) -> String {
        match self {
            KeyComparer::Ordinal => key.to_string(),
            KeyComparer::OrdinalIgnoreCase => key.to_ascii_uppercase(),
        }
    }
}

/// Environment mapping with platform key semantics.
///
/// Keys stay unique under the comparer; the spelling of the first insertion
/// of a key is kept when later writes differ only in case.
#[derive(Debug, Clone)]
pub struct Environment {
    comparer: KeyComparer,
    entries: HashMap<String, (String, String)>,
}

impl Environment {
    pub fn new(comparer: KeyComparer) -> Self {
        Self {
            comparer,
            entries: HashMap::new(),
        }
    }

    /// Snapshot of the current process environment.
    pub fn from_process(comparer: KeyComparer) -> Self {
        let mut env = Self::new(comparer);
        for (key, value) in std::env::vars_os() {
            env.set(key.to_string_lossy(), value.to_string_lossy());
        }
        env
    }

    pub fn comparer(&self) -> KeyComparer {
        self.comparer
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&self.comparer.normalize(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&self.comparer.normalize(key))
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let normalized = self.comparer.normalize(&key);
        match self.entries.get_mut(&normalized) {
            Some(entry) => entry.1 = value,
            None => {
                self.entries.insert(normalized, (key, value));
            }
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries
            .remove(&self.comparer.normalize(key))
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over `(key, value)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .values()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }
}

/// Merge `overrides` onto `base`.
///
/// When `base` is `None` the current process environment is used as the
/// starting point. Overrides apply in iteration order: an empty value removes
/// the key, anything else sets it.
pub fn merge<I, K, V>(overrides: I, base: Option<Environment>, comparer: KeyComparer) -> Environment
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut env = base.unwrap_or_else(|| Environment::from_process(comparer));
    for (key, value) in overrides {
        let (key, value) = (key.as_ref(), value.as_ref());
        if value.is_empty() {
            env.remove(key);
        } else {
            env.set(key, value);
        }
    }
    env
}

/// Terminal type advertised to children on Unix targets.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Variables cleared on Unix so a launching multiplexer or shell does not leak
/// stale session state into the child.
pub const CLEARED_VARIABLES: [&str; 8] = [
    "TMUX", "TMUX_PANE", "STY", "WINDOW", "WINDOWID", "TERMCAP", "COLUMNS", "LINES",
];

/// PTY defaults applied ahead of caller overrides.
///
/// Windows gets none; the pseudoconsole and the legacy agent both set up
/// their own console environment.
pub fn pty_defaults(unix: bool) -> Vec<(&'static str, &'static str)> {
    if !unix {
        return Vec::new();
    }
    let mut defaults = vec![("TERM", DEFAULT_TERM)];
    defaults.extend(CLEARED_VARIABLES.iter().map(|name| (*name, "")));
    defaults
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(comparer: KeyComparer) -> Environment {
        let mut env = Environment::new(comparer);
        env.set("HOME", "/home/user");
        env.set("PATH", "/usr/bin");
        env.set("TMUX", "/tmp/tmux-1000/default,1,0");
        env
    }

    #[test]
    fn test_merge_sets_and_removes() {
        let overrides = vec![("TMUX", ""), ("PATH", "/opt/bin"), ("NEW", "1")];
        let env = merge(overrides, Some(base(KeyComparer::Ordinal)), KeyComparer::Ordinal);

        assert!(!env.contains_key("TMUX"));
        assert_eq!(env.get("PATH"), Some("/opt/bin"));
        assert_eq!(env.get("NEW"), Some("1"));
        // Untouched keys survive
        assert_eq!(env.get("HOME"), Some("/home/user"));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_merge_remove_absent_key() {
        let env = merge(
            [("NOT_THERE", "")],
            Some(base(KeyComparer::Ordinal)),
            KeyComparer::Ordinal,
        );
        assert_eq!(env.len(), 3);
        assert!(!env.contains_key("NOT_THERE"));
    }

    #[test]
    fn test_merge_order_matters() {
        let overrides = vec![("A", "1"), ("A", ""), ("B", ""), ("B", "2")];
        let env = merge(overrides, Some(Environment::new(KeyComparer::Ordinal)), KeyComparer::Ordinal);
        assert!(!env.contains_key("A"));
        assert_eq!(env.get("B"), Some("2"));
    }

    #[test]
    fn test_case_sensitivity() {
        let env = merge(
            [("path", "/lower")],
            Some(base(KeyComparer::Ordinal)),
            KeyComparer::Ordinal,
        );
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert_eq!(env.get("path"), Some("/lower"));

        let env = merge(
            [("path", "C:\\bin")],
            Some(base(KeyComparer::OrdinalIgnoreCase)),
            KeyComparer::OrdinalIgnoreCase,
        );
        assert_eq!(env.len(), 3);
        assert_eq!(env.get("Path"), Some("C:\\bin"));
        // Original spelling is kept
        assert!(env.iter().any(|(k, _)| k == "PATH"));

        let env = merge(
            [("tmux", "")],
            Some(base(KeyComparer::OrdinalIgnoreCase)),
            KeyComparer::OrdinalIgnoreCase,
        );
        assert!(!env.contains_key("TMUX"));
    }

    #[test]
    fn test_merge_seeds_from_process() {
        let env = merge(Vec::<(String, String)>::new(), None, KeyComparer::native());
        let expected = std::env::vars_os().count();
        // Keys that only differ in case collapse on Windows
        assert!(env.len() <= expected);
        if let Ok(path) = std::env::var("PATH") {
            assert_eq!(env.get("PATH"), Some(path.as_str()));
        }
    }

    #[test]
    fn test_pty_defaults() {
        let unix = pty_defaults(true);
        assert_eq!(unix[0], ("TERM", "xterm-256color"));
        assert_eq!(unix.len(), 9);
        assert!(unix[1..].iter().all(|(_, value)| value.is_empty()));

        assert!(pty_defaults(false).is_empty());

        let mut start = Environment::new(KeyComparer::Ordinal);
        start.set("COLUMNS", "132");
        start.set("TERM", "screen");
        let env = merge(unix, Some(start), KeyComparer::Ordinal);
        assert_eq!(env.get("TERM"), Some("xterm-256color"));
        assert!(!env.contains_key("COLUMNS"));
    }
}
