//! Executable resolution for Windows spawns.
//!
//! `CreateProcessW` is given an absolute application path. This module turns
//! the caller's `app` into one, following the same rules a shell would:
//! rooted paths are used as-is (modulo 32/64-bit filesystem redirection),
//! paths with a directory part are taken relative to the working directory,
//! and bare names are searched on `PATH` with `.com` and `.exe` suffixes.
//!
//! Path handling is done on strings with Windows rules so the logic can be
//! exercised on any host; the filesystem probe is injected.

/// Filesystem redirection context of the current process.
#[derive(Debug, Clone, Default)]
pub struct Redirection {
    /// `%WINDIR%`, if known.
    pub windir: Option<String>,
    /// Running as a 32-bit process on 64-bit Windows.
    pub wow64: bool,
}

impl Redirection {
    /// Redirection context of the running process.
    pub fn current() -> Self {
        Self {
            windir: std::env::var("WINDIR").ok().filter(|dir| !dir.is_empty()),
            wow64: std::env::var_os("PROCESSOR_ARCHITEW6432").is_some(),
        }
    }

    fn system32(&self) -> Option<String> {
        self.windir.as_deref().map(|dir| join(dir, "System32"))
    }

    fn sysnative(&self) -> Option<String> {
        self.windir.as_deref().map(|dir| join(dir, "Sysnative"))
    }
}

/// Resolve `app` to the path handed to process creation.
///
/// `path_var` is the `PATH` value to search (from the merged environment, or
/// the process environment). `exists` reports whether a file exists.
pub fn resolve_app<F>(
    app: &str,
    cwd: &str,
    path_var: Option<&str>,
    redirection: &Redirection,
    exists: F,
) -> String
where
    F: Fn(&str) -> bool,
{
    if is_rooted(app) {
        return redirect_rooted(app, redirection, &exists);
    }
    if has_directory(app) {
        return join(cwd, app);
    }

    let path_var = match path_var {
        Some(path) if !path.trim().is_empty() => path,
        _ => return join(cwd, app),
    };

    let mut entries: Vec<String> = path_var
        .split(';')
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect();

    if redirection.wow64 {
        if let (Some(system32), Some(sysnative)) = (redirection.system32(), redirection.sysnative()) {
            let system32_index = entries.iter().position(|entry| same_dir(entry, &system32));
            let has_sysnative = entries.iter().any(|entry| same_dir(entry, &sysnative));
            if let (Some(index), false) = (system32_index, has_sysnative) {
                entries.insert(index, sysnative);
            }
        }
    }

    for entry in &entries {
        let candidate = if is_rooted(entry) {
            join(entry, app)
        } else {
            join(&join(cwd, entry), app)
        };
        if exists(&candidate) {
            return candidate;
        }
        for ext in [".com", ".exe"] {
            let with_ext = format!("{}{}", candidate, ext);
            if exists(&with_ext) {
                return with_ext;
            }
        }
    }

    join(cwd, app)
}

fn redirect_rooted<F>(app: &str, redirection: &Redirection, exists: &F) -> String
where
    F: Fn(&str) -> bool,
{
    let (Some(system32), Some(sysnative)) = (redirection.system32(), redirection.sysnative()) else {
        return app.to_string();
    };

    if redirection.wow64 {
        // A 32-bit process asking for System32 gets SysWOW64 unless it goes
        // through the Sysnative alias.
        if let Some(rest) = strip_dir_prefix(app, &system32) {
            let native = join(&sysnative, rest);
            if exists(&native) {
                return native;
            }
        }
    } else if let Some(rest) = strip_dir_prefix(app, &sysnative) {
        // Sysnative only exists for 32-bit processes.
        return join(&system32, rest);
    }
    app.to_string()
}

/// `Path.IsPathRooted` semantics: leading separator or a drive letter.
pub fn is_rooted(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.first().is_some_and(|b| *b == b'\\' || *b == b'/') {
        return true;
    }
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn has_directory(path: &str) -> bool {
    path.contains('\\') || path.contains('/')
}

/// Join two path segments with a backslash, like `Path.Combine`.
pub fn join(base: &str, rest: &str) -> String {
    if is_rooted(rest) || base.is_empty() {
        return rest.to_string();
    }
    if base.ends_with('\\') || base.ends_with('/') || base.ends_with(':') {
        format!("{}{}", base, rest)
    } else {
        format!("{}\\{}", base, rest)
    }
}

fn same_dir(entry: &str, dir: &str) -> bool {
    let entry = entry.trim_end_matches(['\\', '/']);
    entry.eq_ignore_ascii_case(dir)
}

/// Remainder of `path` below `dir`, compared case-insensitively.
fn strip_dir_prefix<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    let prefix_len = dir.len() + 1;
    if path.len() <= prefix_len || !path.is_char_boundary(dir.len()) {
        return None;
    }
    let (head, rest) = path.split_at(dir.len());
    if !head.eq_ignore_ascii_case(dir) {
        return None;
    }
    let rest = rest.strip_prefix('\\').or_else(|| rest.strip_prefix('/'))?;
    Some(rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn fs(files: &[&str]) -> impl Fn(&str) -> bool {
        let files: HashSet<String> = files.iter().map(|f| f.to_ascii_lowercase()).collect();
        move |path: &str| files.contains(&path.to_ascii_lowercase())
    }

    fn native() -> Redirection {
        Redirection {
            windir: Some("C:\\Windows".to_string()),
            wow64: false,
        }
    }

    fn wow64() -> Redirection {
        Redirection {
            windir: Some("C:\\Windows".to_string()),
            wow64: true,
        }
    }

    #[test]
    fn test_is_rooted() {
        assert!(is_rooted("C:\\x"));
        assert!(is_rooted("c:x"));
        assert!(is_rooted("\\\\server\\share"));
        assert!(is_rooted("/x"));
        assert!(!is_rooted("x\\y"));
        assert!(!is_rooted(""));
    }

    #[test]
    fn test_join() {
        assert_eq!(join("C:\\dir", "app"), "C:\\dir\\app");
        assert_eq!(join("C:\\dir\\", "app"), "C:\\dir\\app");
        assert_eq!(join("C:\\dir", "D:\\app"), "D:\\app");
        assert_eq!(join("", "app"), "app");
    }

    #[test]
    fn test_rooted_passthrough() {
        let exists = fs(&[]);
        assert_eq!(
            resolve_app("D:\\tools\\x.exe", "C:\\work", None, &native(), &exists),
            "D:\\tools\\x.exe"
        );
    }

    #[test]
    fn test_sysnative_redirect_under_wow64() {
        let exists = fs(&["C:\\Windows\\Sysnative\\cmd.exe"]);
        assert_eq!(
            resolve_app("C:\\Windows\\System32\\cmd.exe", "C:\\", None, &wow64(), &exists),
            "C:\\Windows\\Sysnative\\cmd.exe"
        );

        // No redirect when the aliased file is missing
        let exists = fs(&[]);
        assert_eq!(
            resolve_app("C:\\Windows\\System32\\cmd.exe", "C:\\", None, &wow64(), &exists),
            "C:\\Windows\\System32\\cmd.exe"
        );
    }

    #[test]
    fn test_sysnative_mapped_back_when_native() {
        let exists = fs(&[]);
        assert_eq!(
            resolve_app("c:\\windows\\sysnative\\cmd.exe", "C:\\", None, &native(), &exists),
            "C:\\Windows\\System32\\cmd.exe"
        );
    }

    #[test]
    fn test_relative_with_directory() {
        let exists = fs(&[]);
        assert_eq!(
            resolve_app("bin\\tool.exe", "C:\\work", None, &native(), &exists),
            "C:\\work\\bin\\tool.exe"
        );
    }

    #[test]
    fn test_path_search_suffixes() {
        let path = "C:\\a;;C:\\b;rel";
        let exists = fs(&["C:\\b\\tool.com", "C:\\b\\tool.exe"]);
        assert_eq!(
            resolve_app("tool", "C:\\work", Some(path), &native(), &exists),
            "C:\\b\\tool.com"
        );

        let exists = fs(&["C:\\a\\tool"]);
        assert_eq!(
            resolve_app("tool", "C:\\work", Some(path), &native(), &exists),
            "C:\\a\\tool"
        );

        let exists = fs(&["C:\\work\\rel\\tool.exe"]);
        assert_eq!(
            resolve_app("tool", "C:\\work", Some(path), &native(), &exists),
            "C:\\work\\rel\\tool.exe"
        );
    }

    #[test]
    fn test_path_search_fallback() {
        let exists = fs(&[]);
        assert_eq!(
            resolve_app("tool", "C:\\work", Some("C:\\a"), &native(), &exists),
            "C:\\work\\tool"
        );
        assert_eq!(
            resolve_app("tool", "C:\\work", Some("  "), &native(), &exists),
            "C:\\work\\tool"
        );
        assert_eq!(
            resolve_app("tool", "C:\\work", None, &native(), &exists),
            "C:\\work\\tool"
        );
    }

    #[test]
    fn test_path_search_prefers_sysnative_under_wow64() {
        let exists = fs(&[
            "C:\\Windows\\Sysnative\\bash.exe",
            "C:\\Windows\\System32\\bash.exe",
        ]);
        let path = "C:\\Windows\\System32\\;C:\\other";
        assert_eq!(
            resolve_app("bash", "C:\\", Some(path), &wow64(), &exists),
            "C:\\Windows\\Sysnative\\bash.exe"
        );
        assert_eq!(
            resolve_app("bash", "C:\\", Some(path), &native(), &exists),
            "C:\\Windows\\System32\\bash.exe"
        );
    }
}
