//! Command line and environment block rendering for Windows process creation.
//!
//! `CreateProcessW` and the winpty agent take a single command-line string
//! and a UTF-16 environment block rather than vectors. Everything here is
//! plain string work so it is tested on every host.

use crate::env::Environment;
use crate::error::{PtyError, Result};

/// How arguments are turned into a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentMode {
    /// Quote every argument, doubling embedded quotes.
    Quoted,
    /// Join arguments as given; the caller pre-formatted them.
    Verbatim,
}

impl ArgumentMode {
    pub fn from_verbatim(verbatim: bool) -> Self {
        if verbatim {
            ArgumentMode::Verbatim
        } else {
            ArgumentMode::Quoted
        }
    }
}

/// Render an argument list for the given mode.
pub fn format<S: AsRef<str>>(args: &[S], mode: ArgumentMode) -> String {
    match mode {
        ArgumentMode::Quoted => args
            .iter()
            .map(|arg| quote(arg.as_ref()))
            .collect::<Vec<_>>()
            .join(" "),
        ArgumentMode::Verbatim => args
            .iter()
            .map(|arg| arg.as_ref())
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() {
        return String::new();
    }
    format!("\"{}\"", arg.replace('"', "\"\""))
}

/// Full command line: the application followed by its formatted arguments.
///
/// The application is quoted when it contains a space and is not already
/// quoted.
pub fn command_line(app: &str, formatted_args: &str) -> String {
    let mut line = String::with_capacity(app.len() + formatted_args.len() + 4);
    if app.contains(' ') && !app.starts_with('"') && !app.ends_with('"') {
        line.push('"');
        line.push_str(app);
        line.push('"');
    } else {
        line.push_str(app);
    }
    if !formatted_args.trim().is_empty() {
        line.push(' ');
        line.push_str(formatted_args);
    }
    line
}

/// UTF-16 environment block: `KEY=VALUE\0` entries sorted case-insensitively
/// by key, followed by a terminating `\0`. Entries holding a NUL are rejected.
pub fn environment_block(env: &Environment) -> Result<Vec<u16>> {
    let mut entries: Vec<(&str, &str)> = env.iter().collect();
    entries.sort_by_key(|(key, _)| key.to_ascii_uppercase());

    let mut block = Vec::new();
    for (key, value) in entries {
        if key.contains('\0') || value.contains('\0') {
            return Err(nul_error("environment entry", &format!("{}={}", key, value)));
        }
        block.extend(key.encode_utf16());
        block.push(u16::from(b'='));
        block.extend(value.encode_utf16());
        block.push(0);
    }
    block.push(0);
    // An empty block still needs two terminators
    if block.len() < 2 {
        block.push(0);
    }
    Ok(block)
}

/// NUL-terminated UTF-16 copy of `s`.
pub fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Like [`to_wide`], but an interior NUL is a validation error instead of a
/// silent truncation.
pub fn to_wide_checked(what: &str, s: &str) -> Result<Vec<u16>> {
    if s.contains('\0') {
        return Err(nul_error(what, s));
    }
    Ok(to_wide(s))
}

fn nul_error(what: &str, value: &str) -> PtyError {
    PtyError::Validation(format!("{} contains a NUL byte: {:?}", what, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::KeyComparer;

    #[test]
    fn test_quoted_format() {
        assert_eq!(
            format(&["a b", "c\"d"], ArgumentMode::Quoted),
            "\"a b\" \"c\"\"d\""
        );
        assert_eq!(format(&["plain"], ArgumentMode::Quoted), "\"plain\"");
    }

    #[test]
    fn test_quoted_format_empty() {
        let none: [&str; 0] = [];
        assert_eq!(format(&none, ArgumentMode::Quoted), "");
        assert_eq!(format(&[""], ArgumentMode::Quoted), "");
        // Empty tokens still take their separator
        assert_eq!(format(&["a", "", "b"], ArgumentMode::Quoted), "\"a\"  \"b\"");
    }

    #[test]
    fn test_verbatim_format() {
        assert_eq!(
            format(&["/c", "echo \"hi\"", "&&", "exit"], ArgumentMode::Verbatim),
            "/c echo \"hi\" && exit"
        );
        assert_eq!(ArgumentMode::from_verbatim(true), ArgumentMode::Verbatim);
        assert_eq!(ArgumentMode::from_verbatim(false), ArgumentMode::Quoted);
    }

    #[test]
    fn test_command_line() {
        assert_eq!(command_line("C:\\Windows\\cmd.exe", ""), "C:\\Windows\\cmd.exe");
        assert_eq!(
            command_line("C:\\Program Files\\app.exe", "\"x\""),
            "\"C:\\Program Files\\app.exe\" \"x\""
        );
        assert_eq!(
            command_line("\"C:\\Program Files\\app.exe\"", "   "),
            "\"C:\\Program Files\\app.exe\""
        );
    }

    #[test]
    fn test_environment_block() {
        let mut env = Environment::new(KeyComparer::OrdinalIgnoreCase);
        env.set("path", "C:\\bin");
        env.set("ComSpec", "cmd.exe");
        env.set("A", "1");

        let block = environment_block(&env).unwrap();
        let text = String::from_utf16(&block).unwrap();
        assert_eq!(text, "A=1\0ComSpec=cmd.exe\0path=C:\\bin\0\0");
    }

    #[test]
    fn test_empty_environment_block() {
        let env = Environment::new(KeyComparer::OrdinalIgnoreCase);
        assert_eq!(environment_block(&env).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_to_wide() {
        assert_eq!(to_wide("ab"), vec![u16::from(b'a'), u16::from(b'b'), 0]);
        assert_eq!(to_wide_checked("cwd", "ab").unwrap(), to_wide("ab"));
    }

    #[test]
    fn test_interior_nul_rejected() {
        let err = to_wide_checked("cwd", "C:\\\0D:\\").unwrap_err();
        assert!(matches!(err, PtyError::Validation(ref msg) if msg.starts_with("cwd")));

        let mut env = Environment::new(KeyComparer::OrdinalIgnoreCase);
        env.set("FOO", "a\0b");
        assert!(matches!(environment_block(&env), Err(PtyError::Validation(_))));
    }
}
