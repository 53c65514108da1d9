//! Key encoding for the Windows relay
//!
//! The Windows console delivers keys as events rather than bytes, so each
//! crossterm key event is turned back into the sequence an xterm in normal
//! cursor mode would send.

use bitflags::bitflags;
use crossterm::event::{KeyCode, KeyEvent, KeyModifiers};

bitflags! {
    /// Modifier keys
    #[derive(Clone, Copy, Debug, Default, PartialEq)]
    pub struct Modifiers: u8 {
        const SHIFT = 0b0001;
        const ALT   = 0b0010;
        const CTRL  = 0b0100;
    }
}

impl From<KeyModifiers> for Modifiers {
    fn from(mods: KeyModifiers) -> Self {
        let mut result = Modifiers::empty();
        result.set(Modifiers::SHIFT, mods.contains(KeyModifiers::SHIFT));
        result.set(Modifiers::ALT, mods.contains(KeyModifiers::ALT));
        result.set(Modifiers::CTRL, mods.contains(KeyModifiers::CONTROL));
        result
    }
}

impl Modifiers {
    /// xterm modifier parameter: 1 plus the bit value
    fn param(self) -> u8 {
        1 + self.bits()
    }
}

/// Encode a key press, or `None` for keys with no terminal representation.
pub fn encode(event: &KeyEvent) -> Option<Vec<u8>> {
    let mods = Modifiers::from(event.modifiers);
    let bytes = match event.code {
        KeyCode::Char(ch) => encode_char(ch, mods),
        KeyCode::Enter => vec![b'\r'],
        KeyCode::Backspace if mods.contains(Modifiers::ALT) => vec![0x1b, 0x7f],
        KeyCode::Backspace => vec![0x7f],
        KeyCode::Tab => vec![b'\t'],
        KeyCode::BackTab => b"\x1b[Z".to_vec(),
        KeyCode::Esc => vec![0x1b],
        KeyCode::Up => cursor(b'A', mods),
        KeyCode::Down => cursor(b'B', mods),
        KeyCode::Right => cursor(b'C', mods),
        KeyCode::Left => cursor(b'D', mods),
        KeyCode::Home => cursor(b'H', mods),
        KeyCode::End => cursor(b'F', mods),
        KeyCode::Insert => tilde(2, mods),
        KeyCode::Delete => tilde(3, mods),
        KeyCode::PageUp => tilde(5, mods),
        KeyCode::PageDown => tilde(6, mods),
        KeyCode::F(n) => function(n, mods)?,
        _ => return None,
    };
    Some(bytes)
}

fn encode_char(ch: char, mods: Modifiers) -> Vec<u8> {
    let ctrl = if mods.contains(Modifiers::CTRL) { control_code(ch) } else { None };
    match (ctrl, mods.contains(Modifiers::ALT)) {
        (Some(code), true) => vec![0x1b, code],
        (Some(code), false) => vec![code],
        (None, true) => {
            let mut bytes = vec![0x1b];
            bytes.extend(ch.to_string().as_bytes());
            bytes
        }
        (None, false) => ch.to_string().into_bytes(),
    }
}

fn control_code(ch: char) -> Option<u8> {
    match ch {
        'a'..='z' => Some(ch as u8 - b'a' + 1),
        'A'..='Z' => Some(ch as u8 - b'A' + 1),
        '@' | '`' | ' ' | '2' => Some(0x00),
        '[' | '3' => Some(0x1b),
        '\\' | '4' => Some(0x1c),
        ']' | '5' => Some(0x1d),
        '^' | '~' | '6' => Some(0x1e),
        '_' | '?' | '7' => Some(0x1f),
        _ => None,
    }
}

fn cursor(key: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        vec![0x1b, b'[', key]
    } else {
        format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
    }
}

fn tilde(code: u8, mods: Modifiers) -> Vec<u8> {
    if mods.is_empty() {
        format!("\x1b[{}~", code).into_bytes()
    } else {
        format!("\x1b[{};{}~", code, mods.param()).into_bytes()
    }
}

fn function(n: u8, mods: Modifiers) -> Option<Vec<u8>> {
    // F1-F4 are SS3 keys, the rest use the tilde form
    let code = match n {
        1..=4 => {
            let key = b"PQRS"[usize::from(n - 1)];
            return Some(if mods.is_empty() {
                vec![0x1b, b'O', key]
            } else {
                format!("\x1b[1;{}{}", mods.param(), key as char).into_bytes()
            });
        }
        5 => 15,
        6 => 17,
        7 => 18,
        8 => 19,
        9 => 20,
        10 => 21,
        11 => 23,
        12 => 24,
        _ => return None,
    };
    Some(tilde(code, mods))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, mods: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, mods)
    }

    #[test]
    fn test_char_keys() {
        assert_eq!(encode(&key(KeyCode::Char('a'), KeyModifiers::NONE)), Some(b"a".to_vec()));
        assert_eq!(encode(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)), Some(vec![0x03]));
        assert_eq!(encode(&key(KeyCode::Char('x'), KeyModifiers::ALT)), Some(vec![0x1b, b'x']));
        assert_eq!(
            encode(&key(KeyCode::Char('d'), KeyModifiers::CONTROL | KeyModifiers::ALT)),
            Some(vec![0x1b, 0x04])
        );
        assert_eq!(encode(&key(KeyCode::Char('é'), KeyModifiers::NONE)), Some("é".as_bytes().to_vec()));
        assert_eq!(encode(&key(KeyCode::Char('['), KeyModifiers::CONTROL)), Some(vec![0x1b]));
    }

    #[test]
    fn test_cursor_keys() {
        let up = key(KeyCode::Up, KeyModifiers::NONE);
        assert_eq!(encode(&up), Some(b"\x1b[A".to_vec()));

        let ctrl_left = key(KeyCode::Left, KeyModifiers::CONTROL);
        assert_eq!(encode(&ctrl_left), Some(b"\x1b[1;5D".to_vec()));

        let shift_home = key(KeyCode::Home, KeyModifiers::SHIFT);
        assert_eq!(encode(&shift_home), Some(b"\x1b[1;2H".to_vec()));
    }

    #[test]
    fn test_editing_and_function_keys() {
        assert_eq!(encode(&key(KeyCode::Delete, KeyModifiers::NONE)), Some(b"\x1b[3~".to_vec()));
        assert_eq!(encode(&key(KeyCode::PageUp, KeyModifiers::ALT)), Some(b"\x1b[5;3~".to_vec()));
        assert_eq!(encode(&key(KeyCode::F(1), KeyModifiers::NONE)), Some(b"\x1bOP".to_vec()));
        assert_eq!(encode(&key(KeyCode::F(4), KeyModifiers::SHIFT)), Some(b"\x1b[1;2S".to_vec()));
        assert_eq!(encode(&key(KeyCode::F(5), KeyModifiers::NONE)), Some(b"\x1b[15~".to_vec()));
        assert_eq!(encode(&key(KeyCode::F(12), KeyModifiers::CONTROL)), Some(b"\x1b[24;5~".to_vec()));
        assert_eq!(encode(&key(KeyCode::F(13), KeyModifiers::NONE)), None);
        assert_eq!(encode(&key(KeyCode::BackTab, KeyModifiers::SHIFT)), Some(b"\x1b[Z".to_vec()));
    }
}
