//! Host key codes to Amiga raw key codes.

use winit::keyboard::KeyCode;

/// Translate a physical key to the Amiga keyboard matrix code.
pub fn amiga_keycode(key: KeyCode) -> Option<u8> {
    Some(match key {
        KeyCode::Backquote => 0x00,
        KeyCode::Digit1 => 0x01,
        KeyCode::Digit2 => 0x02,
        KeyCode::Digit3 => 0x03,
        KeyCode::Digit4 => 0x04,
        KeyCode::Digit5 => 0x05,
        KeyCode::Digit6 => 0x06,
        KeyCode::Digit7 => 0x07,
        KeyCode::Digit8 => 0x08,
        KeyCode::Digit9 => 0x09,
        KeyCode::Digit0 => 0x0A,
        KeyCode::Minus => 0x0B,
        KeyCode::Equal => 0x0C,
        KeyCode::Backslash => 0x0D,

        KeyCode::KeyQ => 0x10,
        KeyCode::KeyW => 0x11,
        KeyCode::KeyE => 0x12,
        KeyCode::KeyR => 0x13,
        KeyCode::KeyT => 0x14,
        KeyCode::KeyY => 0x15,
        KeyCode::KeyU => 0x16,
        KeyCode::KeyI => 0x17,
        KeyCode::KeyO => 0x18,
        KeyCode::KeyP => 0x19,
        KeyCode::BracketLeft => 0x1A,
        KeyCode::BracketRight => 0x1B,

        KeyCode::KeyA => 0x20,
        KeyCode::KeyS => 0x21,
        KeyCode::KeyD => 0x22,
        KeyCode::KeyF => 0x23,
        KeyCode::KeyG => 0x24,
        KeyCode::KeyH => 0x25,
        KeyCode::KeyJ => 0x26,
        KeyCode::KeyK => 0x27,
        KeyCode::KeyL => 0x28,
        KeyCode::Semicolon => 0x29,
        KeyCode::Quote => 0x2A,

        KeyCode::KeyZ => 0x31,
        KeyCode::KeyX => 0x32,
        KeyCode::KeyC => 0x33,
        KeyCode::KeyV => 0x34,
        KeyCode::KeyB => 0x35,
        KeyCode::KeyN => 0x36,
        KeyCode::KeyM => 0x37,
        KeyCode::Comma => 0x38,
        KeyCode::Period => 0x39,
        KeyCode::Slash => 0x3A,

        KeyCode::Space => 0x40,
        KeyCode::Backspace => 0x41,
        KeyCode::Tab => 0x42,
        KeyCode::Enter => 0x44,
        KeyCode::Escape => 0x45,
        KeyCode::Delete => 0x46,
        KeyCode::ArrowUp => 0x4C,
        KeyCode::ArrowDown => 0x4D,
        KeyCode::ArrowRight => 0x4E,
        KeyCode::ArrowLeft => 0x4F,
        KeyCode::F1 => 0x50,
        KeyCode::F2 => 0x51,
        KeyCode::F3 => 0x52,
        KeyCode::F4 => 0x53,
        KeyCode::F5 => 0x54,
        KeyCode::F6 => 0x55,
        KeyCode::F7 => 0x56,
        KeyCode::F8 => 0x57,
        KeyCode::F9 => 0x58,
        KeyCode::F10 => 0x59,

        KeyCode::ShiftLeft => 0x60,
        KeyCode::ShiftRight => 0x61,
        KeyCode::ControlLeft => 0x63,
        KeyCode::AltLeft => 0x64,
        KeyCode::AltRight => 0x65,
        KeyCode::SuperLeft => 0x66,
        KeyCode::SuperRight => 0x67,

        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_map_into_the_matrix() {
        assert_eq!(amiga_keycode(KeyCode::KeyA), Some(0x20));
        assert_eq!(amiga_keycode(KeyCode::Space), Some(0x40));
        assert_eq!(amiga_keycode(KeyCode::MediaPlayPause), None);
    }
}
