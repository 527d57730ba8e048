//! Keyboard: type-ahead queue feeding the CIA-A serial port.
//!
//! The keyboard MCU shifts one byte at a time into the CIA's serial
//! register and waits for the handshake pulse before sending the next.
//! Wire format: the raw key code in bits 7-1 (key-up in bit 0), rotated
//! and inverted by the transmitter.

use std::collections::VecDeque;

pub struct Keyboard {
    queue: VecDeque<u8>,
    awaiting_ack: bool,
}

impl Keyboard {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            awaiting_ack: false,
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.awaiting_ack = false;
    }

    /// Queue a raw Amiga key code.
    pub fn key_event(&mut self, code: u8, pressed: bool) {
        let value = (code << 1) | u8::from(!pressed);
        // Transmitted inverted, MSB-rotated, per the keyboard protocol.
        self.queue.push_back(!value.rotate_left(7));
    }

    /// The next byte to shift into the CIA, if the line is idle.
    pub fn try_send(&mut self) -> Option<u8> {
        if self.awaiting_ack {
            return None;
        }
        let byte = self.queue.pop_front()?;
        self.awaiting_ack = true;
        Some(byte)
    }

    /// Handshake pulse from the CIA serial line.
    pub fn acknowledge(&mut self) {
        self.awaiting_ack = false;
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Default for Keyboard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sends_one_byte_per_handshake() {
        let mut kbd = Keyboard::new();
        kbd.key_event(0x20, true);
        kbd.key_event(0x20, false);
        let first = kbd.try_send().unwrap();
        assert!(kbd.try_send().is_none());
        kbd.acknowledge();
        let second = kbd.try_send().unwrap();
        assert_ne!(first, second);
        kbd.acknowledge();
        assert!(kbd.try_send().is_none());
    }

    #[test]
    fn wire_encoding_distinguishes_up_and_down() {
        let mut kbd = Keyboard::new();
        kbd.key_event(0x35, true);
        let down = kbd.try_send().unwrap();
        kbd.acknowledge();
        kbd.key_event(0x35, false);
        let up = kbd.try_send().unwrap();
        // The up/down flag lands in the rotated high bit, inverted.
        assert_eq!(down & 0x7F, up & 0x7F);
        assert_ne!(down & 0x80, up & 0x80);
    }
}
