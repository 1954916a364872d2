// The eight gameboy buttons/direction keys are arranged in form of a 2x4 matrix. Select either button or direction
// keys by writing to the joypad register, then read-out bit 0-3.
//
// FF00 - P1/JOYP - Joypad (R/W)
//
// Bit 7 - Not used
// Bit 6 - Not used
// Bit 5 - P15 Select Button Keys      (0=Select)
// Bit 4 - P14 Select Direction Keys   (0=Select)
// Bit 3 - P13 Input Down  or Start    (0=Pressed) (Read Only)
// Bit 2 - P12 Input Up    or Select   (0=Pressed) (Read Only)
// Bit 1 - P11 Input Left  or Button B (0=Pressed) (Read Only)
// Bit 0 - P10 Input Right or Button A (0=Pressed)
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[rustfmt::skip]
#[derive(Clone, Copy)]
pub enum JoypadKey {
    Right  = 0b0000_0001,
    Left   = 0b0000_0010,
    Up     = 0b0000_0100,
    Down   = 0b0000_1000,
    A      = 0b0001_0000,
    B      = 0b0010_0000,
    Select = 0b0100_0000,
    Start  = 0b1000_0000,
}

// Pressed-key bitmask shared between the emulation thread and the host input thread. A set bit
// means the key is held. Atomic loads and stores keep each key transition visible to joypad
// register reads without a lock held across instructions.
#[derive(Clone)]
pub struct Joypad {
    pressed: Arc<AtomicU8>,
}

impl Joypad {
    pub fn power_up() -> Self {
        Self { pressed: Arc::new(AtomicU8::new(0x00)) }
    }

    pub fn set_key(&self, key: JoypadKey, pressed: bool) {
        if pressed {
            self.pressed.fetch_or(key as u8, Ordering::Release);
        } else {
            self.pressed.fetch_and(!(key as u8), Ordering::Release);
        }
    }

    // Low nibble of the joypad register for a given selector byte, active low. With both rows
    // deselected every input reads released; with both selected the rows OR together.
    pub fn read_row(&self, select: u8) -> u8 {
        let pressed = self.pressed.load(Ordering::Acquire);
        let mut v = 0x0f;
        if select & 0x20 == 0x00 {
            v &= !(pressed >> 4);
        }
        if select & 0x10 == 0x00 {
            v &= !(pressed & 0x0f);
        }
        v & 0x0f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_keys_read_high() {
        let joypad = Joypad::power_up();
        assert_eq!(joypad.read_row(0x10), 0x0f);
        assert_eq!(joypad.read_row(0x20), 0x0f);
        assert_eq!(joypad.read_row(0x30), 0x0f);
    }

    #[test]
    fn direction_row() {
        let joypad = Joypad::power_up();
        joypad.set_key(JoypadKey::Down, true);
        joypad.set_key(JoypadKey::Right, true);
        // Bit 4 low selects the direction pad.
        assert_eq!(joypad.read_row(0x20), 0b0110);
        // The action row is unaffected.
        assert_eq!(joypad.read_row(0x10), 0x0f);
        joypad.set_key(JoypadKey::Down, false);
        assert_eq!(joypad.read_row(0x20), 0b1110);
    }

    #[test]
    fn action_row() {
        let joypad = Joypad::power_up();
        joypad.set_key(JoypadKey::Start, true);
        joypad.set_key(JoypadKey::A, true);
        // Bit 5 low selects the action buttons.
        assert_eq!(joypad.read_row(0x10), 0b0110);
    }

    #[test]
    fn both_rows_or_together() {
        let joypad = Joypad::power_up();
        joypad.set_key(JoypadKey::Up, true);
        joypad.set_key(JoypadKey::B, true);
        assert_eq!(joypad.read_row(0x00), 0b1001);
    }
}
