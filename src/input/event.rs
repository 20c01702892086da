//! RDP input events and their flag words
//!
//! Flag values follow the slow-path/fast-path input PDUs of MS-RDPBCGR
//! (TS_KEYBOARD_EVENT, TS_UNICODE_KEYBOARD_EVENT, TS_POINTER_EVENT and
//! TS_POINTERX_EVENT).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Keyboard event flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct KeyboardFlags: u16 {
        /// E0-prefixed scancode
        const EXTENDED = 0x0100;
        /// E1-prefixed scancode (Pause)
        const EXTENDED1 = 0x0200;
        /// Key was already down (auto-repeat)
        const DOWN = 0x4000;
        /// Key released
        const RELEASE = 0x8000;
    }
}

bitflags! {
    /// Pointer event flags
    ///
    /// The low nine bits carry the wheel rotation when `WHEEL` or `HWHEEL`
    /// is set; `WHEEL_NEGATIVE` is the sign bit of that field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PointerFlags: u16 {
        /// Sign bit of the rotation field
        const WHEEL_NEGATIVE = 0x0100;
        /// Vertical wheel rotation
        const WHEEL = 0x0200;
        /// Horizontal wheel rotation
        const HWHEEL = 0x0400;
        /// Pointer moved
        const MOVE = 0x0800;
        /// Left button
        const BUTTON1 = 0x1000;
        /// Right button
        const BUTTON2 = 0x2000;
        /// Middle button
        const BUTTON3 = 0x4000;
        /// Button pressed (absent: released)
        const DOWN = 0x8000;

        const _ = !0;
    }
}

bitflags! {
    /// Extended pointer event flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExtendedPointerFlags: u16 {
        /// Back button
        const BUTTON1 = 0x0001;
        /// Forward button
        const BUTTON2 = 0x0002;
        /// Button pressed (absent: released)
        const DOWN = 0x8000;
    }
}

/// Mask of the 9-bit two's-complement rotation field
pub const WHEEL_ROTATION_MASK: u16 = 0x01FF;

/// Rotation units per wheel detent
pub const WHEEL_DELTA: i32 = 120;

impl PointerFlags {
    /// Signed wheel rotation (positive: away from the user / to the right)
    pub fn wheel_rotation(self) -> i32 {
        let raw = (self.bits() & WHEEL_ROTATION_MASK) as i32;
        if self.contains(PointerFlags::WHEEL_NEGATIVE) {
            raw - 0x200
        } else {
            raw
        }
    }
}

/// One client input event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputEvent {
    /// Physical key by scancode
    KeyboardScancode {
        /// Event flags
        flags: KeyboardFlags,
        /// Set-1 scancode
        code: u16,
    },
    /// Character by UTF-16 code unit
    KeyboardUnicode {
        /// Event flags (only `RELEASE` is meaningful)
        flags: KeyboardFlags,
        /// UTF-16 code unit
        code_unit: u16,
    },
    /// Pointer move, button or wheel
    Pointer {
        /// Event flags
        flags: PointerFlags,
        /// Desktop x coordinate
        x: u16,
        /// Desktop y coordinate
        y: u16,
    },
    /// Extended (back/forward) buttons
    ExtendedPointer {
        /// Event flags
        flags: ExtendedPointerFlags,
        /// Desktop x coordinate
        x: u16,
        /// Desktop y coordinate
        y: u16,
    },
}

impl InputEvent {
    /// Plain pointer move
    pub fn pointer_move(x: u16, y: u16) -> Self {
        InputEvent::Pointer {
            flags: PointerFlags::MOVE,
            x,
            y,
        }
    }

    /// Key press or release by scancode
    pub fn key(code: u16, extended: bool, pressed: bool) -> Self {
        let mut flags = KeyboardFlags::empty();
        flags.set(KeyboardFlags::EXTENDED, extended);
        flags.set(KeyboardFlags::RELEASE, !pressed);
        InputEvent::KeyboardScancode { flags, code }
    }
}
