//! Scancode and keysym mapping tables
//!
//! RDP keyboard events carry PC/AT set-1 scancodes with an E0 ("extended")
//! or E1 flag. The X server identifies physical keys by keycode, which on
//! evdev-based servers is the Linux input keycode plus 8.

use crate::input::error::{InputError, Result};

/// Offset between Linux evdev keycodes and X11 keycodes
pub const X11_KEYCODE_OFFSET: u32 = 8;

/// Linux evdev keycodes
pub mod keycodes {
    pub const KEY_ESC: u32 = 1;
    pub const KEY_1: u32 = 2;
    pub const KEY_2: u32 = 3;
    pub const KEY_3: u32 = 4;
    pub const KEY_4: u32 = 5;
    pub const KEY_5: u32 = 6;
    pub const KEY_6: u32 = 7;
    pub const KEY_7: u32 = 8;
    pub const KEY_8: u32 = 9;
    pub const KEY_9: u32 = 10;
    pub const KEY_0: u32 = 11;
    pub const KEY_MINUS: u32 = 12;
    pub const KEY_EQUAL: u32 = 13;
    pub const KEY_BACKSPACE: u32 = 14;
    pub const KEY_TAB: u32 = 15;
    pub const KEY_Q: u32 = 16;
    pub const KEY_W: u32 = 17;
    pub const KEY_E: u32 = 18;
    pub const KEY_R: u32 = 19;
    pub const KEY_T: u32 = 20;
    pub const KEY_Y: u32 = 21;
    pub const KEY_U: u32 = 22;
    pub const KEY_I: u32 = 23;
    pub const KEY_O: u32 = 24;
    pub const KEY_P: u32 = 25;
    pub const KEY_LEFTBRACE: u32 = 26;
    pub const KEY_RIGHTBRACE: u32 = 27;
    pub const KEY_ENTER: u32 = 28;
    pub const KEY_LEFTCTRL: u32 = 29;
    pub const KEY_A: u32 = 30;
    pub const KEY_S: u32 = 31;
    pub const KEY_D: u32 = 32;
    pub const KEY_F: u32 = 33;
    pub const KEY_G: u32 = 34;
    pub const KEY_H: u32 = 35;
    pub const KEY_J: u32 = 36;
    pub const KEY_K: u32 = 37;
    pub const KEY_L: u32 = 38;
    pub const KEY_SEMICOLON: u32 = 39;
    pub const KEY_APOSTROPHE: u32 = 40;
    pub const KEY_GRAVE: u32 = 41;
    pub const KEY_LEFTSHIFT: u32 = 42;
    pub const KEY_BACKSLASH: u32 = 43;
    pub const KEY_Z: u32 = 44;
    pub const KEY_X: u32 = 45;
    pub const KEY_C: u32 = 46;
    pub const KEY_V: u32 = 47;
    pub const KEY_B: u32 = 48;
    pub const KEY_N: u32 = 49;
    pub const KEY_M: u32 = 50;
    pub const KEY_COMMA: u32 = 51;
    pub const KEY_DOT: u32 = 52;
    pub const KEY_SLASH: u32 = 53;
    pub const KEY_RIGHTSHIFT: u32 = 54;
    pub const KEY_KPASTERISK: u32 = 55;
    pub const KEY_LEFTALT: u32 = 56;
    pub const KEY_SPACE: u32 = 57;
    pub const KEY_CAPSLOCK: u32 = 58;
    pub const KEY_F1: u32 = 59;
    pub const KEY_F2: u32 = 60;
    pub const KEY_F3: u32 = 61;
    pub const KEY_F4: u32 = 62;
    pub const KEY_F5: u32 = 63;
    pub const KEY_F6: u32 = 64;
    pub const KEY_F7: u32 = 65;
    pub const KEY_F8: u32 = 66;
    pub const KEY_F9: u32 = 67;
    pub const KEY_F10: u32 = 68;
    pub const KEY_NUMLOCK: u32 = 69;
    pub const KEY_SCROLLLOCK: u32 = 70;
    pub const KEY_KP7: u32 = 71;
    pub const KEY_KP8: u32 = 72;
    pub const KEY_KP9: u32 = 73;
    pub const KEY_KPMINUS: u32 = 74;
    pub const KEY_KP4: u32 = 75;
    pub const KEY_KP5: u32 = 76;
    pub const KEY_KP6: u32 = 77;
    pub const KEY_KPPLUS: u32 = 78;
    pub const KEY_KP1: u32 = 79;
    pub const KEY_KP2: u32 = 80;
    pub const KEY_KP3: u32 = 81;
    pub const KEY_KP0: u32 = 82;
    pub const KEY_KPDOT: u32 = 83;
    pub const KEY_102ND: u32 = 86;
    pub const KEY_F11: u32 = 87;
    pub const KEY_F12: u32 = 88;
    pub const KEY_RO: u32 = 89;
    pub const KEY_KATAKANAHIRAGANA: u32 = 93;
    pub const KEY_HENKAN: u32 = 92;
    pub const KEY_MUHENKAN: u32 = 94;
    pub const KEY_KPENTER: u32 = 96;
    pub const KEY_RIGHTCTRL: u32 = 97;
    pub const KEY_KPSLASH: u32 = 98;
    pub const KEY_SYSRQ: u32 = 99;
    pub const KEY_RIGHTALT: u32 = 100;
    pub const KEY_HOME: u32 = 102;
    pub const KEY_UP: u32 = 103;
    pub const KEY_PAGEUP: u32 = 104;
    pub const KEY_LEFT: u32 = 105;
    pub const KEY_RIGHT: u32 = 106;
    pub const KEY_END: u32 = 107;
    pub const KEY_DOWN: u32 = 108;
    pub const KEY_PAGEDOWN: u32 = 109;
    pub const KEY_INSERT: u32 = 110;
    pub const KEY_DELETE: u32 = 111;
    pub const KEY_MUTE: u32 = 113;
    pub const KEY_VOLUMEDOWN: u32 = 114;
    pub const KEY_VOLUMEUP: u32 = 115;
    pub const KEY_POWER: u32 = 116;
    pub const KEY_KPEQUAL: u32 = 117;
    pub const KEY_PAUSE: u32 = 119;
    pub const KEY_HANGEUL: u32 = 122;
    pub const KEY_HANJA: u32 = 123;
    pub const KEY_YEN: u32 = 124;
    pub const KEY_LEFTMETA: u32 = 125;
    pub const KEY_RIGHTMETA: u32 = 126;
    pub const KEY_COMPOSE: u32 = 127;
    pub const KEY_CALC: u32 = 140;
    pub const KEY_SLEEP: u32 = 142;
    pub const KEY_WAKEUP: u32 = 143;
    pub const KEY_MAIL: u32 = 155;
    pub const KEY_BOOKMARKS: u32 = 156;
    pub const KEY_COMPUTER: u32 = 157;
    pub const KEY_BACK: u32 = 158;
    pub const KEY_FORWARD: u32 = 159;
    pub const KEY_NEXTSONG: u32 = 163;
    pub const KEY_PLAYPAUSE: u32 = 164;
    pub const KEY_PREVIOUSSONG: u32 = 165;
    pub const KEY_STOPCD: u32 = 166;
    pub const KEY_HOMEPAGE: u32 = 172;
    pub const KEY_REFRESH: u32 = 173;
    pub const KEY_F13: u32 = 183;
    pub const KEY_F14: u32 = 184;
    pub const KEY_F15: u32 = 185;
    pub const KEY_F16: u32 = 186;
    pub const KEY_F17: u32 = 187;
    pub const KEY_F18: u32 = 188;
    pub const KEY_F19: u32 = 189;
    pub const KEY_F20: u32 = 190;
    pub const KEY_F21: u32 = 191;
    pub const KEY_F22: u32 = 192;
    pub const KEY_F23: u32 = 193;
    pub const KEY_F24: u32 = 194;
    pub const KEY_PRINT: u32 = 210;
    pub const KEY_SEARCH: u32 = 217;
    pub const KEY_MEDIA: u32 = 226;
    pub const KEY_MENU: u32 = 139;
    pub const KEY_STOP: u32 = 128;
}

use keycodes::*;

/// Set-1 scancodes without prefix
const PRIMARY: &[(u8, u32)] = &[
    (0x01, KEY_ESC),
    (0x02, KEY_1),
    (0x03, KEY_2),
    (0x04, KEY_3),
    (0x05, KEY_4),
    (0x06, KEY_5),
    (0x07, KEY_6),
    (0x08, KEY_7),
    (0x09, KEY_8),
    (0x0A, KEY_9),
    (0x0B, KEY_0),
    (0x0C, KEY_MINUS),
    (0x0D, KEY_EQUAL),
    (0x0E, KEY_BACKSPACE),
    (0x0F, KEY_TAB),
    (0x10, KEY_Q),
    (0x11, KEY_W),
    (0x12, KEY_E),
    (0x13, KEY_R),
    (0x14, KEY_T),
    (0x15, KEY_Y),
    (0x16, KEY_U),
    (0x17, KEY_I),
    (0x18, KEY_O),
    (0x19, KEY_P),
    (0x1A, KEY_LEFTBRACE),
    (0x1B, KEY_RIGHTBRACE),
    (0x1C, KEY_ENTER),
    (0x1D, KEY_LEFTCTRL),
    (0x1E, KEY_A),
    (0x1F, KEY_S),
    (0x20, KEY_D),
    (0x21, KEY_F),
    (0x22, KEY_G),
    (0x23, KEY_H),
    (0x24, KEY_J),
    (0x25, KEY_K),
    (0x26, KEY_L),
    (0x27, KEY_SEMICOLON),
    (0x28, KEY_APOSTROPHE),
    (0x29, KEY_GRAVE),
    (0x2A, KEY_LEFTSHIFT),
    (0x2B, KEY_BACKSLASH),
    (0x2C, KEY_Z),
    (0x2D, KEY_X),
    (0x2E, KEY_C),
    (0x2F, KEY_V),
    (0x30, KEY_B),
    (0x31, KEY_N),
    (0x32, KEY_M),
    (0x33, KEY_COMMA),
    (0x34, KEY_DOT),
    (0x35, KEY_SLASH),
    (0x36, KEY_RIGHTSHIFT),
    (0x37, KEY_KPASTERISK),
    (0x38, KEY_LEFTALT),
    (0x39, KEY_SPACE),
    (0x3A, KEY_CAPSLOCK),
    (0x3B, KEY_F1),
    (0x3C, KEY_F2),
    (0x3D, KEY_F3),
    (0x3E, KEY_F4),
    (0x3F, KEY_F5),
    (0x40, KEY_F6),
    (0x41, KEY_F7),
    (0x42, KEY_F8),
    (0x43, KEY_F9),
    (0x44, KEY_F10),
    (0x45, KEY_NUMLOCK),
    (0x46, KEY_SCROLLLOCK),
    (0x47, KEY_KP7),
    (0x48, KEY_KP8),
    (0x49, KEY_KP9),
    (0x4A, KEY_KPMINUS),
    (0x4B, KEY_KP4),
    (0x4C, KEY_KP5),
    (0x4D, KEY_KP6),
    (0x4E, KEY_KPPLUS),
    (0x4F, KEY_KP1),
    (0x50, KEY_KP2),
    (0x51, KEY_KP3),
    (0x52, KEY_KP0),
    (0x53, KEY_KPDOT),
    (0x54, KEY_SYSRQ),
    (0x56, KEY_102ND),
    (0x57, KEY_F11),
    (0x58, KEY_F12),
    (0x59, KEY_KPEQUAL),
    (0x5A, KEY_F13),
    (0x5B, KEY_F14),
    (0x5C, KEY_F15),
    (0x5D, KEY_F16),
    (0x5E, KEY_F17),
    (0x5F, KEY_F18),
    (0x60, KEY_F19),
    (0x61, KEY_F20),
    (0x62, KEY_F21),
    (0x63, KEY_F22),
    (0x64, KEY_F23),
    (0x65, KEY_F24),
    (0x70, KEY_KATAKANAHIRAGANA),
    (0x71, KEY_HANJA),
    (0x72, KEY_HANGEUL),
    (0x73, KEY_RO),
    (0x79, KEY_HENKAN),
    (0x7B, KEY_MUHENKAN),
    (0x7D, KEY_YEN),
];

/// Set-1 scancodes with the E0 prefix
const EXTENDED: &[(u8, u32)] = &[
    (0x10, KEY_PREVIOUSSONG),
    (0x19, KEY_NEXTSONG),
    (0x1C, KEY_KPENTER),
    (0x1D, KEY_RIGHTCTRL),
    (0x20, KEY_MUTE),
    (0x21, KEY_CALC),
    (0x22, KEY_PLAYPAUSE),
    (0x24, KEY_STOPCD),
    (0x2E, KEY_VOLUMEDOWN),
    (0x30, KEY_VOLUMEUP),
    (0x32, KEY_HOMEPAGE),
    (0x35, KEY_KPSLASH),
    (0x37, KEY_PRINT),
    (0x38, KEY_RIGHTALT),
    (0x46, KEY_PAUSE),
    (0x47, KEY_HOME),
    (0x48, KEY_UP),
    (0x49, KEY_PAGEUP),
    (0x4B, KEY_LEFT),
    (0x4D, KEY_RIGHT),
    (0x4F, KEY_END),
    (0x50, KEY_DOWN),
    (0x51, KEY_PAGEDOWN),
    (0x52, KEY_INSERT),
    (0x53, KEY_DELETE),
    (0x5B, KEY_LEFTMETA),
    (0x5C, KEY_RIGHTMETA),
    (0x5D, KEY_COMPOSE),
    (0x5E, KEY_POWER),
    (0x5F, KEY_SLEEP),
    (0x63, KEY_WAKEUP),
    (0x65, KEY_SEARCH),
    (0x66, KEY_BOOKMARKS),
    (0x67, KEY_REFRESH),
    (0x68, KEY_STOP),
    (0x69, KEY_FORWARD),
    (0x6A, KEY_BACK),
    (0x6B, KEY_COMPUTER),
    (0x6C, KEY_MAIL),
    (0x6D, KEY_MEDIA),
];

/// RDP scancode to evdev keycode translation
///
/// Both tables are flattened into 256-entry arrays at construction so a
/// lookup is a single index.
pub struct ScancodeMapper {
    primary: [u32; 256],
    extended: [u32; 256],
}

impl ScancodeMapper {
    /// Build the lookup tables
    pub fn new() -> Self {
        let mut mapper = Self {
            primary: [0; 256],
            extended: [0; 256],
        };
        for &(scancode, keycode) in PRIMARY {
            mapper.primary[scancode as usize] = keycode;
        }
        for &(scancode, keycode) in EXTENDED {
            mapper.extended[scancode as usize] = keycode;
        }
        mapper
    }

    /// Translate a scancode to an evdev keycode
    ///
    /// `e1_prefix` is only meaningful for 0x1D, which RDP clients send for
    /// the Pause key.
    pub fn translate_scancode(&self, scancode: u16, extended: bool, e1_prefix: bool) -> Result<u32> {
        let code = u8::try_from(scancode).map_err(|_| InputError::UnknownScancode(scancode))?;

        if e1_prefix {
            return if code == 0x1D {
                Ok(KEY_PAUSE)
            } else {
                Err(InputError::UnknownScancode(0xE100 | scancode))
            };
        }

        let table = if extended { &self.extended } else { &self.primary };
        match table[code as usize] {
            0 if extended => Err(InputError::UnknownScancode(0xE000 | scancode)),
            0 => Err(InputError::UnknownScancode(scancode)),
            keycode => Ok(keycode),
        }
    }

    /// Translate a scancode straight to an X11 keycode
    pub fn x11_keycode(&self, scancode: u16, extended: bool, e1_prefix: bool) -> Result<u8> {
        let evdev = self.translate_scancode(scancode, extended, e1_prefix)?;
        u8::try_from(evdev + X11_KEYCODE_OFFSET).map_err(|_| InputError::UnknownScancode(scancode))
    }

    /// Whether a scancode has a mapping
    pub fn is_mapped(&self, scancode: u16, extended: bool) -> bool {
        self.translate_scancode(scancode, extended, false).is_ok()
    }
}

impl Default for ScancodeMapper {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a Unicode code point to an X keysym
///
/// Latin-1 printable characters share their code point with the keysym; a
/// few control characters have dedicated function keysyms; everything else
/// uses the Unicode keysym range.
pub fn unicode_to_keysym(code_point: u32) -> u32 {
    match code_point {
        0x08 => 0xFF08, // BackSpace
        0x09 => 0xFF09, // Tab
        0x0A | 0x0D => 0xFF0D, // Return
        0x1B => 0xFF1B, // Escape
        0x7F => 0xFFFF, // Delete
        0x20..=0x7E | 0xA0..=0xFF => code_point,
        _ => 0x0100_0000 | code_point,
    }
}
