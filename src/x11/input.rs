//! XTEST input injection

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt as _, KEY_PRESS_EVENT, KEY_RELEASE_EVENT};
use x11rb::protocol::xproto::{BUTTON_PRESS_EVENT, BUTTON_RELEASE_EVENT, MOTION_NOTIFY_EVENT};
use x11rb::protocol::xtest::ConnectionExt as _;
use x11rb::rust_connection::RustConnection;
use x11rb::CURRENT_TIME;

use super::{X11Display, X11Error};
use crate::input::{InputError, InputInjector, Result};

/// Keysym to keycode bindings, including spare keycodes rebound at runtime
#[derive(Debug, Default)]
struct Keymap {
    lookup: HashMap<u32, u8>,
    spare: Vec<u8>,
    /// Spare keycode index handed out next
    next_spare: usize,
    /// Keysym currently bound to each spare keycode
    bound: HashMap<u8, u32>,
}

impl Keymap {
    /// Build from a GetKeyboardMapping reply
    fn from_mapping(min_keycode: u8, keysyms_per_keycode: u8, keysyms: &[u32]) -> Self {
        let mut keymap = Keymap::default();
        let per = usize::from(keysyms_per_keycode.max(1));

        for (index, syms) in keysyms.chunks(per).enumerate() {
            let Ok(offset) = u8::try_from(index) else {
                break;
            };
            let Some(keycode) = min_keycode.checked_add(offset) else {
                break;
            };
            if syms.iter().all(|&sym| sym == 0) {
                keymap.spare.push(keycode);
            } else if let Some(&sym) = syms.first().filter(|&&sym| sym != 0) {
                // Only unshifted symbols, so no modifier has to be synthesised
                keymap.lookup.entry(sym).or_insert(keycode);
            }
        }
        keymap
    }

    /// Pick a spare keycode for `keysym`, evicting the oldest binding
    fn assign_spare(&mut self, keysym: u32) -> Option<u8> {
        if self.spare.is_empty() {
            return None;
        }
        let keycode = self.spare[self.next_spare % self.spare.len()];
        self.next_spare = self.next_spare.wrapping_add(1);

        if let Some(previous) = self.bound.insert(keycode, keysym) {
            self.lookup.remove(&previous);
        }
        self.lookup.insert(keysym, keycode);
        Some(keycode)
    }
}

/// [`InputInjector`] using the XTEST extension
pub struct XTestInjector {
    display: Arc<X11Display>,
    keymap: Mutex<Keymap>,
}

impl XTestInjector {
    /// Check for XTEST and load the keyboard mapping
    pub fn new(display: Arc<X11Display>) -> std::result::Result<Self, X11Error> {
        let (min_keycode, max_keycode) = display.keycode_range();

        let keymap = display.with_connection(|conn| -> std::result::Result<Keymap, X11Error> {
            let version = conn
                .xtest_get_version(2, 2)
                .map_err(|_| X11Error::MissingExtension("XTEST"))?
                .reply()
                .map_err(|_| X11Error::MissingExtension("XTEST"))?;
            debug!(
                "XTEST {}.{} available",
                version.major_version, version.minor_version
            );

            let count = max_keycode.saturating_sub(min_keycode).saturating_add(1);
            let mapping = conn.get_keyboard_mapping(min_keycode, count)?.reply()?;
            Ok(Keymap::from_mapping(
                min_keycode,
                mapping.keysyms_per_keycode,
                &mapping.keysyms,
            ))
        })?;

        debug!(
            "Keymap loaded: {} keysyms, {} spare keycodes",
            keymap.lookup.len(),
            keymap.spare.len()
        );

        Ok(Self {
            display,
            keymap: Mutex::new(keymap),
        })
    }

    fn fake(&self, event_type: u8, detail: u8, x: i16, y: i16) -> Result<()> {
        let root = self.display.root();
        self.display.with_connection(|conn| {
            conn.xtest_fake_input(event_type, detail, CURRENT_TIME, root, x, y, 0)
                .map_err(injection)?;
            conn.flush().map_err(injection)
        })
    }

    fn keycode_for(&self, keysym: u32, pressed: bool) -> Result<u8> {
        let mut keymap = self.keymap.lock();
        if let Some(&keycode) = keymap.lookup.get(&keysym) {
            return Ok(keycode);
        }
        if !pressed {
            // Release of a keysym we never bound; nothing is held
            return Err(InputError::Injection(format!(
                "release of unbound keysym 0x{keysym:X}"
            )));
        }

        let keycode = keymap
            .assign_spare(keysym)
            .ok_or(InputError::NoSpareKeycode(keysym))?;
        drop(keymap);

        self.display.with_connection(|conn| -> Result<()> {
            bind_keycode(conn, keycode, keysym)
        })?;
        trace!("Bound keysym 0x{:X} to spare keycode {}", keysym, keycode);
        Ok(keycode)
    }
}

fn bind_keycode(conn: &RustConnection, keycode: u8, keysym: u32) -> Result<()> {
    // Same symbol in both columns so the shift state does not matter
    conn.change_keyboard_mapping(1, keycode, 2, &[keysym, keysym])
        .map_err(injection)?
        .check()
        .map_err(|e| InputError::Injection(e.to_string()))?;
    Ok(())
}

fn injection(e: impl std::fmt::Display) -> InputError {
    InputError::Injection(e.to_string())
}

impl InputInjector for XTestInjector {
    fn key(&self, keycode: u8, pressed: bool) -> Result<()> {
        let event = if pressed {
            KEY_PRESS_EVENT
        } else {
            KEY_RELEASE_EVENT
        };
        self.fake(event, keycode, 0, 0)
    }

    fn keysym(&self, keysym: u32, pressed: bool) -> Result<()> {
        let keycode = self.keycode_for(keysym, pressed)?;
        self.key(keycode, pressed)
    }

    fn pointer_motion(&self, x: u16, y: u16) -> Result<()> {
        let x = i16::try_from(x).unwrap_or(i16::MAX);
        let y = i16::try_from(y).unwrap_or(i16::MAX);
        self.fake(MOTION_NOTIFY_EVENT, 0, x, y)
    }

    fn pointer_button(&self, button: u8, pressed: bool) -> Result<()> {
        let event = if pressed {
            BUTTON_PRESS_EVENT
        } else {
            BUTTON_RELEASE_EVENT
        };
        self.fake(event, button, 0, 0)
    }
}
