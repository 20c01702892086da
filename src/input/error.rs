//! Input injection error types

use thiserror::Error;

/// Result type for input operations
pub type Result<T> = std::result::Result<T, InputError>;

/// Input module error types
#[derive(Error, Debug)]
pub enum InputError {
    /// The dispatcher has not been started (or was stopped)
    #[error("Input dispatcher is not running")]
    NotRunning,

    /// `start` called while already running
    #[error("Input dispatcher is already running")]
    AlreadyRunning,

    /// The injection backend could not be opened
    #[error("Input injection unavailable: {0}")]
    Unavailable(String),

    /// Unknown scancode
    #[error("Unknown scancode: 0x{0:04X}")]
    UnknownScancode(u16),

    /// UTF-16 code unit that cannot be typed on its own (lone surrogate)
    #[error("Unsupported unicode code unit: U+{0:04X}")]
    UnsupportedCodeUnit(u16),

    /// No free keycode to bind a keysym to
    #[error("No spare keycode available for keysym 0x{0:08X}")]
    NoSpareKeycode(u32),

    /// The backend rejected an injection request
    #[error("Injection failed: {0}")]
    Injection(String),
}
