//! Input Event Injection
//!
//! Turns RDP input events into X server input. The [`InputDispatcher`] owns
//! the per-session injection state and routes each event to an
//! [`InputInjector`], the seam behind which the X11 XTEST implementation
//! lives.
//!
//! # Architecture
//!
//! ```text
//! RDP Input Events
//!       ↓
//! ┌──────────────────────────┐
//! │  InputDispatcher         │ ← running state, held keys/buttons
//! │  - scancode → keycode    │
//! │  - unicode → keysym      │
//! │  - wheel → buttons 4..7  │
//! │  - coordinate clamping   │
//! └──────────────────────────┘
//!       ↓
//! ┌──────────────────────────┐
//! │  InputInjector           │ ← XTEST (x11::XTestInjector)
//! └──────────────────────────┘
//! ```
//!
//! Per-event failures are returned to the caller and never stop the
//! dispatcher.

mod dispatcher;
pub mod error;
mod event;
pub mod mapper;

pub use dispatcher::{InputDispatcher, InputStats, XButton};
pub use error::{InputError, Result};
pub use event::{
    ExtendedPointerFlags, InputEvent, KeyboardFlags, PointerFlags, WHEEL_DELTA,
    WHEEL_ROTATION_MASK,
};
pub use mapper::ScancodeMapper;

/// Low-level injection primitives
///
/// Keycodes and button numbers are in X11 terms. Implementations must be
/// callable from any thread.
#[cfg_attr(test, mockall::automock)]
pub trait InputInjector: Send + Sync {
    /// Press or release a key by X keycode
    fn key(&self, keycode: u8, pressed: bool) -> Result<()>;

    /// Press or release whatever key produces `keysym`
    fn keysym(&self, keysym: u32, pressed: bool) -> Result<()>;

    /// Move the pointer to absolute desktop coordinates
    fn pointer_motion(&self, x: u16, y: u16) -> Result<()>;

    /// Press or release an X pointer button (1-9)
    fn pointer_button(&self, button: u8, pressed: bool) -> Result<()>;
}
