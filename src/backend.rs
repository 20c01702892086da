//! Desktop backend seam
//!
//! A [`DesktopBackend`] is the factory for everything a session needs from
//! the local desktop: a capture source per session and an input injector per
//! session. The X11 implementation lives in [`crate::x11`]; tests plug in an
//! in-memory backend.

use std::sync::Arc;

use crate::capture::{CaptureError, CaptureSource};
use crate::input::{InputError, InputInjector};

/// Provider of capture sources and input injectors for one desktop
pub trait DesktopBackend: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Current size of the desktop in pixels
    fn desktop_size(&self) -> (u32, u32);

    /// Open a capture source producing frames of (at most) `width`×`height`
    fn open_capture(&self, width: u32, height: u32)
        -> Result<Box<dyn CaptureSource>, CaptureError>;

    /// Open an input injector
    fn open_injector(&self) -> Result<Arc<dyn InputInjector>, InputError>;
}

/// Clamp a requested geometry to the desktop, treating 0 as "full desktop"
pub fn clamp_geometry(requested: (u32, u32), desktop: (u32, u32)) -> (u32, u32) {
    let pick = |want: u32, max: u32| if want == 0 { max } else { want.min(max) };
    (pick(requested.0, desktop.0), pick(requested.1, desktop.1))
}
