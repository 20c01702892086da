//! X11 desktop backend
//!
//! One [`X11Display`] connection is opened at startup and shared by `Arc`
//! between every session's capture source and input injector. All requests
//! go through its internal mutex, so a capture thread and a session task
//! never interleave requests on the connection.
//!
//! - Capture: core `GetImage` on the root window in `ZPixmap` format
//! - Input: XTEST fake input, with spare keycodes rebound on demand for
//!   keysyms the current keymap cannot produce

mod capture;
mod input;

pub use capture::X11CaptureSource;
pub use input::XTestInjector;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use x11rb::connection::Connection;
use x11rb::errors::{ConnectError, ConnectionError, ReplyError};
use x11rb::protocol::xproto::{ConnectionExt as _, Window};
use x11rb::rust_connection::RustConnection;

use crate::backend::DesktopBackend;
use crate::capture::{CaptureError, CaptureSource};
use crate::input::{InputError, InputInjector};

/// X11 errors
#[derive(Debug, thiserror::Error)]
pub enum X11Error {
    /// Could not connect to the display
    #[error("failed to connect to X display: {0}")]
    Connect(#[from] ConnectError),

    /// The connection broke
    #[error("X11 connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// A request failed
    #[error("X11 request failed: {0}")]
    Reply(#[from] ReplyError),

    /// The root window pixel format is not 32 bits per pixel
    #[error("unsupported root visual: depth {depth}, {bits_per_pixel} bits per pixel")]
    UnsupportedFormat {
        /// Root window depth
        depth: u8,
        /// Bits per pixel of the matching pixmap format
        bits_per_pixel: u8,
    },

    /// A required extension is missing
    #[error("X server lacks the {0} extension")]
    MissingExtension(&'static str),
}

/// Shared connection to one X display
pub struct X11Display {
    conn: Mutex<RustConnection>,
    name: String,
    root: Window,
    initial_size: (u32, u32),
    min_keycode: u8,
    max_keycode: u8,
}

impl X11Display {
    /// Connect to `display`, or `$DISPLAY` when `None`
    pub fn connect(display: Option<&str>) -> Result<Arc<Self>, X11Error> {
        let (conn, screen_num) = x11rb::connect(display)?;

        let setup = conn.setup();
        let screen = &setup.roots[screen_num];
        let depth = screen.root_depth;
        let bits_per_pixel = setup
            .pixmap_formats
            .iter()
            .find(|format| format.depth == depth)
            .map(|format| format.bits_per_pixel)
            .unwrap_or(0);
        if bits_per_pixel != 32 {
            return Err(X11Error::UnsupportedFormat {
                depth,
                bits_per_pixel,
            });
        }

        let name = display
            .map(str::to_string)
            .or_else(|| std::env::var("DISPLAY").ok())
            .unwrap_or_else(|| ":0".to_string());
        let root = screen.root;
        let initial_size = (
            u32::from(screen.width_in_pixels),
            u32::from(screen.height_in_pixels),
        );
        let (min_keycode, max_keycode) = (setup.min_keycode, setup.max_keycode);

        info!(
            "Connected to X display {} ({}x{}, depth {}, keycodes {}..={})",
            name, initial_size.0, initial_size.1, depth, min_keycode, max_keycode
        );

        Ok(Arc::new(Self {
            conn: Mutex::new(conn),
            name,
            root,
            initial_size,
            min_keycode,
            max_keycode,
        }))
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root window
    pub fn root(&self) -> Window {
        self.root
    }

    /// Keycode range of the server
    pub fn keycode_range(&self) -> (u8, u8) {
        (self.min_keycode, self.max_keycode)
    }

    /// Current root window size
    pub fn size(&self) -> Result<(u32, u32), X11Error> {
        let geometry = self.with_connection(|conn| -> Result<_, X11Error> {
            Ok(conn.get_geometry(self.root)?.reply()?)
        })?;
        Ok((u32::from(geometry.width), u32::from(geometry.height)))
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<R>(&self, f: impl FnOnce(&RustConnection) -> R) -> R {
        let conn = self.conn.lock();
        f(&conn)
    }
}

impl std::fmt::Debug for X11Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X11Display")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("initial_size", &self.initial_size)
            .finish_non_exhaustive()
    }
}

/// [`DesktopBackend`] over an [`X11Display`]
#[derive(Debug, Clone)]
pub struct X11Backend {
    display: Arc<X11Display>,
}

impl X11Backend {
    /// Backend for an open display
    pub fn new(display: Arc<X11Display>) -> Self {
        Self { display }
    }

    /// Connect and wrap in one step
    pub fn connect(display: Option<&str>) -> Result<Self, X11Error> {
        Ok(Self::new(X11Display::connect(display)?))
    }

    /// The shared display
    pub fn display(&self) -> &Arc<X11Display> {
        &self.display
    }
}

impl DesktopBackend for X11Backend {
    fn name(&self) -> &str {
        "x11"
    }

    fn desktop_size(&self) -> (u32, u32) {
        match self.display.size() {
            Ok(size) => size,
            Err(e) => {
                warn!("Failed to query root geometry, using initial size: {}", e);
                self.display.initial_size
            }
        }
    }

    fn open_capture(
        &self,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn CaptureSource>, CaptureError> {
        debug!("Opening X11 capture source at {}x{}", width, height);
        let source = X11CaptureSource::new(Arc::clone(&self.display), width, height)?;
        Ok(Box::new(source))
    }

    fn open_injector(&self) -> Result<Arc<dyn InputInjector>, InputError> {
        let injector = XTestInjector::new(Arc::clone(&self.display))
            .map_err(|e| InputError::Unavailable(e.to_string()))?;
        Ok(Arc::new(injector))
    }
}
