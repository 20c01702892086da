//! Utility Functions and Diagnostics
//!
//! Startup diagnostics and user-friendly error formatting.
//!
//! ## Diagnostics
//!
//! The [`diagnostics`] module logs the host and the X session environment
//! the server is about to attach to, and warns about setups that will not
//! work (no `DISPLAY`, Wayland session).
//!
//! ## Error Formatting
//!
//! The [`errors`] module turns startup failures into a message with
//! troubleshooting steps:
//!
//! ```no_run
//! use lamco_x11_rdp_server::utils::format_user_error;
//!
//! # fn start() -> anyhow::Result<()> { Ok(()) }
//! if let Err(e) = start() {
//!     eprintln!("{}", format_user_error(&e));
//! }
//! ```
//!
//! Error categories with context-aware help:
//! - X display errors → DISPLAY, X authority, XTEST, screen depth
//! - TLS errors → certificate paths and format
//! - Network errors → port conflicts, privileges
//! - Credential errors → password/hash configuration, directory permissions
//! - Config errors → syntax and out-of-range values

pub mod diagnostics;
pub mod errors;

pub use diagnostics::{log_startup_diagnostics, DisplayEnvironment, SystemInfo};
pub use errors::{categorize, format_user_error, ErrorCategory};
