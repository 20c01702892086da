//! # lamco-x11-rdp-server
//!
//! X11 RDP server for Linux: desktop capture, input injection, ephemeral
//! NLA credentials and live session handover.
//!
//! # Architecture
//!
//! ```text
//! lamco-x11-rdp-server
//!   ├─> RdpListener (accept, TLS, authentication, per-connection state)
//!   │     └─> Session
//!   │           ├─> CaptureManager   (X11 GetImage → FrameQueue)
//!   │           ├─> EncodingManager  (FrameQueue → RAW / RFX updates)
//!   │           ├─> InputDispatcher  (client input → XTEST)
//!   │           └─> RdpConnection    (ProtocolLayer)
//!   └─> HandoverDaemon (adopts sessions passed over a Unix socket)
//! ```
//!
//! # Data Flow
//!
//! **Video Path:** X server → CaptureManager → FrameQueue → EncodingManager → Session → Client
//!
//! **Input Path:** Client → RdpConnection → Session → InputDispatcher → XTEST
//!
//! **Handover Path:** Session (bootstrap) → SCM_RIGHTS + state → HandoverDaemon (worker)

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Desktop backend seam (capture source and input injector factory)
pub mod backend;

/// Capture thread and its frame queue
pub mod capture;

/// Server configuration
pub mod config;

/// Damage region detection for differential updates
///
/// Tile-based frame differencing with region merging. The encoder uses it
/// to decide between full and differential updates.
pub mod damage;

/// Frame encoding (RAW / RFX tiles, full vs differential)
pub mod encoder;

/// Frame buffer and the capture → encode hand-off queue
pub mod frame;

/// Live session handover between processes
pub mod handover;

/// Input event injection
pub mod input;

/// Protocol layer seam and the built-in framed protocol
pub mod protocol;

/// Security: TLS, certificates and NLA credentials
pub mod security;

/// Listener, sessions and the shared server runtime
pub mod server;

/// Utility functions
pub mod utils;

/// X11 desktop backend (GetImage capture, XTEST injection)
pub mod x11;
