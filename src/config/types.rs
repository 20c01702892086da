//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::encoder::EncodingMode;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:3389")
    pub listen_addr: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Seconds a client has to complete TLS and authentication
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Depth of the per-session encoded update channel
    #[serde(default = "default_update_queue_depth")]
    pub update_queue_depth: usize,
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_update_queue_depth() -> usize {
    4
}

/// Security and authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Wrap connections in TLS
    pub enable_tls: bool,

    /// Path to TLS certificate file
    pub cert_path: PathBuf,

    /// Path to TLS private key file
    pub key_path: PathBuf,

    /// Generate a self-signed certificate when the files are missing
    #[serde(default)]
    pub generate_cert: bool,

    /// Username clients authenticate as
    pub username: String,

    /// Plain password (hashed at startup)
    #[serde(default)]
    pub password: Option<String>,

    /// NT hash as 32 hex digits, instead of a password
    #[serde(default)]
    pub nt_hash: Option<String>,

    /// Directory for the per-connection SAM records
    pub credential_dir: PathBuf,
}

/// Desktop capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// X display to connect to (None = $DISPLAY)
    #[serde(default)]
    pub display: Option<String>,

    /// Default capture width (0 = desktop width)
    pub width: u32,

    /// Default capture height (0 = desktop height)
    pub height: u32,

    /// Capture poll rate
    pub target_fps: u32,
}

/// Frame encoding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodingConfig {
    /// Bitmap encoding ("raw" or "rfx")
    pub mode: EncodingMode,

    /// Send only changed areas when possible
    pub frame_diff: bool,

    /// Damage tile size for raw updates in pixels
    #[serde(default = "default_tile_size")]
    pub tile_size: u32,
}

fn default_tile_size() -> u32 {
    64
}

/// Session handover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoverConfig {
    /// Unix socket the worker listens on
    pub socket_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    pub level: String,

    /// Log directory (None = console only)
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    /// File written inside `log_dir`
    pub const FILE_NAME: &'static str = "lamco-x11-rdp-server.log";

    /// Accepted values of `level`
    pub const LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    /// Level for the crate's own targets
    ///
    /// Each `-v` overrides the configured level: one gives debug, more give
    /// trace.
    pub fn effective_level(&self, verbose: u8) -> &str {
        match verbose {
            0 => &self.level,
            1 => "debug",
            _ => "trace",
        }
    }

    /// Log file to write, if any; an explicit path wins over `log_dir`
    pub fn log_file(&self, explicit: Option<&Path>) -> Option<PathBuf> {
        explicit
            .map(Path::to_path_buf)
            .or_else(|| self.log_dir.as_ref().map(|dir| dir.join(Self::FILE_NAME)))
    }
}
