//! Configuration management
//!
//! Handles loading, validation, and merging of configuration from:
//! - TOML files
//! - Environment variables (through the CLI)
//! - CLI arguments

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub mod types;

pub use types::*;

use crate::encoder::EncodingMode;
use crate::security::{hash_password, validate_username, NtHash};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Security configuration
    pub security: SecurityConfig,
    /// Capture configuration
    pub capture: CaptureConfig,
    /// Encoding configuration
    pub encoding: EncodingConfig,
    /// Handover configuration
    pub handover: HandoverConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Create default configuration
    pub fn default_config() -> Self {
        let runtime_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);

        Config {
            server: ServerConfig {
                listen_addr: "0.0.0.0:3389".to_string(),
                max_connections: 10,
                handshake_timeout_secs: 10,
                update_queue_depth: 4,
            },
            security: SecurityConfig {
                enable_tls: true,
                cert_path: PathBuf::from("/etc/lamco-x11-rdp-server/cert.pem"),
                key_path: PathBuf::from("/etc/lamco-x11-rdp-server/key.pem"),
                generate_cert: false,
                username: "rdp".to_string(),
                password: None,
                nt_hash: None,
                credential_dir: runtime_dir.join("lamco-x11-rdp-server/credentials"),
            },
            capture: CaptureConfig {
                display: None,
                width: 0,
                height: 0,
                target_fps: 30,
            },
            encoding: EncodingConfig {
                mode: EncodingMode::Rfx,
                frame_diff: true,
                tile_size: 64,
            },
            handover: HandoverConfig {
                socket_path: runtime_dir.join("lamco-x11-rdp-server/handover.sock"),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_dir: None,
            },
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.server.max_connections == 0 {
            anyhow::bail!("max_connections must be at least 1");
        }
        if self.server.handshake_timeout_secs == 0 {
            anyhow::bail!("handshake_timeout_secs must be at least 1");
        }
        if self.server.update_queue_depth == 0 {
            anyhow::bail!("update_queue_depth must be at least 1");
        }

        if self.security.enable_tls && !self.security.generate_cert {
            if !self.security.cert_path.exists() {
                anyhow::bail!("Certificate not found: {:?}", self.security.cert_path);
            }
            if !self.security.key_path.exists() {
                anyhow::bail!("Private key not found: {:?}", self.security.key_path);
            }
        }

        validate_username(&self.security.username).context("Invalid security.username")?;
        self.expected_hash()?;

        if !(1..=120).contains(&self.capture.target_fps) {
            anyhow::bail!(
                "target_fps must be between 1 and 120, got {}",
                self.capture.target_fps
            );
        }

        let tile = self.encoding.tile_size;
        if tile < 16 || tile % 16 != 0 {
            anyhow::bail!("tile_size must be a multiple of 16 (>= 16), got {}", tile);
        }

        if !LoggingConfig::LEVELS.contains(&self.logging.level.as_str()) {
            anyhow::bail!("Unknown logging.level '{}'", self.logging.level);
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse::<SocketAddr>()
            .context("Invalid listen address")
    }

    /// Handshake deadline
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.server.handshake_timeout_secs)
    }

    /// NT hash clients must prove knowledge of
    ///
    /// Exactly one of `password` and `nt_hash` must be set.
    pub fn expected_hash(&self) -> Result<NtHash> {
        match (&self.security.password, &self.security.nt_hash) {
            (Some(password), None) => Ok(hash_password(password)),
            (None, Some(hex)) => NtHash::from_hex(hex).context("Invalid security.nt_hash"),
            (Some(_), Some(_)) => anyhow::bail!("Set either security.password or security.nt_hash, not both"),
            (None, None) => anyhow::bail!("No credential configured: set security.password or security.nt_hash"),
        }
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, listen: Option<String>, port: Option<u16>) -> Self {
        match (listen, port) {
            (Some(listen_addr), Some(port)) => {
                self.server.listen_addr = format!("{}:{}", listen_addr, port);
            }
            (Some(listen_addr), None) => {
                let port = self.listen_addr().map(|a| a.port()).unwrap_or(3389);
                self.server.listen_addr = format!("{}:{}", listen_addr, port);
            }
            (None, Some(port)) => {
                if let Ok(mut addr) = self.listen_addr() {
                    addr.set_port(port);
                    self.server.listen_addr = addr.to_string();
                }
            }
            (None, None) => {}
        }

        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}
