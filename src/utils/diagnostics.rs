//! System Diagnostics
//!
//! Startup information for bug reports: host, kernel, CPU count and the X
//! session environment the server will attach to.

use std::env;

use tracing::{info, warn};

/// System information for diagnostics
#[derive(Debug, Clone)]
pub struct SystemInfo {
    /// Kernel name and release (e.g., "Linux 6.8.0")
    pub kernel: String,

    /// Machine architecture
    pub machine: String,

    /// Number of logical CPU cores
    pub cpu_count: usize,

    /// System hostname
    pub hostname: String,
}

impl SystemInfo {
    /// Gather system information
    pub fn gather() -> Self {
        let (kernel, machine) = match nix::sys::utsname::uname() {
            Ok(uts) => (
                format!(
                    "{} {}",
                    uts.sysname().to_string_lossy(),
                    uts.release().to_string_lossy()
                ),
                uts.machine().to_string_lossy().into_owned(),
            ),
            Err(_) => ("Unknown".to_string(), "Unknown".to_string()),
        };

        Self {
            kernel,
            machine,
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "Unknown".to_string()),
        }
    }

    /// Log system information
    pub fn log(&self) {
        info!("=== System Information ===");
        info!("  Kernel: {} ({})", self.kernel, self.machine);
        info!("  Hostname: {}", self.hostname);
        info!("  CPUs: {}", self.cpu_count);
    }
}

/// Desktop session environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayEnvironment {
    /// `$DISPLAY`
    pub display: Option<String>,
    /// `$XDG_SESSION_TYPE`
    pub session_type: Option<String>,
    /// `$XAUTHORITY`
    pub xauthority: Option<String>,
}

impl DisplayEnvironment {
    /// Read the environment of this process
    pub fn from_env() -> Self {
        Self {
            display: env::var("DISPLAY").ok().filter(|v| !v.is_empty()),
            session_type: env::var("XDG_SESSION_TYPE").ok().filter(|v| !v.is_empty()),
            xauthority: env::var("XAUTHORITY").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Problems worth a warning before connecting
    pub fn warnings(&self, configured_display: Option<&str>) -> Vec<String> {
        let mut warnings = Vec::new();
        if configured_display.is_none() && self.display.is_none() {
            warnings.push("DISPLAY is not set and capture.display is not configured".to_string());
        }
        if self.session_type.as_deref() == Some("wayland") {
            warnings.push(
                "XDG_SESSION_TYPE is wayland; only XWayland clients will be visible".to_string(),
            );
        }
        warnings
    }
}

/// Log system and display information at startup
pub fn log_startup_diagnostics(configured_display: Option<&str>) {
    SystemInfo::gather().log();

    let environment = DisplayEnvironment::from_env();
    info!("=== Display Environment ===");
    info!(
        "  DISPLAY: {}",
        configured_display
            .or(environment.display.as_deref())
            .unwrap_or("(unset)")
    );
    info!(
        "  Session type: {}",
        environment.session_type.as_deref().unwrap_or("(unknown)")
    );
    info!(
        "  XAUTHORITY: {}",
        environment.xauthority.as_deref().unwrap_or("(default)")
    );
    for warning in environment.warnings(configured_display) {
        warn!("{}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_info_gather() {
        let info = SystemInfo::gather();
        assert!(info.cpu_count >= 1);
        assert!(!info.hostname.is_empty());
    }

    #[test]
    fn test_display_warnings() {
        let env = DisplayEnvironment {
            display: None,
            session_type: Some("wayland".into()),
            xauthority: None,
        };
        assert_eq!(env.warnings(None).len(), 2);
        assert_eq!(env.warnings(Some(":0")).len(), 1);

        let x11 = DisplayEnvironment {
            display: Some(":0".into()),
            session_type: Some("x11".into()),
            xauthority: None,
        };
        assert!(x11.warnings(None).is_empty());
    }
}
