//! User-Friendly Error Formatting
//!
//! Provides user-friendly error messages with troubleshooting hints
//! for common startup failures.

use std::fmt::Write;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━";

/// Kind of failure recognised from an error chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// X server connection or extension problem
    Display,
    /// Certificate or key problem
    Tls,
    /// Listening socket problem
    Network,
    /// Credential directory or record problem
    Credential,
    /// Handover socket problem
    Handover,
    /// Configuration file problem
    Config,
    /// Anything else
    Other,
}

/// Classify an error by the messages in its chain
pub fn categorize(error: &anyhow::Error) -> ErrorCategory {
    let message = format!("{:#}", error).to_lowercase();

    if message.contains("x server")
        || message.contains("x11")
        || message.contains("display")
        || message.contains("xtest")
    {
        ErrorCategory::Display
    } else if message.contains("tls") || message.contains("certificate") {
        ErrorCategory::Tls
    } else if message.contains("bind") || message.contains("address") {
        ErrorCategory::Network
    } else if message.contains("credential") || message.contains("sam record") {
        ErrorCategory::Credential
    } else if message.contains("handover") {
        ErrorCategory::Handover
    } else if message.contains("config") {
        ErrorCategory::Config
    } else {
        ErrorCategory::Other
    }
}

/// Format error for user consumption
///
/// Takes technical error and produces user-friendly message with
/// troubleshooting steps and context.
pub fn format_user_error(error: &anyhow::Error) -> String {
    let mut output = String::new();

    writeln!(output).ok();
    writeln!(output, "╔════════════════════════════════════════════════════════════╗").ok();
    writeln!(output, "║                     ERROR                                  ║").ok();
    writeln!(output, "╚════════════════════════════════════════════════════════════╝").ok();
    writeln!(output).ok();

    let (title, summary, hints) = hints_for(categorize(error));
    writeln!(output, "{}", title).ok();
    writeln!(output).ok();
    writeln!(output, "{}", summary).ok();
    if !hints.is_empty() {
        writeln!(output).ok();
        writeln!(output, "Common Causes:").ok();
        writeln!(output).ok();
        for (i, (cause, fix)) in hints.iter().enumerate() {
            writeln!(output, "  {}. {}", i + 1, cause).ok();
            writeln!(output, "     → {}", fix).ok();
        }
    }

    writeln!(output).ok();
    writeln!(output, "{}", RULE).ok();
    writeln!(output, "Technical Details:").ok();
    writeln!(output).ok();
    writeln!(output, "{:#}", error).ok();
    writeln!(output).ok();

    writeln!(output, "{}", RULE).ok();
    writeln!(output, "Need Help?").ok();
    writeln!(output, "  - Run with --verbose for detailed logs: lamco-x11-rdp-server -vv").ok();
    writeln!(
        output,
        "  - Report issues: https://github.com/lamco-admin/lamco-x11-rdp-server/issues"
    )
    .ok();

    output
}

type Hint = (&'static str, &'static str);

fn hints_for(category: ErrorCategory) -> (&'static str, &'static str, &'static [Hint]) {
    match category {
        ErrorCategory::Display => (
            "X Display Error",
            "Could not capture or control the X11 desktop.",
            &[
                (
                    "DISPLAY is not set or points to the wrong server",
                    "Set capture.display in the config or export DISPLAY=:0",
                ),
                (
                    "The X server refuses the connection",
                    "Run as the desktop user or allow it with: xhost +SI:localuser:$USER",
                ),
                (
                    "The XTEST extension is missing",
                    "Enable XTEST in the X server configuration",
                ),
                (
                    "The screen depth is not 24/32 bit",
                    "Start the X server with -depth 24",
                ),
            ],
        ),
        ErrorCategory::Tls => (
            "TLS Certificate Error",
            "Could not load the TLS certificate or private key.",
            &[
                (
                    "Certificate or key file missing",
                    "Check security.cert_path and security.key_path, or pass --generate-cert",
                ),
                (
                    "Files are not PEM encoded",
                    "Convert with: openssl x509 -in cert.der -inform der -out cert.pem",
                ),
            ],
        ),
        ErrorCategory::Network => (
            "Network Error",
            "Could not listen on the configured address.",
            &[
                (
                    "Port already in use",
                    "Check with: ss -tlnp | grep 3389, or use --port",
                ),
                (
                    "Ports below 1024 need privileges",
                    "Use a higher port or grant CAP_NET_BIND_SERVICE",
                ),
                (
                    "Malformed listen address",
                    "Use host:port, for example 0.0.0.0:3389",
                ),
            ],
        ),
        ErrorCategory::Credential => (
            "Credential Error",
            "Could not set up authentication.",
            &[
                (
                    "Neither or both of security.password and security.nt_hash are set",
                    "Configure exactly one of them",
                ),
                (
                    "The credential directory is not writable",
                    "Check security.credential_dir ownership and permissions",
                ),
            ],
        ),
        ErrorCategory::Handover => (
            "Handover Error",
            "Could not set up the session handover socket.",
            &[(
                "Another worker owns the socket or the path is not a socket",
                "Check handover.socket_path and stop the other worker",
            )],
        ),
        ErrorCategory::Config => (
            "Configuration Error",
            "The configuration file is invalid.",
            &[
                (
                    "TOML syntax error or missing section",
                    "Compare with the default config written by the package",
                ),
                (
                    "Value out of range",
                    "See the message below for the offending field",
                ),
            ],
        ),
        ErrorCategory::Other => ("Server Error", "The server failed to start.", &[]),
    }
}
