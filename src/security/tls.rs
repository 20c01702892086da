//! TLS configuration
//!
//! Loads a PEM certificate chain and private key into a rustls
//! [`ServerConfig`] (ring provider, TLS 1.2 and 1.3) and hands out
//! tokio-rustls acceptors for the listener.

use anyhow::{Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// TLS configuration wrapper
#[derive(Clone)]
pub struct TlsConfig {
    cert_chain: Vec<CertificateDer<'static>>,
    server_config: Arc<ServerConfig>,
}

impl TlsConfig {
    /// Create TLS config from PEM files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        info!("Loading TLS configuration from files");
        debug!("Certificate: {:?}", cert_path);
        debug!("Private key: {:?}", key_path);

        let cert_file = File::open(cert_path)
            .with_context(|| format!("Failed to open certificate file {}", cert_path.display()))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to parse certificate")?;

        if certs.is_empty() {
            anyhow::bail!("No certificates found in {}", cert_path.display());
        }

        let key_file = File::open(key_path)
            .with_context(|| format!("Failed to open private key file {}", key_path.display()))?;
        let private_key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut BufReader::new(key_file))
                .context("Failed to parse private key")?
                .ok_or_else(|| anyhow::anyhow!("No private key found in {}", key_path.display()))?;

        let server_config =
            ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
                .with_safe_default_protocol_versions()
                .context("Failed to configure TLS versions")?
                .with_no_client_auth()
                .with_single_cert(certs.clone(), private_key)
                .context("Failed to configure certificate")?;

        info!("TLS configuration created ({} certificate(s))", certs.len());

        Ok(Self {
            cert_chain: certs,
            server_config: Arc::new(server_config),
        })
    }

    /// rustls server configuration
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.server_config)
    }

    /// Certificate chain
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// Acceptor for incoming connections
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server_config())
    }
}
