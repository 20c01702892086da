//! Shared server runtime handle
//!
//! Everything a listener or handover daemon needs is built once here and
//! passed around by `Arc`. There is no process-global state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

use super::{ConnectionId, ServerError};
use crate::backend::DesktopBackend;
use crate::config::Config;
use crate::protocol::{FramedProtocol, ProtocolLayer};
use crate::security::{CertificateGenerator, NlaCredentialProvisioner, NtHash, TlsConfig};

/// Config, TLS, credentials, protocol and desktop for one server process
pub struct ServerRuntime {
    handle: Handle,
    config: Arc<Config>,
    tls: Option<TlsAcceptor>,
    provisioner: NlaCredentialProvisioner,
    protocol: Arc<dyn ProtocolLayer>,
    desktop: Arc<dyn DesktopBackend>,
    nt_hash: NtHash,
    connection_ids: AtomicU64,
}

impl ServerRuntime {
    /// Start building a runtime from `config`
    pub fn builder(config: Config) -> ServerRuntimeBuilder {
        ServerRuntimeBuilder {
            config,
            desktop: None,
            protocol: None,
            tls: None,
            handle: None,
        }
    }

    /// Tokio handle sessions are spawned on
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Validated configuration
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// TLS acceptor, when TLS is enabled
    pub fn tls(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    /// Credential provisioner
    pub fn provisioner(&self) -> &NlaCredentialProvisioner {
        &self.provisioner
    }

    /// Wire protocol
    pub fn protocol(&self) -> &Arc<dyn ProtocolLayer> {
        &self.protocol
    }

    /// Desktop backend
    pub fn desktop(&self) -> &Arc<dyn DesktopBackend> {
        &self.desktop
    }

    /// Username clients authenticate as
    pub fn username(&self) -> &str {
        &self.config.security.username
    }

    /// NT hash clients must prove knowledge of
    pub fn nt_hash(&self) -> &NtHash {
        &self.nt_hash
    }

    /// Allocate a connection id, shared by the listener and the handover daemon
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.connection_ids.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Debug for ServerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRuntime")
            .field("listen_addr", &self.config.server.listen_addr)
            .field("tls", &self.tls.is_some())
            .field("protocol", &self.protocol.name())
            .field("desktop", &self.desktop.name())
            .field("credential_dir", &self.provisioner.dir())
            .finish()
    }
}

/// Builder for [`ServerRuntime`]
pub struct ServerRuntimeBuilder {
    config: Config,
    desktop: Option<Arc<dyn DesktopBackend>>,
    protocol: Option<Arc<dyn ProtocolLayer>>,
    tls: Option<TlsAcceptor>,
    handle: Option<Handle>,
}

impl ServerRuntimeBuilder {
    /// Desktop backend (required)
    pub fn desktop(mut self, desktop: Arc<dyn DesktopBackend>) -> Self {
        self.desktop = Some(desktop);
        self
    }

    /// Protocol layer (default [`FramedProtocol`])
    pub fn protocol(mut self, protocol: Arc<dyn ProtocolLayer>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    /// Use this acceptor instead of loading the configured PEM files
    pub fn tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    /// Tokio runtime to spawn on (default: the current one)
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Validate the configuration and assemble the runtime
    pub fn build(self) -> Result<Arc<ServerRuntime>, ServerError> {
        let config = self.config;
        config
            .validate()
            .map_err(|e| ServerError::Config(format!("{:#}", e)))?;

        let desktop = self
            .desktop
            .ok_or_else(|| ServerError::Config("no desktop backend configured".into()))?;
        let protocol = self
            .protocol
            .unwrap_or_else(|| Arc::new(FramedProtocol::new()));
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| ServerError::NoRuntime)?,
        };

        let nt_hash = config
            .expected_hash()
            .map_err(|e| ServerError::Config(format!("{:#}", e)))?;
        let provisioner = NlaCredentialProvisioner::new(&config.security.credential_dir)?;

        let tls = match (self.tls, config.security.enable_tls) {
            (Some(acceptor), _) => Some(acceptor),
            (None, true) => Some(load_tls(&config)?),
            (None, false) => None,
        };

        info!(
            "Server runtime ready: protocol {}, desktop {}, TLS {}",
            protocol.name(),
            desktop.name(),
            if tls.is_some() { "on" } else { "off" }
        );
        debug!("Credential directory: {:?}", provisioner.dir());

        Ok(Arc::new(ServerRuntime {
            handle,
            config: Arc::new(config),
            tls,
            provisioner,
            protocol,
            desktop,
            nt_hash,
            connection_ids: AtomicU64::new(1),
        }))
    }
}

fn load_tls(config: &Config) -> Result<TlsAcceptor, ServerError> {
    let security = &config.security;
    if security.generate_cert {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let generated = CertificateGenerator::ensure(&hostname, &security.cert_path, &security.key_path)
            .map_err(|e| ServerError::Tls(format!("{:#}", e)))?;
        if generated {
            info!("Generated self-signed certificate for {}", hostname);
        }
    }

    let tls = TlsConfig::from_files(&security.cert_path, &security.key_path)
        .map_err(|e| ServerError::Tls(format!("{:#}", e)))?;
    Ok(tls.acceptor())
}
