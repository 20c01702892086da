//! Self-signed certificate generation
//!
//! Used by `--generate-cert` and by first-run setups that have no
//! certificate yet.

use anyhow::{Context, Result};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{info, warn};

/// Certificate generator
pub struct CertificateGenerator;

impl CertificateGenerator {
    /// Generate a self-signed certificate and key as PEM strings
    ///
    /// `common_name` is also used as the DNS subject alternative name.
    pub fn generate_self_signed(common_name: &str, validity_days: u32) -> Result<(String, String)> {
        info!("Generating self-signed certificate for '{}'", common_name);

        let mut params = CertificateParams::new(vec![common_name.to_string()]);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name);
        distinguished_name.push(DnType::OrganizationName, "lamco-x11-rdp-server");
        params.distinguished_name = distinguished_name;

        let now = time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(validity_days as i64);

        let key_pair = KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
            .context("Failed to generate key pair")?;
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params).context("Failed to generate certificate")?;
        let cert_pem = cert
            .serialize_pem()
            .context("Failed to serialize certificate")?;
        let key_pem = cert.serialize_private_key_pem();

        Ok((cert_pem, key_pem))
    }

    /// Generate a certificate and write it to disk; the key file is 0600
    pub fn generate_and_save(
        common_name: &str,
        validity_days: u32,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<()> {
        info!("Generating and saving certificate to {:?}", cert_path);

        if cert_path.exists() || key_path.exists() {
            warn!("Certificate or key file already exists, will overwrite");
        }

        let (cert_pem, key_pem) = Self::generate_self_signed(common_name, validity_days)?;

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        fs::write(cert_path, cert_pem.as_bytes()).context("Failed to write certificate")?;

        // Remove first so an existing file with looser permissions is not reused
        if key_path.exists() {
            fs::remove_file(key_path).context("Failed to replace private key")?;
        }
        let mut key_file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .context("Failed to create private key file")?;
        key_file
            .write_all(key_pem.as_bytes())
            .context("Failed to write private key")?;

        info!("Certificate and key saved successfully");
        Ok(())
    }

    /// Generate a certificate only if either file is missing
    ///
    /// Returns true when new files were written.
    pub fn ensure(common_name: &str, cert_path: &Path, key_path: &Path) -> Result<bool> {
        if cert_path.exists() && key_path.exists() {
            return Ok(false);
        }
        Self::generate_and_save(common_name, 365, cert_path, key_path)?;
        Ok(true)
    }
}
