//! Security module
//!
//! TLS configuration, self-signed certificate generation and the ephemeral
//! NLA credential records used to authenticate each connection.

pub mod certificates;
pub mod nla;
pub mod tls;

pub use certificates::CertificateGenerator;
pub use nla::{
    hash_password, read_record, validate_username, CredentialError, NlaCredential,
    NlaCredentialProvisioner, NtHash, NT_HASH_LEN,
};
pub use tls::TlsConfig;
