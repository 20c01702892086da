//! Ephemeral NLA credentials
//!
//! Network Level Authentication verifies the client against an NT hash
//! before any desktop resources are committed. For every connection attempt
//! the [`NlaCredentialProvisioner`] writes a single-use SAM record
//!
//! ```text
//! username:::0123456789ABCDEF0123456789ABCDEF:::
//! ```
//!
//! to a fresh owner-only file. The authentication layer reads it back with
//! [`read_record`]; once the handshake concludes the record is overwritten
//! and unlinked. A [`NlaCredential`] that is dropped without being freed
//! removes its file as well.

use std::fmt;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use md4::{Digest, Md4};
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of an NT hash in bytes
pub const NT_HASH_LEN: usize = 16;

/// Upper bound on a SAM record file
const MAX_RECORD_LEN: u64 = 4096;

/// Credential provisioning errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Username is empty
    #[error("username must not be empty")]
    EmptyUsername,

    /// Username contains a character that breaks the record format
    #[error("username contains an invalid character (':' or line break)")]
    InvalidUsername,

    /// NT hash is not 32 hex digits
    #[error("NT hash must be {} hex digits", NT_HASH_LEN * 2)]
    InvalidHash,

    /// The record file is malformed or for another user
    #[error("malformed SAM record in {0}")]
    MalformedRecord(PathBuf),

    /// Filesystem failure
    #[error("credential file I/O failed for {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

impl CredentialError {
    fn io(path: &Path, source: io::Error) -> Self {
        CredentialError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// MD4 digest of the UTF-16LE password
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct NtHash([u8; NT_HASH_LEN]);

impl NtHash {
    /// Wrap raw hash bytes
    pub fn from_bytes(bytes: [u8; NT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse 32 hex digits (either case)
    pub fn from_hex(hex_str: &str) -> Result<Self, CredentialError> {
        let mut bytes = [0u8; NT_HASH_LEN];
        hex::decode_to_slice(hex_str.trim(), &mut bytes).map_err(|_| CredentialError::InvalidHash)?;
        Ok(Self(bytes))
    }

    /// Upper-case hex form used in SAM records
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode_upper(self.0))
    }

    /// Raw hash bytes
    pub fn as_bytes(&self) -> &[u8; NT_HASH_LEN] {
        &self.0
    }
}

impl fmt::Debug for NtHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NtHash(<redacted>)")
    }
}

/// Compute the NT hash of a password
pub fn hash_password(password: &str) -> NtHash {
    let utf16: Zeroizing<Vec<u8>> = Zeroizing::new(
        password
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect(),
    );
    let digest = Md4::digest(utf16.as_slice());
    let mut bytes = [0u8; NT_HASH_LEN];
    bytes.copy_from_slice(&digest);
    NtHash(bytes)
}

/// Check a username can be stored in a SAM record
pub fn validate_username(username: &str) -> Result<(), CredentialError> {
    if username.is_empty() {
        return Err(CredentialError::EmptyUsername);
    }
    if username.contains([':', '\n', '\r', '\0']) {
        return Err(CredentialError::InvalidUsername);
    }
    Ok(())
}

/// One provisioned SAM record
///
/// Removing the file is the provisioner's job ([`NlaCredentialProvisioner::free`]);
/// dropping the credential removes it as a fallback.
pub struct NlaCredential {
    username: String,
    nt_hash: NtHash,
    path: PathBuf,
    removed: bool,
}

impl NlaCredential {
    /// Username in the record
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Hash in the record
    pub fn nt_hash(&self) -> &NtHash {
        &self.nt_hash
    }

    /// Location of the record file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove(&mut self) -> Result<(), CredentialError> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        scrub_and_unlink(&self.path)
    }
}

impl fmt::Debug for NlaCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NlaCredential")
            .field("username", &self.username)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for NlaCredential {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("Failed to remove credential record: {}", e);
        }
    }
}

/// Issues and removes single-use SAM records in one directory
#[derive(Debug, Clone)]
pub struct NlaCredentialProvisioner {
    dir: PathBuf,
}

impl NlaCredentialProvisioner {
    /// Use `dir` for records, creating it (mode 0700) if needed
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CredentialError> {
        let dir = dir.into();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&dir)
            .map_err(|e| CredentialError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory records are written to
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a record for `username` with a hex NT hash
    pub fn generate(&self, username: &str, nt_hash_hex: &str) -> Result<NlaCredential, CredentialError> {
        validate_username(username)?;
        let nt_hash = NtHash::from_hex(nt_hash_hex)?;
        self.write_record(username, nt_hash)
    }

    /// Hash `password` and write a record for `username`
    pub fn generate_from_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<NlaCredential, CredentialError> {
        validate_username(username)?;
        self.write_record(username, hash_password(password))
    }

    /// Write a record from an already parsed hash
    pub fn generate_with_hash(
        &self,
        username: &str,
        nt_hash: &NtHash,
    ) -> Result<NlaCredential, CredentialError> {
        validate_username(username)?;
        self.write_record(username, nt_hash.clone())
    }

    /// Overwrite and unlink a record
    pub fn free(&self, mut credential: NlaCredential) -> Result<(), CredentialError> {
        credential.remove()?;
        debug!("Freed credential record {}", credential.path.display());
        Ok(())
    }

    fn write_record(&self, username: &str, nt_hash: NtHash) -> Result<NlaCredential, CredentialError> {
        let path = self.dir.join(format!("sam-{}", uuid::Uuid::new_v4().simple()));
        let line = Zeroizing::new(format!("{}:::{}:::\n", username, nt_hash.to_hex().as_str()));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| CredentialError::io(&path, e))?;

        let credential = NlaCredential {
            username: username.to_string(),
            nt_hash,
            path,
            removed: false,
        };

        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| CredentialError::io(&credential.path, e))?;

        debug!(
            "Issued credential record for '{}' at {}",
            username,
            credential.path.display()
        );
        Ok(credential)
    }
}

/// Read the hash for `username` from a SAM record file
pub fn read_record(path: &Path, username: &str) -> Result<NtHash, CredentialError> {
    let mut contents = Zeroizing::new(String::new());
    File::open(path)
        .and_then(|file| file.take(MAX_RECORD_LEN).read_to_string(&mut contents))
        .map_err(|e| CredentialError::io(path, e))?;

    for line in contents.lines() {
        let mut fields = line.split(':');
        let (Some(user), Some(""), Some(""), Some(hash)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if user.eq_ignore_ascii_case(username) {
            return NtHash::from_hex(hash).map_err(|_| CredentialError::MalformedRecord(path.to_path_buf()));
        }
    }

    Err(CredentialError::MalformedRecord(path.to_path_buf()))
}

fn scrub_and_unlink(path: &Path) -> Result<(), CredentialError> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(CredentialError::io(path, e)),
    };

    let scrub = OpenOptions::new().write(true).open(path).and_then(|mut file| {
        file.write_all(&vec![0u8; len as usize])?;
        file.sync_all()
    });
    if let Err(e) = scrub {
        warn!("Could not overwrite {} before removal: {}", path.display(), e);
    }

    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CredentialError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_nt_hash_known_vectors() {
        assert_eq!(
            hash_password("").to_hex().as_str(),
            "31D6CFE0D16AE931B73C59D7E0C089C0"
        );
        assert_eq!(
            hash_password("password").to_hex().as_str(),
            "8846F7EAEE8FB117AD06BDD830B7586C"
        );
    }

    #[test]
    fn test_nt_hash_hex_parsing() {
        let hash = NtHash::from_hex("8846f7eaee8fb117ad06bdd830b7586c").unwrap();
        assert_eq!(hash, hash_password("password"));
        assert!(matches!(NtHash::from_hex("abc"), Err(CredentialError::InvalidHash)));
        assert!(matches!(
            NtHash::from_hex("zz46f7eaee8fb117ad06bdd830b7586c"),
            Err(CredentialError::InvalidHash)
        ));
    }

    #[test]
    fn test_debug_redacts_hash() {
        let hash = hash_password("password");
        assert_eq!(format!("{hash:?}"), "NtHash(<redacted>)");
    }

    #[test]
    fn test_generate_writes_owner_only_record() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NlaCredentialProvisioner::new(temp_dir.path().join("creds")).unwrap();

        let credential = provisioner.generate_from_password("alice", "password").unwrap();
        let contents = fs::read_to_string(credential.path()).unwrap();
        assert_eq!(contents, "alice:::8846F7EAEE8FB117AD06BDD830B7586C:::\n");

        let mode = fs::metadata(credential.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let dir_mode = fs::metadata(provisioner.dir()).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn test_read_record_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NlaCredentialProvisioner::new(temp_dir.path()).unwrap();
        let credential = provisioner
            .generate("bob", "31d6cfe0d16ae931b73c59d7e0c089c0")
            .unwrap();

        assert_eq!(read_record(credential.path(), "bob").unwrap(), hash_password(""));
        assert!(matches!(
            read_record(credential.path(), "mallory"),
            Err(CredentialError::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_each_attempt_gets_its_own_file() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NlaCredentialProvisioner::new(temp_dir.path()).unwrap();
        let a = provisioner.generate_from_password("alice", "x").unwrap();
        let b = provisioner.generate_from_password("alice", "x").unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_free_removes_record() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NlaCredentialProvisioner::new(temp_dir.path()).unwrap();
        let credential = provisioner.generate_from_password("alice", "secret").unwrap();
        let path = credential.path().to_path_buf();

        provisioner.free(credential).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_record() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NlaCredentialProvisioner::new(temp_dir.path()).unwrap();
        let path = {
            let credential = provisioner.generate_from_password("alice", "secret").unwrap();
            credential.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_free_tolerates_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NlaCredentialProvisioner::new(temp_dir.path()).unwrap();
        let credential = provisioner.generate_from_password("alice", "secret").unwrap();
        fs::remove_file(credential.path()).unwrap();
        assert!(provisioner.free(credential).is_ok());
    }

    #[test]
    fn test_rejects_invalid_input() {
        let temp_dir = TempDir::new().unwrap();
        let provisioner = NlaCredentialProvisioner::new(temp_dir.path()).unwrap();

        assert!(matches!(
            provisioner.generate_from_password("", "pw"),
            Err(CredentialError::EmptyUsername)
        ));
        assert!(matches!(
            provisioner.generate_from_password("a:b", "pw"),
            Err(CredentialError::InvalidUsername)
        ));
        assert!(matches!(
            provisioner.generate_from_password("a\nb", "pw"),
            Err(CredentialError::InvalidUsername)
        ));
        assert!(matches!(
            provisioner.generate("alice", "not-a-hash"),
            Err(CredentialError::InvalidHash)
        ));
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }
}
