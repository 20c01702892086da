use lamco_x11_rdp_server::security::{
    hash_password, read_record, CertificateGenerator, NlaCredentialProvisioner, NtHash, TlsConfig,
};
use std::os::unix::fs::PermissionsExt;
use tempfile::TempDir;

#[test]
fn test_certificate_generation_and_loading() {
    let temp_dir = TempDir::new().unwrap();
    let cert_path = temp_dir.path().join("tls/cert.pem");
    let key_path = temp_dir.path().join("tls/key.pem");

    // Generate certificate
    assert!(CertificateGenerator::ensure("test-server", &cert_path, &key_path).unwrap());
    assert!(!CertificateGenerator::ensure("test-server", &cert_path, &key_path).unwrap());

    // Load TLS config
    let tls_config = TlsConfig::from_files(&cert_path, &key_path).unwrap();
    assert_eq!(tls_config.certificates().len(), 1);

    let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}

#[test]
fn test_tls_config_rejects_missing_key() {
    let temp_dir = TempDir::new().unwrap();
    let cert_path = temp_dir.path().join("cert.pem");
    let key_path = temp_dir.path().join("key.pem");
    CertificateGenerator::generate_and_save("test-server", 1, &cert_path, &key_path).unwrap();
    std::fs::remove_file(&key_path).unwrap();

    assert!(TlsConfig::from_files(&cert_path, &key_path).is_err());
}

#[test]
fn test_known_nt_hashes() {
    assert_eq!(
        hash_password("password").to_hex().as_str(),
        "8846F7EAEE8FB117AD06BDD830B7586C"
    );
    assert_eq!(
        hash_password("").to_hex().as_str(),
        "31D6CFE0D16AE931B73C59D7E0C089C0"
    );
}

#[test]
fn test_credential_records_are_single_use() {
    let temp_dir = TempDir::new().unwrap();
    let provisioner = NlaCredentialProvisioner::new(temp_dir.path().join("creds")).unwrap();

    let first = provisioner.generate_from_password("alice", "hunter2").unwrap();
    let second = provisioner
        .generate("alice", "8846f7eaee8fb117ad06bdd830b7586c")
        .unwrap();
    assert_ne!(first.path(), second.path());

    let record = std::fs::read_to_string(first.path()).unwrap();
    assert!(record.starts_with("alice:::"));
    assert_eq!(read_record(first.path(), "ALICE").unwrap(), hash_password("hunter2"));
    assert_eq!(
        read_record(second.path(), "alice").unwrap(),
        NtHash::from_hex("8846F7EAEE8FB117AD06BDD830B7586C").unwrap()
    );

    let (first_path, second_path) = (first.path().to_path_buf(), second.path().to_path_buf());
    provisioner.free(first).unwrap();
    assert!(!first_path.exists());
    assert!(second_path.exists());

    drop(second);
    assert!(!second_path.exists());
    assert_eq!(std::fs::read_dir(provisioner.dir()).unwrap().count(), 0);
}

#[test]
fn test_invalid_credentials_are_refused() {
    let temp_dir = TempDir::new().unwrap();
    let provisioner = NlaCredentialProvisioner::new(temp_dir.path()).unwrap();

    assert!(provisioner.generate("bob", "not-hex").is_err());
    assert!(provisioner.generate_from_password("bad:name", "x").is_err());
    assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}
