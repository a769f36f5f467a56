use hostgate::certs::generate_self_signed;
use hostgate::{CertificateError, CertificateStore, ConfigDocument, ConfigStore, ConfigValue};
use std::sync::Arc;
use tempfile::TempDir;

async fn cert_store(dir: &TempDir) -> CertificateStore {
    let ssl = dir.path().join("ssl");
    let store = ConfigStore::open(dir.path().join("config.toml"), || {
        let mut doc = ConfigDocument::new();
        doc.insert(
            "server",
            "sslcrt",
            ConfigValue::Str(ssl.join("server.crt").display().to_string()),
        );
        doc.insert(
            "server",
            "sslkey",
            ConfigValue::Str(ssl.join("server.key").display().to_string()),
        );
        Ok(doc)
    })
    .await
    .unwrap();
    CertificateStore::new(Arc::new(store))
}

#[tokio::test]
async fn mismatched_upload_keeps_installed_pair() {
    let dir = TempDir::new().unwrap();
    let certs = cert_store(&dir).await;

    let installed = certs.generate("panel.local").await.unwrap();
    let cert_before = std::fs::read_to_string(&installed.cert_path).unwrap();
    let key_before = std::fs::read_to_string(&installed.key_path).unwrap();

    let (cert, _) = generate_self_signed("a.local").unwrap();
    let (_, other_key) = generate_self_signed("b.local").unwrap();
    let err = certs.install(&cert, &other_key).await.unwrap_err();
    assert_eq!(err, CertificateError::KeyMismatch);

    assert_eq!(std::fs::read_to_string(&installed.cert_path).unwrap(), cert_before);
    assert_eq!(std::fs::read_to_string(&installed.key_path).unwrap(), key_before);
    assert_eq!(certs.status().await.unwrap().common_name, "panel.local");
}

#[tokio::test]
async fn uploaded_pair_is_served_by_tls() {
    let dir = TempDir::new().unwrap();
    let certs = cert_store(&dir).await;

    let (cert, key) = generate_self_signed("upload.local").unwrap();
    let record = certs.install(&cert, &key).await.unwrap();
    assert_eq!(record.common_name, "upload.local");

    let (cert, key) = certs.load_pair().await.unwrap();
    assert!(hostgate::tls::server_config(&cert, &key).is_ok());
}

#[tokio::test]
async fn missing_pair_reports_missing() {
    let dir = TempDir::new().unwrap();
    let certs = cert_store(&dir).await;

    assert!(!certs.has_valid_pair().await);
    assert!(matches!(certs.load_pair().await, Err(CertificateError::Missing)));
}
