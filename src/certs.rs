//! TLS Certificate Store
//!
//! Owns the active certificate/key pair at `server.sslcrt` / `server.sslkey`.
//!
//! # Swap protocol
//!
//! 1. Parse both PEMs and check the key matches the certificate
//! 2. Write both to sibling temp files and flush them
//! 3. Re-read the temp files and check the pairing again
//! 4. Copy the current pair to `.bak`
//! 5. Rename key, then certificate, over the live paths
//!
//! If the certificate rename fails the key is restored from the backup.
//! The whole sequence holds the write side of the pair lock; status reads
//! and TLS loading hold the read side, so nobody observes a half-swapped
//! pair.

use crate::atomic;
use crate::error::CertificateError;
use crate::store::ConfigStore;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::{info, warn};
use x509_parser::pem::parse_x509_pem;

/// Lifetime of generated certificates
const SELF_SIGNED_VALIDITY_DAYS: i64 = 3650;

/// Active pair description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CertificateRecord {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
    pub common_name: String,
}

/// Facts read from a verified pair
#[derive(Debug, Clone, PartialEq)]
pub struct PairInfo {
    pub common_name: String,
    pub valid_from: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

/// Parse a PEM pair and check the key belongs to the certificate
pub fn inspect_pair(cert_pem: &str, key_pem: &str) -> Result<PairInfo, CertificateError> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|_| CertificateError::Invalid("Certificate is not valid PEM".to_string()))?;
    if pem.label != "CERTIFICATE" {
        return Err(CertificateError::Invalid(format!(
            "Expected a CERTIFICATE block, found {}",
            pem.label
        )));
    }
    let cert = pem
        .parse_x509()
        .map_err(|_| CertificateError::Invalid("Certificate could not be parsed".to_string()))?;

    let key = KeyPair::from_pem(key_pem).map_err(|_| {
        CertificateError::Invalid("Private key is not a valid PKCS#8 PEM key".to_string())
    })?;

    let cert_key: &[u8] = &cert.public_key().subject_public_key.data;
    if key.public_key_raw() != cert_key {
        return Err(CertificateError::KeyMismatch);
    }

    let timestamp = |t: i64| {
        DateTime::<Utc>::from_timestamp(t, 0)
            .ok_or_else(|| CertificateError::Invalid("Certificate validity is out of range".to_string()))
    };

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();

    Ok(PairInfo {
        common_name,
        valid_from: timestamp(cert.validity().not_before.timestamp())?,
        valid_to: timestamp(cert.validity().not_after.timestamp())?,
    })
}

/// Generate a self-signed pair; returns `(cert_pem, key_pem)`
pub fn generate_self_signed(common_name: &str) -> Result<(String, String), CertificateError> {
    let common_name = common_name.trim();
    if common_name.is_empty() {
        return Err(CertificateError::Invalid("Common name is empty".to_string()));
    }

    let mut params = CertificateParams::new(vec![common_name.to_string()])
        .map_err(|_| CertificateError::Invalid(format!("Invalid common name '{}'", common_name)))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;

    let not_before = OffsetDateTime::now_utc() - time::Duration::minutes(5);
    params.not_before = not_before;
    params.not_after = not_before + time::Duration::days(SELF_SIGNED_VALIDITY_DAYS);

    let key = KeyPair::generate().map_err(|e| {
        warn!("Key generation failed: {}", e);
        CertificateError::Invalid("Key generation failed".to_string())
    })?;
    let cert = params.self_signed(&key).map_err(|e| {
        warn!("Certificate signing failed: {}", e);
        CertificateError::Invalid("Certificate signing failed".to_string())
    })?;

    Ok((cert.pem(), key.serialize_pem()))
}

/// Guarded access to the active pair
pub struct CertificateStore {
    store: Arc<ConfigStore>,
    pair_lock: RwLock<()>,
}

impl CertificateStore {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            pair_lock: RwLock::new(()),
        }
    }

    /// Live `(cert, key)` paths from the config document
    pub fn paths(&self) -> Result<(PathBuf, PathBuf), CertificateError> {
        let doc = self.store.snapshot();
        let cert = doc.get_str("server", "sslcrt").filter(|p| !p.is_empty());
        let key = doc.get_str("server", "sslkey").filter(|p| !p.is_empty());
        match (cert, key) {
            (Some(cert), Some(key)) => Ok((PathBuf::from(cert), PathBuf::from(key))),
            _ => Err(CertificateError::Missing),
        }
    }

    /// Describe the installed pair
    pub async fn status(&self) -> Result<CertificateRecord, CertificateError> {
        let _guard = self.pair_lock.read().await;
        let (cert_path, key_path) = self.paths()?;
        let (cert_pem, key_pem) = read_pair(&cert_path, &key_path).await?;
        let info = inspect_pair(&cert_pem, &key_pem)?;
        Ok(record(cert_path, key_path, info))
    }

    /// Whether a matching pair is installed
    pub async fn has_valid_pair(&self) -> bool {
        self.status().await.is_ok()
    }

    /// PEM contents of the installed pair, checked for consistency
    pub async fn load_pair(&self) -> Result<(String, String), CertificateError> {
        let _guard = self.pair_lock.read().await;
        let (cert_path, key_path) = self.paths()?;
        let (cert_pem, key_pem) = read_pair(&cert_path, &key_path).await?;
        inspect_pair(&cert_pem, &key_pem)?;
        Ok((cert_pem, key_pem))
    }

    /// Generate and install a self-signed pair
    pub async fn generate(&self, common_name: &str) -> Result<CertificateRecord, CertificateError> {
        let common_name = common_name.to_string();
        let (cert_pem, key_pem) = tokio::task::spawn_blocking(move || generate_self_signed(&common_name))
            .await
            .map_err(|e| {
                warn!("Certificate generation task failed: {}", e);
                CertificateError::IoFailure
            })??;
        self.install(&cert_pem, &key_pem).await
    }

    /// Verify and atomically install a pair
    pub async fn install(&self, cert_pem: &str, key_pem: &str) -> Result<CertificateRecord, CertificateError> {
        inspect_pair(cert_pem, key_pem)?;

        let _guard = self.pair_lock.write().await;
        let (cert_path, key_path) = self.paths()?;

        for parent in [cert_path.parent(), key_path.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                warn!("Failed to create {}: {}", parent.display(), e);
                CertificateError::IoFailure
            })?;
        }

        let cert_temp = atomic::temp_sibling(&cert_path);
        let key_temp = atomic::temp_sibling(&key_path);

        let written = match atomic::write_synced(&cert_temp, cert_pem.as_bytes(), Some(0o644)).await {
            Ok(()) => atomic::write_synced(&key_temp, key_pem.as_bytes(), Some(0o600)).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!("Failed to stage certificate pair: {}", e);
            discard(&cert_temp, &key_temp).await;
            return Err(CertificateError::IoFailure);
        }

        // What was flushed must still be a matching pair
        let staged = match read_pair(&cert_temp, &key_temp).await {
            Ok((cert, key)) => inspect_pair(&cert, &key),
            Err(e) => Err(e),
        };
        let info = match staged {
            Ok(info) => info,
            Err(e) => {
                discard(&cert_temp, &key_temp).await;
                return Err(e);
            }
        };

        let cert_backup = backup_path(&cert_path);
        let key_backup = backup_path(&key_path);
        let had_key = tokio::fs::try_exists(&key_path).await.unwrap_or(false);
        let backed_up = async {
            if tokio::fs::try_exists(&cert_path).await? {
                tokio::fs::copy(&cert_path, &cert_backup).await?;
            }
            if had_key {
                tokio::fs::copy(&key_path, &key_backup).await?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(e) = backed_up {
            warn!("Failed to back up certificate pair: {}", e);
            discard(&cert_temp, &key_temp).await;
            return Err(CertificateError::IoFailure);
        }

        if let Err(e) = tokio::fs::rename(&key_temp, &key_path).await {
            warn!("Failed to promote key: {}", e);
            discard(&cert_temp, &key_temp).await;
            return Err(CertificateError::IoFailure);
        }

        if let Err(e) = tokio::fs::rename(&cert_temp, &cert_path).await {
            warn!("Failed to promote certificate: {}", e);
            let restored = if had_key {
                tokio::fs::copy(&key_backup, &key_path).await.map(|_| ())
            } else {
                tokio::fs::remove_file(&key_path).await
            };
            if let Err(e) = restored {
                warn!("Failed to restore previous key: {}", e);
            }
            discard(&cert_temp, &key_temp).await;
            return Err(CertificateError::IoFailure);
        }

        info!(
            common_name = %info.common_name,
            cert = %cert_path.display(),
            "Installed certificate pair"
        );
        Ok(record(cert_path, key_path, info))
    }
}

fn record(cert_path: PathBuf, key_path: PathBuf, info: PairInfo) -> CertificateRecord {
    CertificateRecord {
        cert_path,
        key_path,
        valid_from: info.valid_from,
        valid_to: info.valid_to,
        common_name: info.common_name,
    }
}

async fn read_pair(cert_path: &Path, key_path: &Path) -> Result<(String, String), CertificateError> {
    let read = |path: PathBuf| async move {
        tokio::fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CertificateError::Missing
            } else {
                warn!("Failed to read {}: {}", path.display(), e);
                CertificateError::IoFailure
            }
        })
    };

    let cert = read(cert_path.to_path_buf()).await?;
    let key = read(key_path.to_path_buf()).await?;
    Ok((cert, key))
}

async fn discard(cert_temp: &Path, key_temp: &Path) {
    tokio::fs::remove_file(cert_temp).await.ok();
    tokio::fs::remove_file(key_temp).await.ok();
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ConfigDocument, ConfigValue};
    use tempfile::TempDir;

    async fn cert_store() -> (CertificateStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let ssl = dir.path().join("ssl");
        let store = ConfigStore::open(dir.path().join("config.toml"), move || {
            let mut doc = ConfigDocument::new();
            doc.insert("server", "sslcrt", ConfigValue::Str(ssl.join("server.crt").display().to_string()));
            doc.insert("server", "sslkey", ConfigValue::Str(ssl.join("server.key").display().to_string()));
            Ok(doc)
        })
        .await
        .unwrap();
        (CertificateStore::new(Arc::new(store)), dir)
    }

    #[test]
    fn test_generated_pair_matches() {
        let (cert, key) = generate_self_signed("panel.example.com").unwrap();
        let info = inspect_pair(&cert, &key).unwrap();

        assert_eq!(info.common_name, "panel.example.com");
        assert!(info.valid_to - info.valid_from > chrono::Duration::days(3600));
    }

    #[test]
    fn test_mismatched_pair() {
        let (cert, _) = generate_self_signed("a.example.com").unwrap();
        let (_, other_key) = generate_self_signed("b.example.com").unwrap();

        assert_eq!(inspect_pair(&cert, &other_key), Err(CertificateError::KeyMismatch));
    }

    #[test]
    fn test_garbage_is_invalid() {
        let (cert, key) = generate_self_signed("a.example.com").unwrap();

        assert!(matches!(inspect_pair("junk", &key), Err(CertificateError::Invalid(_))));
        assert!(matches!(inspect_pair(&cert, "junk"), Err(CertificateError::Invalid(_))));
        assert!(matches!(generate_self_signed("  "), Err(CertificateError::Invalid(_))));
    }

    #[test]
    fn test_backup_path() {
        assert_eq!(
            backup_path(Path::new("/etc/ssl/server.crt")),
            PathBuf::from("/etc/ssl/server.crt.bak")
        );
    }

    #[tokio::test]
    async fn test_status_without_pair_is_missing() {
        let (certs, _dir) = cert_store().await;
        assert_eq!(certs.status().await, Err(CertificateError::Missing));
        assert!(!certs.has_valid_pair().await);
    }

    #[tokio::test]
    async fn test_generate_installs_pair() {
        let (certs, _dir) = cert_store().await;

        let record = certs.generate("localhost").await.unwrap();
        assert_eq!(record.common_name, "localhost");
        assert_eq!(certs.status().await.unwrap(), record);

        let (cert, key) = certs.load_pair().await.unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let (certs, _dir) = cert_store().await;
        let record = certs.generate("localhost").await.unwrap();

        let mode = std::fs::metadata(&record.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_replace_keeps_backup() {
        let (certs, _dir) = cert_store().await;
        let first = certs.generate("first.local").await.unwrap();
        let first_cert = std::fs::read_to_string(&first.cert_path).unwrap();

        certs.generate("second.local").await.unwrap();

        assert_eq!(certs.status().await.unwrap().common_name, "second.local");
        let backup = std::fs::read_to_string(backup_path(&first.cert_path)).unwrap();
        assert_eq!(backup, first_cert);
    }
}
