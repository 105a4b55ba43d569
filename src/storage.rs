//! Object storage for uploaded files and the signed URLs that expose them.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid object path: {0}")]
    InvalidPath(String),
    #[error("object not found: {0}")]
    NotFound(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError>;
    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError>;
    async fn delete(&self, path: &str) -> Result<(), StorageError>;
}

/// Stores objects as files below a root directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), StorageError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Object key for an upload: `{user_id}/{attachment_id}-{file name}`, with the
/// file name reduced to a filesystem and URL safe form.
pub fn object_path(user_id: &str, attachment_id: &str, file_name: &str) -> String {
    let mut safe: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe = safe.trim_start_matches('.').to_string();
    if safe.is_empty() {
        safe = "file".to_string();
    }
    if safe.len() > 100 {
        safe = safe[safe.len() - 100..].to_string();
    }
    format!("{}/{}-{}", user_id, attachment_id, safe)
}

#[derive(Debug, Clone, Serialize)]
pub struct SignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

type HmacSha256 = Hmac<Sha256>;

/// Issues and checks time-limited download links for stored objects.
/// Signatures are hex HMAC-SHA256 over the object path and expiry.
#[derive(Clone)]
pub struct UrlSigner {
    key: HmacSha256,
    public_url: String,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(secret: &str, public_url: &str, ttl_secs: i64) -> Self {
        Self {
            key: HmacSha256::new_from_slice(secret.as_bytes())
                .expect("HMAC can take key of any size"),
            public_url: public_url.trim_end_matches('/').to_string(),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    fn mac(&self, path: &str, expires: i64) -> HmacSha256 {
        let mut mac = self.key.clone();
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac
    }

    fn signature(&self, path: &str, expires: i64) -> String {
        hex::encode(self.mac(path, expires).finalize().into_bytes())
    }

    pub fn sign(&self, path: &str) -> SignedUrl {
        self.sign_at(path, Utc::now())
    }

    pub fn sign_at(&self, path: &str, now: DateTime<Utc>) -> SignedUrl {
        let expires_at = now + self.ttl;
        let expires = expires_at.timestamp();
        SignedUrl {
            url: format!(
                "{}/files/{}?expires={}&signature={}",
                self.public_url,
                path,
                expires,
                self.signature(path, expires)
            ),
            expires_at,
        }
    }

    pub fn verify(&self, path: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        self.mac(path, expires).verify_slice(&signature).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_sanitizes_file_name() {
        assert_eq!(
            object_path("u1", "a1", "../../etc/pass wd.pdf"),
            "u1/a1-_.._etc_pass_wd.pdf"
        );
        assert_eq!(object_path("u1", "a1", "..."), "u1/a1-file");
        assert_eq!(object_path("u1", "a1", "report.pdf"), "u1/a1-report.pdf");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        assert!(store.resolve("u1/a1-x.txt").is_ok());
        assert!(store.resolve("../outside").is_err());
        assert!(store.resolve("/etc/passwd").is_err());
        assert!(store.resolve("").is_err());
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path()).unwrap();
        store.put("u1/a1-x.txt", b"hello").await.unwrap();
        assert_eq!(store.get("u1/a1-x.txt").await.unwrap(), b"hello");

        store.delete("u1/a1-x.txt").await.unwrap();
        assert!(matches!(
            store.get("u1/a1-x.txt").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
        store.delete("u1/a1-x.txt").await.unwrap();
    }

    #[test]
    fn test_signed_url_verifies_until_expiry() {
        let signer = UrlSigner::new("secret", "http://localhost:3000/", 86_400);
        let signed = signer.sign("u1/a1-x.txt");
        assert!(signed.url.starts_with("http://localhost:3000/files/u1/a1-x.txt?expires="));

        let expires = signed.expires_at.timestamp();
        let signature = signed.url.rsplit("signature=").next().unwrap();
        assert!(signer.verify("u1/a1-x.txt", expires, signature));
        assert!(!signer.verify("u1/a1-y.txt", expires, signature));
        assert!(!signer.verify("u1/a1-x.txt", expires + 1, signature));

        let other = UrlSigner::new("other-secret", "http://localhost:3000", 86_400);
        assert!(!other.verify("u1/a1-x.txt", expires, signature));

        assert_eq!(signature.len(), 64);
        assert!(!signer.verify("u1/a1-x.txt", expires, "not-hex"));
        assert!(!signer.verify("u1/a1-x.txt", expires, &signature[..32]));
        assert!(!signer.verify("u1/a1-x.txt", expires, ""));
    }

    #[test]
    fn test_signed_url_rejected_after_expiry() {
        let signer = UrlSigner::new("secret", "http://localhost:3000", 60);
        let signed = signer.sign_at("u1/a1-x.txt", Utc::now() - Duration::hours(1));
        let signature = signed.url.rsplit("signature=").next().unwrap();
        assert!(!signer.verify("u1/a1-x.txt", signed.expires_at.timestamp(), signature));
    }
}
