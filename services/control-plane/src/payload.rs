//! Content-addressed payload store for large execution inputs and results.
//!
//! Payloads above the controller's inline threshold are written here and the
//! execution record carries a `payload://sha256/<hex>` URI instead of inline
//! bytes.  Identical content maps to the same URI, so re-saving is free.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// URI scheme prefix for stored payloads.
pub const URI_PREFIX: &str = "payload://sha256/";

/// Result of saving a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPayload {
    pub uri: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid payload uri: {0}")]
    InvalidUri(String),
    #[error("payload not found: {0}")]
    NotFound(String),
}

/// Filesystem-backed content-addressed blob store.
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    /// Open (or create) the store rooted at `root`.
    pub fn open(root: &Path) -> Result<Self, PayloadError> {
        std::fs::create_dir_all(root)?;
        Ok(PayloadStore {
            root: root.to_owned(),
        })
    }

    /// Store `data`, returning its content-addressed URI and size.
    pub async fn save_bytes(&self, data: &[u8]) -> Result<StoredPayload, PayloadError> {
        let digest = hex::encode(Sha256::digest(data));
        let path = self.blob_path(&digest);
        // Same digest means same content; skip the rewrite.
        if tokio::fs::try_exists(&path).await? {
            return Ok(StoredPayload {
                uri: format!("{URI_PREFIX}{digest}"),
                size: data.len() as u64,
            });
        }
        // Write via a temp file then rename so readers never observe a
        // partially written blob.
        let tmp = self.root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(StoredPayload {
            uri: format!("{URI_PREFIX}{digest}"),
            size: data.len() as u64,
        })
    }

    /// Store everything readable from `reader`.
    pub async fn save_from_reader<R>(&self, mut reader: R) -> Result<StoredPayload, PayloadError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        self.save_bytes(&buf).await
    }

    /// Read the payload behind `uri`.
    pub async fn open_uri(&self, uri: &str) -> Result<Vec<u8>, PayloadError> {
        let path = self.path_for_uri(uri)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PayloadError::NotFound(uri.to_owned()))
            }
            Err(e) => Err(PayloadError::Io(e)),
        }
    }

    /// Remove the payload behind `uri`.  Removing an absent payload is an error.
    pub async fn remove(&self, uri: &str) -> Result<(), PayloadError> {
        let path = self.path_for_uri(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PayloadError::NotFound(uri.to_owned()))
            }
            Err(e) => Err(PayloadError::Io(e)),
        }
    }

    fn blob_path(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    fn path_for_uri(&self, uri: &str) -> Result<PathBuf, PayloadError> {
        let digest = uri
            .strip_prefix(URI_PREFIX)
            .ok_or_else(|| PayloadError::InvalidUri(uri.to_owned()))?;
        // Digest must be plain lowercase hex; anything else could escape the root.
        if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PayloadError::InvalidUri(uri.to_owned()));
        }
        Ok(self.blob_path(digest))
    }
}
