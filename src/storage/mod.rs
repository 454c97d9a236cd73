//! Object storage access
//!
//! All reads and writes go through sidecar-signed URLs; the service holds no
//! storage credentials of its own. [`ObjectStore`] covers the operations the
//! pipeline needs: existence/size checks for completion verification,
//! streamed download of the raw asset, and streamed upload of the analysis
//! proxy.

use futures::StreamExt;
use std::path::Path;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;

pub mod signer;

pub use signer::{SignedUrl, UrlSigner};

/// Allowed drift between declared and stored size, absorbing encoding
/// artifacts. Anything larger fails verification.
pub const SIZE_TOLERANCE_BYTES: u64 = 1024;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Size mismatch: expected {expected} bytes, found {actual} bytes")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Storage request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected storage response: {0}")]
    Unexpected(String),
}

/// Sanitize a client filename for use in a storage key.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive the collision-resistant key under which a raw asset is stored.
pub fn derive_storage_key(upload_id: &str, filename: &str, session_id: Option<i64>) -> String {
    let safe = sanitize_filename(filename);
    match session_id {
        Some(sid) => format!("sessions/{sid}/{upload_id}/{safe}"),
        None => format!("uploads/{upload_id}/{safe}"),
    }
}

/// Derive the proxy key next to the raw asset, swapping the extension.
pub fn derive_proxy_key(storage_key: &str) -> String {
    match storage_key.rfind('.') {
        // Only strip an extension inside the final path segment.
        Some(dot) if !storage_key[dot..].contains('/') => {
            format!("{}_proxy.mp4", &storage_key[..dot])
        }
        _ => format!("{storage_key}_proxy.mp4"),
    }
}

/// Object storage client operating over signed URLs.
pub struct ObjectStore {
    signer: UrlSigner,
    bucket: String,
    private_dir: String,
    ttl_sec: u64,
    client: reqwest::Client,
}

impl ObjectStore {
    pub fn new(
        signer: UrlSigner,
        bucket: impl Into<String>,
        private_dir: impl Into<String>,
        ttl_sec: u64,
    ) -> Self {
        Self {
            signer,
            bucket: bucket.into().trim_matches('/').to_string(),
            private_dir: private_dir.into().trim_matches('/').to_string(),
            ttl_sec,
            client: reqwest::Client::new(),
        }
    }

    fn object_name(&self, key: &str) -> String {
        if self.private_dir.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.private_dir, key)
        }
    }

    /// Signed PUT URL for the client-side direct upload.
    pub async fn sign_put(&self, key: &str, content_type: &str) -> Result<SignedUrl, StorageError> {
        self.signer
            .sign(
                &self.bucket,
                &self.object_name(key),
                "PUT",
                self.ttl_sec,
                Some(content_type),
            )
            .await
    }

    /// Stored object size. `NotFound` if the object never landed.
    #[tracing::instrument(name = "storage.size", skip(self), err)]
    pub async fn size(&self, key: &str) -> Result<u64, StorageError> {
        let signed = self
            .signer
            .sign(&self.bucket, &self.object_name(key), "HEAD", self.ttl_sec, None)
            .await?;

        let response = self.client.head(&signed.url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(StorageError::Unexpected(format!(
                "HEAD {} returned {}",
                key,
                response.status()
            )));
        }

        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| StorageError::Unexpected(format!("HEAD {key} carried no content length")))
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.size(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Confirm a claimed upload actually landed and matches the declared
    /// size within [`SIZE_TOLERANCE_BYTES`]. Returns the stored size.
    pub async fn verify_stored(&self, key: &str, declared: u64) -> Result<u64, StorageError> {
        let actual = self.size(key).await?;
        let drift = actual.abs_diff(declared);
        if drift > SIZE_TOLERANCE_BYTES {
            return Err(StorageError::SizeMismatch {
                expected: declared,
                actual,
            });
        }
        Ok(actual)
    }

    /// Signed GET URL for short-lived read access.
    pub async fn sign_get(&self, key: &str) -> Result<SignedUrl, StorageError> {
        self.signer
            .sign(&self.bucket, &self.object_name(key), "GET", self.ttl_sec, None)
            .await
    }

    /// Stream an object down to a local file. Returns bytes written.
    #[tracing::instrument(name = "storage.download", skip(self, dest), err)]
    pub async fn download(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let signed = self.sign_get(key).await?;

        let response = self.client.get(&signed.url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if !response.status().is_success() {
            return Err(StorageError::Unexpected(format!(
                "GET {} returned {}",
                key,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(key, bytes = written, "Downloaded object");
        Ok(written)
    }

    /// Stream a local file up into an object.
    #[tracing::instrument(name = "storage.upload", skip(self, path), err)]
    pub async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let signed = self.sign_put(key, content_type).await?;

        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let response = self
            .client
            .put(&signed.url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StorageError::Unexpected(format!(
                "PUT {} returned {}",
                key,
                response.status()
            )));
        }

        info!(key, bytes = size, "Uploaded object");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("my clip (1).mp4"), "my_clip__1_.mp4");
        assert_eq!(sanitize_filename("ok-file_v2.mov"), "ok-file_v2.mov");
    }

    #[test]
    fn test_derive_storage_key() {
        let key = derive_storage_key("upl_abc", "a b.mp4", None);
        assert_eq!(key, "uploads/upl_abc/a_b.mp4");

        let key = derive_storage_key("upl_abc", "a.mp4", Some(7));
        assert_eq!(key, "sessions/7/upl_abc/a.mp4");
    }

    #[test]
    fn test_derive_proxy_key_swaps_extension() {
        assert_eq!(
            derive_proxy_key("uploads/upl_1/clip.mov"),
            "uploads/upl_1/clip_proxy.mp4"
        );
    }

    #[test]
    fn test_derive_proxy_key_without_extension() {
        assert_eq!(
            derive_proxy_key("uploads/upl_1/rawclip"),
            "uploads/upl_1/rawclip_proxy.mp4"
        );
        // A dot in a directory segment is not an extension
        assert_eq!(
            derive_proxy_key("uploads/v1.2/rawclip"),
            "uploads/v1.2/rawclip_proxy.mp4"
        );
    }
}
