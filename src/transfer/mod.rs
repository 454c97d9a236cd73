//! Chunked resumable transfer to the inference backend
//!
//! Implements the start/upload/finalize handshake of the backend's
//! file-ingestion API. A transfer streams a local file in fixed-size chunks
//! accumulated from a bounded buffer, so memory stays O(chunk size)
//! regardless of asset size. Each chunk call gets a bounded retry with
//! doubling backoff so one transient blip does not force re-sending the
//! whole file.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub mod poll;

pub use poll::{poll_for_active, ActivationError, PollConfig};

/// Default chunk size: 16 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Transfer errors
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Failed to start remote upload: {0}")]
    Start(String),

    #[error("Chunk upload failed at offset {offset}: {message}")]
    Chunk { offset: u64, message: String },

    #[error("Transfer protocol violation: {0}")]
    Protocol(String),

    #[error("Transfer request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque handle for an asset the backend has accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    #[serde(default)]
    pub uri: String,
}

/// Processing state of a remote file.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteFileState {
    Active { uri: String },
    Failed,
    Processing,
}

#[derive(Deserialize)]
struct FinalizeResponse {
    file: Option<RemoteFile>,
}

#[derive(Deserialize)]
struct FileStatusResponse {
    #[serde(default)]
    state: String,
    #[serde(default)]
    uri: String,
}

/// Client for the backend's resumable file-ingestion API.
pub struct RemoteFileClient {
    base_url: String,
    api_key: String,
    chunk_retries: u32,
    retry_base: Duration,
    client: reqwest::Client,
}

impl RemoteFileClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            chunk_retries: 3,
            retry_base: Duration::from_millis(500),
            client: reqwest::Client::new(),
        }
    }

    /// Whether a non-empty API key was configured.
    pub fn has_api_key(&self) -> bool {
        !self.api_key.is_empty()
    }

    /// Override the per-chunk attempt budget.
    pub fn with_chunk_retries(mut self, retries: u32, base: Duration) -> Self {
        self.chunk_retries = retries.max(1);
        self.retry_base = base;
        self
    }

    /// Declare a new upload; returns the upload-session URI for chunk PUTs.
    #[tracing::instrument(name = "transfer.start", skip(self), err)]
    pub async fn start_upload(
        &self,
        size_bytes: u64,
        content_type: &str,
        display_name: &str,
    ) -> Result<String, TransferError> {
        let response = self
            .client
            .post(format!(
                "{}/upload/v1beta/files?key={}",
                self.base_url, self.api_key
            ))
            .header("Content-Type", "application/json")
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", size_bytes.to_string())
            .header("X-Goog-Upload-Header-Content-Type", content_type)
            .json(&serde_json::json!({
                "file": { "display_name": display_name }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TransferError::Start(format!("{status}: {body}")));
        }

        let upload_uri = response
            .headers()
            .get("X-Goog-Upload-URL")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .ok_or_else(|| TransferError::Start("No upload URI returned".into()))?;

        info!(size_bytes, "Started remote upload");
        Ok(upload_uri)
    }

    /// Upload one contiguous byte range at `offset`, retrying transient
    /// failures. The finalize call returns the remote file handle.
    #[tracing::instrument(
        name = "transfer.put_chunk",
        skip(self, upload_uri, chunk),
        fields(bytes = chunk.len(), finalize),
        err
    )]
    pub async fn put_chunk(
        &self,
        upload_uri: &str,
        chunk: Bytes,
        offset: u64,
        finalize: bool,
    ) -> Result<Option<RemoteFile>, TransferError> {
        let command = if finalize { "upload, finalize" } else { "upload" };

        let mut last_err: Option<TransferError> = None;
        for attempt in 0..self.chunk_retries {
            if attempt > 0 {
                let backoff = self.retry_base * 2u32.saturating_pow(attempt - 1);
                warn!(offset, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying chunk");
                tokio::time::sleep(backoff).await;
            }

            let result = self
                .client
                .put(upload_uri)
                .header("Content-Length", chunk.len().to_string())
                .header("X-Goog-Upload-Offset", offset.to_string())
                .header("X-Goog-Upload-Command", command)
                .body(chunk.clone())
                .send()
                .await;

            let response = match result {
                Ok(r) => r,
                // Connection-level failures are worth another attempt.
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                if !finalize {
                    return Ok(None);
                }
                let parsed: FinalizeResponse = response.json().await.map_err(|e| {
                    TransferError::Protocol(format!("Malformed finalize response: {e}"))
                })?;
                return Ok(parsed.file);
            }

            let retryable = status.is_server_error()
                || status == reqwest::StatusCode::TOO_MANY_REQUESTS;
            let body = response.text().await.unwrap_or_default();
            let err = TransferError::Chunk {
                offset,
                message: format!("{status}: {body}"),
            };
            if !retryable {
                return Err(err);
            }
            last_err = Some(err);
        }

        Err(last_err.unwrap_or(TransferError::Chunk {
            offset,
            message: "Attempt budget exhausted".into(),
        }))
    }

    /// Current processing state of a remote file.
    pub async fn get_file_status(&self, name: &str) -> Result<RemoteFileState, TransferError> {
        let response = self
            .client
            .get(format!("{}/v1beta/{}?key={}", self.base_url, name, self.api_key))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransferError::Protocol(format!(
                "File status returned {}",
                response.status()
            )));
        }

        let parsed: FileStatusResponse = response
            .json()
            .await
            .map_err(|e| TransferError::Protocol(format!("Malformed status response: {e}")))?;

        Ok(match parsed.state.as_str() {
            "ACTIVE" => RemoteFileState::Active { uri: parsed.uri },
            "FAILED" => RemoteFileState::Failed,
            _ => RemoteFileState::Processing,
        })
    }
}

/// Streams a local file through the chunk protocol.
pub struct ChunkedUploader<'a> {
    client: &'a RemoteFileClient,
    chunk_size: usize,
}

impl<'a> ChunkedUploader<'a> {
    pub fn new(client: &'a RemoteFileClient, chunk_size: usize) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Ship `path` to `upload_uri`.
    ///
    /// Chunks are built by accumulating a bounded buffer from a streamed
    /// read and flushing whenever a full chunk is buffered. The chunk whose
    /// end offset equals `total_size` carries the finalize command; offsets
    /// are tracked cumulatively and must land exactly on `total_size`.
    #[tracing::instrument(
        name = "transfer.send",
        skip(self, upload_uri, path, on_progress),
        fields(total_size),
        err
    )]
    pub async fn send(
        &self,
        upload_uri: &str,
        path: &Path,
        total_size: u64,
        on_progress: mpsc::Sender<f64>,
    ) -> Result<RemoteFile, TransferError> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut acc = BytesMut::with_capacity(self.chunk_size.min(DEFAULT_CHUNK_SIZE) * 2);
        let mut read_buf = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        let mut remote: Option<RemoteFile> = None;

        'read: loop {
            let n = file.read(&mut read_buf).await?;
            if n == 0 {
                break;
            }
            acc.extend_from_slice(&read_buf[..n]);

            while acc.len() >= self.chunk_size {
                let chunk = acc.split_to(self.chunk_size).freeze();
                remote = self.flush(upload_uri, chunk, &mut offset, total_size, &on_progress).await?;
                if remote.is_some() {
                    break 'read;
                }
            }
        }

        // Finalized mid-file: bytes still buffered, or still unread when the
        // finalize chunk landed exactly on a chunk boundary, mean the source
        // is longer than declared.
        if remote.is_some() && (!acc.is_empty() || file.read(&mut read_buf).await? > 0) {
            return Err(TransferError::Protocol(format!(
                "File continues past declared size {total_size}"
            )));
        }

        // Trailing partial chunk; also catches files smaller than one chunk.
        if remote.is_none() {
            let chunk = acc.split_to(acc.len()).freeze();
            remote = self.flush(upload_uri, chunk, &mut offset, total_size, &on_progress).await?;
        }

        if offset != total_size {
            return Err(TransferError::Protocol(format!(
                "Transferred {offset} bytes but declared {total_size}"
            )));
        }

        remote.ok_or_else(|| {
            TransferError::Protocol("Finalize response carried no file handle".into())
        })
    }

    async fn flush(
        &self,
        upload_uri: &str,
        chunk: Bytes,
        offset: &mut u64,
        total_size: u64,
        on_progress: &mpsc::Sender<f64>,
    ) -> Result<Option<RemoteFile>, TransferError> {
        let end = *offset + chunk.len() as u64;
        if end > total_size {
            return Err(TransferError::Protocol(format!(
                "Chunk ending at {end} overruns declared size {total_size}"
            )));
        }

        let finalize = end == total_size;
        let len = chunk.len();
        let result = self
            .client
            .put_chunk(upload_uri, chunk, *offset, finalize)
            .await?;

        *offset = end;
        let fraction = if total_size == 0 {
            1.0
        } else {
            *offset as f64 / total_size as f64
        };
        let _ = on_progress.try_send(fraction);
        debug!(offset = *offset, bytes = len, finalize, "Chunk sent");

        Ok(result)
    }
}
