//! Upload session lifecycle
//!
//! Every upload attempt is tracked as an [`UploadSession`] moving through a
//! forward-only state machine:
//!
//! ```text
//! UPLOADING -> STORED -> COMPRESSING -> COMPRESSED -> TRANSFERRING -> ACTIVE
//!                  \___________________________________/^
//! ```
//!
//! `STORED -> TRANSFERRING` is the direct edge taken when the decision engine
//! rules compression unnecessary and the original asset is shipped as its own
//! proxy. `FAILED` is terminal and reachable from every non-terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod registry;
pub mod store;

pub use registry::{CreateUpload, SessionRegistry};
pub use store::{MemoryStore, SessionStore, StoreError};

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Illegal transition: {from:?} -> {to:?}")]
    InvalidTransition { from: UploadStatus, to: UploadStatus },

    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Upload lifecycle status, persisted with the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UploadStatus {
    Uploading,
    Stored,
    Compressing,
    Compressed,
    Transferring,
    Active,
    Failed,
}

impl UploadStatus {
    /// Whether this status permits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Active | UploadStatus::Failed)
    }

    /// Legal-successor predicate. This is the single choke point enforcing
    /// the state graph; every status write goes through it.
    pub fn can_advance_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Uploading, Stored)
            | (Stored, Compressing)
            | (Stored, Transferring)
            | (Compressing, Compressed)
            | (Compressed, Transferring)
            | (Transferring, Active) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadStatus::Uploading => "UPLOADING",
            UploadStatus::Stored => "STORED",
            UploadStatus::Compressing => "COMPRESSING",
            UploadStatus::Compressed => "COMPRESSED",
            UploadStatus::Transferring => "TRANSFERRING",
            UploadStatus::Active => "ACTIVE",
            UploadStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Pipeline stage for progress reporting.
///
/// Each stage owns a disjoint sub-range of the 0-100 percent scale, declared
/// in one place so no stage hardcodes magic percentages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Uploading,
    Stored,
    Fetching,
    Compressing,
    Compressed,
    Transferring,
    Processing,
    Ready,
    Failed,
}

impl Stage {
    /// The `[start, end]` percent sub-range this stage owns.
    pub fn span(self) -> (u8, u8) {
        match self {
            Stage::Uploading => (0, 40),
            Stage::Stored => (40, 40),
            Stage::Fetching => (41, 45),
            Stage::Compressing => (45, 75),
            Stage::Compressed => (75, 80),
            Stage::Transferring => (80, 95),
            Stage::Processing => (95, 99),
            Stage::Ready => (100, 100),
            Stage::Failed => (0, 0),
        }
    }

    /// Map a 0.0-1.0 fraction of stage-local progress into the stage's
    /// overall percent sub-range.
    pub fn scale(self, fraction: f64) -> u8 {
        let (start, end) = self.span();
        let fraction = fraction.clamp(0.0, 1.0);
        start + ((end - start) as f64 * fraction).floor() as u8
    }
}

/// Progress snapshot: stage, overall percent, optional operator-facing message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Stage,
    pub pct: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    pub fn new(stage: Stage, pct: u8) -> Self {
        Self {
            stage,
            pct,
            message: None,
        }
    }

    pub fn with_message(stage: Stage, pct: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            pct,
            message: Some(message.into()),
        }
    }

    /// Progress at the start of a stage's sub-range.
    pub fn at_stage_start(stage: Stage, message: impl Into<String>) -> Self {
        Self::with_message(stage, stage.span().0, message)
    }
}

/// One row per logical upload attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    /// Server-generated, globally unique, stable for the session's lifetime.
    pub upload_id: String,
    /// Client-supplied idempotency token; unique across sessions.
    pub attempt_id: String,
    /// Optional association to a parent analysis session.
    pub session_id: Option<i64>,
    pub filename: String,
    pub mime_type: String,
    /// Client-declared size, verified against storage on completion.
    pub size_bytes: u64,
    /// Collision-resistant path under which the raw asset is stored.
    pub storage_key: String,
    /// Populated only if compression ran.
    pub proxy_storage_key: Option<String>,
    pub proxy_size_bytes: Option<u64>,
    pub status: UploadStatus,
    pub progress: Progress,
    /// Opaque reference returned by the inference backend once usable.
    pub remote_file_handle: Option<String>,
    /// Last fatal message; present only in the FAILED state.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
