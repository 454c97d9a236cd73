//! Session registry
//!
//! Single owner of all writes to `status`, `progress`, `remote_file_handle`
//! and `last_error`. Other components read sessions or propose progress
//! updates through it; nothing else touches those fields.

use super::{Progress, SessionError, SessionStore, Stage, StoreError, UploadSession, UploadStatus};
use crate::storage::derive_storage_key;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// MIME types accepted for upload, in addition to anything under `video/`.
const ALLOWED_VIDEO_MIMETYPES: &[&str] = &[
    "video/mp4",
    "video/quicktime",
    "video/x-msvideo",
    "video/x-matroska",
    "video/webm",
    "video/mpeg",
    "video/3gpp",
    "video/3gpp2",
];

/// Parameters for creating an upload session.
#[derive(Debug, Clone)]
pub struct CreateUpload {
    pub attempt_id: String,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub session_id: Option<i64>,
}

/// Registry enforcing the upload state graph over a [`SessionStore`].
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    max_size_bytes: u64,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, max_size_bytes: u64) -> Self {
        Self {
            store,
            max_size_bytes,
        }
    }

    /// Create a session, or return the existing one for a replayed attempt.
    ///
    /// Replaying `init` with an `attempt_id` whose session is still
    /// `UPLOADING` returns that session unchanged, so a flaky client can
    /// re-request a signed URL bound to the same storage key. An attempt id
    /// already bound to a stored or terminal session is a client error.
    #[tracing::instrument(name = "session.create", skip(self, req), fields(attempt_id = %req.attempt_id), err)]
    pub async fn create(&self, req: CreateUpload) -> Result<UploadSession, SessionError> {
        self.validate(&req)?;

        if let Some(existing) = self.store.find_by_attempt_id(&req.attempt_id).await? {
            return Self::replay(existing);
        }

        let upload_id = format!("upl_{}", uuid::Uuid::new_v4().simple());
        let storage_key = derive_storage_key(&upload_id, &req.filename, req.session_id);
        let now = Utc::now();

        let session = UploadSession {
            upload_id: upload_id.clone(),
            attempt_id: req.attempt_id.clone(),
            session_id: req.session_id,
            filename: req.filename,
            mime_type: req.mime_type,
            size_bytes: req.size_bytes,
            storage_key,
            proxy_storage_key: None,
            proxy_size_bytes: None,
            status: UploadStatus::Uploading,
            progress: Progress::new(Stage::Uploading, 0),
            remote_file_handle: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert(session.clone()).await {
            Ok(()) => {
                info!(upload_id = %upload_id, size_bytes = session.size_bytes, "Initialized upload session");
                Ok(session)
            }
            // Lost a race against a concurrent replay of the same attempt.
            Err(StoreError::DuplicateAttempt(_)) => {
                let existing = self
                    .store
                    .find_by_attempt_id(&req.attempt_id)
                    .await?
                    .ok_or_else(|| SessionError::NotFound(req.attempt_id.clone()))?;
                Self::replay(existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load a session by upload id.
    pub async fn get(&self, upload_id: &str) -> Result<UploadSession, SessionError> {
        self.store
            .find_by_upload_id(upload_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(upload_id.to_string()))
    }

    /// Move a session to `status`, recording `progress`.
    ///
    /// Rejects anything the state graph does not allow.
    #[tracing::instrument(name = "session.advance", skip(self, progress), err)]
    pub async fn advance(
        &self,
        upload_id: &str,
        status: UploadStatus,
        progress: Progress,
    ) -> Result<UploadSession, SessionError> {
        let mut session = self.get(upload_id).await?;

        if !session.status.can_advance_to(status) {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                to: status,
            });
        }

        session.status = status;
        session.progress = Self::clamp_monotonic(&session.progress, progress);
        session.updated_at = Utc::now();
        self.store.update(&session).await?;

        info!(upload_id, status = %status, pct = session.progress.pct, "Session advanced");
        Ok(session)
    }

    /// Record stage-local progress without a status change.
    pub async fn report_progress(
        &self,
        upload_id: &str,
        progress: Progress,
    ) -> Result<(), SessionError> {
        let mut session = self.get(upload_id).await?;
        if session.status.is_terminal() {
            // A late callback from a finished stage carries no information.
            return Ok(());
        }
        session.progress = Self::clamp_monotonic(&session.progress, progress);
        session.updated_at = Utc::now();
        self.store.update(&session).await?;
        Ok(())
    }

    /// Record the proxy object produced by compression.
    pub async fn record_proxy(
        &self,
        upload_id: &str,
        proxy_storage_key: &str,
        proxy_size_bytes: u64,
    ) -> Result<(), SessionError> {
        let mut session = self.get(upload_id).await?;
        session.proxy_storage_key = Some(proxy_storage_key.to_string());
        session.proxy_size_bytes = Some(proxy_size_bytes);
        session.updated_at = Utc::now();
        self.store.update(&session).await?;
        Ok(())
    }

    /// Terminal success: record the remote handle and move to `ACTIVE`.
    #[tracing::instrument(name = "session.activate", skip(self), err)]
    pub async fn activate(&self, upload_id: &str, handle: &str) -> Result<(), SessionError> {
        let mut session = self.get(upload_id).await?;

        if !session.status.can_advance_to(UploadStatus::Active) {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                to: UploadStatus::Active,
            });
        }

        session.status = UploadStatus::Active;
        session.remote_file_handle = Some(handle.to_string());
        session.progress = Progress::new(Stage::Ready, 100);
        session.updated_at = Utc::now();
        self.store.update(&session).await?;

        info!(upload_id, handle, "Upload active");
        Ok(())
    }

    /// Terminal failure. Idempotent when the session is already failed.
    #[tracing::instrument(name = "session.fail", skip(self))]
    pub async fn fail(&self, upload_id: &str, reason: &str) -> Result<(), SessionError> {
        let mut session = self.get(upload_id).await?;

        if session.status == UploadStatus::Failed {
            return Ok(());
        }
        if !session.status.can_advance_to(UploadStatus::Failed) {
            return Err(SessionError::InvalidTransition {
                from: session.status,
                to: UploadStatus::Failed,
            });
        }

        session.status = UploadStatus::Failed;
        session.last_error = Some(reason.to_string());
        session.progress = Progress::new(Stage::Failed, 0);
        session.updated_at = Utc::now();
        self.store.update(&session).await?;

        warn!(upload_id, reason, "Upload failed");
        Ok(())
    }

    /// Startup recovery: mark every non-terminal session failed.
    ///
    /// A process restart loses in-flight pipelines; their temp files and
    /// remote upload sessions are unrecoverable, so the sessions are failed
    /// outright instead of being left stuck mid-progress.
    pub async fn fail_orphans(&self) -> Result<usize, SessionError> {
        let mut failed = 0;
        for session in self.store.all().await? {
            if !session.status.is_terminal() {
                self.fail(&session.upload_id, "Pipeline interrupted by process restart")
                    .await?;
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(count = failed, "Failed orphaned sessions at startup");
        }
        Ok(failed)
    }

    fn validate(&self, req: &CreateUpload) -> Result<(), SessionError> {
        if req.filename.is_empty() || req.attempt_id.is_empty() {
            return Err(SessionError::Validation(
                "filename and attemptId are required".into(),
            ));
        }

        if !req.mime_type.starts_with("video/")
            && !ALLOWED_VIDEO_MIMETYPES.contains(&req.mime_type.as_str())
        {
            return Err(SessionError::Validation(
                "Invalid file type. Only video files are allowed.".into(),
            ));
        }

        if req.size_bytes == 0 {
            return Err(SessionError::Validation(
                "Declared size must be greater than zero".into(),
            ));
        }

        if req.size_bytes > self.max_size_bytes {
            return Err(SessionError::Validation(format!(
                "File too large. Maximum size is {}MB",
                self.max_size_bytes / (1024 * 1024)
            )));
        }

        Ok(())
    }

    fn replay(existing: UploadSession) -> Result<UploadSession, SessionError> {
        if existing.status == UploadStatus::Uploading {
            info!(upload_id = %existing.upload_id, "Replayed init for in-flight attempt");
            Ok(existing)
        } else {
            Err(SessionError::Validation(format!(
                "Attempt id already bound to a {} upload",
                existing.status
            )))
        }
    }

    /// Percent never regresses within a live session; stage and message
    /// always take the caller's values. A move to the failed stage resets
    /// the scale instead.
    fn clamp_monotonic(current: &Progress, mut proposed: Progress) -> Progress {
        if proposed.stage != Stage::Failed {
            proposed.pct = proposed.pct.max(current.pct);
        }
        proposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryStore;

    const GIB2: u64 = 2 * 1024 * 1024 * 1024;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemoryStore::new()), GIB2)
    }

    fn request(attempt_id: &str) -> CreateUpload {
        CreateUpload {
            attempt_id: attempt_id.into(),
            filename: "screening.mp4".into(),
            mime_type: "video/mp4".into(),
            size_bytes: 100 * 1024 * 1024,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_ids_and_key() {
        let registry = registry();
        let session = registry.create(request("a-1")).await.unwrap();

        assert!(session.upload_id.starts_with("upl_"));
        assert_eq!(session.status, UploadStatus::Uploading);
        assert!(session.storage_key.contains(&session.upload_id));
    }

    #[tokio::test]
    async fn test_create_rejects_non_video_mime() {
        let registry = registry();
        let mut req = request("a-1");
        req.mime_type = "application/pdf".into();
        let err = registry.create(req).await.unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_oversized() {
        let registry = registry();
        let mut req = request("a-1");
        req.size_bytes = GIB2 + 1;
        assert!(registry.create(req).await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_zero_size() {
        let registry = registry();
        let mut req = request("a-1");
        req.size_bytes = 0;
        assert!(registry.create(req).await.is_err());
    }

    #[tokio::test]
    async fn test_replayed_init_returns_same_session() {
        let registry = registry();
        let first = registry.create(request("a-1")).await.unwrap();
        let second = registry.create(request("a-1")).await.unwrap();

        assert_eq!(first.upload_id, second.upload_id);
        assert_eq!(first.storage_key, second.storage_key);
    }

    #[tokio::test]
    async fn test_replay_after_stored_is_rejected() {
        let registry = registry();
        let session = registry.create(request("a-1")).await.unwrap();
        registry
            .advance(
                &session.upload_id,
                UploadStatus::Stored,
                Progress::new(Stage::Stored, 40),
            )
            .await
            .unwrap();

        assert!(registry.create(request("a-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_advance_rejects_illegal_transition() {
        let registry = registry();
        let session = registry.create(request("a-1")).await.unwrap();

        let err = registry
            .advance(
                &session.upload_id,
                UploadStatus::Active,
                Progress::new(Stage::Ready, 100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_failed_session_cannot_advance() {
        let registry = registry();
        let session = registry.create(request("a-1")).await.unwrap();
        registry.fail(&session.upload_id, "boom").await.unwrap();

        let err = registry
            .advance(
                &session.upload_id,
                UploadStatus::Stored,
                Progress::new(Stage::Stored, 40),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_fail_is_idempotent() {
        let registry = registry();
        let session = registry.create(request("a-1")).await.unwrap();
        registry.fail(&session.upload_id, "first").await.unwrap();
        registry.fail(&session.upload_id, "second").await.unwrap();

        let stored = registry.get(&session.upload_id).await.unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_progress_never_regresses() {
        let registry = registry();
        let session = registry.create(request("a-1")).await.unwrap();
        let id = session.upload_id.clone();

        registry
            .advance(&id, UploadStatus::Stored, Progress::new(Stage::Stored, 40))
            .await
            .unwrap();
        registry
            .report_progress(&id, Progress::new(Stage::Fetching, 43))
            .await
            .unwrap();
        // A stale lower report must not move the needle backwards.
        registry
            .report_progress(&id, Progress::new(Stage::Fetching, 41))
            .await
            .unwrap();

        let stored = registry.get(&id).await.unwrap();
        assert_eq!(stored.progress.pct, 43);
    }

    #[tokio::test]
    async fn test_fail_orphans_marks_non_terminal_sessions() {
        let registry = registry();
        let live = registry.create(request("a-1")).await.unwrap();
        let done = registry.create(request("a-2")).await.unwrap();
        registry
            .advance(
                &done.upload_id,
                UploadStatus::Stored,
                Progress::new(Stage::Stored, 40),
            )
            .await
            .unwrap();
        registry
            .advance(
                &done.upload_id,
                UploadStatus::Transferring,
                Progress::new(Stage::Transferring, 80),
            )
            .await
            .unwrap();
        registry.activate(&done.upload_id, "files/ok").await.unwrap();

        let failed = registry.fail_orphans().await.unwrap();
        assert_eq!(failed, 1);

        let live = registry.get(&live.upload_id).await.unwrap();
        assert_eq!(live.status, UploadStatus::Failed);
        let done = registry.get(&done.upload_id).await.unwrap();
        assert_eq!(done.status, UploadStatus::Active);
    }
}
