//! Session persistence contract
//!
//! The pipeline only needs a narrow insert/find/update surface over the
//! session table; the relational engine behind it is someone else's problem.
//! [`MemoryStore`] is the in-process implementation used by the server and
//! by tests.

use super::UploadSession;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Duplicate attempt id: {0}")]
    DuplicateAttempt(String),

    #[error("No session for upload id: {0}")]
    MissingSession(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Narrow read/update contract over the UploadSession record.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails if the attempt id is already taken.
    async fn insert(&self, session: UploadSession) -> Result<(), StoreError>;

    async fn find_by_upload_id(&self, upload_id: &str)
        -> Result<Option<UploadSession>, StoreError>;

    async fn find_by_attempt_id(
        &self,
        attempt_id: &str,
    ) -> Result<Option<UploadSession>, StoreError>;

    /// Overwrite the stored record keyed by its upload id.
    async fn update(&self, session: &UploadSession) -> Result<(), StoreError>;

    /// Every stored session. Used by startup recovery.
    async fn all(&self) -> Result<Vec<UploadSession>, StoreError>;
}

/// In-memory session store backed by concurrent maps.
#[derive(Default)]
pub struct MemoryStore {
    by_upload_id: DashMap<String, UploadSession>,
    // Secondary index enforcing the attempt-id unique constraint.
    attempt_index: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, session: UploadSession) -> Result<(), StoreError> {
        use dashmap::mapref::entry::Entry;
        match self.attempt_index.entry(session.attempt_id.clone()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateAttempt(session.attempt_id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(session.upload_id.clone());
                self.by_upload_id
                    .insert(session.upload_id.clone(), session);
                Ok(())
            }
        }
    }

    async fn find_by_upload_id(
        &self,
        upload_id: &str,
    ) -> Result<Option<UploadSession>, StoreError> {
        Ok(self.by_upload_id.get(upload_id).map(|s| s.clone()))
    }

    async fn find_by_attempt_id(
        &self,
        attempt_id: &str,
    ) -> Result<Option<UploadSession>, StoreError> {
        let Some(upload_id) = self.attempt_index.get(attempt_id).map(|id| id.clone()) else {
            return Ok(None);
        };
        self.find_by_upload_id(&upload_id).await
    }

    async fn update(&self, session: &UploadSession) -> Result<(), StoreError> {
        match self.by_upload_id.get_mut(&session.upload_id) {
            Some(mut slot) => {
                *slot = session.clone();
                Ok(())
            }
            None => Err(StoreError::MissingSession(session.upload_id.clone())),
        }
    }

    async fn all(&self) -> Result<Vec<UploadSession>, StoreError> {
        Ok(self.by_upload_id.iter().map(|s| s.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Progress, Stage, UploadStatus};
    use chrono::Utc;

    fn sample_session(upload_id: &str, attempt_id: &str) -> UploadSession {
        UploadSession {
            upload_id: upload_id.into(),
            attempt_id: attempt_id.into(),
            session_id: None,
            filename: "clip.mp4".into(),
            mime_type: "video/mp4".into(),
            size_bytes: 1024,
            storage_key: format!("uploads/{upload_id}/clip.mp4"),
            proxy_storage_key: None,
            proxy_size_bytes: None,
            status: UploadStatus::Uploading,
            progress: Progress::new(Stage::Uploading, 0),
            remote_file_handle: None,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = MemoryStore::new();
        store
            .insert(sample_session("upl_1", "attempt-1"))
            .await
            .unwrap();

        let by_upload = store.find_by_upload_id("upl_1").await.unwrap().unwrap();
        assert_eq!(by_upload.attempt_id, "attempt-1");

        let by_attempt = store.find_by_attempt_id("attempt-1").await.unwrap().unwrap();
        assert_eq!(by_attempt.upload_id, "upl_1");
    }

    #[tokio::test]
    async fn test_duplicate_attempt_rejected() {
        let store = MemoryStore::new();
        store
            .insert(sample_session("upl_1", "attempt-1"))
            .await
            .unwrap();

        let err = store
            .insert(sample_session("upl_2", "attempt-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateAttempt(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_session_fails() {
        let store = MemoryStore::new();
        let session = sample_session("upl_missing", "attempt-x");
        let err = store.update(&session).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingSession(_)));
    }
}
