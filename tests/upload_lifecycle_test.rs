//! Upload Lifecycle Integration Tests
//!
//! Walks sessions through the state graph via the registry's public API.

use focalpoint_ingest::session::{
    CreateUpload, MemoryStore, Progress, SessionError, SessionRegistry, Stage, UploadStatus,
};
use std::sync::Arc;

fn registry() -> SessionRegistry {
    SessionRegistry::new(Arc::new(MemoryStore::new()), 2 * 1024 * 1024 * 1024)
}

fn request(attempt_id: &str) -> CreateUpload {
    CreateUpload {
        attempt_id: attempt_id.into(),
        filename: "clip.mp4".into(),
        mime_type: "video/mp4".into(),
        size_bytes: 1_000_000,
        session_id: None,
    }
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_lifecycle_with_compression() {
        let registry = registry();
        let session = registry.create(request("a1")).await.unwrap();
        let id = session.upload_id;

        for (status, stage) in [
            (UploadStatus::Stored, Stage::Stored),
            (UploadStatus::Compressing, Stage::Compressing),
            (UploadStatus::Compressed, Stage::Compressed),
            (UploadStatus::Transferring, Stage::Transferring),
        ] {
            registry
                .advance(&id, status, Progress::at_stage_start(stage, "step"))
                .await
                .unwrap();
        }

        registry.activate(&id, "https://backend/files/x").await.unwrap();

        let session = registry.get(&id).await.unwrap();
        assert_eq!(session.status, UploadStatus::Active);
        assert_eq!(session.progress.pct, 100);
    }

    #[tokio::test]
    async fn test_stored_to_transferring_skips_compression_states() {
        let registry = registry();
        let session = registry.create(request("a1")).await.unwrap();
        let id = session.upload_id;

        registry
            .advance(
                &id,
                UploadStatus::Stored,
                Progress::at_stage_start(Stage::Stored, "Upload complete"),
            )
            .await
            .unwrap();

        let result = registry
            .advance(
                &id,
                UploadStatus::Transferring,
                Progress::at_stage_start(Stage::Transferring, "Sending to analysis backend"),
            )
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_cannot_jump_from_uploading_to_transferring() {
        let registry = registry();
        let session = registry.create(request("a1")).await.unwrap();

        let result = registry
            .advance(
                &session.upload_id,
                UploadStatus::Transferring,
                Progress::at_stage_start(Stage::Transferring, "step"),
            )
            .await;

        assert!(matches!(
            result,
            Err(SessionError::InvalidTransition {
                from: UploadStatus::Uploading,
                to: UploadStatus::Transferring,
            })
        ));
    }

    #[tokio::test]
    async fn test_replayed_init_reuses_session_while_uploading() {
        let registry = registry();
        let first = registry.create(request("a1")).await.unwrap();
        let second = registry.create(request("a1")).await.unwrap();

        assert_eq!(first.upload_id, second.upload_id);
        assert_eq!(first.storage_key, second.storage_key);
    }

    #[tokio::test]
    async fn test_replayed_init_after_storage_is_rejected() {
        let registry = registry();
        let first = registry.create(request("a1")).await.unwrap();

        registry
            .advance(
                &first.upload_id,
                UploadStatus::Stored,
                Progress::at_stage_start(Stage::Stored, "Upload complete"),
            )
            .await
            .unwrap();

        let result = registry.create(request("a1")).await;
        assert!(matches!(result, Err(SessionError::Validation(_))));
    }

    #[tokio::test]
    async fn test_startup_sweep_fails_only_unfinished_sessions() {
        let registry = registry();

        let stuck = registry.create(request("a1")).await.unwrap();
        let done = registry.create(request("a2")).await.unwrap();

        for (status, stage) in [
            (UploadStatus::Stored, Stage::Stored),
            (UploadStatus::Transferring, Stage::Transferring),
        ] {
            registry
                .advance(&done.upload_id, status, Progress::at_stage_start(stage, "step"))
                .await
                .unwrap();
        }
        registry
            .activate(&done.upload_id, "https://backend/files/x")
            .await
            .unwrap();

        let swept = registry.fail_orphans().await.unwrap();
        assert_eq!(swept, 1);

        let stuck = registry.get(&stuck.upload_id).await.unwrap();
        assert_eq!(stuck.status, UploadStatus::Failed);
        assert!(stuck.last_error.unwrap().contains("restart"));

        let done = registry.get(&done.upload_id).await.unwrap();
        assert_eq!(done.status, UploadStatus::Active);
    }
}
