//! Upload API Integration Tests
//!
//! Drives the HTTP handlers end to end against mock storage, covering the
//! init/complete/status lifecycle and duplicate-completion behavior.

use async_trait::async_trait;
use bytes::Bytes;
use focalpoint_ingest::api::{handle_request, AppState};
use focalpoint_ingest::compress::{CompressError, TranscodeOutput, Transcoder};
use focalpoint_ingest::decision::{Thresholds, VideoMetadata};
use focalpoint_ingest::pipeline::{Pipeline, PipelineSettings};
use focalpoint_ingest::session::{MemoryStore, SessionRegistry, UploadStatus};
use focalpoint_ingest::storage::{ObjectStore, UrlSigner};
use focalpoint_ingest::transfer::{PollConfig, RemoteFileClient};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Probe-only transcoder; these tests never reach the compression branch.
struct InertTranscoder;

#[async_trait]
impl Transcoder for InertTranscoder {
    async fn probe(&self, _path: &Path) -> Result<VideoMetadata, CompressError> {
        Ok(VideoMetadata {
            size_bytes: 1000,
            width: 640,
            height: 480,
            fps: 8.0,
        })
    }

    async fn transcode(
        &self,
        _input: &Path,
        _target_height: u32,
        _target_fps: u32,
        _progress: mpsc::Sender<f64>,
    ) -> Result<TranscodeOutput, CompressError> {
        Err(CompressError::Transcode("not wired in this harness".into()))
    }
}

struct Harness {
    state: Arc<AppState>,
    registry: Arc<SessionRegistry>,
    _sidecar: MockServer,
    _storage: MockServer,
    _remote: MockServer,
}

/// Wire up the handler state against mock storage. The backend mock carries
/// no expectations; sessions that reach the background pipeline fail there,
/// which these tests don't assert on.
async fn harness() -> Harness {
    let storage = MockServer::start().await;
    let remote = MockServer::start().await;
    let sidecar = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/object-storage/signed-object-url"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "signed_url": format!("{}/signed-object", storage.uri())
        })))
        .mount(&sidecar)
        .await;

    // Slow verification holds concurrent completions open together.
    Mock::given(method("HEAD"))
        .and(path("/signed-object"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(vec![0u8; 1000])
                .set_delay(Duration::from_millis(100)),
        )
        .mount(&storage)
        .await;

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(MemoryStore::new()),
        2 * 1024 * 1024 * 1024,
    ));
    let objects = Arc::new(ObjectStore::new(
        UrlSigner::new(sidecar.uri()),
        "focalpoint-assets",
        ".private",
        900,
    ));
    let client = Arc::new(
        RemoteFileClient::new(remote.uri(), "test-key")
            .with_chunk_retries(1, Duration::from_millis(10)),
    );

    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&registry),
        Arc::clone(&objects),
        client,
        Arc::new(InertTranscoder),
        PipelineSettings {
            thresholds: Thresholds::default(),
            target_height: 720,
            target_fps: 10,
            chunk_size: 64 * 1024,
            poll: PollConfig {
                interval: Duration::from_millis(10),
                max_attempts: 2,
            },
            work_dir: tempfile::tempdir().unwrap().keep(),
        },
    ));

    let state = Arc::new(AppState {
        registry: Arc::clone(&registry),
        objects,
        pipeline,
    });

    Harness {
        state,
        registry,
        _sidecar: sidecar,
        _storage: storage,
        _remote: remote,
    }
}

async fn call(
    state: Arc<AppState>,
    method: Method,
    uri: &str,
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    let resp = handle_request(state, req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

async fn init_upload(h: &Harness) -> String {
    let (status, body) = call(
        Arc::clone(&h.state),
        Method::POST,
        "/uploads/init",
        serde_json::json!({
            "attemptId": "attempt-1",
            "filename": "clip.mp4",
            "mimeType": "video/mp4",
            "sizeBytes": 1000
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["uploadId"].as_str().unwrap().to_string()
}

fn complete_request(upload_id: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(Method::POST)
        .uri("/uploads/complete")
        .body(Full::new(Bytes::from(
            serde_json::json!({ "uploadId": upload_id }).to_string(),
        )))
        .unwrap()
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_issues_signed_put_url() {
        let h = harness().await;

        let (status, body) = call(
            Arc::clone(&h.state),
            Method::POST,
            "/uploads/init",
            serde_json::json!({
                "attemptId": "attempt-1",
                "filename": "clip.mp4",
                "mimeType": "video/mp4",
                "sizeBytes": 1000
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert!(body["putUrl"].as_str().unwrap().contains("/signed-object"));
        assert!(body["uploadId"].as_str().unwrap().starts_with("upl_"));
    }

    #[tokio::test]
    async fn test_init_rejects_unsupported_mime_type() {
        let h = harness().await;

        let (status, body) = call(
            Arc::clone(&h.state),
            Method::POST,
            "/uploads/init",
            serde_json::json!({
                "attemptId": "attempt-1",
                "filename": "notes.txt",
                "mimeType": "text/plain",
                "sizeBytes": 10
            }),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_complete_unknown_upload_is_not_found() {
        let h = harness().await;

        let (status, _) = call(
            Arc::clone(&h.state),
            Method::POST,
            "/uploads/complete",
            serde_json::json!({ "uploadId": "upl_missing" }),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_concurrent_completions_both_succeed() {
        let h = harness().await;
        let upload_id = init_upload(&h).await;

        // Both calls read the session while it is still UPLOADING and race
        // on the STORED transition; the loser must get the session's current
        // status back, not a conflict.
        let (r1, r2) = tokio::join!(
            handle_request(Arc::clone(&h.state), complete_request(&upload_id)),
            handle_request(Arc::clone(&h.state), complete_request(&upload_id)),
        );
        let (r1, r2) = (r1.unwrap(), r2.unwrap());

        assert_eq!(r1.status(), StatusCode::OK);
        assert_eq!(r2.status(), StatusCode::OK);

        for resp in [r1, r2] {
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
            assert!(body["status"].is_string());
        }

        let session = h.registry.get(&upload_id).await.unwrap();
        assert_ne!(session.status, UploadStatus::Uploading);
    }

    #[tokio::test]
    async fn test_repeated_completion_reports_current_status() {
        let h = harness().await;
        let upload_id = init_upload(&h).await;

        let r1 = handle_request(Arc::clone(&h.state), complete_request(&upload_id))
            .await
            .unwrap();
        assert_eq!(r1.status(), StatusCode::OK);

        let r2 = handle_request(Arc::clone(&h.state), complete_request(&upload_id))
            .await
            .unwrap();
        assert_eq!(r2.status(), StatusCode::OK);

        let bytes = r2.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["status"].is_string());
    }

    #[tokio::test]
    async fn test_status_reflects_session_record() {
        let h = harness().await;
        let upload_id = init_upload(&h).await;

        let (status, body) = call(
            Arc::clone(&h.state),
            Method::GET,
            &format!("/uploads/status/{upload_id}"),
            serde_json::json!(null),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["uploadId"], upload_id.as_str());
        assert_eq!(body["status"], "UPLOADING");
        assert_eq!(body["progress"]["stage"], "uploading");
    }
}
