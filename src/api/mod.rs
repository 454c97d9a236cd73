//! HTTP API
//!
//! Parses incoming requests, routes them to handlers, and renders JSON
//! bodies. Three operations cover the upload lifecycle: `init` hands out a
//! signed PUT URL, `complete` verifies the direct upload landed and kicks
//! off the background pipeline, and `status` reads the session record.
//!
//! The server never proxies asset bytes; clients PUT directly against
//! storage with the signed URL from `init`.

use crate::pipeline::Pipeline;
use crate::session::{
    CreateUpload, Progress, SessionError, SessionRegistry, Stage, UploadStatus,
};
use crate::storage::{ObjectStore, StorageError};
use bytes::{Buf, Bytes};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{Method, Request, Response, StatusCode};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{error, warn};

/// Shared handler state.
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub objects: Arc<ObjectStore>,
    pub pipeline: Arc<Pipeline>,
}

/// Recognized endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    InitUpload,
    CompleteUpload,
    UploadStatus(String),
    Health,
    Metrics,
}

/// Map a method and path to a route.
pub fn parse_route(method: &Method, path: &str) -> Option<Route> {
    match (method, path) {
        (&Method::POST, "/uploads/init") => Some(Route::InitUpload),
        (&Method::POST, "/uploads/complete") => Some(Route::CompleteUpload),
        (&Method::GET, "/health") => Some(Route::Health),
        (&Method::GET, "/metrics") => Some(Route::Metrics),
        (&Method::GET, p) => p
            .strip_prefix("/uploads/status/")
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .map(|id| Route::UploadStatus(id.to_string())),
        _ => None,
    }
}

/// Whether any method would match this path. Distinguishes 404 from 405.
fn path_is_known(path: &str) -> bool {
    matches!(path, "/uploads/init" | "/uploads/complete" | "/health" | "/metrics")
        || path
            .strip_prefix("/uploads/status/")
            .is_some_and(|id| !id.is_empty() && !id.contains('/'))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest {
    attempt_id: String,
    filename: String,
    mime_type: String,
    size_bytes: u64,
    #[serde(default)]
    session_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    upload_id: String,
    storage_key: String,
    put_url: String,
    headers: HashMap<String, String>,
    expires_in_sec: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompleteRequest {
    upload_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    upload_id: String,
    status: UploadStatus,
    progress: Progress,
    filename: String,
    mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote_file_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
}

/// Upper bound on request bodies. Every endpoint takes a small JSON
/// control message; asset bytes go straight to storage, never through
/// this server.
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Top-level request handler.
pub async fn handle_request<B>(
    state: Arc<AppState>,
    req: Request<B>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: Body + Send,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let route = parse_route(req.method(), req.uri().path());

    let response = match route {
        Some(Route::InitUpload) => init_upload(&state, req).await,
        Some(Route::CompleteUpload) => complete_upload(&state, req).await,
        Some(Route::UploadStatus(id)) => upload_status(&state, &id).await,
        Some(Route::Health) => health(),
        Some(Route::Metrics) => metrics(),
        None if path_is_known(req.uri().path()) => {
            error_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")
        }
        None => error_response(StatusCode::NOT_FOUND, "Not found"),
    };

    Ok(response)
}

async fn init_upload<B>(state: &Arc<AppState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body + Send,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body: InitRequest = match read_json(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let session = match state
        .registry
        .create(CreateUpload {
            attempt_id: body.attempt_id,
            filename: body.filename,
            mime_type: body.mime_type,
            size_bytes: body.size_bytes,
            session_id: body.session_id,
        })
        .await
    {
        Ok(s) => s,
        Err(e) => return session_error_response(e),
    };

    let signed = match state
        .objects
        .sign_put(&session.storage_key, &session.mime_type)
        .await
    {
        Ok(s) => s,
        Err(e) => {
            error!(upload_id = %session.upload_id, error = %e, "Could not sign upload URL");
            return error_response(StatusCode::BAD_GATEWAY, "Could not sign upload URL");
        }
    };

    json_response(
        StatusCode::OK,
        &InitResponse {
            upload_id: session.upload_id,
            storage_key: session.storage_key,
            put_url: signed.url,
            headers: signed.headers,
            expires_in_sec: signed.expires_in_sec,
        },
    )
}

async fn complete_upload<B>(state: &Arc<AppState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body + Send,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body: CompleteRequest = match read_json(req).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let session = match state.registry.get(&body.upload_id).await {
        Ok(s) => s,
        Err(e) => return session_error_response(e),
    };

    // Replayed completion: report where the session already is.
    if session.status != UploadStatus::Uploading {
        return json_response(
            StatusCode::OK,
            &serde_json::json!({ "status": session.status }),
        );
    }

    match state
        .objects
        .verify_stored(&session.storage_key, session.size_bytes)
        .await
    {
        Ok(_) => {}
        Err(e @ (StorageError::NotFound(_) | StorageError::SizeMismatch { .. })) => {
            warn!(upload_id = %session.upload_id, error = %e, "Completion verification failed");
            let reason = e.to_string();
            if let Err(persist) = state.registry.fail(&session.upload_id, &reason).await {
                error!(upload_id = %session.upload_id, error = %persist, "Could not record verification failure");
            }
            crate::metrics::record_session_outcome("FAILED");
            return error_response(StatusCode::BAD_REQUEST, &reason);
        }
        Err(e) => {
            error!(upload_id = %session.upload_id, error = %e, "Storage verification error");
            return error_response(StatusCode::BAD_GATEWAY, "Storage verification error");
        }
    }

    if let Err(e) = state
        .registry
        .advance(
            &session.upload_id,
            UploadStatus::Stored,
            Progress::at_stage_start(Stage::Stored, "Upload complete"),
        )
        .await
    {
        // Two completions can both pass the Uploading guard; the loser's
        // advance fails. Report where the session landed, like any replay.
        if matches!(e, SessionError::InvalidTransition { .. }) {
            return match state.registry.get(&session.upload_id).await {
                Ok(s) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "status": s.status }),
                ),
                Err(e) => session_error_response(e),
            };
        }
        return session_error_response(e);
    }

    state.pipeline.spawn(session.upload_id.clone());

    json_response(
        StatusCode::OK,
        &serde_json::json!({ "status": UploadStatus::Stored }),
    )
}

async fn upload_status(state: &Arc<AppState>, upload_id: &str) -> Response<Full<Bytes>> {
    match state.registry.get(upload_id).await {
        Ok(s) => json_response(
            StatusCode::OK,
            &StatusResponse {
                upload_id: s.upload_id,
                status: s.status,
                progress: s.progress,
                filename: s.filename,
                mime_type: s.mime_type,
                remote_file_handle: s.remote_file_handle,
                last_error: s.last_error,
            },
        ),
        Err(e) => session_error_response(e),
    }
}

fn health() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(r#"{"status":"ok"}"#)))
        .unwrap()
}

fn metrics() -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .unwrap()
}

async fn read_json<T, B>(req: Request<B>) -> Result<T, Response<Full<Bytes>>>
where
    T: serde::de::DeserializeOwned,
    B: Body + Send,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let declared = req
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if declared.is_some_and(|len| len > MAX_BODY_BYTES as u64) {
        return Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "Request body too large",
        ));
    }

    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            return Err(error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large",
            ))
        }
        Err(e) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("Could not read request body: {e}"),
            ))
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, &format!("Invalid request body: {e}"))
    })
}

fn session_error_response(e: SessionError) -> Response<Full<Bytes>> {
    let status = match &e {
        SessionError::Validation(_) => StatusCode::BAD_REQUEST,
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::InvalidTransition { .. } => StatusCode::CONFLICT,
        SessionError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, &e.to_string())
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => {
            error!(error = %e, "Response serialization failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
