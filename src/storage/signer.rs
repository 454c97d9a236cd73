//! Signed URL issuance
//!
//! The storage sidecar issues time-boxed URLs scoping a single object and a
//! single HTTP method. Signing is pure capability issuance; nothing here
//! mutates state.

use super::StorageError;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A signed URL plus the headers the client must echo.
///
/// `Content-Type` is pinned for PUT so a different payload type cannot be
/// smuggled under a pre-agreed one.
#[derive(Debug, Clone)]
pub struct SignedUrl {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub expires_in_sec: u64,
}

#[derive(Serialize)]
struct SignRequest<'a> {
    bucket_name: &'a str,
    object_name: &'a str,
    method: &'a str,
    expires_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
}

#[derive(Deserialize)]
struct SignResponse {
    signed_url: String,
}

/// Client for the signing sidecar.
pub struct UrlSigner {
    endpoint: String,
    client: reqwest::Client,
}

impl UrlSigner {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Issue a signed URL for `method` on one object, valid for `ttl_sec`.
    #[tracing::instrument(
        name = "storage.sign",
        skip(self),
        fields(object = %object_name, method = %method),
        err
    )]
    pub async fn sign(
        &self,
        bucket_name: &str,
        object_name: &str,
        method: &str,
        ttl_sec: u64,
        content_type: Option<&str>,
    ) -> Result<SignedUrl, StorageError> {
        let expires_at = (Utc::now() + Duration::seconds(ttl_sec as i64)).to_rfc3339();
        let request = SignRequest {
            bucket_name,
            object_name,
            method,
            expires_at,
            content_type,
        };

        let response = self
            .client
            .post(format!("{}/object-storage/signed-object-url", self.endpoint))
            .json(&request)
            .send()
            .await
            .map_err(|e| StorageError::Authorization(format!("Signing backend unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(StorageError::Authorization(format!(
                "Failed to sign object URL, errorcode: {}",
                response.status()
            )));
        }

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| StorageError::Authorization(format!("Malformed signing response: {e}")))?;

        let mut headers = HashMap::new();
        if let Some(ct) = content_type {
            headers.insert("Content-Type".to_string(), ct.to_string());
        }

        Ok(SignedUrl {
            url: body.signed_url,
            headers,
            expires_in_sec: ttl_sec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_sign_returns_url_and_pinned_content_type() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/object-storage/signed-object-url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "signed_url": "https://storage.example/signed?sig=abc"
            })))
            .mount(&mock_server)
            .await;

        let signer = UrlSigner::new(mock_server.uri());
        let signed = signer
            .sign("bucket", "uploads/u1/clip.mp4", "PUT", 900, Some("video/mp4"))
            .await
            .unwrap();

        assert_eq!(signed.url, "https://storage.example/signed?sig=abc");
        assert_eq!(signed.expires_in_sec, 900);
        assert_eq!(signed.headers.get("Content-Type").unwrap(), "video/mp4");
    }

    #[tokio::test]
    async fn test_sign_failure_is_authorization_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/object-storage/signed-object-url"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let signer = UrlSigner::new(mock_server.uri());
        let err = signer
            .sign("bucket", "uploads/u1/clip.mp4", "GET", 900, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Authorization(_)));
    }
}
