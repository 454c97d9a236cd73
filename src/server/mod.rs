//! HTTP server module
//!
//! Binds the listener, assembles the component graph from configuration,
//! and serves the upload API until interrupted.

use crate::api::{handle_request, AppState};
use crate::compress::FfmpegTranscoder;
use crate::config::Config;
use crate::decision::Thresholds;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::session::{MemoryStore, SessionRegistry};
use crate::storage::{ObjectStore, UrlSigner};
use crate::transfer::{PollConfig, RemoteFileClient};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// HTTP Server
pub struct Server {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl Server {
    /// Assemble the component graph from configuration.
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("{}", e)))?;

        let signer = UrlSigner::new(&config.storage.sidecar_endpoint);
        let objects = Arc::new(ObjectStore::new(
            signer,
            &config.storage.bucket,
            &config.storage.private_dir,
            config.limits.presign_ttl_sec,
        ));

        let registry = Arc::new(SessionRegistry::new(
            Arc::new(MemoryStore::new()),
            config.limits.max_size_bytes,
        ));

        let remote = Arc::new(
            RemoteFileClient::new(&config.remote.base_url, &config.remote.api_key)
                .with_chunk_retries(config.remote.chunk_retries, Duration::from_millis(500)),
        );

        let work_dir = std::env::temp_dir().join("focalpoint-downloads");
        let transcoder = Arc::new(FfmpegTranscoder::new(work_dir.clone()));

        let pipeline = Arc::new(Pipeline::new(
            Arc::clone(&registry),
            Arc::clone(&objects),
            Arc::clone(&remote),
            transcoder,
            PipelineSettings {
                thresholds: Thresholds {
                    max_file_size_mb: config.compression.max_file_size_mb,
                    max_height: config.compression.max_height,
                    max_fps: config.compression.max_fps,
                },
                target_height: config.compression.target_height,
                target_fps: config.compression.target_fps,
                chunk_size: config.remote.chunk_size,
                poll: PollConfig {
                    interval: Duration::from_secs(config.polling.interval_secs),
                    max_attempts: config.polling.max_attempts,
                },
                work_dir,
            },
        ));

        Ok(Self {
            addr,
            state: Arc::new(AppState {
                registry,
                objects,
                pipeline,
            }),
        })
    }

    /// Run the server until interrupted.
    pub async fn run(&self) -> Result<(), ServerError> {
        // Any session that was mid-pipeline when the last process died has
        // lost its background task; its client must re-upload.
        match self.state.registry.fail_orphans().await {
            Ok(0) => {}
            Ok(n) => warn!(count = n, "Failed orphaned sessions from previous run"),
            Err(e) => warn!(error = %e, "Orphan sweep failed"),
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;

        info!("Starting server on {}", self.addr);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down server");
                    return Ok(());
                }
                result = listener.accept() => {
                    let (stream, _) = match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let io = TokioIo::new(stream);
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let service =
                            service_fn(move |req| handle_request(Arc::clone(&state), req));
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            warn!(error = %e, "Connection error");
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        CompressionConfig, LimitsConfig, PollingConfig, RemoteConfig, ServerConfig, StorageConfig,
    };

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1:0".into(),
            },
            storage: StorageConfig {
                sidecar_endpoint: "http://127.0.0.1:1106".into(),
                bucket: "focalpoint-assets".into(),
                private_dir: ".private".into(),
            },
            remote: RemoteConfig::default(),
            limits: LimitsConfig::default(),
            compression: CompressionConfig::default(),
            polling: PollingConfig::default(),
        }
    }

    #[test]
    fn test_server_new() {
        let server = Server::new(test_config());
        assert!(server.is_ok());
    }

    #[test]
    fn test_server_invalid_address() {
        let mut config = test_config();
        config.server.address = "invalid".into();
        let server = Server::new(config);
        assert!(server.is_err());
    }
}
