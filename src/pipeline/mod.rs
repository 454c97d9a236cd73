//! Background ingestion pipeline
//!
//! After completion is verified, each upload's remaining work runs as one
//! independent background task: fetch the raw asset, decide on compression,
//! transcode if warranted, upload the proxy back to storage, ship it to the
//! inference backend, and poll until active. Sessions never share in-process
//! state; the persisted record is the only synchronization point.
//!
//! Every error is caught at the task boundary, recorded into the session's
//! `last_error`, and the session moved to `FAILED`; nothing propagates to an
//! HTTP caller. Temp files are removed on every exit path.

use crate::compress::{CompressError, Transcoder};
use crate::decision::{decide, Thresholds};
use crate::metrics;
use crate::session::{
    Progress, SessionError, SessionRegistry, Stage, UploadStatus,
};
use crate::storage::{derive_proxy_key, sanitize_filename, ObjectStore, StorageError};
use crate::transfer::{
    poll_for_active, ActivationError, ChunkedUploader, PollConfig, RemoteFileClient, TransferError,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Errors crossing the pipeline's outer boundary. Only their messages
/// survive, persisted into the session record.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Compress(#[from] CompressError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Activation(#[from] ActivationError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Fatal(String),
}

/// Knobs the orchestrator needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub thresholds: Thresholds,
    pub target_height: u32,
    pub target_fps: u32,
    pub chunk_size: usize,
    pub poll: PollConfig,
    /// Scratch directory for downloaded originals and proxies.
    pub work_dir: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            target_height: 720,
            target_fps: 10,
            chunk_size: crate::transfer::DEFAULT_CHUNK_SIZE,
            poll: PollConfig::default(),
            work_dir: std::env::temp_dir().join("focalpoint-downloads"),
        }
    }
}

/// Deletes its path on drop, whatever the exit path was.
struct TempGuard {
    path: PathBuf,
}

impl TempGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Drop for TempGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to clean up temp file"
                );
            }
        }
    }
}

/// Ingestion pipeline orchestrator.
pub struct Pipeline {
    registry: Arc<SessionRegistry>,
    objects: Arc<ObjectStore>,
    remote: Arc<RemoteFileClient>,
    transcoder: Arc<dyn Transcoder>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        objects: Arc<ObjectStore>,
        remote: Arc<RemoteFileClient>,
        transcoder: Arc<dyn Transcoder>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            registry,
            objects,
            remote,
            transcoder,
            settings,
        }
    }

    /// Launch the post-completion pipeline for one session, fire-and-forget.
    pub fn spawn(self: &Arc<Self>, upload_id: String) -> tokio::task::JoinHandle<()> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.run(&upload_id).await })
    }

    /// Run the pipeline to a terminal state, absorbing every error into the
    /// session record.
    #[tracing::instrument(name = "pipeline.run", skip(self))]
    pub async fn run(&self, upload_id: &str) {
        match self.execute(upload_id).await {
            Ok(()) => {
                metrics::record_session_outcome("ACTIVE");
            }
            Err(e) => {
                error!(upload_id, error = %e, "Pipeline failed");
                metrics::record_session_outcome("FAILED");
                if let Err(persist) = self.registry.fail(upload_id, &e.to_string()).await {
                    error!(upload_id, error = %persist, "Could not record pipeline failure");
                }
            }
        }
    }

    async fn execute(&self, upload_id: &str) -> Result<(), PipelineError> {
        let session = self.registry.get(upload_id).await?;

        if !self.remote.has_api_key() {
            return Err(PipelineError::Fatal(
                "Remote backend API key not configured".into(),
            ));
        }

        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        let input_path = self
            .settings
            .work_dir
            .join(format!("{upload_id}_{}", sanitize_filename(&session.filename)));
        let _input_guard = TempGuard::new(input_path.clone());

        // Fetch the original while the session is still STORED; the fetch
        // is prep work for the decision, not a state of its own.
        self.registry
            .report_progress(
                upload_id,
                Progress::at_stage_start(Stage::Fetching, "Fetching original for analysis"),
            )
            .await?;

        let fetch_started = Instant::now();
        let downloaded = self.objects.download(&session.storage_key, &input_path).await?;
        metrics::record_stage_duration("fetch", fetch_started.elapsed().as_secs_f64());

        let mut metadata = self.transcoder.probe(&input_path).await?;
        if metadata.size_bytes == 0 {
            metadata.size_bytes = downloaded;
        }

        let decision = decide(&metadata, &self.settings.thresholds);
        metrics::record_compression_decision(decision.should_compress);

        let (source_path, source_size, source_mime, _proxy_guard);
        if decision.should_compress {
            info!(upload_id, reasons = ?decision.reasons, "Compressing for analysis");

            self.registry
                .advance(
                    upload_id,
                    UploadStatus::Compressing,
                    Progress::with_message(
                        Stage::Compressing,
                        Stage::Compressing.span().0,
                        "Creating analysis proxy (720p, 10fps)",
                    ),
                )
                .await?;

            let (tx, pump) = self.progress_pump(upload_id, Stage::Compressing, "Compressing");
            let compress_started = Instant::now();
            let output = self
                .transcoder
                .transcode(
                    &input_path,
                    self.settings.target_height,
                    self.settings.target_fps,
                    tx,
                )
                .await?;
            let _ = pump.await;
            metrics::record_stage_duration("compress", compress_started.elapsed().as_secs_f64());
            _proxy_guard = Some(TempGuard::new(output.output_path.clone()));

            info!(
                upload_id,
                proxy_mb = format!("{:.1}", output.output_size as f64 / 1024.0 / 1024.0),
                ratio = format!("{:.1}", output.ratio(downloaded)),
                "Compression complete"
            );

            let proxy_key = derive_proxy_key(&session.storage_key);
            self.registry
                .record_proxy(upload_id, &proxy_key, output.output_size)
                .await?;
            self.registry
                .advance(
                    upload_id,
                    UploadStatus::Compressed,
                    Progress::with_message(
                        Stage::Compressed,
                        Stage::Compressed.span().0,
                        "Proxy created, uploading to storage",
                    ),
                )
                .await?;

            self.objects
                .upload_file(&proxy_key, &output.output_path, "video/mp4")
                .await?;

            source_size = output.output_size;
            source_mime = "video/mp4".to_string();
            source_path = output.output_path;
        } else {
            info!(upload_id, "Asset within thresholds, shipping original as proxy");
            source_path = input_path.clone();
            source_size = downloaded;
            source_mime = session.mime_type.clone();
            _proxy_guard = None;
        }

        self.registry
            .advance(
                upload_id,
                UploadStatus::Transferring,
                Progress::with_message(
                    Stage::Transferring,
                    Stage::Transferring.span().0,
                    "Sending to analysis backend",
                ),
            )
            .await?;

        let upload_uri = self
            .remote
            .start_upload(
                source_size,
                &source_mime,
                &format!("{} (analysis proxy)", session.filename),
            )
            .await?;

        let (tx, pump) = self.progress_pump(upload_id, Stage::Transferring, "Sending to analysis backend");
        let transfer_started = Instant::now();
        let remote_file = ChunkedUploader::new(&self.remote, self.settings.chunk_size)
            .send(&upload_uri, &source_path, source_size, tx)
            .await?;
        let _ = pump.await;
        metrics::record_stage_duration("transfer", transfer_started.elapsed().as_secs_f64());
        metrics::record_remote_bytes(source_size);

        info!(upload_id, remote = %remote_file.name, "Transfer complete, awaiting activation");

        let (tick_tx, tick_pump) =
            self.progress_pump(upload_id, Stage::Processing, "Processing on analysis backend");
        let uri = poll_for_active(&self.remote, &remote_file.name, &self.settings.poll, || {
            let _ = tick_tx.try_send(1.0);
        })
        .await;
        drop(tick_tx);
        let _ = tick_pump.await;
        let uri = uri?;

        self.registry.activate(upload_id, &uri).await?;
        info!(upload_id, uri, "Upload active");

        Ok(())
    }

    /// Consumes stage-local fractions and writes remapped overall percents
    /// into the session record.
    fn progress_pump(
        &self,
        upload_id: &str,
        stage: Stage,
        label: &'static str,
    ) -> (mpsc::Sender<f64>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<f64>(16);
        let registry = Arc::clone(&self.registry);
        let upload_id = upload_id.to_string();

        let handle = tokio::spawn(async move {
            while let Some(fraction) = rx.recv().await {
                let pct = stage.scale(fraction);
                let stage_local = (fraction.clamp(0.0, 1.0) * 100.0).floor() as u8;
                let progress =
                    Progress::with_message(stage, pct, format!("{label}: {stage_local}%"));
                if let Err(e) = registry.report_progress(&upload_id, progress).await {
                    warn!(upload_id, error = %e, "Dropping progress update");
                }
            }
        });

        (tx, handle)
    }
}
