//! Compression worker
//!
//! Builds bounded-resolution, bounded-framerate analysis proxies for videos
//! the decision engine rules too heavy. The external transcoder sits behind
//! the [`Transcoder`] trait so the pipeline can be exercised without ffmpeg
//! on the box.

use crate::decision::VideoMetadata;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod ffmpeg;

pub use ffmpeg::FfmpegTranscoder;

/// Compression errors. Both variants are terminal for a session: a file that
/// cannot be probed or transcoded will not get better on retry.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Transcode failed: {0}")]
    Transcode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a transcode run.
#[derive(Debug, Clone)]
pub struct TranscodeOutput {
    pub output_path: PathBuf,
    pub output_size: u64,
}

impl TranscodeOutput {
    /// Achieved compression ratio (original size over proxy size).
    pub fn ratio(&self, original_size: u64) -> f64 {
        if self.output_size == 0 {
            return 0.0;
        }
        original_size as f64 / self.output_size as f64
    }
}

/// External transcoder contract.
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Probe the container for the first video stream's dimensions, size
    /// and frame rate.
    async fn probe(&self, path: &Path) -> Result<VideoMetadata, CompressError>;

    /// Produce a proxy with the shorter side bounded by `target_height` and
    /// the frame rate bounded by `target_fps`, streaming fractional progress
    /// (0.0-1.0) into `progress`.
    async fn transcode(
        &self,
        input: &Path,
        target_height: u32,
        target_fps: u32,
        progress: mpsc::Sender<f64>,
    ) -> Result<TranscodeOutput, CompressError>;
}
