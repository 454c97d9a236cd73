//! ffprobe/ffmpeg transcoder
//!
//! Probes containers with `ffprobe -print_format json` and builds proxies
//! with `ffmpeg`, parsing its `-progress` key/value stream into fractional
//! callbacks.

use super::{CompressError, TranscodeOutput, Transcoder};
use crate::decision::VideoMetadata;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Frame rate assumed when the container declares none or a zero denominator.
const DEFAULT_FPS: f64 = 30.0;

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    #[serde(default)]
    format: Option<ProbeFormat>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

#[derive(Deserialize, Default)]
struct ProbeFormat {
    size: Option<String>,
    duration: Option<String>,
}

/// Parse a rational `num/den` frame rate. A zero or absent denominator falls
/// back to the bare numerator; an unparseable string yields `None`.
pub(crate) fn parse_frame_rate(raw: &str) -> Option<f64> {
    let mut parts = raw.splitn(2, '/');
    let num: f64 = parts.next()?.trim().parse().ok()?;
    match parts.next().and_then(|d| d.trim().parse::<f64>().ok()) {
        Some(den) if den > 0.0 => Some(num / den),
        _ if num > 0.0 => Some(num),
        _ => None,
    }
}

/// Transcoder shelling out to ffprobe/ffmpeg.
pub struct FfmpegTranscoder {
    work_dir: PathBuf,
}

impl FfmpegTranscoder {
    /// `work_dir` receives proxy outputs; it is created on demand.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    async fn run_ffprobe(&self, path: &Path) -> Result<ProbeOutput, CompressError> {
        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| CompressError::Probe(format!("Failed to run ffprobe: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CompressError::Probe(format!(
                "ffprobe exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| CompressError::Probe(format!("Malformed ffprobe output: {e}")))
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    #[tracing::instrument(name = "compress.probe", skip(self), err)]
    async fn probe(&self, path: &Path) -> Result<VideoMetadata, CompressError> {
        let probed = self.run_ffprobe(path).await?;

        let stream = probed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| CompressError::Probe("No video stream found in file".into()))?;

        let fps = stream
            .r_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.avg_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(DEFAULT_FPS);

        let size_bytes = probed
            .format
            .as_ref()
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);

        let metadata = VideoMetadata {
            size_bytes,
            width: stream.width.unwrap_or(0),
            height: stream.height.unwrap_or(0),
            fps,
        };

        info!(
            size_mb = format!("{:.2}", metadata.size_bytes as f64 / 1024.0 / 1024.0),
            width = metadata.width,
            height = metadata.height,
            fps = format!("{:.2}", metadata.fps),
            "Video metadata extracted"
        );

        Ok(metadata)
    }

    #[tracing::instrument(name = "compress.transcode", skip(self, progress), err)]
    async fn transcode(
        &self,
        input: &Path,
        target_height: u32,
        target_fps: u32,
        progress: mpsc::Sender<f64>,
    ) -> Result<TranscodeOutput, CompressError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        // Total duration lets -progress ticks become fractions.
        let duration_secs = self
            .run_ffprobe(input)
            .await
            .ok()
            .and_then(|p| p.format)
            .and_then(|f| f.duration)
            .and_then(|d| d.parse::<f64>().ok())
            .filter(|d| *d > 0.0);

        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("asset");
        let output_path = self
            .work_dir
            .join(format!("{stem}_{}_proxy.mp4", uuid::Uuid::new_v4().simple()));

        // Bound the shorter side; -2 keeps the other side even for libx264.
        let scale = format!(
            "scale='if(gt(iw,ih),-2,{h})':'if(gt(iw,ih),{h},-2)'",
            h = target_height
        );

        let mut child = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-vf", &scale])
            .args(["-r", &target_fps.to_string()])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-crf", "28"])
            .args(["-c:a", "aac", "-b:a", "96k"])
            .args(["-movflags", "+faststart"])
            .args(["-progress", "pipe:1", "-nostats"])
            .arg(&output_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CompressError::Transcode(format!("Failed to run ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CompressError::Transcode("ffmpeg stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CompressError::Transcode("ffmpeg stderr unavailable".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = BufReader::new(stderr).read_to_string(&mut buf).await;
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(raw) = line.strip_prefix("out_time_ms=") {
                if let (Some(duration), Ok(out_us)) = (duration_secs, raw.trim().parse::<f64>()) {
                    let fraction = (out_us / 1_000_000.0 / duration).clamp(0.0, 1.0);
                    // Ticks outrunning the consumer are dropped, not awaited.
                    let _ = progress.try_send(fraction);
                    debug!(fraction, "Transcode progress");
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| CompressError::Transcode(format!("ffmpeg wait failed: {e}")))?;
        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let tail: String = stderr_text
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(CompressError::Transcode(format!(
                "ffmpeg exited with {status}: {tail}"
            )));
        }

        let output_size = tokio::fs::metadata(&output_path).await?.len();
        let _ = progress.try_send(1.0);

        info!(
            output = %output_path.display(),
            size_mb = format!("{:.1}", output_size as f64 / 1024.0 / 1024.0),
            "Transcode complete"
        );

        Ok(TranscodeOutput {
            output_path,
            output_size,
        })
    }
}
