//! Threshold decision engine
//!
//! Pure function mapping probed media metadata to a compress/no-compress
//! verdict. A video is judged by its shorter dimension so portrait and
//! landscape footage are treated alike; comparisons are strict greater-than,
//! so values exactly at a threshold pass untouched.

use serde::{Deserialize, Serialize};

const MIB: f64 = 1024.0 * 1024.0;

/// Probed media metadata relevant to the verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoMetadata {
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
}

/// Compression thresholds. Defaults: 60 MB, 720p shorter side, 10 fps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_file_size_mb: f64,
    pub max_height: u32,
    pub max_fps: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_file_size_mb: 60.0,
            max_height: 720,
            max_fps: 10.0,
        }
    }
}

/// The verdict plus one human-readable reason per exceeded metric.
#[derive(Debug, Clone)]
pub struct Decision {
    pub should_compress: bool,
    pub reasons: Vec<String>,
}

/// Decide whether a video needs an analysis proxy.
///
/// Every exceeded threshold contributes its own reason; all are reported,
/// not just the first.
pub fn decide(metadata: &VideoMetadata, thresholds: &Thresholds) -> Decision {
    let mut reasons = Vec::new();

    let file_size_mb = metadata.size_bytes as f64 / MIB;
    let effective_height = metadata.width.min(metadata.height);

    if file_size_mb > thresholds.max_file_size_mb {
        reasons.push(format!(
            "File size {:.1}MB exceeds {}MB threshold",
            file_size_mb, thresholds.max_file_size_mb
        ));
    }

    if effective_height > thresholds.max_height {
        reasons.push(format!(
            "Resolution {}x{} exceeds {}p threshold",
            metadata.width, metadata.height, thresholds.max_height
        ));
    }

    if metadata.fps > thresholds.max_fps {
        reasons.push(format!(
            "Frame rate {}fps exceeds {}fps threshold",
            metadata.fps, thresholds.max_fps
        ));
    }

    Decision {
        should_compress: !reasons.is_empty(),
        reasons,
    }
}
