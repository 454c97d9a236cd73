//! Metrics module
//!
//! Prometheus counters for the ingestion pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec,
};

lazy_static! {
    // Session outcomes
    pub static ref SESSIONS_TOTAL: CounterVec = register_counter_vec!(
        "focalpoint_sessions_total",
        "Upload sessions reaching a terminal state",
        &["status"]
    ).unwrap();

    // Compression
    pub static ref COMPRESSION_DECISIONS: CounterVec = register_counter_vec!(
        "focalpoint_compression_decisions_total",
        "Compression decisions by verdict",
        &["verdict"]  // "compress" or "skip"
    ).unwrap();

    // Remote transfer
    pub static ref REMOTE_BYTES_TOTAL: Counter = register_counter!(
        "focalpoint_remote_bytes_total",
        "Bytes shipped to the inference backend"
    ).unwrap();

    // Stage timings
    pub static ref STAGE_DURATION: HistogramVec = register_histogram_vec!(
        "focalpoint_stage_duration_seconds",
        "Pipeline stage duration in seconds",
        &["stage"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]
    ).unwrap();
}

/// Record a session reaching a terminal state
pub fn record_session_outcome(status: &str) {
    SESSIONS_TOTAL.with_label_values(&[status]).inc();
}

/// Record a compression verdict
pub fn record_compression_decision(should_compress: bool) {
    let verdict = if should_compress { "compress" } else { "skip" };
    COMPRESSION_DECISIONS.with_label_values(&[verdict]).inc();
}

/// Record bytes shipped to the remote backend
pub fn record_remote_bytes(bytes: u64) {
    REMOTE_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record how long a pipeline stage took
pub fn record_stage_duration(stage: &str, duration_secs: f64) {
    STAGE_DURATION
        .with_label_values(&[stage])
        .observe(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_session_outcome() {
        record_session_outcome("ACTIVE");
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_compression_decision() {
        record_compression_decision(true);
        record_compression_decision(false);
        // Just verify it doesn't panic
    }

    #[test]
    fn test_record_stage_duration() {
        record_stage_duration("transferring", 12.5);
        // Just verify it doesn't panic
    }
}
