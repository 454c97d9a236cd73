//! Activation polling
//!
//! After finalize the backend processes the asset asynchronously. The poller
//! checks its state on a fixed interval under a hard attempt ceiling; a
//! transient status-call error counts as "still processing", not a failure.

use super::{RemoteFileClient, RemoteFileState};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Activation errors
#[derive(Error, Debug)]
pub enum ActivationError {
    #[error("Remote file processing failed")]
    RemoteFailed,

    #[error("Timed out waiting for remote file to become active after {attempts} attempts")]
    Timeout { attempts: u32 },
}

/// Polling cadence. Defaults: every 5 seconds, 60 attempts (5-minute ceiling).
#[derive(Debug, Clone)]
pub struct PollConfig {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_attempts: 60,
        }
    }
}

/// Poll until the remote file is active, returning its URI.
///
/// `on_tick` fires once per inconclusive attempt so the caller can surface a
/// "nearly there" signal.
#[tracing::instrument(name = "transfer.poll", skip(client, config, on_tick), err)]
pub async fn poll_for_active(
    client: &RemoteFileClient,
    name: &str,
    config: &PollConfig,
    mut on_tick: impl FnMut() + Send,
) -> Result<String, ActivationError> {
    for attempt in 1..=config.max_attempts {
        match client.get_file_status(name).await {
            Ok(RemoteFileState::Active { uri }) => {
                info!(name, attempt, "Remote file active");
                return Ok(uri);
            }
            Ok(RemoteFileState::Failed) => return Err(ActivationError::RemoteFailed),
            Ok(RemoteFileState::Processing) => {
                debug!(name, attempt, "Remote file still processing");
            }
            // The status call itself hiccuped; keep polling.
            Err(e) => {
                debug!(name, attempt, error = %e, "Status check failed, will retry");
            }
        }

        on_tick();
        if attempt < config.max_attempts {
            tokio::time::sleep(config.interval).await;
        }
    }

    Err(ActivationError::Timeout {
        attempts: config.max_attempts,
    })
}
