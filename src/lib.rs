//! Focalpoint Ingest Library
//!
//! Video asset ingestion and remote-transfer pipeline.
//!
//! # Features
//!
//! - **Direct-to-storage uploads**: clients upload via short-lived signed URLs
//! - **Completion verification**: stored objects are checked against the declared size
//! - **Analysis proxies**: oversized videos are transcoded to a bounded 720p/10fps proxy
//! - **Resumable remote transfer**: proxies ship to the inference backend in 16 MiB chunks
//! - **Bounded activation polling**: waits for the backend to report the asset usable
//! - **Persisted lifecycle**: every upload tracked through a forward-only state machine
//!
//! # Example
//!
//! ```no_run
//! use focalpoint_ingest::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = Server::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod compress;
pub mod config;
pub mod decision;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod storage;
pub mod transfer;

// Re-export commonly used types
pub use config::Config;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
