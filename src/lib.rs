//! # catalog-sync
//!
//! Staged ingestion pipeline for syncing remote content catalogs into a
//! versioned local store.
//!
//! A producer describes what the remote catalog contains as a stream of
//! declarative content units; a chain of concurrent stages connected by
//! bounded channels then looks up what is already stored, downloads and
//! validates the rest, persists everything idempotently and updates a
//! repository version's membership to match. Backpressure flows end to end
//! through the channel capacities, so memory stays bounded no matter how
//! large the catalog is.
//!
//! ## Design Philosophy
//!
//! - **Declarative input** - producers state what should exist, stages work
//!   out what to do
//! - **Idempotent by construction** - re-running a sync never duplicates
//!   units, links or provenance records
//! - **Library-first** - no CLI or daemon, purely a Rust crate for embedding
//! - **Store-agnostic** - everything persistent goes through the
//!   [`storage::Storage`] trait
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use catalog_sync::{
//!     Artifact, ContentFeed, ContentUnit, DeclarativeArtifact, DeclarativeContent,
//!     DigestSet, HttpDownloader, InMemoryStorage, Remote, RemoteId, RetryConfig,
//!     SyncPipeline, VersionId,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Arc::new(InMemoryStorage::new());
//!     let downloader = Arc::new(HttpDownloader::new("/tmp/artifacts", RetryConfig::default()));
//!     let remote = Arc::new(Remote { id: RemoteId(1), name: "upstream".into() });
//!
//!     let unit = ContentUnit::new(
//!         "file",
//!         [("relative_path".to_string(), "a.txt".to_string())],
//!         ["relative_path".to_string()],
//!     );
//!     let artifact = DeclarativeArtifact::new(
//!         Artifact::declared(DigestSet::sha256("9834876dcfb05cb167a5c24953eba58c4ac89b1adf57f28f2f9d09af107ee8f0"), Some(3)),
//!         "https://example.com/a.txt",
//!         "a.txt",
//!         remote,
//!     )?;
//!     let feed = ContentFeed::new(vec![DeclarativeContent::new(unit, vec![artifact])]);
//!
//!     SyncPipeline::new(storage, downloader, VersionId(1))
//!         .run(Box::new(feed))
//!         .await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Artifact fetching and validation
pub mod downloader;
/// Error types
pub mod error;
/// The declarative data model flowing through the pipeline
pub mod model;
/// Pipeline core: channels, stages, runner
pub mod pipeline;
/// Fire-and-forget progress reporting
pub mod progress;
/// Retry logic with exponential backoff
pub mod retry;
/// The built-in pipeline stages
pub mod stages;
/// Persistent store contract and the in-memory backend
pub mod storage;
/// Canonical sync pipeline assembly
pub mod sync;

// Re-export commonly used types
pub use config::{RetryConfig, SyncConfig};
pub use downloader::{DownloadedFile, Downloader, HttpDownloader};
pub use error::{DownloadError, Error, Result, StorageError};
pub use model::{
    Artifact, ArtifactId, ContentArtifactLink, ContentFuture, ContentId, ContentKey, ContentUnit,
    DeclarativeArtifact, DeclarativeContent, DigestSet, Remote, RemoteArtifactRecord, RemoteId,
    VersionId,
};
pub use pipeline::{
    ChannelFactory, DefaultChannelFactory, DrainStage, Item, Pipeline, ProfilingChannelFactory,
    Stage, StageIo,
};
pub use progress::{CountingSink, ProgressReporter, ProgressSink};
pub use storage::{DuplicatePredicate, InMemoryStorage, Storage, StorageTransaction};
pub use sync::{ContentFeed, SyncMode, SyncPipeline};
