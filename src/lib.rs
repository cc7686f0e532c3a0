//! # cinder - Adaptive Embedding Compute Plane
//!
//! Schedules chunk-embedding work across a pool of isolated model worker
//! processes under host resource limits, with a zero-copy shared embedding
//! cache mapped into every process.
//!
//! ## Architecture
//!
//! - **Resource monitor**: samples host memory/CPU, classifies `Ok`/`Paused`
//!   with hysteresis, publishes coalesced transitions.
//! - **Shared cache**: a memory-mapped file of fixed, lock-bearing slots
//!   keyed by blake3 content hash; parent and workers map the same file.
//! - **Workers**: separate OS processes (`cinder worker`) speaking framed
//!   messages over stdio, one model instance and one batch at a time.
//! - **Dispatcher**: packs tasks into fixed-size batches, assigns each to
//!   one ready worker, stitches results back in submit order, retries
//!   aborted and failed batches.
//! - **Pool scheduler**: starts and stops workers from monitor state,
//!   queue depth and idleness, with strict lifecycle safety rules.
//! - **Degradation**: under pressure chunks are accepted without vectors
//!   and re-embedded automatically when pressure lifts.
//!
//! ## Quick start
//!
//! ```no_run
//! use cinder::{Chunk, Config, EmbedOptions, EmbeddingService};
//!
//! # async fn demo() {
//! let settings = Config::load(std::path::Path::new(".")).resolve();
//! let service = EmbeddingService::start(settings);
//!
//! let chunks = vec![Chunk::new("chunk-1", "fn main() {}")];
//! let results = service.embed(chunks, EmbedOptions::default()).await;
//! for result in &results {
//!     match (&result.embedding, result.degraded) {
//!         (Some(embedding), _) => println!("{} dims", embedding.len()),
//!         (None, true) => println!("accepted, embedding deferred"),
//!         (None, false) => println!("failed: {:?}", result.error),
//!     }
//! }
//! # }
//! ```

pub mod cache;
pub mod chunk;
pub mod config;
pub mod degrade;
pub mod dispatch;
pub mod monitor;
pub mod pool;
pub mod service;
pub mod worker;

pub use cache::{CacheError, CacheStats, EmbeddingCache};
pub use chunk::{Chunk, ContentHash, EmbeddedChunk, Embedding};
pub use config::{Config, Settings};
pub use monitor::{MonitorHandle, MonitorState, ResourceMonitor, ResourceSample};
pub use pool::{PoolSnapshot, WorkerRecord, WorkerState};
pub use service::{EmbedOptions, EmbeddingService, ServiceStats};

/// Terminal per-chunk outcomes surfaced through [`EmbeddedChunk::error`].
///
/// Transient faults (aborts, single worker failures) are retried inside the
/// plane and never reach the caller unless the attempt budget runs out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize)]
pub enum EmbedError {
    /// The shared cache could not be opened; the plane runs without it.
    /// Surfaced through `stats()`, never per chunk.
    #[error("embedding cache unavailable")]
    CacheUnavailable,
    /// The chunk's batch kept getting aborted until its attempts ran out
    #[error("embedding aborted")]
    EmbedAborted,
    /// The chunk's batch failed after exhausting its attempts
    #[error("embedding failed: {reason}")]
    EmbedFailed { reason: String },
    /// The worker holding the chunk's batch died, repeatedly
    #[error("worker died")]
    WorkerDied,
    /// The chunk sat in the queue past its deadline; not re-enqueued
    #[error("embedding timed out")]
    EmbedTimeout,
    /// The plane is draining; all new work is rejected
    #[error("shutting down")]
    ShuttingDown,
}
