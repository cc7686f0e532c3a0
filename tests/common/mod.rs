//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::TestPlane;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use cinder::{Chunk, EmbeddingService, MonitorHandle, MonitorState, Settings};

/// Embedding dimension for the test plane (small, fast frames).
pub const TEST_DIM: u32 = 16;

/// Path of the built `cinder` binary, used as the worker program.
pub fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_cinder"))
}

/// Settings tuned for tests: tiny dimension, hash backend, fast flushes,
/// cache file inside a scratch dir, workers spawned from the built binary.
pub fn test_settings(dir: &TempDir, workers: usize, batch_size: usize) -> Settings {
    Settings {
        cache_file_path: dir.path().join("emb.cache"),
        // Large relative to test key counts so slot collisions stay rare
        cache_capacity: 65_536,
        embedding_dim: TEST_DIM,
        batch_size,
        batch_flush: Duration::from_millis(25),
        worker_min: workers,
        worker_max: workers.max(1),
        backend: "hash".into(),
        worker_program: Some(worker_binary()),
        scheduler_tick: Duration::from_millis(200),
        drain_grace: Duration::from_secs(5),
        ..Settings::default()
    }
}

/// A running embedding plane with a controllable monitor and automatic
/// scratch-dir cleanup.
pub struct TestPlane {
    pub service: Arc<EmbeddingService>,
    pub monitor_tx: watch::Sender<MonitorState>,
    _dir: TempDir,
}

impl TestPlane {
    /// Start a plane with `workers` hash-backend workers and the given
    /// batch size, monitor pinned to `Ok`.
    pub fn start(workers: usize, batch_size: usize) -> Self {
        Self::start_in_state(workers, batch_size, MonitorState::Ok)
    }

    /// Start with the monitor pinned to a chosen initial state.
    pub fn start_in_state(workers: usize, batch_size: usize, state: MonitorState) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = test_settings(&dir, workers, batch_size);
        let (monitor, monitor_tx) = MonitorHandle::fixed(state);
        let service = EmbeddingService::start_with_monitor(settings, monitor);
        Self {
            service,
            monitor_tx,
            _dir: dir,
        }
    }

    /// Wait until at least `n` workers are ready (or panic after ~10s).
    pub async fn wait_ready(&self, n: usize) {
        for _ in 0..200 {
            let stats = self.service.stats().await;
            if stats.workers.ready >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("workers never became ready");
    }
}

/// Create a test chunk with deterministic content.
pub fn test_chunk(id: &str, content: &str) -> Chunk {
    Chunk::new(id, content)
}

/// `n` distinct chunks named `c0..cn`.
pub fn chunk_batch(n: usize) -> Vec<Chunk> {
    (0..n)
        .map(|i| test_chunk(&format!("c{}", i), &format!("fn f{}() {{ }}", i)))
        .collect()
}
