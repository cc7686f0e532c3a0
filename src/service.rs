//! Embedding service: the facade the indexing and query paths call
//!
//! `embed(chunks)` returns one entry per input chunk, in input order,
//! every time: a vector, a `degraded` tag (accepted without embedding
//! under pressure), or a terminal error. `lookup` probes the shared cache
//! without ever touching the queue. `stats` aggregates monitor, pool,
//! queue, cache and deferred-set state.
//!
//! Construction wires the whole plane together: monitor → pool/degrade,
//! dispatcher ↔ pool, cache shared with every worker via the mapped file.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};

use crate::cache::{CacheStats, EmbeddingCache};
use crate::chunk::{Chunk, ContentHash, EmbeddedChunk, Embedding};
use crate::config::Settings;
use crate::degrade::{self, SharedDeferred};
use crate::dispatch::{self, DispatcherMsg, EmbedTask, QueueStats, SubmitRequest};
use crate::monitor::{MonitorHandle, MonitorState, ResourceMonitor, ResourceSample};
use crate::pool::{self, PoolHandle, PoolSnapshot};
use crate::EmbedError;

/// Per-call options for `embed`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedOptions {
    /// Dispatch immediately without waiting to fill a batch
    pub flush: bool,
}

/// Aggregate health surface, serializable for the CLI and callers.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStats {
    pub queue: QueueStats,
    pub workers: PoolSnapshot,
    pub cache: Option<CacheStats>,
    pub cache_available: bool,
    pub monitor_state: MonitorState,
    pub monitor_sample: ResourceSample,
    pub degraded: bool,
    pub deferred_len: usize,
    pub deferred_dropped: u64,
}

/// The adaptive embedding compute plane, fully assembled.
pub struct EmbeddingService {
    settings: Settings,
    cache: Option<Arc<EmbeddingCache>>,
    dispatch_tx: mpsc::Sender<DispatcherMsg>,
    queue_stats_rx: watch::Receiver<QueueStats>,
    monitor: MonitorHandle,
    pool: PoolHandle,
    deferred: SharedDeferred,
    shutting_down: AtomicBool,
}

impl EmbeddingService {
    /// Start the plane with the real resource monitor.
    pub fn start(settings: Settings) -> Arc<Self> {
        let monitor = ResourceMonitor::start(&settings);
        Self::start_with_monitor(settings, monitor)
    }

    /// Start with an injected monitor handle (tests, bench).
    pub fn start_with_monitor(settings: Settings, monitor: MonitorHandle) -> Arc<Self> {
        let cache = match EmbeddingCache::open(
            &settings.cache_file_path,
            settings.cache_capacity,
            settings.embedding_dim,
        ) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(e) => {
                // The plane still functions: every probe misses, workers
                // embed everything, stats report the cache as unavailable.
                tracing::warn!(error = %e, "Embedding cache unavailable, continuing without it");
                None
            }
        };

        // The pool inbox is created up front so the dispatcher can hold its
        // sender before the scheduler loop exists.
        let (pool_tx, pool_rx) = mpsc::channel(256);
        let (dispatch_tx, queue_stats_rx) = dispatch::spawn_dispatcher(&settings, pool_tx.clone());

        let pool = pool::spawn_pool(
            &settings,
            monitor.subscribe(),
            queue_stats_rx.clone(),
            dispatch_tx.clone(),
            pool_tx,
            pool_rx,
        );

        let deferred = degrade::shared_deferred(settings.deferred_cap);
        degrade::spawn_drain(
            monitor.subscribe(),
            Arc::clone(&deferred),
            dispatch_tx.clone(),
            settings.drain_chunk_rate,
        );

        Arc::new(Self {
            settings,
            cache,
            dispatch_tx,
            queue_stats_rx,
            monitor,
            pool,
            deferred,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Embed a list of chunks. The returned list always has exactly one
    /// entry per input, in input order.
    pub async fn embed(&self, chunks: Vec<Chunk>, opts: EmbedOptions) -> Vec<EmbeddedChunk> {
        tracing::debug!(count = chunks.len(), "embed");

        if self.shutting_down.load(Ordering::Acquire) {
            return chunks
                .into_iter()
                .map(|chunk| EmbeddedChunk::failed(chunk, EmbedError::ShuttingDown))
                .collect();
        }

        // Pressure (or a flooded queue): accept without embedding.
        if self.should_degrade() {
            return self.degrade_all(chunks);
        }

        let dim = self.settings.embedding_dim as usize;
        let mut slots: Vec<Option<EmbeddedChunk>> = Vec::with_capacity(chunks.len());
        let mut pending: Vec<(usize, Chunk, oneshot::Receiver<Result<Vec<f32>, EmbedError>>)> =
            Vec::new();
        let mut tasks = Vec::new();

        for (position, chunk) in chunks.into_iter().enumerate() {
            let hash = chunk.resolve_hash();
            if let Some(cache) = &self.cache {
                if let Some(vector) = cache.get(hash.as_bytes()) {
                    slots.push(Some(EmbeddedChunk::embedded(chunk, Embedding::new(vector))));
                    continue;
                }
            }
            let (reply, reply_rx) = oneshot::channel();
            tasks.push(EmbedTask {
                text: chunk.content.clone(),
                reply,
                enqueued_at: Instant::now(),
                attempt_count: 0,
            });
            slots.push(None);
            pending.push((position, chunk, reply_rx));
        }

        if !tasks.is_empty() {
            let submit = SubmitRequest {
                tasks,
                flush: opts.flush,
            };
            if self
                .dispatch_tx
                .send(DispatcherMsg::Submit(submit))
                .await
                .is_err()
            {
                // Dispatcher loop gone; terminal for these chunks.
                for (position, chunk, _reply) in pending {
                    slots[position] = Some(EmbeddedChunk::failed(chunk, EmbedError::ShuttingDown));
                }
                return slots
                    .into_iter()
                    .map(|slot| slot.expect("every slot settled"))
                    .collect();
            }

            for (position, chunk, reply_rx) in pending {
                let settled = match reply_rx.await {
                    Ok(Ok(vector)) => {
                        if vector.len() == dim {
                            EmbeddedChunk::embedded(chunk, Embedding::new(vector))
                        } else {
                            EmbeddedChunk::failed(
                                chunk,
                                EmbedError::EmbedFailed {
                                    reason: format!(
                                        "vector dimension {} != {}",
                                        vector.len(),
                                        dim
                                    ),
                                },
                            )
                        }
                    }
                    Ok(Err(error)) => EmbeddedChunk::failed(chunk, error),
                    Err(_) => EmbeddedChunk::failed(
                        chunk,
                        EmbedError::EmbedFailed {
                            reason: "reply channel closed".into(),
                        },
                    ),
                };
                slots[position] = Some(settled);
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.expect("every slot settled"))
            .collect()
    }

    /// Cache-only probe; never touches the queue.
    pub fn lookup(&self, hashes: &[String]) -> HashMap<String, Option<Vec<f32>>> {
        let mut results = HashMap::with_capacity(hashes.len());
        for hex in hashes {
            let vector = ContentHash::from_hex(hex)
                .ok()
                .and_then(|hash| {
                    self.cache
                        .as_ref()
                        .and_then(|cache| cache.get(hash.as_bytes()))
                });
            results.insert(hex.clone(), vector);
        }
        results
    }

    /// Aggregate health snapshot.
    pub async fn stats(&self) -> ServiceStats {
        let workers = self.pool.snapshot().await;
        let queue = self.queue_stats_rx.borrow().clone();
        let (deferred_len, deferred_dropped) = {
            let set = self
                .deferred
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (set.len(), set.dropped())
        };
        ServiceStats {
            degraded: self.should_degrade(),
            queue,
            workers,
            cache: self.cache.as_ref().map(|cache| cache.stats()),
            cache_available: self.cache.is_some(),
            monitor_state: self.monitor.state(),
            monitor_sample: self.monitor.current(),
            deferred_len,
            deferred_dropped,
        }
    }

    /// Embed one synthetic chunk to pull the pool and model warm.
    pub async fn warm(&self) {
        let chunk = Chunk::new("warmup", "warmup");
        let _ = self
            .embed(vec![chunk], EmbedOptions { flush: true })
            .await;
    }

    /// Graceful shutdown: reject new work, stop the dispatcher queue, and
    /// drain every worker (bounded by the grace deadline, then escalated).
    /// Re-entrant: later calls wait on the same pool drain.
    pub async fn drain(&self, reason: &str) {
        let first = !self.shutting_down.swap(true, Ordering::AcqRel);
        if first {
            tracing::info!(reason, "Draining embedding service");
            let _ = self.dispatch_tx.send(DispatcherMsg::Shutdown).await;
        }
        self.pool.drain(reason).await;
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn should_degrade(&self) -> bool {
        self.monitor.state() == MonitorState::Paused || self.queue_stats_rx.borrow().high_water
    }

    fn degrade_all(&self, chunks: Vec<Chunk>) -> Vec<EmbeddedChunk> {
        let mut set = self
            .deferred
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        chunks
            .into_iter()
            .map(|chunk| {
                set.push(chunk.clone());
                EmbeddedChunk::degraded(chunk)
            })
            .collect()
    }
}
