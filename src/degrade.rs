//! Graceful degradation: accept chunks without embedding under pressure
//!
//! While the monitor reports pressure (or the dispatcher queue is past its
//! high-water mark), incoming chunks are returned immediately tagged
//! `degraded` and parked in a bounded deferred set. When pressure lifts,
//! a drain task feeds the deferred chunks back into the dispatcher in FIFO
//! order at a capped rate. Their results land in the shared cache, so the
//! caller's next submission of the same content turns into cache hits.
//!
//! Degradation is a first-class success: callers get every chunk back,
//! just without a vector yet.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::chunk::Chunk;
use crate::dispatch::{DispatcherMsg, EmbedTask, SubmitRequest};
use crate::monitor::MonitorState;

/// FIFO set of chunks accepted without embedding, keyed by `chunk_id`.
///
/// Re-submission of a chunk_id already in the set collapses to one entry
/// carrying the latest content, at the original queue position. Beyond
/// `cap` entries, new chunks are dropped (counted, warned).
pub struct DeferredSet {
    cap: usize,
    order: VecDeque<String>,
    entries: HashMap<String, Chunk>,
    dropped: u64,
    last_drop_warn: Option<Instant>,
}

impl DeferredSet {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            order: VecDeque::new(),
            entries: HashMap::new(),
            dropped: 0,
            last_drop_warn: None,
        }
    }

    /// Park a chunk. Returns false if it was dropped on overflow.
    pub fn push(&mut self, chunk: Chunk) -> bool {
        if let Some(slot) = self.entries.get_mut(&chunk.chunk_id) {
            // Same id re-submitted while deferred: keep one entry with the
            // latest content, original FIFO position.
            *slot = chunk;
            return true;
        }
        if self.entries.len() >= self.cap {
            self.dropped += 1;
            let warn_due = self
                .last_drop_warn
                .map(|t| t.elapsed() > Duration::from_secs(30))
                .unwrap_or(true);
            if warn_due {
                self.last_drop_warn = Some(Instant::now());
                tracing::warn!(
                    cap = self.cap,
                    dropped = self.dropped,
                    "Deferred set full, dropping chunks"
                );
            }
            return false;
        }
        self.order.push_back(chunk.chunk_id.clone());
        self.entries.insert(chunk.chunk_id.clone(), chunk);
        true
    }

    /// Take up to `n` chunks in FIFO order.
    pub fn take(&mut self, n: usize) -> Vec<Chunk> {
        let mut taken = Vec::new();
        while taken.len() < n {
            let Some(chunk_id) = self.order.pop_front() else {
                break;
            };
            if let Some(chunk) = self.entries.remove(&chunk_id) {
                taken.push(chunk);
            }
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Shared handle to the deferred set.
pub type SharedDeferred = Arc<Mutex<DeferredSet>>;

pub fn shared_deferred(cap: usize) -> SharedDeferred {
    Arc::new(Mutex::new(DeferredSet::new(cap)))
}

/// Pause between drain steps, bounding the re-submission rate.
const DRAIN_STEP_PAUSE: Duration = Duration::from_millis(50);

/// Re-check cadence for chunks deferred without a monitor edge (queue
/// high-water degradation).
const IDLE_RECHECK: Duration = Duration::from_millis(500);

/// Watch for `Paused → Ok` edges and feed deferred chunks back into the
/// dispatcher, `rate` chunks per step. The replies are discarded: the
/// embeddings land in the shared cache, which is what makes the chunks
/// embeddable-as-hits on resubmission.
pub fn spawn_drain(
    mut monitor_rx: watch::Receiver<MonitorState>,
    deferred: SharedDeferred,
    dispatch_tx: mpsc::Sender<DispatcherMsg>,
    rate: usize,
) {
    tokio::spawn(async move {
        loop {
            // Wait until we are in (or arrive at) the Ok state.
            while *monitor_rx.borrow_and_update() != MonitorState::Ok {
                if monitor_rx.changed().await.is_err() {
                    return;
                }
            }

            // Drain while Ok holds and chunks remain.
            loop {
                if *monitor_rx.borrow() != MonitorState::Ok {
                    break;
                }
                let batch = {
                    let mut set = deferred
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    set.take(rate)
                };
                if batch.is_empty() {
                    break;
                }
                let count = batch.len();
                let tasks: Vec<EmbedTask> = batch
                    .into_iter()
                    .map(|chunk| {
                        let (reply, _discarded) = tokio::sync::oneshot::channel();
                        EmbedTask {
                            text: chunk.content,
                            reply,
                            enqueued_at: Instant::now(),
                            attempt_count: 0,
                        }
                    })
                    .collect();
                tracing::info!(count, "Re-submitting deferred chunks");
                if dispatch_tx
                    .send(DispatcherMsg::Submit(SubmitRequest {
                        tasks,
                        flush: true,
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(DRAIN_STEP_PAUSE).await;
            }

            // Nothing left (or paused again). Chunks can also arrive while
            // the monitor stays Ok (queue high-water degradation), so wake
            // on a timer as well as on the next edge.
            tokio::select! {
                changed = monitor_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(IDLE_RECHECK) => {}
            }
        }
    });
}
