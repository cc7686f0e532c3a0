//! Process pool scheduler: worker lifecycle, scaling policy, drain
//!
//! The scheduler loop is the sole writer of worker state. Workers move
//! `starting → ready → busy ↔ ready → draining → dead`; the dispatcher
//! flips `ready ↔ busy` only through `MarkBusy`/`MarkReady` messages into
//! this loop.
//!
//! Scaling reacts to monitor state, dispatcher queue depth and per-worker
//! idleness on a periodic tick. Both directions use the same two-tick
//! projection over the observed arrival and service rates: a decision
//! fires only if it would still hold two ticks from now.
//!
//! Safety rules enforced here:
//! 1. a `busy` worker is never terminated;
//! 2. at most one worker is in `starting` at a time;
//! 3. termination is committed only after the dispatcher confirms the
//!    worker's lease was still unused (and the record is re-checked);
//! 4. pressure (`Paused`) stops new starts but never stops idle workers.

mod child;

use std::collections::HashMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::chunk::epoch_secs;
use crate::config::Settings;
use crate::dispatch::{DispatcherMsg, QueueStats, WorkerLease};
use crate::monitor::MonitorState;
use crate::worker::protocol::Request;

/// Errors from worker process management.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("worker child missing {0} pipe")]
    MissingPipe(&'static str),
}

/// Worker lifecycle states. Only the scheduler loop writes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Ready,
    Busy,
    Draining,
    Dead,
}

/// Serializable snapshot of one worker for `stats()`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerRecord {
    pub worker_id: u64,
    pub os_pid: Option<u32>,
    pub state: WorkerState,
    pub spawned_at: u64,
    pub last_busy_at: Option<u64>,
    pub current_batch_id: Option<u64>,
    pub batches_served: u64,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolSnapshot {
    pub workers: Vec<WorkerRecord>,
    pub ready: usize,
    pub busy: usize,
    pub total: usize,
}

/// Inbound messages for the scheduler loop.
pub enum PoolMsg {
    /// A worker answered `INIT_OK`
    WorkerUp { worker_id: u64 },
    /// Any worker traffic; refreshes the health clock
    Heartbeat { worker_id: u64 },
    /// Dispatcher assigned a batch to this worker
    MarkBusy { worker_id: u64, batch_id: u64 },
    /// Dispatcher finished handling this worker's batch result
    MarkReady { worker_id: u64 },
    /// Worker announced a graceful exit
    WorkerExiting { worker_id: u64 },
    /// Worker stdout closed (death or exit)
    ChannelClosed { worker_id: u64 },
    /// Dispatcher has waiting work and no ready worker
    Poke,
    /// Raise the pool floor to at least this many workers (capped at the
    /// configured maximum)
    Ensure { target: usize },
    /// Outcome of a scale-down lease reclaim
    ReclaimResult { worker_id: u64, reclaimed: bool },
    /// Graceful shutdown of the whole pool
    Drain {
        reason: String,
        done: oneshot::Sender<()>,
    },
    /// Read-only state for `stats()`
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
}

/// Handle to the scheduler loop.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::Sender<PoolMsg>,
}

impl PoolHandle {
    pub fn sender(&self) -> mpsc::Sender<PoolMsg> {
        self.tx.clone()
    }

    /// Ask the scheduler to keep at least `target` workers alive (subject
    /// to the configured maximum and the start-safety rules; workers come
    /// up one at a time).
    pub async fn ensure(&self, target: usize) {
        let _ = self.tx.send(PoolMsg::Ensure { target }).await;
    }

    /// Gracefully stop every worker; resolves once all are gone (the loop
    /// escalates to OS termination after the grace deadline). Re-entrant:
    /// concurrent calls all resolve when the pool is empty.
    pub async fn drain(&self, reason: &str) {
        let (done, done_rx) = oneshot::channel();
        if self
            .tx
            .send(PoolMsg::Drain {
                reason: reason.to_string(),
                done,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = done_rx.await;
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let (reply, reply_rx) = oneshot::channel();
        if self.tx.send(PoolMsg::Snapshot { reply }).await.is_err() {
            return PoolSnapshot::default();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Spawn the scheduler loop. The inbox is passed in because the dispatcher
/// holds its sender before this loop exists.
pub fn spawn_pool(
    settings: &Settings,
    monitor_rx: watch::Receiver<MonitorState>,
    queue_stats_rx: watch::Receiver<QueueStats>,
    dispatch_tx: mpsc::Sender<DispatcherMsg>,
    tx: mpsc::Sender<PoolMsg>,
    rx: mpsc::Receiver<PoolMsg>,
) -> PoolHandle {
    let pool = Pool::new(settings, monitor_rx, queue_stats_rx, dispatch_tx, tx.clone());
    tokio::spawn(pool.run(rx));
    PoolHandle { tx }
}

struct WorkerEntry {
    child: child::ChildProcess,
    state: WorkerState,
    spawned_at: Instant,
    spawned_epoch: u64,
    last_busy_at: Instant,
    last_busy_epoch: Option<u64>,
    current_batch_id: Option<u64>,
    health_last_ok_at: Instant,
    batches_served: u64,
    drain_deadline: Option<Instant>,
    /// In-starting timestamp for the warmup guard
    starting_since: Option<Instant>,
}

struct Pool {
    settings: Settings,
    monitor_rx: watch::Receiver<MonitorState>,
    queue_stats_rx: watch::Receiver<QueueStats>,
    dispatch_tx: mpsc::Sender<DispatcherMsg>,
    self_tx: mpsc::Sender<PoolMsg>,

    workers: HashMap<u64, WorkerEntry>,
    next_worker_id: u64,
    draining_all: bool,
    drain_waiters: Vec<oneshot::Sender<()>>,
    /// A reclaim sent to the dispatcher that has not resolved yet
    pending_reclaim: Option<u64>,
    /// Last tick's queue totals, for rate computation
    prev_enqueued: u64,
    prev_completed: u64,
    arrival_per_tick: f64,
    service_per_tick: f64,
}

impl Pool {
    fn new(
        settings: &Settings,
        monitor_rx: watch::Receiver<MonitorState>,
        queue_stats_rx: watch::Receiver<QueueStats>,
        dispatch_tx: mpsc::Sender<DispatcherMsg>,
        self_tx: mpsc::Sender<PoolMsg>,
    ) -> Self {
        Self {
            settings: settings.clone(),
            monitor_rx,
            queue_stats_rx,
            dispatch_tx,
            self_tx,
            workers: HashMap::new(),
            next_worker_id: 1,
            draining_all: false,
            drain_waiters: Vec::new(),
            pending_reclaim: None,
            prev_enqueued: 0,
            prev_completed: 0,
            arrival_per_tick: 0.0,
            service_per_tick: 0.0,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<PoolMsg>) {
        let mut ticker = tokio::time::interval(self.settings.scheduler_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut monitor_rx = self.monitor_rx.clone();

        // Bring the pool to its lower bound immediately.
        self.control();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { return };
                    self.handle(msg).await;
                }
                _ = ticker.tick() => {
                    self.update_rates();
                    self.reap_and_escalate().await;
                    self.control();
                }
                changed = monitor_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let state = *monitor_rx.borrow_and_update();
                    match state {
                        MonitorState::Paused => {
                            tracing::info!("Pool: pressure pause, no new worker starts");
                        }
                        MonitorState::Ok => {
                            tracing::info!("Pool: pressure lifted, resuming policy");
                            self.control();
                        }
                    }
                }
            }

            if self.draining_all && self.workers.is_empty() {
                for waiter in self.drain_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
    }

    async fn handle(&mut self, msg: PoolMsg) {
        match msg {
            PoolMsg::WorkerUp { worker_id } => {
                let announce = if let Some(entry) = self.workers.get_mut(&worker_id) {
                    entry.health_last_ok_at = Instant::now();
                    if entry.state == WorkerState::Starting {
                        entry.state = WorkerState::Ready;
                        entry.starting_since = None;
                        tracing::info!(worker_id, "Worker ready");
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };
                if announce {
                    self.announce_lease(worker_id).await;
                    // A fresh worker may unblock the next start.
                    self.control();
                }
            }
            PoolMsg::Heartbeat { worker_id } => {
                if let Some(entry) = self.workers.get_mut(&worker_id) {
                    entry.health_last_ok_at = Instant::now();
                }
            }
            PoolMsg::MarkBusy {
                worker_id,
                batch_id,
            } => {
                if let Some(entry) = self.workers.get_mut(&worker_id) {
                    if entry.state == WorkerState::Draining {
                        // Lost race with a reclaim; the worker will finish
                        // this batch before honoring the shutdown.
                        tracing::warn!(worker_id, batch_id, "Batch assigned to draining worker");
                    } else {
                        entry.state = WorkerState::Busy;
                    }
                    entry.current_batch_id = Some(batch_id);
                    entry.last_busy_at = Instant::now();
                    entry.last_busy_epoch = Some(epoch_secs());
                    entry.health_last_ok_at = Instant::now();
                }
            }
            PoolMsg::MarkReady { worker_id } => {
                let announce = if let Some(entry) = self.workers.get_mut(&worker_id) {
                    entry.health_last_ok_at = Instant::now();
                    if entry.state == WorkerState::Busy {
                        entry.state = WorkerState::Ready;
                        entry.current_batch_id = None;
                        entry.batches_served += 1;
                        true
                    } else {
                        // Draining workers and stale notices stay put.
                        entry.current_batch_id = None;
                        false
                    }
                } else {
                    false
                };
                if announce && !self.draining_all {
                    self.announce_lease(worker_id).await;
                }
            }
            PoolMsg::WorkerExiting { worker_id } => {
                if let Some(entry) = self.workers.get_mut(&worker_id) {
                    if entry.state != WorkerState::Draining {
                        tracing::warn!(worker_id, "Worker exiting unprompted");
                    }
                    entry.state = WorkerState::Draining;
                    entry
                        .drain_deadline
                        .get_or_insert(Instant::now() + self.settings.drain_grace);
                }
            }
            PoolMsg::ChannelClosed { worker_id } => {
                self.on_worker_gone(worker_id).await;
            }
            PoolMsg::Poke => {
                self.control();
            }
            PoolMsg::Ensure { target } => {
                let floor = target.min(self.settings.worker_max);
                if floor > self.settings.worker_min {
                    tracing::info!(floor, "Raising pool floor");
                    self.settings.worker_min = floor;
                }
                self.control();
            }
            PoolMsg::ReclaimResult {
                worker_id,
                reclaimed,
            } => {
                if self.pending_reclaim == Some(worker_id) {
                    self.pending_reclaim = None;
                }
                if reclaimed {
                    self.commit_scale_down(worker_id);
                } else {
                    tracing::debug!(worker_id, "Scale-down aborted, lease already in use");
                }
            }
            PoolMsg::Drain { reason, done } => {
                self.begin_drain(&reason, done);
            }
            PoolMsg::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    /// Hand a ready worker's lease to the dispatcher.
    async fn announce_lease(&self, worker_id: u64) {
        let Some(entry) = self.workers.get(&worker_id) else {
            return;
        };
        let lease = WorkerLease {
            worker_id,
            stdin_tx: entry.child.stdin_tx.clone(),
            idle_since: entry.last_busy_at,
        };
        if self
            .dispatch_tx
            .send(DispatcherMsg::WorkerReady(lease))
            .await
            .is_err()
        {
            tracing::debug!(worker_id, "Dispatcher gone, lease dropped");
        }
    }

    /// A worker's channel closed: reap it, tell the dispatcher about any
    /// in-flight batch, and let the policy consider a replacement.
    async fn on_worker_gone(&mut self, worker_id: u64) {
        let Some(mut entry) = self.workers.remove(&worker_id) else {
            return;
        };
        let code = entry.child.try_reap();
        let was_draining = entry.state == WorkerState::Draining;
        let batch_id = entry.current_batch_id;

        if was_draining && batch_id.is_none() {
            tracing::info!(worker_id, ?code, "Worker exited");
        } else {
            tracing::warn!(worker_id, ?code, ?batch_id, "Worker died");
        }

        let _ = self
            .dispatch_tx
            .send(DispatcherMsg::WorkerDied {
                worker_id,
                batch_id,
            })
            .await;

        if !self.draining_all {
            self.control();
        }
    }

    /// Periodic reaping: heartbeat death for busy workers, escalation for
    /// draining workers past their grace deadline.
    async fn reap_and_escalate(&mut self) {
        let now = Instant::now();
        let heartbeat_deadline = self.settings.heartbeat_deadline();

        let mut gone = Vec::new();
        for (&worker_id, entry) in &mut self.workers {
            match entry.state {
                // A busy worker gone silent is hung; a starting worker
                // that never answered INIT is wedged. Both are replaced.
                WorkerState::Busy | WorkerState::Starting => {
                    if now.duration_since(entry.health_last_ok_at) > heartbeat_deadline {
                        tracing::warn!(worker_id, state = ?entry.state, "Heartbeat lost, terminating worker");
                        entry.child.kill();
                        gone.push(worker_id);
                    } else if entry.child.try_reap().is_some() {
                        gone.push(worker_id);
                    }
                }
                WorkerState::Draining => {
                    if entry.drain_deadline.is_some_and(|d| now >= d) {
                        tracing::warn!(worker_id, "Drain grace elapsed, escalating to kill");
                        entry.child.kill();
                        entry.drain_deadline = Some(now + self.settings.drain_grace);
                    }
                }
                _ => {
                    if entry.child.try_reap().is_some() {
                        gone.push(worker_id);
                    }
                }
            }
        }
        for worker_id in gone {
            self.on_worker_gone(worker_id).await;
        }
    }

    fn update_rates(&mut self) {
        let stats = self.queue_stats_rx.borrow().clone();
        self.arrival_per_tick = stats.enqueued_total.saturating_sub(self.prev_enqueued) as f64;
        self.service_per_tick = stats.completed_total.saturating_sub(self.prev_completed) as f64;
        self.prev_enqueued = stats.enqueued_total;
        self.prev_completed = stats.completed_total;
    }

    /// One pass of the scaling policy.
    fn control(&mut self) {
        if self.draining_all {
            return;
        }
        let monitor_ok = *self.monitor_rx.borrow() == MonitorState::Ok;
        let queue = self.queue_stats_rx.borrow().clone();

        let ctx = ScaleContext {
            monitor_ok,
            queue_depth: queue.depth,
            arrival_per_tick: self.arrival_per_tick,
            service_per_tick: self.service_per_tick,
            batch_size: self.settings.batch_size,
            workers_alive: self.alive_count(),
            worker_min: self.settings.worker_min,
            worker_max: self.settings.worker_max,
            starting_blocked: self.starting_blocked(),
        };

        if needs_min_fill(&ctx) || should_scale_up(&ctx) {
            // One start per decision, and only with headroom.
            if ctx.workers_alive < ctx.worker_max {
                self.start_worker();
            }
            return;
        }

        if self.pending_reclaim.is_none() {
            let candidates = self.scale_down_candidates();
            if let Some(worker_id) = pick_scale_down(
                &ctx,
                &candidates,
                self.settings.worker_idle,
                self.settings.worker_min_life,
            ) {
                self.request_reclaim(worker_id);
            }
        }
    }

    fn alive_count(&self) -> usize {
        self.workers
            .values()
            .filter(|entry| {
                matches!(
                    entry.state,
                    WorkerState::Starting | WorkerState::Ready | WorkerState::Busy
                )
            })
            .count()
    }

    /// Safety rule 2 plus the warmup guard: a start is blocked while any
    /// worker is still inside its starting window.
    fn starting_blocked(&self) -> bool {
        self.workers.values().any(|entry| {
            entry.state == WorkerState::Starting
                && entry
                    .starting_since
                    .is_some_and(|t| t.elapsed() < self.settings.worker_warmup)
        })
    }

    fn scale_down_candidates(&self) -> Vec<ScaleDownCandidate> {
        self.workers
            .iter()
            .filter(|(_, entry)| entry.state == WorkerState::Ready)
            .map(|(&worker_id, entry)| ScaleDownCandidate {
                worker_id,
                idle_for: entry.last_busy_at.elapsed(),
                alive_for: entry.spawned_at.elapsed(),
            })
            .collect()
    }

    fn start_worker(&mut self) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let backend = self.settings.backend.clone();
        match child::spawn_worker(
            &self.settings,
            worker_id,
            &backend,
            self.self_tx.clone(),
            self.dispatch_tx.clone(),
        ) {
            Ok(child) => {
                let now = Instant::now();
                self.workers.insert(
                    worker_id,
                    WorkerEntry {
                        child,
                        state: WorkerState::Starting,
                        spawned_at: now,
                        spawned_epoch: epoch_secs(),
                        last_busy_at: now,
                        last_busy_epoch: None,
                        current_batch_id: None,
                        health_last_ok_at: now,
                        batches_served: 0,
                        drain_deadline: None,
                        starting_since: Some(now),
                    },
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Worker spawn failed, will retry next tick");
            }
        }
    }

    /// Begin scale-down: ask the dispatcher for the lease back. The actual
    /// termination waits for the confirmation in `ReclaimResult`.
    fn request_reclaim(&mut self, worker_id: u64) {
        self.pending_reclaim = Some(worker_id);
        let (reply, reply_rx) = oneshot::channel();
        if self
            .dispatch_tx
            .try_send(DispatcherMsg::ReclaimWorker { worker_id, reply })
            .is_err()
        {
            self.pending_reclaim = None;
            return;
        }
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let reclaimed = reply_rx.await.unwrap_or(false);
            let _ = self_tx
                .send(PoolMsg::ReclaimResult {
                    worker_id,
                    reclaimed,
                })
                .await;
        });
    }

    /// Reclaim confirmed: re-check the record, then send SHUTDOWN.
    fn commit_scale_down(&mut self, worker_id: u64) {
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return;
        };
        // Re-check between decision and send: the worker must still be idle.
        if entry.state != WorkerState::Ready {
            tracing::debug!(worker_id, state = ?entry.state, "Scale-down aborted on re-check");
            return;
        }
        tracing::info!(worker_id, "Scaling down idle worker");
        entry.state = WorkerState::Draining;
        entry.drain_deadline = Some(Instant::now() + self.settings.drain_grace);
        entry.child.send(Request::Shutdown);
    }

    fn begin_drain(&mut self, reason: &str, done: oneshot::Sender<()>) {
        if self.workers.is_empty() {
            let _ = done.send(());
            self.draining_all = true;
            return;
        }
        self.drain_waiters.push(done);
        if self.draining_all {
            // Re-entrant drain: just wait with the others.
            return;
        }
        self.draining_all = true;
        tracing::info!(reason, workers = self.workers.len(), "Draining worker pool");

        let deadline = Instant::now() + self.settings.drain_grace;
        for (&worker_id, entry) in &mut self.workers {
            entry.state = WorkerState::Draining;
            entry.drain_deadline = Some(deadline);
            if !entry.child.send(Request::Shutdown) {
                tracing::debug!(worker_id, "Shutdown frame not deliverable");
            }
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        let workers: Vec<WorkerRecord> = self
            .workers
            .iter()
            .map(|(&worker_id, entry)| WorkerRecord {
                worker_id,
                os_pid: entry.child.pid,
                state: entry.state,
                spawned_at: entry.spawned_epoch,
                last_busy_at: entry.last_busy_epoch,
                current_batch_id: entry.current_batch_id,
                batches_served: entry.batches_served,
            })
            .collect();
        let ready = workers
            .iter()
            .filter(|w| w.state == WorkerState::Ready)
            .count();
        let busy = workers
            .iter()
            .filter(|w| w.state == WorkerState::Busy)
            .count();
        PoolSnapshot {
            ready,
            busy,
            total: workers.len(),
            workers,
        }
    }
}

// ===== scaling policy (pure) =====

/// Inputs for one scaling decision.
#[derive(Debug, Clone)]
pub(crate) struct ScaleContext {
    pub monitor_ok: bool,
    pub queue_depth: usize,
    pub arrival_per_tick: f64,
    pub service_per_tick: f64,
    pub batch_size: usize,
    pub workers_alive: usize,
    pub worker_min: usize,
    pub worker_max: usize,
    pub starting_blocked: bool,
}

/// An idle worker eligible for consideration.
#[derive(Debug, Clone)]
pub(crate) struct ScaleDownCandidate {
    pub worker_id: u64,
    pub idle_for: Duration,
    pub alive_for: Duration,
}

/// Queue depth projected two ticks ahead under the observed rates.
fn projected_depth(ctx: &ScaleContext) -> f64 {
    (ctx.queue_depth as f64 + 2.0 * (ctx.arrival_per_tick - ctx.service_per_tick)).max(0.0)
}

/// The pool is below its lower bound and allowed to start.
fn needs_min_fill(ctx: &ScaleContext) -> bool {
    ctx.monitor_ok && !ctx.starting_blocked && ctx.workers_alive < ctx.worker_min
}

/// Scale-up: monitor ok, a full backlog per worker both now and projected
/// two ticks out, headroom below the cap, and no worker mid-start.
pub(crate) fn should_scale_up(ctx: &ScaleContext) -> bool {
    if !ctx.monitor_ok || ctx.starting_blocked || ctx.workers_alive >= ctx.worker_max {
        return false;
    }
    let backlog = (ctx.batch_size * ctx.workers_alive.max(1)) as f64;
    ctx.queue_depth as f64 >= backlog && projected_depth(ctx) >= backlog
}

/// Scale-down: monitor ok, empty queue that stays empty under projection,
/// pool above its floor, and an idle worker that has been idle at least
/// `idle_threshold` and alive at least `life_threshold`. Picks the
/// least-recently-used idle worker.
pub(crate) fn pick_scale_down(
    ctx: &ScaleContext,
    candidates: &[ScaleDownCandidate],
    idle_threshold: Duration,
    life_threshold: Duration,
) -> Option<u64> {
    if !ctx.monitor_ok
        || ctx.queue_depth != 0
        || projected_depth(ctx) > 0.0
        || ctx.workers_alive <= ctx.worker_min
    {
        return None;
    }
    candidates
        .iter()
        .filter(|c| c.idle_for >= idle_threshold && c.alive_for >= life_threshold)
        .max_by_key(|c| c.idle_for)
        .map(|c| c.worker_id)
}
