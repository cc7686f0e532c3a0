//! Batch dispatcher: queue, batch packing, worker assignment, stitching
//!
//! Owns the task queue and all batch state. Tasks arrive with a one-shot
//! reply slot each; the dispatcher packs them into fixed-size batches,
//! assigns each batch to exactly one ready worker (least-recently-used
//! first), and settles the replies from worker results. Aborted or failed
//! batches re-enqueue at the head of the queue until `max_attempts` is
//! exhausted.
//!
//! The dispatcher is the only writer of queue/batch state; the pool learns
//! about assignment through `MarkBusy`/`MarkReady` messages, and `MarkReady`
//! is sent strictly after a failed batch has been re-enqueued so the
//! scale-down path can never observe an idle worker ahead of its retry
//! work.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};

use crate::config::Settings;
use crate::pool::PoolMsg;
use crate::worker::protocol::{Request, Response, ERR_CODE_ABORTED};
use crate::EmbedError;

/// Inbound messages for the dispatcher loop.
pub enum DispatcherMsg {
    /// New work from the embedding facade
    Submit(SubmitRequest),
    /// The pool announces a worker able to take a batch
    WorkerReady(WorkerLease),
    /// The pool wants a ready worker back (scale-down); the reply is true
    /// iff the lease was still unused and the worker is safe to stop
    ReclaimWorker {
        worker_id: u64,
        reply: oneshot::Sender<bool>,
    },
    /// A batch result from a worker's reader task
    WorkerResult { worker_id: u64, response: Response },
    /// A worker died; its in-flight batch (if any) needs re-enqueueing
    WorkerDied {
        worker_id: u64,
        batch_id: Option<u64>,
    },
    /// Reject all queued and future work; in-flight batches still settle
    Shutdown,
}

/// One chunk awaiting embedding. The reply slot points back into the
/// caller's per-submit coordinator, which restores input order.
pub struct EmbedTask {
    pub text: String,
    pub reply: oneshot::Sender<Result<Vec<f32>, EmbedError>>,
    pub enqueued_at: Instant,
    pub attempt_count: u32,
}

/// A group of tasks from one `embed` call.
pub struct SubmitRequest {
    pub tasks: Vec<EmbedTask>,
    /// Dispatch immediately without waiting for a full batch
    pub flush: bool,
}

/// A ready worker on loan to the dispatcher. `idle_since` drives the
/// least-recently-used pick.
pub struct WorkerLease {
    pub worker_id: u64,
    pub stdin_tx: mpsc::Sender<Request>,
    pub idle_since: Instant,
}

/// Queue-side counters published through a watch channel; the pool reads
/// these to compute service/arrival rates for its scaling projection, and
/// the degradation controller reads `high_water`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub enqueued_total: u64,
    pub completed_total: u64,
    pub failed_total: u64,
    pub timed_out_total: u64,
    pub in_flight_batches: usize,
    pub high_water: bool,
}

/// Rolling window of batch service durations for the P95 estimate.
const DURATION_WINDOW: usize = 32;
/// Deadline floor before any batch has been observed.
const DEFAULT_BATCH_BUDGET: Duration = Duration::from_secs(30);

/// Spawn the dispatcher loop. Returns its inbox and the stats watch.
pub fn spawn_dispatcher(
    settings: &Settings,
    pool_tx: mpsc::Sender<PoolMsg>,
) -> (mpsc::Sender<DispatcherMsg>, watch::Receiver<QueueStats>) {
    let (tx, rx) = mpsc::channel(1024);
    let (stats_tx, stats_rx) = watch::channel(QueueStats::default());
    let dispatcher = Dispatcher::new(settings, pool_tx, stats_tx);
    tokio::spawn(dispatcher.run(rx));
    (tx, stats_rx)
}

struct InFlight {
    worker_id: u64,
    tasks: Vec<EmbedTask>,
    sent_at: Instant,
}

struct Dispatcher {
    batch_size: usize,
    batch_flush: Duration,
    max_attempts: u32,
    high_water_mark: usize,

    queue: VecDeque<EmbedTask>,
    ready: Vec<WorkerLease>,
    in_flight: HashMap<u64, InFlight>,
    next_batch_id: u64,
    durations: VecDeque<Duration>,
    shutting_down: bool,

    pool_tx: mpsc::Sender<PoolMsg>,
    stats_tx: watch::Sender<QueueStats>,
    enqueued_total: u64,
    completed_total: u64,
    failed_total: u64,
    timed_out_total: u64,
    last_poke: Option<Instant>,
}

impl Dispatcher {
    fn new(
        settings: &Settings,
        pool_tx: mpsc::Sender<PoolMsg>,
        stats_tx: watch::Sender<QueueStats>,
    ) -> Self {
        Self {
            batch_size: settings.batch_size,
            batch_flush: settings.batch_flush,
            max_attempts: settings.max_attempts,
            high_water_mark: settings.batch_size * settings.worker_max.max(1) * 4,
            queue: VecDeque::new(),
            ready: Vec::new(),
            in_flight: HashMap::new(),
            next_batch_id: 1,
            durations: VecDeque::with_capacity(DURATION_WINDOW),
            shutting_down: false,
            pool_tx,
            stats_tx,
            enqueued_total: 0,
            completed_total: 0,
            failed_total: 0,
            timed_out_total: 0,
            last_poke: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DispatcherMsg>) {
        loop {
            // Next wakeup for the flush deadline. Once the front task is
            // already overdue (e.g. no worker is free) this degrades to a
            // periodic retry rather than a hot loop.
            let flush_at = self.queue.front().map(|task| {
                let deadline = task.enqueued_at + self.batch_flush;
                let now = Instant::now();
                if deadline <= now {
                    now + self.batch_flush
                } else {
                    deadline
                }
            });

            let msg = if let Some(deadline) = flush_at {
                tokio::select! {
                    msg = rx.recv() => msg,
                    _ = tokio::time::sleep_until(deadline.into()) => {
                        self.sweep_timeouts();
                        self.try_dispatch(true).await;
                        self.publish_stats();
                        continue;
                    }
                }
            } else {
                rx.recv().await
            };

            let Some(msg) = msg else {
                // Facade dropped; nothing left to serve.
                return;
            };
            self.handle(msg).await;
            self.publish_stats();
        }
    }

    async fn handle(&mut self, msg: DispatcherMsg) {
        match msg {
            DispatcherMsg::Submit(submit) => self.on_submit(submit).await,
            DispatcherMsg::WorkerReady(lease) => {
                if self.shutting_down {
                    return;
                }
                tracing::debug!(worker_id = lease.worker_id, "Worker ready for batches");
                self.ready.push(lease);
                self.try_dispatch(false).await;
            }
            DispatcherMsg::ReclaimWorker { worker_id, reply } => {
                let before = self.ready.len();
                self.ready.retain(|lease| lease.worker_id != worker_id);
                let _ = reply.send(self.ready.len() < before);
            }
            DispatcherMsg::WorkerResult {
                worker_id,
                response,
            } => self.on_result(worker_id, response).await,
            DispatcherMsg::WorkerDied {
                worker_id,
                batch_id,
            } => self.on_worker_died(worker_id, batch_id).await,
            DispatcherMsg::Shutdown => {
                self.shutting_down = true;
                self.ready.clear();
                let drained: Vec<EmbedTask> = self.queue.drain(..).collect();
                for task in drained {
                    self.settle_err(task, EmbedError::ShuttingDown);
                }
                tracing::info!("Dispatcher rejecting new work (shutting down)");
            }
        }
    }

    async fn on_submit(&mut self, submit: SubmitRequest) {
        if self.shutting_down {
            for task in submit.tasks {
                self.settle_err(task, EmbedError::ShuttingDown);
            }
            return;
        }
        self.enqueued_total += submit.tasks.len() as u64;
        self.queue.extend(submit.tasks);
        self.sweep_timeouts();
        self.try_dispatch(submit.flush).await;
    }

    /// Cut batches while full ones are available; cut one partial batch
    /// when flushing. Every batch goes to the least-recently-used ready
    /// worker.
    async fn try_dispatch(&mut self, flush: bool) {
        loop {
            if self.queue.is_empty() {
                return;
            }
            let full = self.queue.len() >= self.batch_size;
            let overdue = self
                .queue
                .front()
                .map(|task| task.enqueued_at.elapsed() >= self.batch_flush)
                .unwrap_or(false);
            if !(full || flush || overdue) {
                return;
            }

            let Some(lease) = self.take_lru_worker() else {
                self.poke_pool();
                return;
            };

            let take = self.queue.len().min(self.batch_size);
            let tasks: Vec<EmbedTask> = self.queue.drain(..take).collect();
            let batch_id = self.next_batch_id;
            self.next_batch_id += 1;

            let texts: Vec<String> = tasks.iter().map(|task| task.text.clone()).collect();
            let count = texts.len();
            if lease
                .stdin_tx
                .try_send(Request::Embed { batch_id, texts })
                .is_err()
            {
                // Channel gone: the worker died between ready and now.
                // Put the tasks back in order and try the next worker.
                tracing::debug!(worker_id = lease.worker_id, "Lease stale, worker unreachable");
                for task in tasks.into_iter().rev() {
                    self.queue.push_front(task);
                }
                self.next_batch_id -= 1;
                continue;
            }

            tracing::debug!(batch_id, worker_id = lease.worker_id, count, "Dispatched batch");
            self.in_flight.insert(
                batch_id,
                InFlight {
                    worker_id: lease.worker_id,
                    tasks,
                    sent_at: Instant::now(),
                },
            );
            let _ = self.pool_tx.try_send(PoolMsg::MarkBusy {
                worker_id: lease.worker_id,
                batch_id,
            });
        }
    }

    fn take_lru_worker(&mut self) -> Option<WorkerLease> {
        if self.ready.is_empty() {
            return None;
        }
        let mut lru = 0;
        for (i, lease) in self.ready.iter().enumerate() {
            if lease.idle_since < self.ready[lru].idle_since {
                lru = i;
            }
        }
        Some(self.ready.swap_remove(lru))
    }

    /// Ask the pool to consider scaling when work is waiting and no worker
    /// is ready. Rate-limited to one poke per flush interval.
    fn poke_pool(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_poke {
            if now.duration_since(last) < self.batch_flush {
                return;
            }
        }
        self.last_poke = Some(now);
        let _ = self.pool_tx.try_send(PoolMsg::Poke);
    }

    async fn on_result(&mut self, worker_id: u64, response: Response) {
        match response {
            Response::EmbedOk { batch_id, vectors } => {
                let Some(in_flight) = self.in_flight.remove(&batch_id) else {
                    tracing::debug!(batch_id, "Result for unknown batch (already settled)");
                    self.release_worker(worker_id).await;
                    return;
                };
                self.record_duration(in_flight.sent_at.elapsed());

                if vectors.len() != in_flight.tasks.len() {
                    tracing::warn!(
                        batch_id,
                        got = vectors.len(),
                        expected = in_flight.tasks.len(),
                        "Vector count mismatch, failing batch"
                    );
                    self.retry_or_fail(
                        in_flight.tasks,
                        EmbedError::EmbedFailed {
                            reason: "vector count mismatch".into(),
                        },
                    );
                } else {
                    self.completed_total += vectors.len() as u64;
                    for (task, vector) in in_flight.tasks.into_iter().zip(vectors) {
                        // A closed receiver means the caller went away;
                        // the work still happened and the cache is warm.
                        let _ = task.reply.send(Ok(vector));
                    }
                }
                self.release_worker(worker_id).await;
            }
            Response::EmbedErr {
                batch_id,
                code,
                message,
            } => {
                let Some(in_flight) = self.in_flight.remove(&batch_id) else {
                    if batch_id != 0 {
                        tracing::debug!(batch_id, "Error for unknown batch");
                    }
                    self.release_worker(worker_id).await;
                    return;
                };
                let terminal = if code == ERR_CODE_ABORTED {
                    tracing::debug!(batch_id, "Batch aborted, re-enqueueing at head");
                    EmbedError::EmbedAborted
                } else {
                    tracing::warn!(batch_id, code, %message, "Batch failed on worker");
                    EmbedError::EmbedFailed { reason: message }
                };
                // Re-enqueue BEFORE the pool can observe this worker idle.
                self.retry_or_fail(in_flight.tasks, terminal);
                self.release_worker(worker_id).await;
            }
            other => {
                tracing::debug!(?other, "Non-batch response routed to dispatcher");
            }
        }
    }

    async fn on_worker_died(&mut self, worker_id: u64, batch_id: Option<u64>) {
        self.ready.retain(|lease| lease.worker_id != worker_id);
        let in_flight = match batch_id {
            Some(batch_id) => self.in_flight.remove(&batch_id),
            None => None,
        };
        if let Some(in_flight) = in_flight {
            tracing::warn!(
                worker_id,
                batch_id = ?batch_id,
                tasks = in_flight.tasks.len(),
                "Worker died mid-batch, re-enqueueing"
            );
            self.retry_or_fail(in_flight.tasks, EmbedError::WorkerDied);
            self.try_dispatch(false).await;
        }
    }

    /// Hand the worker back to the pool; the pool re-announces a lease if
    /// the worker is staying in service.
    async fn release_worker(&mut self, worker_id: u64) {
        let _ = self.pool_tx.try_send(PoolMsg::MarkReady { worker_id });
    }

    /// Re-enqueue at the head of the queue (preserving relative order) with
    /// `attempt_count` bumped; tasks that are out of attempts settle with
    /// `terminal`.
    fn retry_or_fail(&mut self, tasks: Vec<EmbedTask>, terminal: EmbedError) {
        for mut task in tasks.into_iter().rev() {
            task.attempt_count += 1;
            if task.attempt_count < self.max_attempts {
                self.queue.push_front(task);
            } else {
                self.settle_err(task, terminal.clone());
            }
        }
    }

    fn settle_err(&mut self, task: EmbedTask, error: EmbedError) {
        self.failed_total += 1;
        let _ = task.reply.send(Err(error));
    }

    /// Reject queued tasks that blew their deadline (2 × rolling P95 of
    /// batch service time). Timed-out tasks are not re-enqueued.
    fn sweep_timeouts(&mut self) {
        let deadline = self.task_deadline();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for task in self.queue.drain(..) {
            if task.enqueued_at.elapsed() > deadline {
                self.timed_out_total += 1;
                self.failed_total += 1;
                let _ = task.reply.send(Err(EmbedError::EmbedTimeout));
            } else {
                kept.push_back(task);
            }
        }
        self.queue = kept;
    }

    fn record_duration(&mut self, duration: Duration) {
        if self.durations.len() == DURATION_WINDOW {
            self.durations.pop_front();
        }
        self.durations.push_back(duration);
    }

    /// 2 × P95 of observed batch durations, floored by the default budget.
    fn task_deadline(&self) -> Duration {
        let p95 = if self.durations.is_empty() {
            DEFAULT_BATCH_BUDGET
        } else {
            let mut sorted: Vec<Duration> = self.durations.iter().copied().collect();
            sorted.sort();
            let idx = (sorted.len() as f64 * 0.95).ceil() as usize;
            sorted[idx.min(sorted.len()) - 1].max(DEFAULT_BATCH_BUDGET)
        };
        p95 * 2
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(QueueStats {
            depth: self.queue.len(),
            enqueued_total: self.enqueued_total,
            completed_total: self.completed_total,
            failed_total: self.failed_total,
            timed_out_total: self.timed_out_total,
            in_flight_batches: self.in_flight.len(),
            high_water: self.queue.len() > self.high_water_mark,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::Receiver;

    fn test_settings(batch_size: usize, flush_ms: u64) -> Settings {
        Settings {
            batch_size,
            batch_flush: Duration::from_millis(flush_ms),
            max_attempts: 2,
            ..Settings::default()
        }
    }

    struct Harness {
        tx: mpsc::Sender<DispatcherMsg>,
        stats: watch::Receiver<QueueStats>,
        pool_rx: Receiver<PoolMsg>,
    }

    fn spawn_harness(batch_size: usize) -> Harness {
        spawn_harness_with_flush(batch_size, 20)
    }

    fn spawn_harness_with_flush(batch_size: usize, flush_ms: u64) -> Harness {
        let (pool_tx, pool_rx) = mpsc::channel(64);
        let (tx, stats) = spawn_dispatcher(&test_settings(batch_size, flush_ms), pool_tx);
        Harness { tx, stats, pool_rx }
    }

    /// A fake worker: a lease plus the receiving end of its stdin channel.
    fn fake_worker(worker_id: u64) -> (WorkerLease, Receiver<Request>) {
        let (stdin_tx, stdin_rx) = mpsc::channel(8);
        (
            WorkerLease {
                worker_id,
                stdin_tx,
                idle_since: Instant::now(),
            },
            stdin_rx,
        )
    }

    fn submit_tasks(
        texts: &[&str],
        flush: bool,
    ) -> (SubmitRequest, Vec<oneshot::Receiver<Result<Vec<f32>, EmbedError>>>) {
        let mut tasks = Vec::new();
        let mut replies = Vec::new();
        for text in texts {
            let (reply, reply_rx) = oneshot::channel();
            tasks.push(EmbedTask {
                text: text.to_string(),
                reply,
                enqueued_at: Instant::now(),
                attempt_count: 0,
            });
            replies.push(reply_rx);
        }
        (SubmitRequest { tasks, flush }, replies)
    }

    async fn expect_embed(rx: &mut Receiver<Request>) -> (u64, Vec<String>) {
        match tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("worker should receive a frame")
            .expect("channel open")
        {
            Request::Embed { batch_id, texts } => (batch_id, texts),
            other => panic!("expected EMBED, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_batch_dispatches_immediately() {
        let mut harness = spawn_harness(2);
        let (lease, mut worker_rx) = fake_worker(1);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();

        let (submit, mut replies) = submit_tasks(&["a", "b"], false);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();

        let (batch_id, texts) = expect_embed(&mut worker_rx).await;
        assert_eq!(texts, vec!["a", "b"]);

        harness
            .tx
            .send(DispatcherMsg::WorkerResult {
                worker_id: 1,
                response: Response::EmbedOk {
                    batch_id,
                    vectors: vec![vec![1.0], vec![2.0]],
                },
            })
            .await
            .unwrap();

        assert_eq!(replies.remove(0).await.unwrap().unwrap(), vec![1.0]);
        assert_eq!(replies.remove(0).await.unwrap().unwrap(), vec![2.0]);
    }

    #[tokio::test]
    async fn test_partial_batch_waits_for_flush_deadline() {
        let mut harness = spawn_harness_with_flush(100, 300);
        let (lease, mut worker_rx) = fake_worker(1);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();

        let (submit, _replies) = submit_tasks(&["only-one"], false);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();

        // Below batch size and well inside the flush window: nothing yet
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(worker_rx.try_recv().is_err());

        // After the flush deadline the partial batch goes out
        let (_batch_id, texts) = expect_embed(&mut worker_rx).await;
        assert_eq!(texts, vec!["only-one"]);
    }

    #[tokio::test]
    async fn test_flush_submit_skips_deadline() {
        let mut harness = spawn_harness(100);
        let (lease, mut worker_rx) = fake_worker(1);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();

        let (submit, _replies) = submit_tasks(&["now"], true);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();

        let (_batch_id, texts) = expect_embed(&mut worker_rx).await;
        assert_eq!(texts, vec!["now"]);
    }

    #[tokio::test]
    async fn test_large_submit_cuts_fixed_batches_one_in_flight() {
        // One worker, batch size 2, five tasks → 3 sequential batches
        let mut harness = spawn_harness(2);
        let (lease, mut worker_rx) = fake_worker(1);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();

        let (submit, replies) = submit_tasks(&["a", "b", "c", "d", "e"], true);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();

        let mut seen = Vec::new();
        for round in 0..3 {
            let (batch_id, texts) = expect_embed(&mut worker_rx).await;
            // At most one batch in flight on a single worker
            assert!(worker_rx.try_recv().is_err(), "round {}", round);
            seen.extend(texts.clone());
            // Worker completes, pool re-announces the lease
            harness
                .tx
                .send(DispatcherMsg::WorkerResult {
                    worker_id: 1,
                    response: Response::EmbedOk {
                        batch_id,
                        vectors: texts.iter().map(|_| vec![0.0]).collect(),
                    },
                })
                .await
                .unwrap();
            let (lease, rx2) = fake_worker(1);
            worker_rx = rx2;
            harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();
        }
        assert_eq!(seen, vec!["a", "b", "c", "d", "e"]);
        for reply in replies {
            assert!(reply.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_aborted_batch_reenqueues_at_head_in_order() {
        let mut harness = spawn_harness(2);
        let (lease, mut worker_rx) = fake_worker(1);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();

        let (submit, replies) = submit_tasks(&["a", "b"], true);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();
        let (batch_id, _) = expect_embed(&mut worker_rx).await;

        harness
            .tx
            .send(DispatcherMsg::WorkerResult {
                worker_id: 1,
                response: Response::EmbedErr {
                    batch_id,
                    code: ERR_CODE_ABORTED,
                    message: "aborted".into(),
                },
            })
            .await
            .unwrap();

        // Worker comes back; the retried batch preserves input order
        let (lease, mut worker_rx) = fake_worker(1);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();
        let (batch_id, texts) = expect_embed(&mut worker_rx).await;
        assert_eq!(texts, vec!["a", "b"]);

        harness
            .tx
            .send(DispatcherMsg::WorkerResult {
                worker_id: 1,
                response: Response::EmbedOk {
                    batch_id,
                    vectors: vec![vec![1.0], vec![2.0]],
                },
            })
            .await
            .unwrap();
        for reply in replies {
            assert!(reply.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_repeated_failures_exhaust_attempts() {
        let mut harness = spawn_harness(1);
        let (submit, mut replies) = submit_tasks(&["doomed"], true);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();

        // max_attempts = 2 → the task is retried once, then failed
        for _ in 0..2 {
            let (lease, mut worker_rx) = fake_worker(1);
            harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();
            let (batch_id, _) = expect_embed(&mut worker_rx).await;
            harness
                .tx
                .send(DispatcherMsg::WorkerResult {
                    worker_id: 1,
                    response: Response::EmbedErr {
                        batch_id,
                        code: 2,
                        message: "model exploded".into(),
                    },
                })
                .await
                .unwrap();
        }

        let result = replies.remove(0).await.unwrap();
        assert!(matches!(result, Err(EmbedError::EmbedFailed { .. })));
    }

    #[tokio::test]
    async fn test_worker_death_reenqueues_batch() {
        let mut harness = spawn_harness(2);
        let (lease, mut worker_rx) = fake_worker(7);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();

        let (submit, replies) = submit_tasks(&["a", "b"], true);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();
        let (batch_id, _) = expect_embed(&mut worker_rx).await;

        harness
            .tx
            .send(DispatcherMsg::WorkerDied {
                worker_id: 7,
                batch_id: Some(batch_id),
            })
            .await
            .unwrap();

        // A replacement worker picks the batch up again
        let (lease, mut worker_rx) = fake_worker(8);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();
        let (batch_id, texts) = expect_embed(&mut worker_rx).await;
        assert_eq!(texts, vec!["a", "b"]);
        harness
            .tx
            .send(DispatcherMsg::WorkerResult {
                worker_id: 8,
                response: Response::EmbedOk {
                    batch_id,
                    vectors: vec![vec![1.0], vec![2.0]],
                },
            })
            .await
            .unwrap();
        for reply in replies {
            assert!(reply.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_and_new_work() {
        let harness = spawn_harness(100);
        let (submit, mut queued) = submit_tasks(&["stuck"], false);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();

        harness.tx.send(DispatcherMsg::Shutdown).await.unwrap();
        assert!(matches!(
            queued.remove(0).await.unwrap(),
            Err(EmbedError::ShuttingDown)
        ));

        let (submit, mut fresh) = submit_tasks(&["late"], false);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();
        assert!(matches!(
            fresh.remove(0).await.unwrap(),
            Err(EmbedError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_reclaim_reports_lease_state() {
        let mut harness = spawn_harness(2);
        let (lease, _worker_rx) = fake_worker(3);
        harness.tx.send(DispatcherMsg::WorkerReady(lease)).await.unwrap();

        let (reply, reply_rx) = oneshot::channel();
        harness
            .tx
            .send(DispatcherMsg::ReclaimWorker {
                worker_id: 3,
                reply,
            })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap(), "unused lease is reclaimable");

        let (reply, reply_rx) = oneshot::channel();
        harness
            .tx
            .send(DispatcherMsg::ReclaimWorker {
                worker_id: 3,
                reply,
            })
            .await
            .unwrap();
        assert!(!reply_rx.await.unwrap(), "already reclaimed");

        // Pool messages flowed for none of this (no batches were cut)
        assert!(harness.pool_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stats_track_queue_depth() {
        let mut harness = spawn_harness(100);
        let (submit, _replies) = submit_tasks(&["a", "b", "c"], false);
        harness.tx.send(DispatcherMsg::Submit(submit)).await.unwrap();

        harness.stats.changed().await.unwrap();
        let stats = harness.stats.borrow().clone();
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.enqueued_total, 3);
        assert_eq!(stats.completed_total, 0);
    }
}
