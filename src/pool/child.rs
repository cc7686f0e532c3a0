//! Worker subprocess plumbing: spawn, framed stdin writer, stdout reader
//!
//! The pool re-executes its own binary with the hidden `worker` subcommand;
//! stdin/stdout carry frames, stderr is inherited so worker logs land in
//! the parent's log stream. Each child gets two tasks: a writer draining an
//! mpsc of requests into stdin, and a reader routing responses to the pool
//! and dispatcher loops. Reader EOF is the prompt death signal; the pool
//! reaps the exit code afterwards.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

use crate::config::Settings;
use crate::dispatch::DispatcherMsg;
use crate::worker::protocol::{self, Request, Response};

use super::{PoolError, PoolMsg};

/// Requests buffered towards one worker's stdin. A worker has at most one
/// batch in flight, so the channel stays shallow: INIT, one EMBED, maybe an
/// ABORT and a SHUTDOWN.
const STDIN_QUEUE: usize = 8;

/// Parent-side handle to one spawned worker process.
pub(super) struct ChildProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin_tx: mpsc::Sender<Request>,
}

impl ChildProcess {
    /// Queue a request; returns false if the stdin writer is gone (the
    /// worker is dead or dying).
    pub fn send(&self, request: Request) -> bool {
        self.stdin_tx.try_send(request).is_ok()
    }

    /// Escalate: OS-terminate the child.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "start_kill failed (already dead?)");
        }
    }

    /// Non-blocking reap; `Some(code)` once the process has exited.
    pub fn try_reap(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code().unwrap_or(-1)),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(error = %e, "try_wait failed");
                Some(-1)
            }
        }
    }
}

/// The program to execute for workers: the test override, or this binary.
fn worker_program(settings: &Settings) -> Result<PathBuf, PoolError> {
    if let Some(program) = &settings.worker_program {
        return Ok(program.clone());
    }
    std::env::current_exe().map_err(PoolError::Spawn)
}

/// Spawn a worker process and its IPC tasks. The `INIT` frame is queued
/// immediately; the pool hears `WorkerUp` once the child answers `INIT_OK`.
pub(super) fn spawn_worker(
    settings: &Settings,
    worker_id: u64,
    backend: &str,
    pool_tx: mpsc::Sender<PoolMsg>,
    dispatch_tx: mpsc::Sender<DispatcherMsg>,
) -> Result<ChildProcess, PoolError> {
    let program = worker_program(settings)?;

    let mut child = Command::new(&program)
        .arg("worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(PoolError::Spawn)?;

    let pid = child.id();
    let stdin = child.stdin.take().ok_or(PoolError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(PoolError::MissingPipe("stdout"))?;

    let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_QUEUE);
    tokio::spawn(writer_task(worker_id, stdin, stdin_rx));
    tokio::spawn(reader_task(worker_id, stdout, pool_tx, dispatch_tx));

    let init = Request::Init(protocol::InitRequest {
        worker_id,
        dim: settings.embedding_dim,
        cache_capacity: settings.cache_capacity,
        cache_path: settings.cache_file_path.display().to_string(),
        model_path: settings.model_cache_path.display().to_string(),
        backend: backend.to_string(),
    });
    if stdin_tx.try_send(init).is_err() {
        tracing::warn!(worker_id, "Worker stdin closed before INIT");
    }

    tracing::info!(worker_id, ?pid, program = %program.display(), "Spawned worker");
    Ok(ChildProcess {
        child,
        pid,
        stdin_tx,
    })
}

/// Drains queued requests into the child's stdin. Ends when the channel
/// closes (worker entry dropped) or a write fails (child gone).
async fn writer_task(worker_id: u64, mut stdin: ChildStdin, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.recv().await {
        if let Err(e) = protocol::send_request(&mut stdin, &request).await {
            tracing::debug!(worker_id, error = %e, "Worker stdin write failed");
            break;
        }
    }
}

/// Routes worker responses: lifecycle frames to the pool, batch results to
/// the dispatcher. On EOF or a framing error the pool is told the channel
/// is gone and the task ends.
async fn reader_task(
    worker_id: u64,
    mut stdout: tokio::process::ChildStdout,
    pool_tx: mpsc::Sender<PoolMsg>,
    dispatch_tx: mpsc::Sender<DispatcherMsg>,
) {
    loop {
        match protocol::recv_response(&mut stdout).await {
            Ok(Response::InitOk) => {
                if pool_tx.send(PoolMsg::WorkerUp { worker_id }).await.is_err() {
                    return;
                }
            }
            Ok(response @ (Response::EmbedOk { .. } | Response::EmbedErr { .. })) => {
                // Any traffic refreshes the worker's health clock.
                let _ = pool_tx.try_send(PoolMsg::Heartbeat { worker_id });
                if dispatch_tx
                    .send(DispatcherMsg::WorkerResult {
                        worker_id,
                        response,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Response::AbortAck) => {
                let _ = pool_tx.try_send(PoolMsg::Heartbeat { worker_id });
            }
            Ok(Response::Exiting) => {
                let _ = pool_tx.send(PoolMsg::WorkerExiting { worker_id }).await;
            }
            Err(e) => {
                tracing::debug!(worker_id, error = %e, "Worker channel closed");
                let _ = pool_tx.send(PoolMsg::ChannelClosed { worker_id }).await;
                return;
            }
        }
    }
}
