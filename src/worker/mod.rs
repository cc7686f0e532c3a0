//! Worker process: an isolated, single-threaded embedding actor
//!
//! Spawned by the pool as `cinder worker` with framed messages on
//! stdin/stdout (stderr carries logs). The worker holds one model instance
//! and processes at most one batch at a time:
//!
//! `INIT` → load backend, attach shared cache, reply `INIT_OK` →
//! loop { `EMBED` | `ABORT` | `SHUTDOWN` }.
//!
//! Per `EMBED`: probe the shared cache per text, run one model invocation
//! over the misses, write them back through the cache, reply with vectors
//! in input order. Backend failures produce `EMBED_ERR` and keep the
//! worker alive; an IPC write failure is fatal. A termination signal runs
//! the same graceful sequence as `SHUTDOWN` under a short deadline.

pub mod backend;
pub mod protocol;

use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::cache::EmbeddingCache;
use crate::chunk::ContentHash;
use backend::Backend;
use protocol::{
    recv_request_blocking, send_response_blocking, InitRequest, ProtocolError, Request, Response,
    ERR_CODE_MODEL,
};

/// Deadline for the signal-driven graceful exit before the watchdog gives
/// up and the worker dies with a non-zero code.
const SIGNAL_EXIT_DEADLINE: Duration = Duration::from_secs(5);

/// Set by the termination-signal handler; checked between batches.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Run the worker loop over stdin/stdout. Returns the process exit code.
pub fn run(stdin: impl Read, stdout: impl Write) -> i32 {
    install_signal_handler();

    let mut reader = BufReader::new(stdin);
    let mut writer = BufWriter::new(stdout);

    match serve(&mut reader, &mut writer) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "Worker terminating on IPC failure");
            1
        }
    }
}

fn install_signal_handler() {
    let result = ctrlc::set_handler(|| {
        if SHUTDOWN_REQUESTED.swap(true, Ordering::AcqRel) {
            std::process::exit(1);
        }
        // Give the in-flight batch a bounded window to finish, then die hard.
        std::thread::spawn(|| {
            std::thread::sleep(SIGNAL_EXIT_DEADLINE);
            std::process::exit(1);
        });
    });
    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to install worker signal handler");
    }
}

fn serve(reader: &mut impl Read, writer: &mut impl Write) -> Result<(), ProtocolError> {
    // First frame must be INIT.
    let init = match recv_request_blocking(reader)? {
        Request::Init(init) => init,
        Request::Shutdown => {
            send_response_blocking(writer, &Response::Exiting)?;
            return Ok(());
        }
        other => {
            tracing::error!(?other, "First frame was not INIT");
            return Err(ProtocolError::Malformed {
                frame: "INIT",
                detail: "expected INIT as first frame".into(),
            });
        }
    };

    let mut state = match WorkerState::bring_up(&init) {
        Ok(state) => state,
        Err(e) => {
            // The parent learns the reason, then this process exits.
            send_response_blocking(
                writer,
                &Response::EmbedErr {
                    batch_id: 0,
                    code: protocol::ERR_CODE_INTERNAL,
                    message: format!("init failed: {}", e),
                },
            )?;
            return Ok(());
        }
    };

    send_response_blocking(writer, &Response::InitOk)?;
    tracing::info!(
        worker_id = init.worker_id,
        backend = state.backend.name(),
        cache = state.cache.is_some(),
        "Worker ready"
    );

    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Acquire) {
            break;
        }
        let request = match recv_request_blocking(reader) {
            Ok(request) => request,
            Err(ProtocolError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Parent went away; treated like a shutdown without the ack.
                tracing::info!("Parent closed the channel, exiting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match request {
            Request::Embed { batch_id, texts } => {
                let response = state.embed_batch(batch_id, &texts);
                // An ABORT that arrived while the batch was running is
                // honored now: the invocation finished atomically, the
                // batch is reported aborted, then the abort is acked.
                if take_pending_abort(reader, batch_id)? {
                    send_response_blocking(
                        writer,
                        &Response::EmbedErr {
                            batch_id,
                            code: protocol::ERR_CODE_ABORTED,
                            message: "aborted".into(),
                        },
                    )?;
                    send_response_blocking(writer, &Response::AbortAck)?;
                } else {
                    send_response_blocking(writer, &response)?;
                }
            }
            Request::Abort { .. } => {
                // No batch in flight: ack immediately.
                send_response_blocking(writer, &Response::AbortAck)?;
            }
            Request::Shutdown => break,
            Request::Init(_) => {
                tracing::warn!("Duplicate INIT ignored");
                send_response_blocking(writer, &Response::InitOk)?;
            }
        }
    }

    // Graceful exit: release the cache mapping, tell the parent, exit 0.
    drop(state);
    send_response_blocking(writer, &Response::Exiting)?;
    Ok(())
}

/// Check for an `ABORT` frame already buffered on stdin (sent while the
/// batch ran). Only consumes input when a full frame is ready; anything
/// that is not an abort for this batch is left untouched conceptually by
/// re-interpreting it on the next loop turn; in practice the parent never
/// pipelines a second request onto a busy worker, so a pending frame here
/// is an abort or nothing.
#[cfg(unix)]
fn take_pending_abort(
    reader: &mut impl Read,
    current_batch: u64,
) -> Result<bool, ProtocolError> {
    use std::os::fd::RawFd;

    // poll(2) with zero timeout on stdin.
    let fd: RawFd = 0;
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    // SAFETY: pollfd points at a valid struct for the duration of the call.
    let ready = unsafe { libc::poll(&mut pollfd, 1, 0) };
    if ready <= 0 || pollfd.revents & libc::POLLIN == 0 {
        return Ok(false);
    }

    match recv_request_blocking(reader)? {
        Request::Abort { batch_id } => Ok(batch_id.is_none() || batch_id == Some(current_batch)),
        Request::Shutdown => {
            SHUTDOWN_REQUESTED.store(true, Ordering::Release);
            Ok(false)
        }
        other => {
            tracing::warn!(?other, "Unexpected frame while busy, dropping");
            Ok(false)
        }
    }
}

#[cfg(not(unix))]
fn take_pending_abort(
    _reader: &mut impl Read,
    _current_batch: u64,
) -> Result<bool, ProtocolError> {
    Ok(false)
}

/// Everything the worker owns after a successful `INIT`.
struct WorkerState {
    backend: Box<dyn Backend>,
    cache: Option<EmbeddingCache>,
    dim: usize,
}

impl WorkerState {
    fn bring_up(init: &InitRequest) -> Result<Self, backend::BackendError> {
        let backend = backend::load_backend(
            &init.backend,
            init.dim as usize,
            Path::new(&init.model_path),
        )?;

        // A broken cache never takes the worker down; it embeds everything.
        let cache = match EmbeddingCache::open(
            Path::new(&init.cache_path),
            init.cache_capacity,
            init.dim,
        ) {
            Ok(cache) => Some(cache),
            Err(e) => {
                tracing::warn!(error = %e, "Worker running without shared cache");
                None
            }
        };

        Ok(Self {
            backend,
            cache,
            dim: init.dim as usize,
        })
    }

    /// One batch: cache probe per text, one model invocation over the
    /// misses, write-through, vectors in input order.
    fn embed_batch(&mut self, batch_id: u64, texts: &[String]) -> Response {
        let _span = tracing::info_span!("embed_batch", batch_id, count = texts.len()).entered();

        let hashes: Vec<ContentHash> = texts
            .iter()
            .map(|t| ContentHash::compute(t))
            .collect();

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        if let Some(cache) = &self.cache {
            for (i, hash) in hashes.iter().enumerate() {
                match cache.get(hash.as_bytes()) {
                    Some(v) => vectors[i] = Some(v),
                    None => miss_indices.push(i),
                }
            }
        } else {
            miss_indices.extend(0..texts.len());
        }

        if !miss_indices.is_empty() {
            let miss_texts: Vec<&str> = miss_indices.iter().map(|&i| texts[i].as_str()).collect();
            let computed = match self.backend.embed(&miss_texts) {
                Ok(computed) => computed,
                Err(e) => {
                    tracing::warn!(batch_id, error = %e, "Model invocation failed");
                    return Response::EmbedErr {
                        batch_id,
                        code: ERR_CODE_MODEL,
                        message: e.to_string(),
                    };
                }
            };
            if computed.len() != miss_indices.len()
                || computed.iter().any(|v| v.len() != self.dim)
            {
                return Response::EmbedErr {
                    batch_id,
                    code: ERR_CODE_MODEL,
                    message: format!(
                        "backend returned {} vectors for {} inputs",
                        computed.len(),
                        miss_indices.len()
                    ),
                };
            }

            for (&i, vector) in miss_indices.iter().zip(computed) {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.put(hashes[i].as_bytes(), &vector) {
                        tracing::debug!(error = %e, "Cache write-through failed");
                    }
                }
                vectors[i] = Some(vector);
            }
        }

        let vectors: Vec<Vec<f32>> = vectors
            .into_iter()
            .map(|v| v.expect("every index is a hit or a computed miss"))
            .collect();
        Response::EmbedOk { batch_id, vectors }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init_request(dir: &TempDir, dim: u32) -> InitRequest {
        InitRequest {
            worker_id: 1,
            dim,
            cache_capacity: 64,
            cache_path: dir.path().join("emb.cache").display().to_string(),
            model_path: dir.path().display().to_string(),
            backend: "hash".into(),
        }
    }

    #[test]
    fn test_embed_batch_orders_and_dims() {
        let dir = TempDir::new().unwrap();
        let mut state = WorkerState::bring_up(&init_request(&dir, 8)).unwrap();

        let texts = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let response = state.embed_batch(1, &texts);
        let vectors = match response {
            Response::EmbedOk { batch_id, vectors } => {
                assert_eq!(batch_id, 1);
                vectors
            }
            other => panic!("expected EmbedOk, got {:?}", other),
        };
        assert_eq!(vectors.len(), 3);
        assert!(vectors.iter().all(|v| v.len() == 8));
        // Same content, same vector; different content, different vector
        assert_eq!(vectors[0], vectors[2]);
        assert_ne!(vectors[0], vectors[1]);
    }

    #[test]
    fn test_embed_batch_hits_cache_on_repeat() {
        let dir = TempDir::new().unwrap();
        let mut state = WorkerState::bring_up(&init_request(&dir, 8)).unwrap();

        let texts = vec!["x".to_string(), "y".to_string()];
        let first = state.embed_batch(1, &texts);
        let second = state.embed_batch(2, &texts);
        let (a, b) = match (first, second) {
            (Response::EmbedOk { vectors: a, .. }, Response::EmbedOk { vectors: b, .. }) => (a, b),
            other => panic!("expected two EmbedOk, got {:?}", other),
        };
        assert_eq!(a, b);
        // Second batch was served from the cache entirely
        let stats = state.cache.as_ref().unwrap().stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.writes, 2);
    }

    #[test]
    fn test_bring_up_without_cache_still_works() {
        let dir = TempDir::new().unwrap();
        let mut init = init_request(&dir, 8);
        // A directory path cannot be opened as the cache file
        init.cache_path = dir.path().display().to_string();
        let mut state = WorkerState::bring_up(&init).unwrap();
        assert!(state.cache.is_none());

        let response = state.embed_batch(1, &["still works".to_string()]);
        assert!(matches!(response, Response::EmbedOk { .. }));
    }

    #[test]
    fn test_bring_up_rejects_unknown_backend() {
        let dir = TempDir::new().unwrap();
        let mut init = init_request(&dir, 8);
        init.backend = "no-such-backend".into();
        assert!(WorkerState::bring_up(&init).is_err());
    }

    #[test]
    fn test_serve_shutdown_before_init() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        let mut input = Vec::new();
        rt.block_on(protocol::send_request(&mut input, &Request::Shutdown))
            .unwrap();

        let mut output = Vec::new();
        serve(&mut input.as_slice(), &mut output).unwrap();

        let response = rt
            .block_on(protocol::recv_response(&mut output.as_slice()))
            .unwrap();
        assert_eq!(response, Response::Exiting);
    }
}
