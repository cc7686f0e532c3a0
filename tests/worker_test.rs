//! Protocol-level tests against a real spawned worker process.

mod common;

use std::io::{BufReader, BufWriter};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use cinder::worker::protocol::{
    recv_response_blocking, send_request_blocking, InitRequest, Request, Response,
};
use common::{worker_binary, TEST_DIM};

struct WorkerUnderTest {
    child: Child,
    stdin: Option<BufWriter<ChildStdin>>,
    stdout: BufReader<ChildStdout>,
    _dir: TempDir,
}

impl WorkerUnderTest {
    fn spawn() -> Self {
        let dir = TempDir::new().unwrap();
        let mut child = Command::new(worker_binary())
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("worker spawns");
        let stdin = BufWriter::new(child.stdin.take().unwrap());
        let stdout = BufReader::new(child.stdout.take().unwrap());
        Self {
            child,
            stdin: Some(stdin),
            stdout,
            _dir: dir,
        }
    }

    fn init(&mut self) {
        let init = Request::Init(InitRequest {
            worker_id: 1,
            dim: TEST_DIM,
            cache_capacity: 256,
            cache_path: self._dir.path().join("emb.cache").display().to_string(),
            model_path: self._dir.path().display().to_string(),
            backend: "hash".into(),
        });
        self.send(&init);
        assert_eq!(self.recv(), Response::InitOk);
    }

    fn send(&mut self, request: &Request) {
        let stdin = self.stdin.as_mut().expect("stdin open");
        send_request_blocking(stdin, request).unwrap();
    }

    fn recv(&mut self) -> Response {
        recv_response_blocking(&mut self.stdout).expect("worker response")
    }

    fn wait_exit(&mut self) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.code().unwrap_or(-1);
            }
            if Instant::now() > deadline {
                let _ = self.child.kill();
                panic!("worker did not exit in time");
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for WorkerUnderTest {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_init_then_embed_in_order() {
    let mut worker = WorkerUnderTest::spawn();
    worker.init();

    worker.send(&Request::Embed {
        batch_id: 1,
        texts: vec!["alpha".into(), "beta".into(), "alpha".into()],
    });
    match worker.recv() {
        Response::EmbedOk { batch_id, vectors } => {
            assert_eq!(batch_id, 1);
            assert_eq!(vectors.len(), 3);
            assert!(vectors.iter().all(|v| v.len() == TEST_DIM as usize));
            assert_eq!(vectors[0], vectors[2], "same text, same vector");
            assert_ne!(vectors[0], vectors[1]);
        }
        other => panic!("expected EMBED_OK, got {:?}", other),
    }
}

#[test]
fn test_embed_is_deterministic_across_workers() {
    let run = || {
        let mut worker = WorkerUnderTest::spawn();
        worker.init();
        worker.send(&Request::Embed {
            batch_id: 9,
            texts: vec!["stable text".into()],
        });
        match worker.recv() {
            Response::EmbedOk { mut vectors, .. } => vectors.remove(0),
            other => panic!("expected EMBED_OK, got {:?}", other),
        }
    };
    assert_eq!(run(), run());
}

#[test]
fn test_abort_outside_batch_acks_immediately() {
    let mut worker = WorkerUnderTest::spawn();
    worker.init();

    worker.send(&Request::Abort { batch_id: None });
    assert_eq!(worker.recv(), Response::AbortAck);

    // Worker is still serviceable afterwards
    worker.send(&Request::Embed {
        batch_id: 2,
        texts: vec!["still alive".into()],
    });
    assert!(matches!(worker.recv(), Response::EmbedOk { batch_id: 2, .. }));
}

#[test]
fn test_shutdown_is_graceful() {
    let mut worker = WorkerUnderTest::spawn();
    worker.init();

    worker.send(&Request::Shutdown);
    assert_eq!(worker.recv(), Response::Exiting);
    assert_eq!(worker.wait_exit(), 0);
}

#[test]
fn test_parent_disappearing_ends_worker() {
    let mut worker = WorkerUnderTest::spawn();
    worker.init();

    // Closing stdin is what the worker sees when the parent dies.
    worker.stdin.take();
    assert_eq!(worker.wait_exit(), 0);
}

#[test]
fn test_second_worker_reuses_first_workers_cache() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("emb.cache").display().to_string();

    let spawn_and_embed = || {
        let mut child = Command::new(worker_binary())
            .arg("worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let mut stdin = BufWriter::new(child.stdin.take().unwrap());
        let mut stdout = BufReader::new(child.stdout.take().unwrap());

        send_request_blocking(
            &mut stdin,
            &Request::Init(InitRequest {
                worker_id: 1,
                dim: TEST_DIM,
                cache_capacity: 256,
                cache_path: cache_path.clone(),
                model_path: dir.path().display().to_string(),
                backend: "hash".into(),
            }),
        )
        .unwrap();
        assert_eq!(recv_response_blocking(&mut stdout).unwrap(), Response::InitOk);

        send_request_blocking(
            &mut stdin,
            &Request::Embed {
                batch_id: 1,
                texts: vec!["cross-process".into()],
            },
        )
        .unwrap();
        let vector = match recv_response_blocking(&mut stdout).unwrap() {
            Response::EmbedOk { mut vectors, .. } => vectors.remove(0),
            other => panic!("expected EMBED_OK, got {:?}", other),
        };

        send_request_blocking(&mut stdin, &Request::Shutdown).unwrap();
        let _ = recv_response_blocking(&mut stdout);
        let _ = child.wait();
        vector
    };

    let first = spawn_and_embed();
    // The second worker attaches to the same cache file and must return
    // the very bytes the first worker stored.
    let second = spawn_and_embed();
    assert_eq!(first, second);
}
