//! Native backends against the `mock-engine` binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use futures::executor::block_on;
use futures::future::join_all;
use mock_engine::PROBE_HARDWARE_CONCURRENCY as PROBE;
use parking_lot::Mutex;
use runtime_native::{
    NativeOptions, NativeShmBackend, NativeShmSyncBackend, NativeSocketBackend,
    NativeSocketSyncBackend,
};
use tempfile::TempDir;
use transport_fabric::{AsyncBackend, BackendError, BackendKind, LogSink, SyncBackend};

const MOCK_ENGINE: &str = env!("CARGO_BIN_EXE_mock-engine");

fn options(dir: &TempDir) -> NativeOptions {
    NativeOptions::new(MOCK_ENGINE).endpoint_dir(dir.path())
}

/// An engine binary that runs `body` through the shell.
fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn requests(n: u8) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("request {i}").into_bytes()).collect()
}

fn endpoints(dir: &TempDir) -> Vec<PathBuf> {
    fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().map_or(true, |ext| ext != "log"))
        .collect()
}

/// Pipelined socket calls each resolve with their own response.
#[test]
fn socket_pipelines_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let backend = NativeSocketBackend::connect(&options(&dir)).unwrap();
    assert_eq!(AsyncBackend::kind(&backend), BackendKind::NativeUnixSocket);

    let sent = requests(32);
    let calls: Vec<_> = sent.iter().map(|r| backend.call(r.clone())).collect();
    let replies: Vec<_> = block_on(join_all(calls))
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(replies, sent);
    assert_eq!(backend.pending_len(), 0);
}

/// Destroy rejects later calls, is repeatable and removes the socket file.
#[test]
fn socket_destroy_is_final() {
    let dir = tempfile::tempdir().unwrap();
    let backend = NativeSocketBackend::connect(&options(&dir)).unwrap();
    assert_eq!(block_on(backend.call(b"x".to_vec())).unwrap(), b"x");
    AsyncBackend::destroy(&backend);
    AsyncBackend::destroy(&backend);
    assert_eq!(
        block_on(backend.call(b"y".to_vec())),
        Err(BackendError::Destroyed)
    );
    assert!(endpoints(&dir).is_empty());
}

/// An engine that dies mid-session fails the waiting call and every later one.
#[test]
fn socket_reports_engine_exit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = script(
        dir.path(),
        "engine",
        &format!("exec {MOCK_ENGINE} \"$@\" --exit-after 1"),
    );
    let mut options = options(&dir);
    options.engine_path = engine;
    let backend = NativeSocketBackend::connect(&options).unwrap();

    assert_eq!(block_on(backend.call(b"one".to_vec())).unwrap(), b"one");
    let expected = BackendError::Process("engine process exited with code 3".into());
    assert_eq!(block_on(backend.call(b"two".to_vec())), Err(expected.clone()));
    assert_eq!(block_on(backend.call(b"three".to_vec())), Err(expected));
}

/// The pipe-style socket backend refuses overlapping calls.
#[test]
fn socket_sync_refuses_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(NativeSocketSyncBackend::connect(&options(&dir)).unwrap());
    assert_eq!(SyncBackend::call(&*backend, b"ping").unwrap(), b"ping");

    let done = Arc::new(AtomicBool::new(false));
    let busy = {
        let backend = Arc::clone(&backend);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let big = vec![7u8; 1024 * 1024];
            let mut answered = 0;
            while answered < 200 {
                match SyncBackend::call(&*backend, &big) {
                    Ok(reply) => {
                        assert_eq!(reply.len(), big.len());
                        answered += 1;
                    }
                    Err(BackendError::Concurrency(_)) => continue,
                    Err(err) => panic!("{err}"),
                }
            }
            done.store(true, Ordering::Release);
        })
    };
    let mut refused = false;
    while !done.load(Ordering::Acquire) && !refused {
        if let Err(err) = SyncBackend::call(&*backend, b"overlap") {
            assert!(matches!(err, BackendError::Concurrency(_)), "{err}");
            refused = true;
        }
    }
    busy.join().unwrap();
    assert!(refused);
}

/// The engine sees the configured thread count.
#[test]
fn socket_passes_hardware_concurrency() {
    let dir = tempfile::tempdir().unwrap();
    let backend = NativeSocketSyncBackend::connect(&options(&dir).threads(Some(4))).unwrap();
    assert_eq!(SyncBackend::call(&backend, PROBE).unwrap(), b"4");
}

/// Shared-memory calls pipeline, including messages larger than a ring.
#[test]
fn shm_pipelines_and_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    options.ring_size = Some(64 * 1024);
    let backend = NativeShmBackend::connect(&options).unwrap();
    assert_eq!(AsyncBackend::kind(&backend), BackendKind::NativeSharedMemory);

    let mut sent = requests(16);
    sent.push(vec![0xA5; 300 * 1024]);
    let calls: Vec<_> = sent.iter().map(|r| backend.call(r.clone())).collect();
    let replies: Vec<_> = block_on(join_all(calls))
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(replies, sent);
    assert_eq!(backend.pending_len(), 0);

    AsyncBackend::destroy(&backend);
    assert_eq!(
        block_on(backend.call(b"late".to_vec())),
        Err(BackendError::Destroyed)
    );
    assert!(endpoints(&dir).is_empty());
}

/// Shared memory defaults the engine to one thread.
#[test]
fn shm_defaults_to_one_thread() {
    let dir = tempfile::tempdir().unwrap();
    let backend = NativeShmSyncBackend::connect(&options(&dir)).unwrap();
    assert_eq!(SyncBackend::call(&backend, PROBE).unwrap(), b"1");
}

/// Concurrent callers on the sync shared-memory backend take turns.
#[test]
fn shm_sync_serializes_callers() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(NativeShmSyncBackend::connect(&options(&dir)).unwrap());
    let workers: Vec<_> = (0..4u8)
        .map(|worker| {
            let backend = Arc::clone(&backend);
            thread::spawn(move || {
                for i in 0..25u8 {
                    let request = vec![worker, i];
                    assert_eq!(SyncBackend::call(&*backend, &request).unwrap(), request);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    SyncBackend::destroy(&*backend);
    SyncBackend::destroy(&*backend);
    assert_eq!(SyncBackend::call(&*backend, b"x"), Err(BackendError::Destroyed));
}

/// A shared-memory engine that dies is reported with its exit status.
#[test]
fn shm_reports_engine_exit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = script(
        dir.path(),
        "engine",
        &format!("exec {MOCK_ENGINE} \"$@\" --exit-after 0"),
    );
    let mut options = options(&dir);
    options.engine_path = engine;
    let backend = NativeShmBackend::connect(&options).unwrap();
    assert_eq!(
        block_on(backend.call(b"boom".to_vec())),
        Err(BackendError::Process("engine process exited with code 3".into()))
    );
}

/// An engine that exits during startup aborts the connect with its status.
#[test]
fn startup_exit_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    options.engine_path = script(dir.path(), "engine", "exit 4");
    let expected = BackendError::Process("engine process exited with code 4".into());
    assert_eq!(NativeSocketBackend::connect(&options).err(), Some(expected.clone()));
    assert_eq!(NativeShmSyncBackend::connect(&options).err(), Some(expected));
}

/// An engine that never publishes its region times out.
#[test]
fn shm_attach_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    options.engine_path = script(dir.path(), "engine", "exec sleep 30");
    let err = NativeShmSyncBackend::connect(&options).err().unwrap();
    assert!(matches!(err, BackendError::Timeout { .. }), "{err}");
}

/// A missing engine binary is unavailable.
#[test]
fn missing_engine_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let mut options = options(&dir);
    options.engine_path = dir.path().join("no-such-engine");
    let err = NativeSocketBackend::connect(&options).err().unwrap();
    assert!(matches!(err, BackendError::Unavailable(_)), "{err}");
}

/// With a logger, engine output goes to a log file the logger is told about.
#[test]
fn logger_gets_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    let logger: LogSink = Arc::new(move |line: &str| sink.lock().push(line.to_owned()));
    let backend = NativeSocketSyncBackend::connect(&options(&dir).logger(logger)).unwrap();
    SyncBackend::call(&backend, b"hello").unwrap();

    let line = lines.lock().first().cloned().unwrap();
    let log = line
        .strip_prefix("engine logs redirected to ")
        .map(PathBuf::from)
        .unwrap();
    assert!(fs::read_to_string(log).unwrap().contains("mock engine starting"));
}
