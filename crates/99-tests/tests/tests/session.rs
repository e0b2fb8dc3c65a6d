//! Session behaviour through the client entry point: pipelining, destroy,
//! reference data and the worker echo scenario.

mod common;

use std::sync::Arc;
use std::thread;

use engine_client::{
    AsyncBackend, BackendError, BackendFactory, BackendKind, BackendOptions,
    StaticReferenceData, SyncBackend,
};
use futures::executor::block_on;
use futures::future::join_all;
use rand::seq::SliceRandom;
use rand::thread_rng;
use runtime_wasm::WasmtimeFactory;
use tempfile::tempdir;
use testdata::{echo_request, markers, ENGINE_WAT};

use common::{factory, modules};

/// Many in-flight calls on a native transport each get their own reply.
#[test]
fn native_pipelining_keeps_callers_apart() {
    let dir = tempdir().unwrap();
    for kind in [BackendKind::NativeUnixSocket, BackendKind::NativeSharedMemory] {
        let backend = factory(&dir, Some(kind)).create_async().unwrap();
        let requests: Vec<Vec<u8>> = (0..64).map(echo_request).collect();
        let calls: Vec<_> = requests.iter().map(|r| backend.call(r.clone())).collect();
        let replies: Vec<Vec<u8>> = block_on(join_all(calls))
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(replies, requests, "{kind} swapped replies");
        backend.destroy();
    }
}

/// Futures awaited in a shuffled order still see their own replies.
#[test]
fn awaiting_out_of_order_is_harmless() {
    let dir = tempdir().unwrap();
    let backend = factory(&dir, Some(BackendKind::NativeUnixSocket))
        .create_async()
        .unwrap();
    let mut calls: Vec<_> = (0..16u32)
        .map(|v| (v, backend.call(echo_request(v))))
        .collect();
    calls.shuffle(&mut thread_rng());
    for (v, call) in calls {
        assert_eq!(block_on(call).unwrap(), echo_request(v));
    }
}

/// Destroy is idempotent on every kind and later calls fail cleanly.
#[test]
fn destroy_is_final_everywhere() {
    let dir = tempdir().unwrap();
    for kind in BackendKind::ALL {
        let backend = factory(&dir, Some(kind)).create_async().unwrap();
        backend.destroy();
        backend.destroy();
        assert_eq!(
            block_on(backend.call(echo_request(1))),
            Err(BackendError::Destroyed),
            "{kind}"
        );
    }
}

/// Native endpoints are gone once their sessions end.
#[test]
fn native_sessions_clean_up() {
    let dir = tempdir().unwrap();
    for kind in [BackendKind::NativeUnixSocket, BackendKind::NativeSharedMemory] {
        let backend = factory(&dir, Some(kind)).create_sync().unwrap();
        backend.call(&echo_request(1)).unwrap();
        drop(backend);
    }
    let left: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert!(left.is_empty(), "left behind: {left:?}");
}

/// Three concurrent echoes on a worker backend each carry their own `v`.
#[test]
fn worker_echo_scenario() {
    let dir = tempdir().unwrap();
    let backend = Arc::new(
        factory(&dir, Some(BackendKind::WasmWorker))
            .create_async()
            .unwrap(),
    );
    let handles: Vec<_> = (1..=3u32)
        .map(|v| {
            let backend = Arc::clone(&backend);
            thread::spawn(move || (v, block_on(backend.call(echo_request(v)))))
        })
        .collect();
    for handle in handles {
        let (v, reply) = handle.join().unwrap();
        assert_eq!(reply.unwrap(), echo_request(v));
    }
    backend.destroy();
}

/// Reference data is loaded into wasm backends before they are handed out.
#[test]
fn wasm_backends_load_reference_data() {
    let init = Arc::new(StaticReferenceData(vec![markers::LOAD_VERIFIER_CRS, 0, 0, 0]));
    for kind in [BackendKind::Wasm, BackendKind::WasmWorker] {
        let factory = BackendFactory::new(BackendOptions::default().backend(kind).threads(1))
            .with_module_factory(modules())
            .with_reference_data(init.clone());
        let backend = factory.create_async().unwrap();
        assert_eq!(
            block_on(backend.call(echo_request(2))).unwrap(),
            echo_request(2)
        );
    }
}

/// A module that cannot load its reference data is never handed out.
#[test]
fn failed_reference_load_fails_creation() {
    let bare = Arc::new(WasmtimeFactory::from_bytes(ENGINE_WAT.as_bytes()).unwrap());
    let factory = BackendFactory::new(BackendOptions::default().backend(BackendKind::Wasm))
        .with_module_factory(bare)
        .with_reference_data(Arc::new(StaticReferenceData(vec![
            markers::LOAD_VERIFIER_CRS,
        ])));
    assert!(factory.create_async().is_err());
    assert!(factory.create_sync().is_err());
}

/// The engine is told how many threads to use.
#[test]
fn engine_sees_thread_count() {
    let dir = tempdir().unwrap();
    let backend = factory(&dir, Some(BackendKind::NativeUnixSocket))
        .create_sync()
        .unwrap();
    let reply = backend
        .call(mock_engine::PROBE_HARDWARE_CONCURRENCY)
        .unwrap();
    assert_eq!(reply, b"2");
}
