//! Every backend kind answers the same requests with the same bytes.

mod common;

use engine_client::{AsyncBackend, BackendKind, SyncBackend};
use futures::executor::block_on;
use tempfile::tempdir;
use testdata::echo_request;

use common::factory;

fn corpus() -> Vec<Vec<u8>> {
    let mut requests: Vec<Vec<u8>> = (1..=4).map(echo_request).collect();
    requests.push(vec![7u8; 300 * 1024]);
    requests.push((0..=255u8).cycle().take(5000).collect());
    requests
}

/// Async calls through all four kinds yield identical responses.
#[test]
fn async_backends_agree() {
    let dir = tempdir().unwrap();
    let requests = corpus();
    let mut answers = Vec::new();
    for kind in BackendKind::ALL {
        let backend = factory(&dir, Some(kind)).create_async().unwrap();
        assert_eq!(backend.kind(), kind);
        let replies: Vec<Vec<u8>> = requests
            .iter()
            .map(|request| block_on(backend.call(request.clone())).unwrap())
            .collect();
        backend.destroy();
        answers.push((kind, replies));
    }
    for (kind, replies) in &answers {
        assert_eq!(replies, &requests, "{kind} disagrees");
    }
}

/// Blocking calls through every sync-capable kind yield identical responses.
#[test]
fn sync_backends_agree() {
    let dir = tempdir().unwrap();
    let requests = corpus();
    for kind in [
        BackendKind::Wasm,
        BackendKind::NativeUnixSocket,
        BackendKind::NativeSharedMemory,
    ] {
        let backend = factory(&dir, Some(kind)).create_sync().unwrap();
        for request in &requests {
            assert_eq!(&backend.call(request).unwrap(), request, "{kind} disagrees");
        }
        backend.destroy();
    }
}

/// With an engine on hand the unnamed chains pick the native transports.
#[test]
fn fallback_prefers_native_engine() {
    let dir = tempdir().unwrap();
    let backend = factory(&dir, None).create_async().unwrap();
    assert_eq!(backend.kind(), BackendKind::NativeUnixSocket);
    backend.destroy();

    let backend = factory(&dir, None).create_sync().unwrap();
    assert_eq!(backend.kind(), BackendKind::NativeSharedMemory);
    backend.destroy();
}
