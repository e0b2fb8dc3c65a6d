//! Engine fixture module under wasmtime: the msgpack call path, typed exports,
//! async host imports and the worker pool.
#![cfg(feature = "wasmtime")]

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use futures::executor::block_on;
use futures::future::{self, join_all, FutureExt};
use parking_lot::Mutex;
use runtime_wasm::{
    HostData, HostFuture, HostValue, InstanceSpec, LogSink, MemoryLimits, ModuleFactory,
    ModuleInstance, WasmArg, WasmBackend, WasmWorkerBackend, WasmtimeFactory,
};
use testdata::{echo_request, markers, ENGINE_WAT, LOG_LINE};
use transport_fabric::{AsyncBackend, BackendError, SyncBackend};

struct FixedCrs;

impl HostData for FixedCrs {
    fn load_verifier_crs(&self) -> HostFuture {
        future::ready(Ok(HostValue::Bytes(vec![0x42; 8]))).boxed()
    }

    fn load_prover_crs(&self, num_points: u32) -> HostFuture {
        future::ready(Ok(HostValue::Bytes(vec![num_points as u8; 8]))).boxed()
    }
}

fn factory() -> WasmtimeFactory {
    WasmtimeFactory::from_bytes(ENGINE_WAT.as_bytes())
        .expect("fixture compiles")
        .with_host_data(Arc::new(FixedCrs))
}

fn spec(log: LogSink) -> InstanceSpec {
    InstanceSpec {
        index: 0,
        limits: MemoryLimits::default(),
        threads: 4,
        log,
    }
}

fn quiet() -> LogSink {
    Arc::new(|_: &str| {})
}

fn backend_with_log(log: LogSink) -> WasmBackend {
    let (module, bridge) = factory().instantiate(&spec(log)).expect("instantiate");
    WasmBackend::new(module, bridge).expect("init")
}

fn live_allocations(backend: &WasmBackend) -> u32 {
    backend.module().lock().call("live_allocations", &[]).unwrap()
}

/// Echo works for requests inside and beyond the call buffers, without leaks.
#[test]
fn msgpack_echo_is_leak_free() {
    let backend = backend_with_log(quiet());
    let baseline = live_allocations(&backend);
    assert_eq!(SyncBackend::call(&backend, &echo_request(1)).unwrap(), echo_request(1));

    let big = vec![9u8; 9 * 1024 * 1024];
    assert_eq!(SyncBackend::call(&backend, &big).unwrap(), big);
    assert_eq!(live_allocations(&backend), baseline);
}

/// The module sees the configured hardware concurrency at init.
#[test]
fn initialize_reads_hardware_concurrency() {
    let backend = backend_with_log(quiet());
    assert_eq!(backend.module().lock().call("threads", &[]).unwrap(), 4);
}

/// Async imports suspend the module and resume it with host bytes.
#[test]
fn async_imports_resume_with_host_data() {
    let backend = backend_with_log(quiet());
    let baseline = live_allocations(&backend);

    let reply = block_on(AsyncBackend::call(
        &backend,
        vec![markers::LOAD_VERIFIER_CRS, 1, 2],
    ))
    .unwrap();
    assert_eq!(reply, vec![0x42, 1, 2]);

    let reply = block_on(AsyncBackend::call(
        &backend,
        vec![markers::LOAD_PROVER_CRS, 0, 0, 0, 0],
    ))
    .unwrap();
    assert_eq!(reply, vec![5, 0, 0, 0, 0]);
    assert_eq!(live_allocations(&backend), baseline);
}

/// An async import reached from the blocking path is refused.
#[test]
fn blocking_call_cannot_suspend() {
    let backend = backend_with_log(quiet());
    let err = SyncBackend::call(&backend, &[markers::LOAD_VERIFIER_CRS]).unwrap_err();
    assert!(matches!(err, BackendError::Wasm(_)), "{err}");
}

/// A trap inside the module is an error, and the instance keeps serving.
#[test]
fn trap_is_reported() {
    let backend = backend_with_log(quiet());
    assert!(SyncBackend::call(&backend, &[markers::TRAP]).is_err());
    assert_eq!(SyncBackend::call(&backend, b"still here").unwrap(), b"still here");
}

/// Typed exports read fixed-size and heap-returned outputs.
#[test]
fn typed_export_round_trip() {
    let backend = backend_with_log(quiet());
    let baseline = live_allocations(&backend);
    let input = b"\x01\x02\x03\x04";
    let outputs = backend
        .call_export(
            "sum_and_reverse",
            &[WasmArg::Bytes(input), WasmArg::Word(4)],
            &[Some(4), None],
        )
        .unwrap();
    assert_eq!(outputs[0], 10u32.to_le_bytes());
    assert_eq!(outputs[1], b"\x04\x03\x02\x01");
    assert_eq!(live_allocations(&backend), baseline);

    let stubbed = backend.call_export("wasi_stubs", &[], &[]).unwrap();
    assert!(stubbed.is_empty());
}

/// `random_get` fills module memory.
#[test]
fn random_get_is_wired() {
    let backend = backend_with_log(quiet());
    let words: Vec<u32> = (0..4)
        .map(|_| backend.module().lock().call("random_word", &[]).unwrap())
        .collect();
    assert!(words.windows(2).any(|w| w[0] != w[1]));
}

/// `logstr` lines reach the sink given at instantiation.
#[test]
fn logstr_reaches_sink() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let backend = backend_with_log(Arc::new(move |line: &str| sink.lock().push(line.to_owned())));
    SyncBackend::call(&backend, &[markers::LOG, 1]).unwrap();
    assert_eq!(*lines.lock(), vec![LOG_LINE.to_owned()]);
}

/// Worker-hosted instances answer concurrent requests and forward logs.
#[test]
fn worker_pool_over_wasmtime() -> anyhow::Result<()> {
    let (tx, rx) = unbounded();
    let logger: LogSink = Arc::new(move |line: &str| {
        let _ = tx.send(line.to_owned());
    });
    let backend =
        WasmWorkerBackend::spawn(Arc::new(factory()), 2, MemoryLimits::default(), Some(logger))?;

    let calls: Vec<_> = (1..=3)
        .map(|v| AsyncBackend::call(&backend, echo_request(v)))
        .collect();
    for (v, reply) in (1..=3).zip(block_on(join_all(calls))) {
        assert_eq!(reply?, echo_request(v));
    }

    block_on(backend.call_on(1, vec![markers::LOG]))?;
    assert_eq!(rx.recv_timeout(Duration::from_secs(2))?, LOG_LINE);
    AsyncBackend::destroy(&backend);
    Ok(())
}

/// Workers serve requests that load reference data through async imports.
#[test]
fn worker_loads_crs() -> anyhow::Result<()> {
    let backend = WasmWorkerBackend::spawn(Arc::new(factory()), 2, MemoryLimits::default(), None)?;
    let reply = block_on(AsyncBackend::call(
        &backend,
        vec![markers::LOAD_VERIFIER_CRS, 1, 2],
    ))?;
    assert_eq!(reply, vec![0x42, 1, 2]);
    let reply = block_on(backend.call_on(1, vec![markers::LOAD_PROVER_CRS, 0, 0, 0, 0]))?;
    assert_eq!(reply, vec![5, 0, 0, 0, 0]);
    Ok(())
}

/// A worker pool whose secondary workers get a small memory limit still
/// starts and answers on every worker.
#[test]
fn small_worker_limits() -> anyhow::Result<()> {
    let limits = MemoryLimits {
        initial_pages: 33,
        maximum_pages: 1024,
    };
    let backend = WasmWorkerBackend::spawn(Arc::new(factory()), 3, limits, None)?;
    for index in 0..3 {
        assert_eq!(block_on(backend.call_on(index, echo_request(7)))?, echo_request(7));
    }
    Ok(())
}

/// Missing module files are reported as unavailable, not as a crash.
#[test]
fn missing_module_file() {
    let err = WasmtimeFactory::from_file("/nonexistent/engine.wasm").err().unwrap();
    assert!(matches!(err, BackendError::Unavailable(_)));
}
