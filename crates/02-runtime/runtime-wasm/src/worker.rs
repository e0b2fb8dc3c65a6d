use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use futures::executor::block_on;
use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use transport_fabric::{
    port_listener, AsyncBackend, BackendError, BackendKind, BackendResult, CallFuture, Connector,
    Lifecycle, LogSink, PortConnector, SyncBackend, TransportClient, TransportServer,
};

use crate::bridge::{AsyncBridge, ASYNCIFY_DATA_SIZE};
use crate::module::BoxedModule;
use crate::wasm::{WasmBackend, MSGPACK_SCRATCH_SIZE};

const PAGE_SIZE: u64 = 64 * 1024;

/// Upper bound on module instances in one pool.
pub const MAX_THREADS: usize = 32;

/// Wasm page limits (64 KiB pages).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryLimits {
    pub initial_pages: u32,
    pub maximum_pages: u32,
}

impl Default for MemoryLimits {
    fn default() -> Self {
        Self {
            initial_pages: 33,
            maximum_pages: 65536,
        }
    }
}

impl MemoryLimits {
    pub fn validate(&self) -> BackendResult<()> {
        if self.initial_pages == 0 || self.initial_pages > self.maximum_pages {
            return Err(BackendError::InvalidConfig(format!(
                "memory pages must satisfy 0 < initial ({}) <= maximum ({})",
                self.initial_pages, self.maximum_pages
            )));
        }
        if self.maximum_pages > 65536 {
            return Err(BackendError::InvalidConfig(format!(
                "maximum of {} pages exceeds the 4 GiB wasm32 limit",
                self.maximum_pages
            )));
        }
        for limits in [*self, self.for_worker(1)] {
            let needed = 2 * u64::from(limits.call_buffer_size()) + u64::from(ASYNCIFY_DATA_SIZE);
            if needed > limits.max_bytes() {
                return Err(BackendError::InvalidConfig(format!(
                    "{} pages cannot hold {needed} bytes of call buffers",
                    limits.maximum_pages
                )));
            }
        }
        Ok(())
    }

    fn max_bytes(&self) -> u64 {
        u64::from(self.maximum_pages) * PAGE_SIZE
    }

    /// Size of each msgpack call buffer: an eighth of the maximum memory,
    /// capped at [`MSGPACK_SCRATCH_SIZE`].
    pub fn call_buffer_size(&self) -> u32 {
        let eighth = (self.max_bytes() / 8) & !7;
        u32::try_from(eighth).map_or(MSGPACK_SCRATCH_SIZE, |size| size.min(MSGPACK_SCRATCH_SIZE))
    }

    /// The first worker keeps the full maximum; the rest get a quarter of it.
    pub fn for_worker(&self, index: usize) -> Self {
        if index == 0 {
            return *self;
        }
        Self {
            initial_pages: self.initial_pages,
            maximum_pages: (self.maximum_pages / 4).max(self.initial_pages),
        }
    }
}

/// Everything a factory needs to build one instance.
#[derive(Clone)]
pub struct InstanceSpec {
    pub index: usize,
    pub limits: MemoryLimits,
    /// Reported to the module as its hardware concurrency.
    pub threads: u32,
    pub log: LogSink,
}

/// Builds module instances; one call per worker.
pub trait ModuleFactory: Send + Sync + 'static {
    fn instantiate(&self, spec: &InstanceSpec) -> BackendResult<(BoxedModule, AsyncBridge)>;
}

pub(crate) fn pool_size(threads: usize) -> usize {
    threads.clamp(1, MAX_THREADS)
}

/// Fixed, ordered set of worker threads, each serving one module instance
/// over a worker port.
pub struct WorkerPool {
    workers: Vec<Worker>,
}

struct Worker {
    index: usize,
    connector: Arc<PortConnector>,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        factory: Arc<dyn ModuleFactory>,
        threads: usize,
        limits: MemoryLimits,
    ) -> BackendResult<Self> {
        limits.validate()?;
        let size = pool_size(threads);
        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            workers.push(Worker::spawn(
                Arc::clone(&factory),
                index,
                size as u32,
                limits.for_worker(index),
            )?);
        }
        info!(workers = size, "wasm worker pool ready");
        Ok(Self { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn connector(&self, index: usize) -> Option<Arc<dyn Connector>> {
        self.workers
            .get(index)
            .map(|worker| Arc::clone(&worker.connector) as Arc<dyn Connector>)
    }

    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }
}

impl Worker {
    fn spawn(
        factory: Arc<dyn ModuleFactory>,
        index: usize,
        threads: u32,
        limits: MemoryLimits,
    ) -> BackendResult<Self> {
        let name = format!("wasm-worker-{index}");
        let (listener, connector) = port_listener(&name);
        let (ready_tx, ready_rx) = bounded::<BackendResult<()>>(1);
        let (shutdown_tx, shutdown_rx) = unbounded::<()>();

        let thread = thread::Builder::new().name(name).spawn(move || {
            let (log_tx, log_rx) = unbounded::<String>();
            let spec = InstanceSpec {
                index,
                limits,
                threads,
                log: Arc::new(move |line: &str| {
                    let _ = log_tx.send(line.to_owned());
                }),
            };
            let backend = match factory
                .instantiate(&spec)
                .and_then(|(module, bridge)| WasmBackend::with_limits(module, bridge, &limits))
            {
                Ok(backend) => backend,
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            let dispatcher = backend.clone();
            // Requests on one port arrive one at a time, so each may suspend
            // on host imports through the bridge.
            let server = TransportServer::new(Arc::new(listener), move |payload: &[u8]| {
                block_on(AsyncBackend::call(&dispatcher, payload.to_vec()))
                    .map_err(|err| err.to_string())
            });
            if let Err(err) = server.start() {
                let _ = ready_tx.send(Err(err));
                return;
            }
            let _ = ready_tx.send(Ok(()));
            serve(index, &server, &log_rx, &shutdown_rx);
            server.stop();
            SyncBackend::destroy(&backend);
        })?;

        let mut worker = Self {
            index,
            connector: Arc::new(connector),
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        };
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(worker),
            Ok(Err(err)) => {
                worker.stop();
                Err(err)
            }
            Err(_) => {
                worker.stop();
                Err(BackendError::unavailable(format!(
                    "worker {index} exited during startup"
                )))
            }
        }
    }

    fn stop(&mut self) {
        // Dropping the sender disconnects the worker's shutdown receiver.
        self.shutdown.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(worker = self.index, "worker thread panicked");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Relays module log lines to connected clients until shutdown.
fn serve(index: usize, server: &TransportServer, logs: &Receiver<String>, shutdown: &Receiver<()>) {
    loop {
        select! {
            recv(logs) -> line => match line {
                Ok(line) => {
                    if server.broadcast(line.as_bytes()) == 0 {
                        debug!(worker = index, line = %line, "module log with no listener");
                    }
                }
                Err(_) => {
                    let _ = shutdown.recv();
                    return;
                }
            },
            recv(shutdown) -> _ => return,
        }
    }
}

/// Module instances on worker threads, reached over the message-passing
/// transport. Calls go to the first worker unless addressed explicitly.
pub struct WasmWorkerBackend {
    pool: Mutex<WorkerPool>,
    clients: Vec<TransportClient>,
    lifecycle: Lifecycle,
}

impl WasmWorkerBackend {
    pub fn spawn(
        factory: Arc<dyn ModuleFactory>,
        threads: usize,
        limits: MemoryLimits,
        logger: Option<LogSink>,
    ) -> BackendResult<Self> {
        let pool = WorkerPool::spawn(factory, threads, limits)?;
        let mut clients = Vec::with_capacity(pool.len());
        for index in 0..pool.len() {
            let connector = pool
                .connector(index)
                .ok_or_else(|| BackendError::unavailable(format!("worker {index} is missing")))?;
            let client = TransportClient::new(connector);
            client.open()?;
            let logger = logger.clone();
            client.on_event(move |payload| {
                let line = String::from_utf8_lossy(payload);
                debug!(worker = index, line = %line, "module log");
                if let Some(logger) = &logger {
                    logger(&line);
                }
            });
            clients.push(client);
        }
        Ok(Self {
            pool: Mutex::new(pool),
            clients,
            lifecycle: Lifecycle::new(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.clients.len()
    }

    /// Sends a request to one specific worker.
    pub fn call_on(&self, index: usize, request: Vec<u8>) -> CallFuture {
        if let Err(err) = self.lifecycle.ensure_live() {
            return future::ready(Err(err)).boxed();
        }
        match self.clients.get(index) {
            Some(client) => client.request(request),
            None => future::ready(Err(BackendError::InvalidConfig(format!(
                "no worker {index} in a pool of {}",
                self.clients.len()
            ))))
            .boxed(),
        }
    }
}

impl AsyncBackend for WasmWorkerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WasmWorker
    }

    fn call(&self, request: Vec<u8>) -> CallFuture {
        self.call_on(0, request)
    }

    fn destroy(&self) {
        if !self.lifecycle.begin_destroy() {
            return;
        }
        for client in &self.clients {
            client.close();
        }
        self.pool.lock().shutdown();
        debug!("wasm worker pool shut down");
    }
}

impl Drop for WasmWorkerBackend {
    fn drop(&mut self) {
        self.destroy();
    }
}
