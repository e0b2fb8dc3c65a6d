//! Shared-memory backends.
//!
//! The sync variant serializes callers on a lock and blocks each one until
//! its response arrives. The async variant pipelines: requests are written
//! as they come and a poller thread settles them in submission order. The
//! poller parks on the outstanding-call counter while it is zero, so an idle
//! backend costs nothing.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use transport::wait::{wait_u32, wake_all, wake_one, PollBackoff};
use transport_fabric::{
    AsyncBackend, BackendError, BackendKind, BackendResult, CallFuture, FifoQueue, Lifecycle,
    ResponseFuture, SyncBackend,
};

use crate::process::{shm_dir, unique_name, EngineCommand, EngineProcess, NativeOptions};
use crate::shm::{try_attach, ShmChannel, ShmCloser, ShmReceiver, ShmSender};

const ATTACH_INTERVAL: Duration = Duration::from_millis(100);
const SYNC_ATTACH_TIMEOUT: Duration = Duration::from_secs(3);
const ASYNC_ATTACH_TIMEOUT: Duration = Duration::from_secs(5);
/// Ring size of the sync variant when none is configured.
pub const SYNC_RING_SIZE: u32 = 1024 * 1024;
/// Ring size of the async variant when none is configured.
pub const ASYNC_RING_SIZE: u32 = 4 * 1024 * 1024;

struct Attached {
    process: EngineProcess,
    channel: ShmChannel,
    path: PathBuf,
}

/// Spawns the engine on a fresh region name and attaches to it.
fn launch(
    options: &NativeOptions,
    ring_args: bool,
    attach_timeout: Duration,
    on_exit: impl FnOnce(BackendError) + Send + 'static,
) -> BackendResult<Attached> {
    if options.max_clients == 0 {
        return Err(BackendError::InvalidConfig(
            "max_clients must be at least 1".into(),
        ));
    }
    let dir = options.endpoint_dir.clone().unwrap_or_else(shm_dir);
    let name = unique_name();
    let path = dir.join(&name);
    let _ = std::fs::remove_file(&path);

    let mut input = path.clone().into_os_string();
    input.push(".shm");
    let mut command = EngineCommand::msgpack_run(&options.engine_path, input)
        .arg("--max-clients")
        .arg(options.max_clients.to_string())
        // The engine defaults to a single thread in shared-memory mode.
        .threads(Some(options.threads.unwrap_or(1)))
        .log_to(options.log_file(&dir, &name));
    if ring_args {
        let ring = options.ring_size.unwrap_or(ASYNC_RING_SIZE).to_string();
        command = command
            .arg("--request-ring-size")
            .arg(&ring)
            .arg("--response-ring-size")
            .arg(&ring);
    } else if let Some(ring) = options.ring_size {
        command = command
            .arg("--request-ring-size")
            .arg(ring.to_string())
            .arg("--response-ring-size")
            .arg(ring.to_string());
    }

    let process = EngineProcess::spawn(&command, on_exit)?;
    let attached = process.await_endpoint(
        "engine shared memory",
        attach_timeout,
        ATTACH_INTERVAL,
        || try_attach(&path),
    );
    match attached {
        Ok(channel) => {
            info!(
                pid = process.id(),
                path = %path.display(),
                slot = channel.slot(),
                "attached to engine shared memory"
            );
            Ok(Attached {
                process,
                channel,
                path,
            })
        }
        Err(err) => {
            process.kill();
            let _ = std::fs::remove_file(&path);
            Err(err)
        }
    }
}

fn release(closer: &ShmCloser, process: &EngineProcess, path: &Path) {
    closer.close();
    process.terminate();
    let _ = std::fs::remove_file(path);
}

/// Shared-memory engine connection that blocks the caller.
pub struct NativeShmSyncBackend {
    lifecycle: Lifecycle,
    channel: Mutex<(ShmSender, ShmReceiver)>,
    closer: ShmCloser,
    terminal: Mutex<Option<BackendError>>,
    process: EngineProcess,
    path: PathBuf,
}

impl NativeShmSyncBackend {
    pub fn connect(options: &NativeOptions) -> BackendResult<Self> {
        let Attached {
            process,
            channel,
            path,
        } = launch(options, false, SYNC_ATTACH_TIMEOUT, |_| {})?;
        let (sender, receiver, closer) = channel.split();
        Ok(Self {
            lifecycle: Lifecycle::new(),
            channel: Mutex::new((sender, receiver)),
            closer,
            terminal: Mutex::new(None),
            process,
            path,
        })
    }

    fn alive(&self) -> BackendResult<()> {
        self.lifecycle.ensure_live()?;
        self.process.ensure_running()
    }
}

impl SyncBackend for NativeShmSyncBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeSharedMemory
    }

    fn call(&self, request: &[u8]) -> BackendResult<Vec<u8>> {
        self.lifecycle.ensure_live()?;
        let mut channel = self.channel.lock();
        if let Some(err) = self.terminal.lock().clone() {
            return Err(err);
        }
        let (sender, receiver) = &mut *channel;
        let alive = || self.alive();
        let result = sender
            .send(request, &alive)
            .and_then(|()| receiver.recv(&alive));
        match result {
            Ok(reply) => Ok(reply),
            Err(BackendError::Destroyed) => Err(BackendError::Destroyed),
            Err(_) if self.lifecycle.is_destroyed() => Err(BackendError::Destroyed),
            Err(err) => Err(self.terminal.lock().get_or_insert(err).clone()),
        }
    }

    fn destroy(&self) {
        if self.lifecycle.begin_destroy() {
            release(&self.closer, &self.process, &self.path);
            info!(pid = self.process.id(), "native shared-memory backend destroyed");
        }
    }
}

impl Drop for NativeShmSyncBackend {
    fn drop(&mut self) {
        SyncBackend::destroy(self);
    }
}

struct ShmShared {
    lifecycle: Lifecycle,
    queue: Arc<FifoQueue>,
    sender: Mutex<ShmSender>,
    /// Calls written but not yet answered; the poller parks while it is zero.
    outstanding: AtomicU32,
    closer: ShmCloser,
    process: EngineProcess,
    path: PathBuf,
}

impl ShmShared {
    fn alive(&self) -> BackendResult<()> {
        self.lifecycle.ensure_live()?;
        self.process.ensure_running()
    }

    fn submit(&self, request: &[u8]) -> BackendResult<ResponseFuture> {
        self.lifecycle.ensure_live()?;
        let mut sender = self.sender.lock();
        let (id, response) = self.queue.push()?;
        if self.outstanding.fetch_add(1, Ordering::AcqRel) == 0 {
            wake_one(&self.outstanding);
        }
        if let Err(err) = sender.send(request, &|| self.alive()) {
            drop(sender);
            self.queue.remove(id);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            self.queue.close(err.clone());
            return Err(err);
        }
        Ok(response)
    }

    fn poll_loop(&self, mut receiver: ShmReceiver) {
        let mut backoff = PollBackoff::new();
        loop {
            if self.lifecycle.is_destroyed() {
                return;
            }
            if self.outstanding.load(Ordering::Acquire) == 0 {
                wait_u32(&self.outstanding, 0);
                backoff.reset();
                continue;
            }
            match receiver.try_recv() {
                Ok(Some(reply)) => {
                    self.outstanding.fetch_sub(1, Ordering::AcqRel);
                    if !self.queue.resolve_next(Ok(reply)) {
                        warn!(path = %self.path.display(), "engine sent an unrequested response");
                    }
                    backoff.reset();
                }
                Ok(None) => {
                    if let Err(err) = self.process.ensure_running() {
                        self.fail(err);
                        return;
                    }
                    backoff.snooze();
                }
                Err(err) => {
                    if !self.lifecycle.is_destroyed() {
                        self.fail(err);
                    }
                    return;
                }
            }
        }
    }

    fn fail(&self, err: BackendError) {
        let rejected = self.queue.close(err.clone());
        warn!(%err, rejected, "engine shared memory failed");
    }
}

/// Pipelined shared-memory engine connection.
pub struct NativeShmBackend {
    shared: Arc<ShmShared>,
}

impl NativeShmBackend {
    pub fn connect(options: &NativeOptions) -> BackendResult<Self> {
        let queue = Arc::new(FifoQueue::new());
        let on_exit = {
            let queue = Arc::clone(&queue);
            move |err: BackendError| {
                queue.close(err);
            }
        };
        let Attached {
            process,
            channel,
            path,
        } = launch(options, true, ASYNC_ATTACH_TIMEOUT, on_exit)?;
        let (sender, receiver, closer) = channel.split();
        let shared = Arc::new(ShmShared {
            lifecycle: Lifecycle::new(),
            queue,
            sender: Mutex::new(sender),
            outstanding: AtomicU32::new(0),
            closer,
            process,
            path,
        });

        let polling = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("engine-shm-poller".into())
            .spawn(move || polling.poll_loop(receiver));
        if let Err(err) = spawned {
            AsyncBackend::destroy(&Self { shared });
            return Err(err.into());
        }
        Ok(Self { shared })
    }

    pub fn pending_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn engine_pid(&self) -> u32 {
        self.shared.process.id()
    }
}

impl AsyncBackend for NativeShmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeSharedMemory
    }

    fn call(&self, request: Vec<u8>) -> CallFuture {
        match self.shared.submit(&request) {
            Ok(response) => response.boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    fn destroy(&self) {
        let shared = &self.shared;
        if !shared.lifecycle.begin_destroy() {
            return;
        }
        let rejected = shared.queue.close(BackendError::Destroyed);
        // Bump past zero so a poller about to park sees the change.
        shared.outstanding.fetch_add(1, Ordering::AcqRel);
        wake_all(&shared.outstanding);
        release(&shared.closer, &shared.process, &shared.path);
        debug!(rejected, "rejected pending shared-memory calls");
        info!(pid = shared.process.id(), "native shared-memory backend destroyed");
    }
}

impl Drop for NativeShmBackend {
    fn drop(&mut self) {
        AsyncBackend::destroy(self);
    }
}
