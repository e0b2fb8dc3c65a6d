//! Unix-socket backends.
//!
//! [`NativeSocketBackend`] pipelines: any number of framed requests may be
//! on the wire, and a reader thread settles them in submission order.
//! [`NativeSocketSyncBackend`] is pipe-style: one call at a time, and an
//! overlapping call is refused with [`BackendError::Concurrency`].

use std::io::{ErrorKind, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use transport::frame::write_frame;
use transport::FrameDecoder;
use transport_fabric::{
    AsyncBackend, BackendError, BackendKind, BackendResult, CallFuture, FifoQueue, Lifecycle,
    ResponseFuture, SyncBackend,
};

use crate::process::{unique_name, EngineCommand, EngineProcess, NativeOptions};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_INTERVAL: Duration = Duration::from_millis(50);
/// How long a reader that hit EOF waits for the engine's exit status.
const EXIT_GRACE: Duration = Duration::from_millis(200);
const READ_CHUNK: usize = 64 * 1024;

struct Launched {
    process: EngineProcess,
    stream: UnixStream,
    path: PathBuf,
}

/// Spawns the engine on a fresh socket path and connects to it.
fn launch(
    options: &NativeOptions,
    on_exit: impl FnOnce(BackendError) + Send + 'static,
) -> BackendResult<Launched> {
    let dir = options
        .endpoint_dir
        .clone()
        .unwrap_or_else(std::env::temp_dir);
    let name = unique_name();
    let path = dir.join(format!("{name}.sock"));
    if path.exists() {
        std::fs::remove_file(&path)?;
    }

    let command = EngineCommand::msgpack_run(&options.engine_path, &path)
        .threads(options.threads)
        .log_to(options.log_file(&dir, &name));
    let process = EngineProcess::spawn(&command, on_exit)?;
    let connected = process.await_endpoint(
        "engine socket",
        CONNECT_TIMEOUT,
        CONNECT_INTERVAL,
        || {
            if !path.exists() {
                return Ok(None);
            }
            match UnixStream::connect(&path) {
                Ok(stream) => Ok(Some(stream)),
                Err(err) if is_retryable(&err) => Ok(None),
                Err(err) => Err(BackendError::Connection(format!(
                    "failed to connect to {}: {err}",
                    path.display()
                ))),
            }
        },
    );
    let stream = match connected {
        Ok(stream) => stream,
        Err(err) => {
            process.kill();
            let _ = std::fs::remove_file(&path);
            return Err(err);
        }
    };
    info!(pid = process.id(), path = %path.display(), "connected to engine socket");
    Ok(Launched {
        process,
        stream,
        path,
    })
}

fn is_retryable(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::WouldBlock
    )
}

/// What to report once the engine stops answering.
fn lost_engine(process: &EngineProcess, cause: Option<std::io::Error>) -> BackendError {
    if let Some(reason) = process.wait_exit(EXIT_GRACE) {
        return reason.into_error();
    }
    match cause {
        Some(err) => BackendError::Connection(format!("engine socket failed: {err}")),
        None => BackendError::Connection("engine closed the socket".into()),
    }
}

struct SocketShared {
    lifecycle: Lifecycle,
    queue: Arc<FifoQueue>,
    writer: Mutex<UnixStream>,
    process: EngineProcess,
    path: PathBuf,
}

impl SocketShared {
    fn submit(&self, request: &[u8]) -> BackendResult<ResponseFuture> {
        self.lifecycle.ensure_live()?;
        // Queue order must match wire order, so push and write under one lock.
        let mut writer = self.writer.lock();
        let (id, response) = self.queue.push()?;
        if let Err(err) = write_frame(&mut *writer, request) {
            drop(writer);
            self.queue.remove(id);
            let err = lost_engine(&self.process, Some(err));
            self.queue.close(err.clone());
            return Err(err);
        }
        Ok(response)
    }

    fn read_loop(&self, mut stream: UnixStream) {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let cause = loop {
            match stream.read(&mut buf) {
                Ok(0) => break None,
                Ok(n) => {
                    let fed = decoder.feed(&buf[..n], |body| {
                        if !self.queue.resolve_next(Ok(body)) {
                            warn!(path = %self.path.display(), "engine sent an unrequested response");
                        }
                    });
                    if let Err(err) = fed {
                        self.queue.close(BackendError::from(err));
                        return;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => break Some(err),
            }
        };
        if self.lifecycle.is_destroyed() {
            return;
        }
        let err = lost_engine(&self.process, cause);
        let rejected = self.queue.close(err.clone());
        warn!(%err, rejected, "engine socket closed");
    }

    fn shutdown(&self) {
        let rejected = self.queue.close(BackendError::Destroyed);
        if let Err(err) = self.writer.lock().shutdown(Shutdown::Both) {
            debug!(%err, "engine socket already shut down");
        }
        self.process.terminate();
        remove_endpoint(&self.path);
        info!(pid = self.process.id(), rejected, "native socket backend destroyed");
    }
}

fn remove_endpoint(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != ErrorKind::NotFound {
            debug!(path = %path.display(), %err, "could not remove engine endpoint");
        }
    }
}

/// Pipelined engine connection over a Unix socket.
pub struct NativeSocketBackend {
    shared: Arc<SocketShared>,
}

impl NativeSocketBackend {
    pub fn connect(options: &NativeOptions) -> BackendResult<Self> {
        let queue = Arc::new(FifoQueue::new());
        let on_exit = {
            let queue = Arc::clone(&queue);
            move |err: BackendError| {
                queue.close(err);
            }
        };
        let Launched {
            process,
            stream,
            path,
        } = launch(options, on_exit)?;
        let reader = stream.try_clone()?;
        let shared = Arc::new(SocketShared {
            lifecycle: Lifecycle::new(),
            queue,
            writer: Mutex::new(stream),
            process,
            path,
        });

        let reading = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("engine-socket-reader".into())
            .spawn(move || reading.read_loop(reader));
        if let Err(err) = spawned {
            shared.lifecycle.begin_destroy();
            shared.shutdown();
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

impl AsyncBackend for NativeSocketBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeUnixSocket
    }

    fn call(&self, request: Vec<u8>) -> CallFuture {
        match self.shared.submit(&request) {
            Ok(response) => response.boxed(),
            Err(err) => future::ready(Err(err)).boxed(),
        }
    }

    fn destroy(&self) {
        if self.shared.lifecycle.begin_destroy() {
            self.shared.shutdown();
        }
    }
}

impl Drop for NativeSocketBackend {
    fn drop(&mut self) {
        AsyncBackend::destroy(self);
    }
}

struct Pipe {
    stream: UnixStream,
    decoder: FrameDecoder,
    buf: Vec<u8>,
}

impl Pipe {
    fn round_trip(&mut self, request: &[u8]) -> Result<Vec<u8>, Option<std::io::Error>> {
        write_frame(&mut self.stream, request).map_err(Some)?;
        let mut reply = None;
        loop {
            let n = match self.stream.read(&mut self.buf) {
                Ok(0) => return Err(None),
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Some(err)),
            };
            self.decoder
                .feed(&self.buf[..n], |body| reply = Some(body))
                .map_err(|err| Some(std::io::Error::new(ErrorKind::InvalidData, err)))?;
            if let Some(reply) = reply.take() {
                return Ok(reply);
            }
        }
    }
}

/// Pipe-style engine connection: strictly one call at a time.
pub struct NativeSocketSyncBackend {
    lifecycle: Lifecycle,
    pipe: Mutex<Pipe>,
    /// Second handle on the socket so `destroy` can interrupt a blocked call.
    control: UnixStream,
    terminal: Mutex<Option<BackendError>>,
    process: EngineProcess,
    path: PathBuf,
}

impl NativeSocketSyncBackend {
    pub fn connect(options: &NativeOptions) -> BackendResult<Self> {
        let terminal = Mutex::new(None);
        let Launched {
            process,
            stream,
            path,
        } = launch(options, |_| {})?;
        let control = stream.try_clone()?;
        Ok(Self {
            lifecycle: Lifecycle::new(),
            pipe: Mutex::new(Pipe {
                stream,
                decoder: FrameDecoder::new(),
                buf: vec![0; READ_CHUNK],
            }),
            control,
            terminal,
            process,
            path,
        })
    }

    fn fail(&self, err: BackendError) -> BackendError {
        self.terminal.lock().get_or_insert(err).clone()
    }
}

impl SyncBackend for NativeSocketSyncBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::NativeUnixSocket
    }

    fn call(&self, request: &[u8]) -> BackendResult<Vec<u8>> {
        self.lifecycle.ensure_live()?;
        if let Some(err) = self.terminal.lock().clone() {
            return Err(err);
        }
        let mut pipe = self.pipe.try_lock().ok_or_else(|| {
            BackendError::Concurrency(
                "socket backend does not support pipelining; await the previous call".into(),
            )
        })?;
        match pipe.round_trip(request) {
            Ok(reply) => Ok(reply),
            Err(_) if self.lifecycle.is_destroyed() => Err(BackendError::Destroyed),
            Err(cause) => Err(self.fail(lost_engine(&self.process, cause))),
        }
    }

    fn destroy(&self) {
        if !self.lifecycle.begin_destroy() {
            return;
        }
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            debug!(%err, "engine socket already shut down");
        }
        self.process.terminate();
        remove_endpoint(&self.path);
        info!(pid = self.process.id(), "native socket backend destroyed");
    }
}

impl Drop for NativeSocketSyncBackend {
    fn drop(&mut self) {
        SyncBackend::destroy(self);
    }
}
