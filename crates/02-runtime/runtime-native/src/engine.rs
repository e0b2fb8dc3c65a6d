//! Engine side of the native transports.
//!
//! A real engine implements these loops itself; they live here so the
//! backends can be exercised against `mock-engine` and so the wire contract
//! is written down once in code.

use std::ffi::OsStr;
use std::io::{ErrorKind, Read};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use transport::frame::write_frame;
use transport::wait::PollBackoff;
use transport::FrameDecoder;
use transport_fabric::{BackendError, BackendResult};

use crate::shm::{ShmLayout, ShmServer};

const PARENT_POLL: Duration = Duration::from_millis(500);

/// Where `--input` asks the engine to listen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Socket(PathBuf),
    /// Region path with the `.shm` suffix removed.
    SharedMemory(PathBuf),
}

impl Endpoint {
    pub fn parse(input: &Path) -> BackendResult<Self> {
        match input.extension().and_then(OsStr::to_str) {
            Some("sock") => Ok(Endpoint::Socket(input.to_path_buf())),
            Some("shm") => Ok(Endpoint::SharedMemory(input.with_extension(""))),
            _ => Err(BackendError::InvalidConfig(format!(
                "input {} names neither a .sock nor a .shm endpoint",
                input.display()
            ))),
        }
    }
}

/// What the engine does with one request. `None` drops the connection
/// without answering.
pub trait Handler {
    fn handle(&mut self, request: Vec<u8>) -> Option<Vec<u8>>;
}

impl<F: FnMut(Vec<u8>) -> Option<Vec<u8>>> Handler for F {
    fn handle(&mut self, request: Vec<u8>) -> Option<Vec<u8>> {
        self(request)
    }
}

/// Accepts connections on `path` one after another and answers each
/// request in arrival order. Returns when the listener fails.
pub fn serve_socket(path: &Path, handler: &mut dyn Handler) -> BackendResult<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "engine listening on socket");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(err) = serve_connection(stream, handler) {
                    warn!(%err, "engine connection failed");
                }
            }
            Err(err) => {
                let _ = std::fs::remove_file(path);
                return Err(err.into());
            }
        }
    }
    Ok(())
}

fn serve_connection(mut stream: UnixStream, handler: &mut dyn Handler) -> BackendResult<()> {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut requests = Vec::new();
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                debug!("engine connection closed by host");
                return Ok(());
            }
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        decoder.feed(&buf[..n], |request| requests.push(request))?;
        for request in requests.drain(..) {
            match handler.handle(request) {
                Some(response) => write_frame(&mut stream, &response)?,
                None => return Ok(()),
            }
        }
    }
}

/// Publishes a region at `path` and serves every client slot round-robin
/// until `handler` declines a request or the process is stopped.
pub fn serve_shm(path: &Path, layout: ShmLayout, handler: &mut dyn Handler) -> BackendResult<()> {
    let mut server = ShmServer::create(path, layout)?;
    info!(path = %path.display(), ?layout, "engine listening on shared memory");
    let running = || -> BackendResult<()> { Ok(()) };
    let mut backoff = PollBackoff::with_max_sleep(Duration::from_millis(1));
    loop {
        for slot in server.accept()? {
            debug!(slot, "shared-memory client attached");
        }
        let mut progressed = false;
        for slot in 0..layout.max_clients {
            let Some(channel) = server.channel(slot) else {
                continue;
            };
            let request = match channel.receiver.try_recv() {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(err) => {
                    debug!(slot, %err, "shared-memory client gone");
                    channel.closer().close();
                    continue;
                }
            };
            progressed = true;
            let Some(response) = handler.handle(request) else {
                return Ok(());
            };
            if let Err(err) = channel.sender.send(&response, &running) {
                warn!(slot, %err, "dropping shared-memory client");
                channel.closer().close();
            }
        }
        if progressed {
            backoff.reset();
        } else {
            backoff.snooze();
        }
    }
}

/// Calls `on_orphaned` once the process that started us has gone away.
pub fn watch_parent(on_orphaned: impl FnOnce() + Send + 'static) -> BackendResult<()> {
    let parent = std::os::unix::process::parent_id();
    thread::Builder::new()
        .name("parent-watch".into())
        .spawn(move || {
            while std::os::unix::process::parent_id() == parent {
                thread::sleep(PARENT_POLL);
            }
            on_orphaned();
        })?;
    Ok(())
}
