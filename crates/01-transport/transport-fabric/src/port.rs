use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BackendError, BackendResult};
use crate::message::WireMessage;

/// Receives every inbound message; `None` is the close sentinel.
pub type MessageHandler = Box<dyn FnMut(Option<WireMessage>) + Send>;

/// Capabilities a bidirectional message channel must offer.
pub trait Socket: Send + Sync {
    fn send(&self, message: WireMessage) -> BackendResult<()>;

    /// Installs the single inbound handler. Messages sent before registration
    /// are buffered and delivered once it is installed.
    fn register_handler(&self, handler: MessageHandler) -> BackendResult<()>;

    /// Tells the remote end we are closing. Idempotent.
    fn close(&self);
}

/// Client-side factory for new channels.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BackendResult<Arc<dyn Socket>>;
}

/// Server-side source of new channels.
pub trait Listener: Send + Sync {
    fn open(&self, on_socket: Box<dyn FnMut(Arc<dyn Socket>) + Send>) -> BackendResult<()>;
    fn close(&self);
}

type Frame = Option<WireMessage>;

/// One end of an in-process channel between a host thread and a worker.
pub struct WorkerPort {
    name: String,
    tx: Sender<Frame>,
    rx: Mutex<Option<Receiver<Frame>>>,
    closed: AtomicBool,
}

/// Creates two connected ports.
pub fn port_pair(name: &str) -> (WorkerPort, WorkerPort) {
    let (a_tx, a_rx) = unbounded();
    let (b_tx, b_rx) = unbounded();
    (
        WorkerPort::new(format!("{name}/a"), a_tx, b_rx),
        WorkerPort::new(format!("{name}/b"), b_tx, a_rx),
    )
}

impl WorkerPort {
    fn new(name: String, tx: Sender<Frame>, rx: Receiver<Frame>) -> Self {
        Self {
            name,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Socket for WorkerPort {
    fn send(&self, message: WireMessage) -> BackendResult<()> {
        if self.is_closed() {
            return Err(BackendError::transport(format!("port {} is closed", self.name)));
        }
        self.tx
            .send(Some(message))
            .map_err(|_| BackendError::transport(format!("peer of port {} is gone", self.name)))
    }

    fn register_handler(&self, mut handler: MessageHandler) -> BackendResult<()> {
        let rx = self.rx.lock().take().ok_or_else(|| {
            BackendError::transport(format!("port {} already has a handler", self.name))
        })?;
        let name = self.name.clone();
        thread::Builder::new()
            .name(format!("port-{name}"))
            .spawn(move || {
                for frame in rx.iter() {
                    let closing = frame.is_none();
                    handler(frame);
                    if closing {
                        return;
                    }
                }
                // Peer dropped without sending the sentinel.
                debug!(port = %name, "peer disconnected");
                handler(None);
            })?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(None);
        }
    }
}

/// Accepts ports created by the matching [`PortConnector`].
pub struct PortListener {
    name: String,
    incoming: Mutex<Option<Receiver<WorkerPort>>>,
    stop: Mutex<Option<Sender<()>>>,
}

/// Creates worker ports and hands the far end to a [`PortListener`].
pub struct PortConnector {
    name: String,
    tx: Sender<WorkerPort>,
    next: AtomicU64,
}

pub fn port_listener(name: &str) -> (PortListener, PortConnector) {
    let (tx, rx) = unbounded();
    (
        PortListener {
            name: name.to_owned(),
            incoming: Mutex::new(Some(rx)),
            stop: Mutex::new(None),
        },
        PortConnector {
            name: name.to_owned(),
            tx,
            next: AtomicU64::new(0),
        },
    )
}

impl Connector for PortConnector {
    fn connect(&self) -> BackendResult<Arc<dyn Socket>> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let (local, remote) = port_pair(&format!("{}#{n}", self.name));
        self.tx
            .send(remote)
            .map_err(|_| BackendError::unavailable(format!("listener {} is gone", self.name)))?;
        Ok(Arc::new(local))
    }
}

impl Listener for PortListener {
    fn open(&self, mut on_socket: Box<dyn FnMut(Arc<dyn Socket>) + Send>) -> BackendResult<()> {
        let incoming = self.incoming.lock().take().ok_or_else(|| {
            BackendError::transport(format!("listener {} already open", self.name))
        })?;
        let (stop_tx, stop_rx) = unbounded::<()>();
        *self.stop.lock() = Some(stop_tx);
        thread::Builder::new()
            .name(format!("accept-{}", self.name))
            .spawn(move || loop {
                select! {
                    recv(incoming) -> port => match port {
                        Ok(port) => on_socket(Arc::new(port)),
                        Err(_) => return,
                    },
                    recv(stop_rx) -> _ => return,
                }
            })?;
        Ok(())
    }

    fn close(&self) {
        // Dropping the sender disconnects `stop_rx` and ends the accept loop.
        self.stop.lock().take();
    }
}
