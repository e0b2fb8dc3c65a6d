use std::sync::{Arc, Weak};

use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::CallFuture;
use crate::error::{BackendError, BackendResult};
use crate::message::WireMessage;
use crate::pending::PendingMap;
use crate::port::{Connector, Socket};

pub type EventListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Request side of the message-passing transport.
///
/// Requests get increasing ids and may resolve in any order. Messages without
/// an id are events and go to the registered listeners.
pub struct TransportClient {
    connector: Arc<dyn Connector>,
    shared: Arc<ClientShared>,
}

struct ClientShared {
    socket: Mutex<Option<Arc<dyn Socket>>>,
    pending: PendingMap,
    listeners: Mutex<Vec<EventListener>>,
}

impl TransportClient {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            shared: Arc::new(ClientShared {
                socket: Mutex::new(None),
                pending: PendingMap::new(),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn open(&self) -> BackendResult<()> {
        let socket = self.connector.connect()?;
        let weak: Weak<ClientShared> = Arc::downgrade(&self.shared);
        socket.register_handler(Box::new(move |frame| {
            if let Some(shared) = weak.upgrade() {
                shared.handle(frame);
            }
        }))?;
        *self.shared.socket.lock() = Some(socket);
        Ok(())
    }

    pub fn request(&self, payload: Vec<u8>) -> CallFuture {
        let Some(socket) = self.shared.socket.lock().clone() else {
            let err = self
                .shared
                .pending
                .terminal()
                .unwrap_or_else(|| BackendError::transport("socket is not open"));
            return future::ready(Err(err)).boxed();
        };
        let (msg_id, response) = match self.shared.pending.register() {
            Ok(registered) => registered,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        if let Err(err) = socket.send(WireMessage::Request { msg_id, payload }) {
            if let Some(call) = self.shared.pending.take(msg_id) {
                call.reject(err);
            }
        }
        response.boxed()
    }

    pub fn on_event(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared.listeners.lock().push(Arc::new(listener));
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    /// Closes the channel and fails every outstanding request.
    pub fn close(&self) {
        self.shared.shutdown(BackendError::Destroyed);
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl ClientShared {
    fn handle(&self, frame: Option<WireMessage>) {
        let Some(message) = frame else {
            debug!("remote end closing");
            self.shutdown(BackendError::transport("remote end closed the channel"));
            return;
        };
        match message {
            WireMessage::Response { msg_id, payload } => match self.pending.take(msg_id) {
                Some(call) => call.resolve(payload),
                None => warn!(msg_id, "response for unknown request"),
            },
            WireMessage::Failure { msg_id, error } => match self.pending.take(msg_id) {
                Some(call) => call.reject(BackendError::Execution(error)),
                None => warn!(msg_id, "failure for unknown request"),
            },
            WireMessage::Event { payload } => {
                let listeners = self.listeners.lock().clone();
                for listener in listeners {
                    listener(&payload);
                }
            }
            WireMessage::Request { msg_id, .. } => {
                warn!(msg_id, "client received a request; dropping it");
            }
        }
    }

    fn shutdown(&self, reason: BackendError) {
        if let Some(socket) = self.socket.lock().take() {
            socket.close();
        }
        let rejected = self.pending.close(reason);
        if rejected > 0 {
            debug!(rejected, "failed outstanding requests on close");
        }
        self.listeners.lock().clear();
    }
}
