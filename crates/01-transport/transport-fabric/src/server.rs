use std::borrow::Cow;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::BackendResult;
use crate::message::WireMessage;
use crate::port::{Listener, Socket};

/// Handles the payload of every inbound request.
///
/// A dispatcher may return a view into memory it does not own, such as a
/// module's linear memory; the server copies it before it leaves the call.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch<'a>(&'a self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, String>;
}

impl<F> Dispatch for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, String> + Send + Sync + 'static,
{
    fn dispatch<'a>(&'a self, payload: &'a [u8]) -> Result<Cow<'a, [u8]>, String> {
        self(payload).map(Cow::Owned)
    }
}

/// Reply side of the message-passing transport.
pub struct TransportServer {
    listener: Arc<dyn Listener>,
    shared: Arc<ServerShared>,
}

struct ServerShared {
    dispatch: Box<dyn Dispatch>,
    sockets: Mutex<Vec<Arc<dyn Socket>>>,
}

impl TransportServer {
    pub fn new(listener: Arc<dyn Listener>, dispatch: impl Dispatch) -> Self {
        Self {
            listener,
            shared: Arc::new(ServerShared {
                dispatch: Box::new(dispatch),
                sockets: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn start(&self) -> BackendResult<()> {
        let weak = Arc::downgrade(&self.shared);
        self.listener.open(Box::new(move |socket| {
            if let Some(shared) = weak.upgrade() {
                ServerShared::accept(&shared, socket);
            }
        }))
    }

    /// Stops accepting and closes every registered channel.
    pub fn stop(&self) {
        self.listener.close();
        let sockets = std::mem::take(&mut *self.shared.sockets.lock());
        for socket in sockets {
            socket.close();
        }
    }

    /// Sends `payload` as an event to every open channel; returns how many got it.
    pub fn broadcast(&self, payload: &[u8]) -> usize {
        let sockets: SmallVec<[Arc<dyn Socket>; 4]> =
            self.shared.sockets.lock().iter().cloned().collect();
        let mut delivered = 0;
        for socket in sockets {
            match socket.send(WireMessage::Event {
                payload: payload.to_vec(),
            }) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(%err, "broadcast skipped a channel"),
            }
        }
        delivered
    }

    pub fn socket_count(&self) -> usize {
        self.shared.sockets.lock().len()
    }
}

impl ServerShared {
    fn accept(this: &Arc<Self>, socket: Arc<dyn Socket>) {
        this.sockets.lock().push(Arc::clone(&socket));
        let weak: Weak<ServerShared> = Arc::downgrade(this);
        let me = Arc::clone(&socket);
        let registered = socket.register_handler(Box::new(move |frame| {
            if let Some(shared) = weak.upgrade() {
                shared.handle(&me, frame);
            }
        }));
        if let Err(err) = registered {
            warn!(%err, "could not serve new channel");
            this.remove(&socket);
            socket.close();
        }
    }

    fn handle(&self, socket: &Arc<dyn Socket>, frame: Option<WireMessage>) {
        let Some(message) = frame else {
            self.remove(socket);
            socket.close();
            return;
        };
        let (msg_id, payload) = match message {
            WireMessage::Request { msg_id, payload } => (msg_id, payload),
            other => {
                warn!(msg_id = ?other.msg_id(), "server ignores non-request message");
                return;
            }
        };
        let reply = match self.dispatch.dispatch(&payload) {
            Ok(result) => WireMessage::Response {
                msg_id,
                payload: result.into_owned(),
            },
            Err(error) => WireMessage::Failure { msg_id, error },
        };
        if let Err(err) = socket.send(reply) {
            warn!(msg_id, %err, "reply dropped");
        }
    }

    fn remove(&self, socket: &Arc<dyn Socket>) {
        let target = Arc::as_ptr(socket) as *const ();
        self.sockets
            .lock()
            .retain(|s| Arc::as_ptr(s) as *const () != target);
    }
}

impl Drop for TransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}
