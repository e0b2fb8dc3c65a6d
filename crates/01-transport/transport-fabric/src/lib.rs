#![allow(missing_docs)]
//! Backend contract and the message-passing transport.
//!
//! Every engine transport implements [`SyncBackend`] or [`AsyncBackend`].
//! The message-passing half multiplexes requests by id over any channel that
//! implements [`Socket`]; [`WorkerPort`] is the in-process variant used for
//! worker threads.

mod backend;
mod client;
mod error;
mod message;
mod pending;
mod port;
mod server;

pub use backend::{AsyncBackend, BackendKind, CallFuture, Lifecycle, LogSink, SyncBackend};
pub use client::{EventListener, TransportClient};
pub use error::{BackendError, BackendResult};
pub use message::WireMessage;
pub use pending::{FifoQueue, PendingCall, PendingMap, ResponseFuture};
pub use port::{
    port_listener, port_pair, Connector, Listener, MessageHandler, PortConnector, PortListener,
    Socket, WorkerPort,
};
pub use server::{Dispatch, TransportServer};
