//! Correlation state for outstanding requests.
//!
//! Stream transports answer strictly in submission order and use
//! [`FifoQueue`]; message-passing transports correlate by id and use
//! [`PendingMap`]. Both turn a terminal failure into a rejection of every
//! waiting call and refuse new calls afterwards.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::error::{BackendError, BackendResult};

type Reply = BackendResult<Vec<u8>>;

/// Resolves once the matching response, or a terminal error, arrives.
#[derive(Debug)]
pub struct ResponseFuture {
    rx: oneshot::Receiver<Reply>,
}

impl Future for ResponseFuture {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => Poll::Ready(reply),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(BackendError::transport(
                "pending call dropped without a response",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One outstanding request and the means to settle it.
#[derive(Debug)]
pub struct PendingCall {
    id: u64,
    reply: oneshot::Sender<Reply>,
}

impl PendingCall {
    pub fn new(id: u64) -> (Self, ResponseFuture) {
        let (reply, rx) = oneshot::channel();
        (Self { id, reply }, ResponseFuture { rx })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn settle(self, reply: Reply) {
        // The caller may have dropped its future; nothing to deliver then.
        let _ = self.reply.send(reply);
    }

    pub fn resolve(self, bytes: Vec<u8>) {
        self.settle(Ok(bytes));
    }

    pub fn reject(self, err: BackendError) {
        self.settle(Err(err));
    }
}

#[derive(Debug, Default)]
struct FifoState {
    calls: VecDeque<PendingCall>,
    next_id: u64,
    terminal: Option<BackendError>,
}

/// Callbacks matched to responses purely by arrival order.
#[derive(Debug, Default)]
pub struct FifoQueue {
    inner: Mutex<FifoState>,
}

impl FifoQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a call. Fails with the terminal error once the queue is closed.
    pub fn push(&self) -> BackendResult<(u64, ResponseFuture)> {
        let mut state = self.inner.lock();
        if let Some(err) = &state.terminal {
            return Err(err.clone());
        }
        let id = state.next_id;
        state.next_id += 1;
        let (call, future) = PendingCall::new(id);
        state.calls.push_back(call);
        Ok((id, future))
    }

    /// Settles the oldest call. Returns false when nothing was waiting.
    pub fn resolve_next(&self, reply: Reply) -> bool {
        let call = self.inner.lock().calls.pop_front();
        match call {
            Some(call) => {
                call.settle(reply);
                true
            }
            None => false,
        }
    }

    /// Removes a call that never made it onto the wire.
    pub fn remove(&self, id: u64) -> Option<PendingCall> {
        let mut state = self.inner.lock();
        let index = state.calls.iter().position(|call| call.id == id)?;
        state.calls.remove(index)
    }

    /// Rejects everything queued and refuses later pushes with `err`.
    ///
    /// The first terminal error sticks; returns how many calls were rejected.
    pub fn close(&self, err: BackendError) -> usize {
        let calls = {
            let mut state = self.inner.lock();
            if state.terminal.is_none() {
                state.terminal = Some(err.clone());
            }
            std::mem::take(&mut state.calls)
        };
        let rejected = calls.len();
        for call in calls {
            call.reject(err.clone());
        }
        rejected
    }

    pub fn terminal(&self) -> Option<BackendError> {
        self.inner.lock().terminal.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct MapState {
    calls: HashMap<u64, PendingCall>,
    next_id: u64,
    terminal: Option<BackendError>,
}

/// Calls keyed by a monotonically increasing id.
#[derive(Debug, Default)]
pub struct PendingMap {
    inner: Mutex<MapState>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> BackendResult<(u64, ResponseFuture)> {
        let mut state = self.inner.lock();
        if let Some(err) = &state.terminal {
            return Err(err.clone());
        }
        let id = state.next_id;
        state.next_id += 1;
        let (call, future) = PendingCall::new(id);
        state.calls.insert(id, call);
        Ok((id, future))
    }

    pub fn take(&self, id: u64) -> Option<PendingCall> {
        self.inner.lock().calls.remove(&id)
    }

    /// Same contract as [`FifoQueue::close`].
    pub fn close(&self, err: BackendError) -> usize {
        let calls = {
            let mut state = self.inner.lock();
            if state.terminal.is_none() {
                state.terminal = Some(err.clone());
            }
            std::mem::take(&mut state.calls)
        };
        let rejected = calls.len();
        for (_, call) in calls {
            call.reject(err.clone());
        }
        rejected
    }

    pub fn terminal(&self) -> Option<BackendError> {
        self.inner.lock().terminal.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
