use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{BackendError, BackendResult};

/// Deferred result of an asynchronous call.
pub type CallFuture = BoxFuture<'static, BackendResult<Vec<u8>>>;

/// Receives human-readable diagnostic lines from a backend and its engine.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// The transport families a session can run on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    Wasm,
    WasmWorker,
    NativeUnixSocket,
    NativeSharedMemory,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Wasm,
        BackendKind::WasmWorker,
        BackendKind::NativeUnixSocket,
        BackendKind::NativeSharedMemory,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Wasm => "wasm",
            BackendKind::WasmWorker => "wasm-worker",
            BackendKind::NativeUnixSocket => "native-unix-socket",
            BackendKind::NativeSharedMemory => "native-shared-memory",
        }
    }

    /// WASM-family backends need reference data pushed in before first use.
    pub fn is_wasm_family(self) -> bool {
        matches!(self, BackendKind::Wasm | BackendKind::WasmWorker)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| BackendError::InvalidConfig(format!("unknown backend `{s}`")))
    }
}

/// Blocking call contract.
///
/// `destroy` may be called any number of times; after the first call every
/// `call` fails with [`BackendError::Destroyed`] or the backend's terminal error.
pub trait SyncBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn call(&self, request: &[u8]) -> BackendResult<Vec<u8>>;
    fn destroy(&self);
}

/// Deferred call contract with the same destroy rules as [`SyncBackend`].
pub trait AsyncBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn call(&self, request: Vec<u8>) -> CallFuture;
    fn destroy(&self);
}

/// One-way live → destroyed switch shared by the backends.
#[derive(Debug, Default)]
pub struct Lifecycle {
    destroyed: AtomicBool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_live(&self) -> BackendResult<()> {
        if self.is_destroyed() {
            return Err(BackendError::Destroyed);
        }
        Ok(())
    }

    /// Returns true for exactly one caller; teardown runs only on that path.
    pub fn begin_destroy(&self) -> bool {
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}
