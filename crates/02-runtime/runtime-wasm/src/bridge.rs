//! Suspend/resume bridge for exports that call asynchronous host imports.
//!
//! The module is built with stack-switching exports (`asyncify_*`). When a
//! wrapped import is entered it starts the host operation and asks the module
//! to unwind; the driving call then awaits the host result, rewinds the
//! module and re-enters the export, at which point the import returns the
//! stored result and execution continues where it left off.
//!
//! ```text
//! Idle --import--> Unwinding --export returns--> AwaitingHost
//!   ^                                                 |
//!   +--import returns result <-- Rewinding <--result--+
//! ```

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, trace};
use transport_fabric::{BackendError, BackendResult};

use crate::module::{exports, ModuleInstance, SharedModule};
use crate::scratch::len_u32;

/// Size of the unwind buffer, header included.
pub const ASYNCIFY_DATA_SIZE: u32 = 16 * 1024;

/// What an asynchronous import produces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostValue {
    /// Returned to the module as-is.
    Word(u32),
    /// Copied into a fresh heap block; the module receives the pointer.
    Bytes(Vec<u8>),
}

pub type HostFuture = BoxFuture<'static, BackendResult<HostValue>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BridgePhase {
    Idle,
    Unwinding,
    AwaitingHost,
    Rewinding,
}

struct BridgeState {
    phase: BridgePhase,
    data_addr: Option<u32>,
    in_flight: bool,
    pending: Option<HostFuture>,
    result: Option<HostValue>,
}

impl Default for BridgeState {
    fn default() -> Self {
        Self {
            phase: BridgePhase::Idle,
            data_addr: None,
            in_flight: false,
            pending: None,
            result: None,
        }
    }
}

/// Drives at most one suspended export at a time.
#[derive(Clone, Default)]
pub struct AsyncBridge {
    state: Arc<Mutex<BridgeState>>,
}

impl AsyncBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the unwind buffer and writes its `[start, end)` header.
    pub fn init(&self, module: &mut dyn ModuleInstance) -> BackendResult<()> {
        let addr = module.call(exports::MALLOC, &[ASYNCIFY_DATA_SIZE])?;
        if addr == 0 {
            return Err(BackendError::wasm("could not allocate the asyncify buffer"));
        }
        module.write_u32_le(addr, addr + 8)?;
        module.write_u32_le(addr + 4, addr + ASYNCIFY_DATA_SIZE)?;
        self.state.lock().data_addr = Some(addr);
        Ok(())
    }

    pub fn release(&self, module: &mut dyn ModuleInstance) -> BackendResult<()> {
        match self.state.lock().data_addr.take() {
            Some(addr) => module.call(exports::FREE, &[addr]).map(drop),
            None => Ok(()),
        }
    }

    pub fn phase(&self) -> BridgePhase {
        self.state.lock().phase
    }

    /// True while a bridged call is running or suspended.
    pub fn is_busy(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Turns a host operation into an import the module can call synchronously.
    pub fn wrap_import<F>(
        &self,
        name: &'static str,
        start: F,
    ) -> impl Fn(&mut dyn ModuleInstance, &[u32]) -> BackendResult<u32> + Send + Sync + 'static
    where
        F: Fn(&[u32]) -> HostFuture + Send + Sync + 'static,
    {
        let state = Arc::clone(&self.state);
        move |module: &mut dyn ModuleInstance, args: &[u32]| {
            let mut st = state.lock();
            match st.phase {
                BridgePhase::Idle => {
                    if !st.in_flight {
                        return Err(BackendError::wasm(format!(
                            "async import {name} reached outside a bridged call"
                        )));
                    }
                    let data_addr = st
                        .data_addr
                        .ok_or_else(|| BackendError::wasm("async bridge used before init"))?;
                    st.pending = Some(start(args));
                    st.phase = BridgePhase::Unwinding;
                    drop(st);
                    trace!(import = name, "unwinding");
                    module.call(exports::START_UNWIND, &[data_addr])?;
                    Ok(0)
                }
                BridgePhase::Rewinding => {
                    let value = st
                        .result
                        .take()
                        .ok_or_else(|| BackendError::wasm("rewound without a host result"))?;
                    st.phase = BridgePhase::Idle;
                    drop(st);
                    module.call(exports::STOP_REWIND, &[])?;
                    match value {
                        HostValue::Word(word) => Ok(word),
                        HostValue::Bytes(bytes) => {
                            let ptr = module.call(exports::MALLOC, &[len_u32(bytes.len())?])?;
                            module.write(ptr, &bytes)?;
                            Ok(ptr)
                        }
                    }
                }
                phase => Err(BackendError::Concurrency(format!(
                    "async import {name} entered while {phase:?}"
                ))),
            }
        }
    }

    /// Calls `name`, suspending across every async import it reaches.
    pub async fn call(&self, module: &SharedModule, name: &str, args: &[u32]) -> BackendResult<u32> {
        let data_addr = {
            let mut st = self.state.lock();
            if st.in_flight {
                return Err(BackendError::Concurrency(format!(
                    "can only handle one async call at a time: {name}({args:?})"
                )));
            }
            let addr = st
                .data_addr
                .ok_or_else(|| BackendError::wasm("async bridge used before init"))?;
            st.in_flight = true;
            addr
        };
        let _reset = InFlight(&self.state);

        let mut result = module.lock().call(name, args)?;
        loop {
            let pending = {
                let mut st = self.state.lock();
                match st.pending.take() {
                    Some(future) => {
                        st.phase = BridgePhase::AwaitingHost;
                        future
                    }
                    None => break,
                }
            };
            module.lock().call(exports::STOP_UNWIND, &[])?;
            debug!(export = name, "suspended on host import");
            let value = pending.await?;
            {
                let mut st = self.state.lock();
                st.result = Some(value);
                st.phase = BridgePhase::Rewinding;
            }
            result = {
                let mut module = module.lock();
                module.call(exports::START_REWIND, &[data_addr])?;
                module.call(name, args)?
            };
        }
        Ok(result)
    }
}

/// Returns the bridge to idle however the driving call ends.
struct InFlight<'a>(&'a Mutex<BridgeState>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut st = self.0.lock();
        st.in_flight = false;
        st.phase = BridgePhase::Idle;
        st.pending = None;
        st.result = None;
    }
}
