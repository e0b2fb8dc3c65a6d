//! In-process engine backends built on a WebAssembly module.
//!
//! The module is reached through [`ModuleInstance`]; arguments are marshalled
//! with the [`ScratchAllocator`]; exports that call asynchronous host imports
//! run through the [`AsyncBridge`]. [`WasmBackend`] runs the module on the
//! calling thread and [`WasmWorkerBackend`] runs instances on worker threads
//! behind the message-passing transport.

mod bridge;
#[cfg(test)]
mod fake;
#[cfg(feature = "wasmtime")]
mod host;
mod module;
mod scratch;
mod wasm;
mod worker;

pub use bridge::{AsyncBridge, BridgePhase, HostFuture, HostValue, ASYNCIFY_DATA_SIZE};
#[cfg(feature = "wasmtime")]
pub use host::{HostData, NoHostData, WasmtimeFactory};
pub use module::{exports, BoxedModule, ExportTable, ModuleInstance, SharedModule};
pub use scratch::{HeapAllocation, ScratchAllocator, WasmArg, SCRATCH_REGION_SIZE};
pub use wasm::{WasmBackend, MSGPACK_SCRATCH_SIZE};
pub use transport_fabric::LogSink;
pub use worker::{
    InstanceSpec, MemoryLimits, ModuleFactory, WasmWorkerBackend, WorkerPool, MAX_THREADS,
};
