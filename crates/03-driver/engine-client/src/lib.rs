//! Entry point for driving an engine.
//!
//! [`BackendFactory`] turns [`BackendOptions`] into one live backend: an
//! in-process module ([`BackendKind::Wasm`]), a pool of module workers
//! ([`BackendKind::WasmWorker`]), or a native engine process reached over a
//! Unix socket or shared memory. Every backend answers the same
//! `call(request) -> response` contract, so callers only pick a kind (or let
//! the factory pick) and never see the transport.

mod factory;
mod options;
mod reference;
mod singleton;

pub use factory::{BackendFactory, EngineBackend, EngineSyncBackend, Environment};
pub use options::{BackendOptions, MemoryOptions, ENV_ENGINE_BINARY_PATH, ENV_HARDWARE_CONCURRENCY};
pub use reference::{ReferenceData, StaticReferenceData};
pub use singleton::{
    destroy_singleton, destroy_sync_singleton, init_singleton, init_singleton_with,
    init_sync_singleton, init_sync_singleton_with, singleton, sync_singleton,
};
pub use transport_fabric::{
    AsyncBackend, BackendError, BackendKind, BackendResult, CallFuture, LogSink, SyncBackend,
};

/// Builds an asynchronous backend for `options` after applying environment
/// overrides.
pub fn connect(options: BackendOptions) -> BackendResult<EngineBackend> {
    BackendFactory::new(options.apply_env()?).create_async()
}

/// Blocking counterpart of [`connect`].
pub fn connect_sync(options: BackendOptions) -> BackendResult<EngineSyncBackend> {
    BackendFactory::new(options.apply_env()?).create_sync()
}
