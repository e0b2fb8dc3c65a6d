//! Backend construction with explicit-or-fallback selection.
//!
//! A named backend is built exactly or the call fails. Without a name the
//! factory walks a chain for the current environment and logs every step it
//! skips:
//!
//! | mode  | host                                  | browser       |
//! |-------|---------------------------------------|---------------|
//! | async | `native-unix-socket` → `wasm`         | `wasm-worker` |
//! | sync  | `native-shared-memory` → `wasm`       | `wasm`        |

use std::path::Path;
use std::sync::Arc;

use runtime_wasm::{
    InstanceSpec, LogSink, MemoryLimits, ModuleFactory, WasmBackend, WasmWorkerBackend,
};
use tracing::{debug, info, warn};
use transport_fabric::{
    AsyncBackend, BackendError, BackendKind, BackendResult, CallFuture, SyncBackend,
};

#[cfg(unix)]
use runtime_native::{
    NativeOptions, NativeShmBackend, NativeShmSyncBackend, NativeSocketBackend,
    NativeSocketSyncBackend,
};
#[cfg(feature = "wasmtime")]
use runtime_wasm::{HostData, WasmtimeFactory};

use crate::options::BackendOptions;
use crate::reference::{self, ReferenceData};

/// Where the client runs; decides the fallback chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    /// A process that may spawn a native engine.
    Host,
    /// A wasm32 embedding that can only run modules.
    Browser,
}

impl Environment {
    pub fn detect() -> Self {
        if cfg!(target_arch = "wasm32") {
            Environment::Browser
        } else {
            Environment::Host
        }
    }

    fn async_chain(self) -> &'static [BackendKind] {
        match self {
            Environment::Host => &[BackendKind::NativeUnixSocket, BackendKind::Wasm],
            Environment::Browser => &[BackendKind::WasmWorker],
        }
    }

    fn sync_chain(self) -> &'static [BackendKind] {
        match self {
            Environment::Host => &[BackendKind::NativeSharedMemory, BackendKind::Wasm],
            Environment::Browser => &[BackendKind::Wasm],
        }
    }
}

/// A live asynchronous backend of any kind.
pub enum EngineBackend {
    Wasm(WasmBackend),
    WasmWorker(WasmWorkerBackend),
    #[cfg(unix)]
    NativeSocket(NativeSocketBackend),
    #[cfg(unix)]
    NativeShm(NativeShmBackend),
}

impl EngineBackend {
    fn as_dyn(&self) -> &dyn AsyncBackend {
        match self {
            EngineBackend::Wasm(backend) => backend,
            EngineBackend::WasmWorker(backend) => backend,
            #[cfg(unix)]
            EngineBackend::NativeSocket(backend) => backend,
            #[cfg(unix)]
            EngineBackend::NativeShm(backend) => backend,
        }
    }
}

impl AsyncBackend for EngineBackend {
    fn kind(&self) -> BackendKind {
        self.as_dyn().kind()
    }

    fn call(&self, request: Vec<u8>) -> CallFuture {
        self.as_dyn().call(request)
    }

    fn destroy(&self) {
        self.as_dyn().destroy()
    }
}

/// A live blocking backend of any kind.
pub enum EngineSyncBackend {
    Wasm(WasmBackend),
    #[cfg(unix)]
    NativeSocket(NativeSocketSyncBackend),
    #[cfg(unix)]
    NativeShm(NativeShmSyncBackend),
}

impl EngineSyncBackend {
    fn as_dyn(&self) -> &dyn SyncBackend {
        match self {
            EngineSyncBackend::Wasm(backend) => backend,
            #[cfg(unix)]
            EngineSyncBackend::NativeSocket(backend) => backend,
            #[cfg(unix)]
            EngineSyncBackend::NativeShm(backend) => backend,
        }
    }
}

impl SyncBackend for EngineSyncBackend {
    fn kind(&self) -> BackendKind {
        self.as_dyn().kind()
    }

    fn call(&self, request: &[u8]) -> BackendResult<Vec<u8>> {
        self.as_dyn().call(request)
    }

    fn destroy(&self) {
        self.as_dyn().destroy()
    }
}

/// Builds backends from [`BackendOptions`].
pub struct BackendFactory {
    options: BackendOptions,
    environment: Environment,
    modules: Option<Arc<dyn ModuleFactory>>,
    #[cfg(feature = "wasmtime")]
    host_data: Option<Arc<dyn HostData>>,
    reference: Option<Arc<dyn ReferenceData>>,
}

impl BackendFactory {
    pub fn new(options: BackendOptions) -> Self {
        Self {
            options,
            environment: Environment::detect(),
            modules: None,
            #[cfg(feature = "wasmtime")]
            host_data: None,
            reference: None,
        }
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Overrides how WASM-family backends get their module instances.
    pub fn with_module_factory(mut self, modules: Arc<dyn ModuleFactory>) -> Self {
        self.modules = Some(modules);
        self
    }

    /// Source for the module's asynchronous reference-data imports.
    #[cfg(feature = "wasmtime")]
    pub fn with_host_data(mut self, data: Arc<dyn HostData>) -> Self {
        self.host_data = Some(data);
        self
    }

    /// Sent once through every new WASM-family backend before it is returned.
    pub fn with_reference_data(mut self, data: Arc<dyn ReferenceData>) -> Self {
        self.reference = Some(data);
        self
    }

    pub fn options(&self) -> &BackendOptions {
        &self.options
    }

    pub fn create_async(&self) -> BackendResult<EngineBackend> {
        self.options.validate()?;
        let backend = match self.options.backend {
            Some(kind) => self.build_async(kind)?,
            None => self.first_available(self.environment.async_chain(), |kind| {
                self.build_async(kind)
            })?,
        };
        self.announce(backend.kind());
        Ok(backend)
    }

    pub fn create_sync(&self) -> BackendResult<EngineSyncBackend> {
        self.options.validate()?;
        let backend = match self.options.backend {
            Some(kind) => self.build_sync(kind)?,
            None => self.first_available(self.environment.sync_chain(), |kind| {
                self.build_sync(kind)
            })?,
        };
        self.announce(backend.kind());
        Ok(backend)
    }

    fn announce(&self, kind: BackendKind) {
        info!(backend = %kind, "engine backend ready");
        self.options.log(&format!("using {kind} backend"));
    }

    fn first_available<T>(
        &self,
        chain: &[BackendKind],
        mut build: impl FnMut(BackendKind) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut last = BackendError::unavailable("no backend candidates for this environment");
        for (i, &kind) in chain.iter().enumerate() {
            match build(kind) {
                Ok(backend) => return Ok(backend),
                Err(err) => {
                    match chain.get(i + 1) {
                        Some(next) => {
                            warn!(backend = %kind, %err, fallback = %next, "backend failed, falling back");
                            self.options
                                .log(&format!("{kind} backend failed ({err}); falling back to {next}"));
                        }
                        None => warn!(backend = %kind, %err, "last backend candidate failed"),
                    }
                    last = err;
                }
            }
        }
        Err(last)
    }

    fn build_async(&self, kind: BackendKind) -> BackendResult<EngineBackend> {
        debug!(backend = %kind, "creating async backend");
        let backend = match kind {
            BackendKind::Wasm => EngineBackend::Wasm(self.wasm()?),
            BackendKind::WasmWorker => EngineBackend::WasmWorker(WasmWorkerBackend::spawn(
                self.module_factory()?,
                self.options.effective_threads(),
                MemoryLimits::from(self.options.memory),
                self.options.logger.clone(),
            )?),
            #[cfg(unix)]
            BackendKind::NativeUnixSocket => {
                EngineBackend::NativeSocket(NativeSocketBackend::connect(&self.native()?)?)
            }
            #[cfg(unix)]
            BackendKind::NativeSharedMemory => {
                EngineBackend::NativeShm(NativeShmBackend::connect(&self.native()?)?)
            }
            #[cfg(not(unix))]
            BackendKind::NativeUnixSocket | BackendKind::NativeSharedMemory => {
                return Err(no_native(kind))
            }
        };
        if kind.is_wasm_family() {
            if let Err(err) = reference::init_async(self.reference.as_deref(), &backend) {
                backend.destroy();
                return Err(err);
            }
        }
        Ok(backend)
    }

    fn build_sync(&self, kind: BackendKind) -> BackendResult<EngineSyncBackend> {
        debug!(backend = %kind, "creating sync backend");
        let backend = match kind {
            BackendKind::Wasm => EngineSyncBackend::Wasm(self.wasm()?),
            BackendKind::WasmWorker => {
                return Err(BackendError::InvalidConfig(
                    "wasm-worker backends only exist in async mode".into(),
                ))
            }
            #[cfg(unix)]
            BackendKind::NativeUnixSocket => {
                EngineSyncBackend::NativeSocket(NativeSocketSyncBackend::connect(&self.native()?)?)
            }
            #[cfg(unix)]
            BackendKind::NativeSharedMemory => {
                EngineSyncBackend::NativeShm(NativeShmSyncBackend::connect(&self.native()?)?)
            }
            #[cfg(not(unix))]
            BackendKind::NativeUnixSocket | BackendKind::NativeSharedMemory => {
                return Err(no_native(kind))
            }
        };
        if kind.is_wasm_family() {
            if let Err(err) = reference::init_sync(self.reference.as_deref(), &backend) {
                backend.destroy();
                return Err(err);
            }
        }
        Ok(backend)
    }

    fn wasm(&self) -> BackendResult<WasmBackend> {
        let spec = InstanceSpec {
            index: 0,
            limits: MemoryLimits::from(self.options.memory),
            threads: self.options.effective_threads() as u32,
            log: self.log_sink(),
        };
        let (module, bridge) = self.module_factory()?.instantiate(&spec)?;
        WasmBackend::with_limits(module, bridge, &spec.limits)
    }

    fn module_factory(&self) -> BackendResult<Arc<dyn ModuleFactory>> {
        if let Some(modules) = &self.modules {
            return Ok(Arc::clone(modules));
        }
        match &self.options.wasm_path {
            Some(path) => self.load_module(path),
            None => Err(BackendError::unavailable(
                "no wasm module configured; set wasm_path or supply a module factory",
            )),
        }
    }

    #[cfg(feature = "wasmtime")]
    fn load_module(&self, path: &Path) -> BackendResult<Arc<dyn ModuleFactory>> {
        let mut factory = WasmtimeFactory::from_file(path)?;
        if let Some(data) = &self.host_data {
            factory = factory.with_host_data(Arc::clone(data));
        }
        Ok(Arc::new(factory))
    }

    #[cfg(not(feature = "wasmtime"))]
    fn load_module(&self, path: &Path) -> BackendResult<Arc<dyn ModuleFactory>> {
        Err(BackendError::unavailable(format!(
            "cannot load {} without the wasmtime feature",
            path.display()
        )))
    }

    /// Module log lines go to the caller's logger, or to `tracing`.
    fn log_sink(&self) -> LogSink {
        match &self.options.logger {
            Some(logger) => Arc::clone(logger),
            None => Arc::new(|line: &str| debug!(line, "module log")),
        }
    }

    #[cfg(unix)]
    fn native(&self) -> BackendResult<NativeOptions> {
        let path = self.options.engine_path.as_ref().ok_or_else(|| {
            BackendError::unavailable(
                "no engine binary configured; set engine_path or ENGINE_BINARY_PATH",
            )
        })?;
        let mut native = NativeOptions::new(path).threads(self.options.threads);
        native.max_clients = self.options.max_clients.unwrap_or(1);
        native.ring_size = self.options.ring_size;
        if let Some(dir) = &self.options.endpoint_dir {
            native = native.endpoint_dir(dir);
        }
        if let Some(logger) = &self.options.logger {
            native = native.logger(Arc::clone(logger));
        }
        Ok(native)
    }
}

#[cfg(not(unix))]
fn no_native(kind: BackendKind) -> BackendError {
    BackendError::unavailable(format!("{kind} needs a Unix host"))
}
