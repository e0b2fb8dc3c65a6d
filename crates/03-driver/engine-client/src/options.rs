//! Backend selection and sizing.

use std::fmt;
use std::path::PathBuf;

use runtime_wasm::{MemoryLimits, MAX_THREADS};
use serde::{Deserialize, Serialize};
use transport_fabric::{BackendError, BackendKind, BackendResult, LogSink};

pub const ENV_HARDWARE_CONCURRENCY: &str = "HARDWARE_CONCURRENCY";
pub const ENV_ENGINE_BINARY_PATH: &str = "ENGINE_BINARY_PATH";

/// Wasm memory bounds in 64 KiB pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    pub initial_pages: u32,
    pub maximum_pages: u32,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        let limits = MemoryLimits::default();
        Self {
            initial_pages: limits.initial_pages,
            maximum_pages: limits.maximum_pages,
        }
    }
}

impl From<MemoryOptions> for MemoryLimits {
    fn from(memory: MemoryOptions) -> Self {
        MemoryLimits {
            initial_pages: memory.initial_pages,
            maximum_pages: memory.maximum_pages,
        }
    }
}

/// How a session reaches its engine.
///
/// `backend: None` lets the factory walk its fallback chain; naming a
/// backend means exactly that backend or an error.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    pub backend: Option<BackendKind>,
    pub threads: Option<usize>,
    pub memory: MemoryOptions,
    pub engine_path: Option<PathBuf>,
    pub wasm_path: Option<PathBuf>,
    /// Directory for native sockets, regions and engine logs.
    pub endpoint_dir: Option<PathBuf>,
    /// Shared memory only; defaults to 1.
    pub max_clients: Option<u32>,
    /// Shared memory only.
    pub ring_size: Option<u32>,
    #[serde(skip)]
    pub logger: Option<LogSink>,
}

impl BackendOptions {
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn engine_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.engine_path = Some(path.into());
        self
    }

    pub fn wasm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wasm_path = Some(path.into());
        self
    }

    pub fn endpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.endpoint_dir = Some(dir.into());
        self
    }

    pub fn logger(mut self, logger: LogSink) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Applies overrides from the process environment.
    pub fn apply_env(self) -> BackendResult<Self> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`; `HARDWARE_CONCURRENCY` wins over the
    /// configured thread count, `ENGINE_BINARY_PATH` only fills a gap.
    pub fn apply_vars(mut self, lookup: impl Fn(&str) -> Option<String>) -> BackendResult<Self> {
        if let Some(raw) = lookup(ENV_HARDWARE_CONCURRENCY) {
            let threads: usize = raw.trim().parse().map_err(|_| {
                BackendError::InvalidConfig(format!(
                    "{ENV_HARDWARE_CONCURRENCY}={raw:?} is not a thread count"
                ))
            })?;
            self.threads = Some(threads.clamp(1, MAX_THREADS));
        }
        if self.engine_path.is_none() {
            self.engine_path = lookup(ENV_ENGINE_BINARY_PATH)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from);
        }
        Ok(self)
    }

    pub fn validate(&self) -> BackendResult<()> {
        MemoryLimits::from(self.memory).validate()?;
        if self.threads == Some(0) {
            return Err(BackendError::InvalidConfig("threads must be at least 1".into()));
        }
        if self.max_clients == Some(0) {
            return Err(BackendError::InvalidConfig(
                "max_clients must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn log(&self, line: &str) {
        if let Some(logger) = &self.logger {
            logger(line);
        }
    }

    /// Thread count used when none was configured.
    pub(crate) fn effective_threads(&self) -> usize {
        self.threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map_or(1, |n| n.get())
                .min(MAX_THREADS)
        })
    }
}

impl fmt::Debug for BackendOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendOptions")
            .field("backend", &self.backend)
            .field("threads", &self.threads)
            .field("memory", &self.memory)
            .field("engine_path", &self.engine_path)
            .field("wasm_path", &self.wasm_path)
            .field("endpoint_dir", &self.endpoint_dir)
            .field("max_clients", &self.max_clients)
            .field("ring_size", &self.ring_size)
            .field("logger", &self.logger.is_some())
            .finish()
    }
}
