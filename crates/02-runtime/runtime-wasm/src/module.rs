use std::sync::Arc;

use parking_lot::Mutex;
use transport_fabric::{BackendError, BackendResult};

/// Export names of the engine module ABI.
pub mod exports {
    pub const INITIALIZE: &str = "_initialize";
    pub const MALLOC: &str = "bbmalloc";
    pub const FREE: &str = "bbfree";
    pub const CALL: &str = "bbapi";
    pub const START_UNWIND: &str = "asyncify_start_unwind";
    pub const STOP_UNWIND: &str = "asyncify_stop_unwind";
    pub const START_REWIND: &str = "asyncify_start_rewind";
    pub const STOP_REWIND: &str = "asyncify_stop_rewind";
}

/// A live module instance: callable exports over one linear memory.
///
/// Arguments and results are `i32` on the wasm side and are reinterpreted as
/// `u32` here. Exports without a result return 0.
pub trait ModuleInstance {
    fn has_export(&mut self, name: &str) -> bool;
    fn call(&mut self, name: &str, args: &[u32]) -> BackendResult<u32>;
    fn read(&self, offset: u32, len: usize) -> BackendResult<Vec<u8>>;
    fn write(&mut self, offset: u32, bytes: &[u8]) -> BackendResult<()>;
    fn memory_size(&self) -> usize;

    fn read_u32_le(&self, offset: u32) -> BackendResult<u32> {
        Ok(u32::from_le_bytes(word(&self.read(offset, 4)?)?))
    }

    fn read_u32_be(&self, offset: u32) -> BackendResult<u32> {
        Ok(u32::from_be_bytes(word(&self.read(offset, 4)?)?))
    }

    fn write_u32_le(&mut self, offset: u32, value: u32) -> BackendResult<()> {
        self.write(offset, &value.to_le_bytes())
    }
}

fn word(bytes: &[u8]) -> BackendResult<[u8; 4]> {
    bytes
        .try_into()
        .map_err(|_| BackendError::wasm("short read of a 4-byte word"))
}

pub type BoxedModule = Box<dyn ModuleInstance + Send>;

/// A module shared between a backend and the bridge driving it.
pub type SharedModule = Arc<Mutex<BoxedModule>>;

/// Exports a module must provide, checked once at construction time.
#[derive(Clone, Debug)]
pub struct ExportTable {
    names: Vec<&'static str>,
}

impl ExportTable {
    /// The exports every engine module carries, including the asyncify set.
    pub fn engine() -> Self {
        Self {
            names: vec![
                exports::INITIALIZE,
                exports::MALLOC,
                exports::FREE,
                exports::CALL,
                exports::START_UNWIND,
                exports::STOP_UNWIND,
                exports::START_REWIND,
                exports::STOP_REWIND,
            ],
        }
    }

    pub fn with(mut self, name: &'static str) -> Self {
        if !self.names.contains(&name) {
            self.names.push(name);
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| *n == name)
    }

    /// Fails with every missing name at once.
    pub fn verify(&self, module: &mut dyn ModuleInstance) -> BackendResult<()> {
        let missing: Vec<&str> = self
            .names
            .iter()
            .copied()
            .filter(|name| !module.has_export(name))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(BackendError::Unavailable(format!(
            "module is missing exports: {}",
            missing.join(", ")
        )))
    }
}
