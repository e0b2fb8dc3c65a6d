//! In-memory stand-in for an engine module, used by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use transport_fabric::{BackendError, BackendResult};

use crate::module::{exports, ModuleInstance};

pub(crate) type Export = Arc<dyn Fn(&mut FakeModule, &[u32]) -> BackendResult<u32> + Send + Sync>;
pub(crate) type Import =
    Arc<dyn Fn(&mut dyn ModuleInstance, &[u32]) -> BackendResult<u32> + Send + Sync>;

const HEAP_BASE: u32 = 64 * 1024;
const MEMORY_SIZE: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Asyncify {
    Normal,
    Unwinding,
    Rewinding,
}

/// Bump-allocating module with a scripted export table.
///
/// `bbapi` echoes its input; asyncify exports only flip [`Asyncify`] state.
pub(crate) struct FakeModule {
    memory: Vec<u8>,
    heap_top: u32,
    pub live: HashMap<u32, u32>,
    pub frees: Vec<u32>,
    pub asyncify: Asyncify,
    exports: HashMap<&'static str, Export>,
    imports: HashMap<&'static str, Import>,
}

impl FakeModule {
    pub fn new() -> Self {
        Self {
            memory: vec![0; MEMORY_SIZE],
            heap_top: HEAP_BASE,
            live: HashMap::new(),
            frees: Vec::new(),
            asyncify: Asyncify::Normal,
            exports: HashMap::new(),
            imports: HashMap::new(),
        }
    }

    pub fn with_export(
        mut self,
        name: &'static str,
        f: impl Fn(&mut FakeModule, &[u32]) -> BackendResult<u32> + Send + Sync + 'static,
    ) -> Self {
        self.exports.insert(name, Arc::new(f));
        self
    }

    pub fn with_import(
        mut self,
        name: &'static str,
        f: impl Fn(&mut dyn ModuleInstance, &[u32]) -> BackendResult<u32> + Send + Sync + 'static,
    ) -> Self {
        self.imports.insert(name, Arc::new(f));
        self
    }

    pub fn call_import(&mut self, name: &str, args: &[u32]) -> BackendResult<u32> {
        let import = self
            .imports
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::wasm(format!("unlinked import {name}")))?;
        import(self, args)
    }

    /// Returns 0 once memory is exhausted.
    fn malloc(&mut self, size: u32) -> u32 {
        let ptr = self.heap_top;
        let end = u64::from(ptr) + u64::from(size.max(1)).next_multiple_of(8);
        if end > self.memory.len() as u64 {
            return 0;
        }
        self.heap_top = end as u32;
        self.live.insert(ptr, size);
        ptr
    }

    /// Echo that honours the out-pointer protocol, spilling to the heap when
    /// the caller's buffer is too small.
    pub fn echo(&mut self, args: &[u32]) -> BackendResult<u32> {
        let [input, len, out_ptr_loc, out_size_loc] = args else {
            return Err(BackendError::wasm("bbapi takes four arguments"));
        };
        let payload = self.read(*input, *len as usize)?;
        let capacity = self.read_u32_le(*out_size_loc)?;
        let target = if *len <= capacity {
            self.read_u32_le(*out_ptr_loc)?
        } else {
            let ptr = self.malloc(*len);
            self.write_u32_le(*out_ptr_loc, ptr)?;
            ptr
        };
        self.write(target, &payload)?;
        self.write_u32_le(*out_size_loc, *len)?;
        Ok(0)
    }
}

impl ModuleInstance for FakeModule {
    fn has_export(&mut self, name: &str) -> bool {
        self.exports.contains_key(name)
            || [
                exports::INITIALIZE,
                exports::MALLOC,
                exports::FREE,
                exports::CALL,
                exports::START_UNWIND,
                exports::STOP_UNWIND,
                exports::START_REWIND,
                exports::STOP_REWIND,
            ]
            .contains(&name)
    }

    fn call(&mut self, name: &str, args: &[u32]) -> BackendResult<u32> {
        if let Some(export) = self.exports.get(name).cloned() {
            return export(self, args);
        }
        let arg = args.first().copied().unwrap_or(0);
        match name {
            exports::INITIALIZE => Ok(0),
            exports::MALLOC => Ok(self.malloc(arg)),
            exports::FREE => {
                if self.live.remove(&arg).is_none() {
                    return Err(BackendError::wasm(format!("double free of {arg}")));
                }
                self.frees.push(arg);
                Ok(0)
            }
            exports::CALL => self.echo(args),
            exports::START_UNWIND => {
                self.asyncify = Asyncify::Unwinding;
                Ok(0)
            }
            exports::START_REWIND => {
                self.asyncify = Asyncify::Rewinding;
                Ok(0)
            }
            exports::STOP_UNWIND | exports::STOP_REWIND => {
                self.asyncify = Asyncify::Normal;
                Ok(0)
            }
            other => Err(BackendError::wasm(format!("no export named {other}"))),
        }
    }

    fn read(&self, offset: u32, len: usize) -> BackendResult<Vec<u8>> {
        let start = offset as usize;
        self.memory
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| BackendError::wasm("read out of bounds"))
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> BackendResult<()> {
        let start = offset as usize;
        self.memory
            .get_mut(start..start + bytes.len())
            .ok_or_else(|| BackendError::wasm("write out of bounds"))?
            .copy_from_slice(bytes);
        Ok(())
    }

    fn memory_size(&self) -> usize {
        self.memory.len()
    }
}
