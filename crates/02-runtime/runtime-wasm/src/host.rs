//! wasmtime host for engine modules.

use std::path::Path;
use std::sync::Arc;

use futures::future::{self, FutureExt};
use rand::RngCore;
use smallvec::SmallVec;
use tracing::{debug, trace};
use transport_fabric::{BackendError, BackendResult, LogSink};
use wasmtime::{
    AsContextMut, Caller, Engine, Extern, ExternType, Func, Instance, Linker, Memory, MemoryType,
    Module, Store, Val, ValType,
};

use crate::bridge::{AsyncBridge, HostFuture};
use crate::module::{BoxedModule, ModuleInstance};
use crate::worker::{InstanceSpec, ModuleFactory};

const WASI: &str = "wasi_snapshot_preview1";
const WASI_EFAULT: u32 = 21;

/// Sources behind the module's asynchronous imports.
pub trait HostData: Send + Sync + 'static {
    fn load_verifier_crs(&self) -> HostFuture;
    fn load_prover_crs(&self, num_points: u32) -> HostFuture;
}

/// Refuses every load.
pub struct NoHostData;

impl HostData for NoHostData {
    fn load_verifier_crs(&self) -> HostFuture {
        future::ready(Err(BackendError::unavailable("no reference data source"))).boxed()
    }

    fn load_prover_crs(&self, _num_points: u32) -> HostFuture {
        future::ready(Err(BackendError::unavailable("no reference data source"))).boxed()
    }
}

struct HostState {
    memory: Option<Memory>,
    log: LogSink,
    threads: u32,
}

/// Compiles an engine module once and instantiates it per worker.
pub struct WasmtimeFactory {
    engine: Engine,
    module: Module,
    data: Arc<dyn HostData>,
}

fn trap(err: wasmtime::Error) -> BackendError {
    BackendError::Wasm(format!("{err:#}"))
}

impl WasmtimeFactory {
    /// Accepts binary modules and, for fixtures, text format.
    pub fn from_bytes(bytes: &[u8]) -> BackendResult<Self> {
        let engine = Engine::default();
        let module = Module::new(&engine, bytes).map_err(trap)?;
        Ok(Self::compiled(engine, module))
    }

    pub fn from_file(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BackendError::unavailable(format!(
                "no wasm module at {}",
                path.display()
            )));
        }
        let engine = Engine::default();
        let module = Module::from_file(&engine, path).map_err(trap)?;
        debug!(path = %path.display(), "compiled engine module");
        Ok(Self::compiled(engine, module))
    }

    fn compiled(engine: Engine, module: Module) -> Self {
        Self {
            engine,
            module,
            data: Arc::new(NoHostData),
        }
    }

    pub fn with_host_data(mut self, data: Arc<dyn HostData>) -> Self {
        self.data = data;
        self
    }

    fn imports_memory(&self) -> bool {
        self.module
            .imports()
            .any(|import| import.module() == "env" && import.name() == "memory")
    }

    fn link(&self, linker: &mut Linker<HostState>, bridge: &AsyncBridge) -> wasmtime::Result<()> {
        linker.allow_shadowing(true);
        linker.func_wrap("env", "logstr", |caller: Caller<'_, HostState>, addr: u32| {
            let line = read_c_string(&caller, addr);
            (caller.data().log)(&line);
        })?;
        linker.func_wrap(
            "env",
            "env_hardware_concurrency",
            |caller: Caller<'_, HostState>| -> u32 { caller.data().threads },
        )?;

        let data = Arc::clone(&self.data);
        let verifier = bridge.wrap_import("env_load_verifier_crs", move |_| data.load_verifier_crs());
        linker.func_wrap(
            "env",
            "env_load_verifier_crs",
            move |mut caller: Caller<'_, HostState>| -> wasmtime::Result<u32> {
                verifier(&mut CallerModule(&mut caller), &[]).map_err(wasmtime::Error::new)
            },
        )?;

        let data = Arc::clone(&self.data);
        let prover = bridge.wrap_import("env_load_prover_crs", move |args| {
            data.load_prover_crs(args.first().copied().unwrap_or(0))
        });
        linker.func_wrap(
            "env",
            "env_load_prover_crs",
            move |mut caller: Caller<'_, HostState>, num_points: u32| -> wasmtime::Result<u32> {
                prover(&mut CallerModule(&mut caller), &[num_points]).map_err(wasmtime::Error::new)
            },
        )?;

        linker.func_wrap(
            WASI,
            "random_get",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| -> u32 {
                let Some(memory) = caller.data().memory else {
                    return WASI_EFAULT;
                };
                let mut bytes = vec![0u8; len as usize];
                rand::thread_rng().fill_bytes(&mut bytes);
                match memory.write(&mut caller, ptr as usize, &bytes) {
                    Ok(()) => 0,
                    Err(_) => WASI_EFAULT,
                }
            },
        )?;

        for import in self.module.imports() {
            if import.module() != WASI || import.name() == "random_get" {
                continue;
            }
            let ExternType::Func(ty) = import.ty() else {
                continue;
            };
            let name = import.name().to_owned();
            let results: Vec<ValType> = ty.results().collect();
            linker.func_new(WASI, import.name(), ty, move |_caller, _params, out| {
                trace!(import = %name, "stubbed wasi call");
                for (slot, ty) in out.iter_mut().zip(&results) {
                    *slot = zero(ty);
                }
                Ok(())
            })?;
        }
        Ok(())
    }
}

impl ModuleFactory for WasmtimeFactory {
    fn instantiate(&self, spec: &InstanceSpec) -> BackendResult<(BoxedModule, AsyncBridge)> {
        let mut store = Store::new(
            &self.engine,
            HostState {
                memory: None,
                log: Arc::clone(&spec.log),
                threads: spec.threads,
            },
        );
        let bridge = AsyncBridge::new();
        let mut linker = Linker::new(&self.engine);
        self.link(&mut linker, &bridge).map_err(trap)?;

        let imported = if self.imports_memory() {
            let ty = MemoryType::new(spec.limits.initial_pages, Some(spec.limits.maximum_pages));
            let memory = Memory::new(&mut store, ty).map_err(trap)?;
            linker.define(&store, "env", "memory", memory).map_err(trap)?;
            Some(memory)
        } else {
            None
        };

        let instance = linker.instantiate(&mut store, &self.module).map_err(trap)?;
        let memory = match imported {
            Some(memory) => memory,
            None => instance
                .get_memory(&mut store, "memory")
                .ok_or_else(|| BackendError::unavailable("module neither imports nor exports memory"))?,
        };
        store.data_mut().memory = Some(memory);
        debug!(
            worker = spec.index,
            pages = memory.size(&store),
            "instantiated engine module"
        );
        let module = WasmtimeModule {
            store,
            instance,
            memory,
        };
        Ok((Box::new(module), bridge))
    }
}

fn zero(ty: &ValType) -> Val {
    match ty {
        ValType::I64 => Val::I64(0),
        ValType::F32 => Val::F32(0),
        ValType::F64 => Val::F64(0),
        _ => Val::I32(0),
    }
}

fn read_c_string(caller: &Caller<'_, HostState>, addr: u32) -> String {
    let Some(memory) = caller.data().memory else {
        return String::new();
    };
    let data = memory.data(caller);
    let start = (addr as usize).min(data.len());
    let end = data[start..]
        .iter()
        .position(|b| *b == 0)
        .map_or(data.len(), |n| start + n);
    String::from_utf8_lossy(&data[start..end]).into_owned()
}

fn call_func(mut store: impl AsContextMut, func: Func, args: &[u32]) -> BackendResult<u32> {
    let params: SmallVec<[Val; 4]> = args.iter().map(|arg| Val::I32(*arg as i32)).collect();
    let mut results: SmallVec<[Val; 1]> = func
        .ty(&store)
        .results()
        .map(|_| Val::I32(0))
        .collect();
    func.call(&mut store, &params, &mut results).map_err(trap)?;
    Ok(results
        .first()
        .and_then(Val::i32)
        .map_or(0, |value| value as u32))
}

fn memory_fault(err: wasmtime::MemoryAccessError) -> BackendError {
    BackendError::wasm(format!("memory access out of bounds: {err}"))
}

struct WasmtimeModule {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
}

impl ModuleInstance for WasmtimeModule {
    fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    fn call(&mut self, name: &str, args: &[u32]) -> BackendResult<u32> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| BackendError::wasm(format!("module has no export {name}")))?;
        call_func(&mut self.store, func, args)
    }

    fn read(&self, offset: u32, len: usize) -> BackendResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.memory
            .read(&self.store, offset as usize, &mut buf)
            .map_err(memory_fault)?;
        Ok(buf)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> BackendResult<()> {
        self.memory
            .write(&mut self.store, offset as usize, bytes)
            .map_err(memory_fault)
    }

    fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }
}

/// The running instance as seen from inside a host import.
struct CallerModule<'a, 'b>(&'a mut Caller<'b, HostState>);

impl CallerModule<'_, '_> {
    fn memory(&self) -> BackendResult<Memory> {
        self.0
            .data()
            .memory
            .ok_or_else(|| BackendError::wasm("import called before memory was bound"))
    }
}

impl ModuleInstance for CallerModule<'_, '_> {
    fn has_export(&mut self, name: &str) -> bool {
        matches!(self.0.get_export(name), Some(Extern::Func(_)))
    }

    fn call(&mut self, name: &str, args: &[u32]) -> BackendResult<u32> {
        let Some(Extern::Func(func)) = self.0.get_export(name) else {
            return Err(BackendError::wasm(format!("module has no export {name}")));
        };
        call_func(&mut *self.0, func, args)
    }

    fn read(&self, offset: u32, len: usize) -> BackendResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.memory()?
            .read(&*self.0, offset as usize, &mut buf)
            .map_err(memory_fault)?;
        Ok(buf)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> BackendResult<()> {
        self.memory()?
            .write(&mut *self.0, offset as usize, bytes)
            .map_err(memory_fault)
    }

    fn memory_size(&self) -> usize {
        self.memory()
            .map_or(0, |memory| memory.data_size(&*self.0))
    }
}
