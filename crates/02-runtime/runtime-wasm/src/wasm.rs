use std::sync::Arc;

use futures::future::FutureExt;
use futures::lock::Mutex as AsyncMutex;
use parking_lot::Mutex;
use tracing::{debug, warn};
use transport_fabric::{
    AsyncBackend, BackendError, BackendKind, BackendResult, CallFuture, Lifecycle, SyncBackend,
};

use crate::bridge::AsyncBridge;
use crate::module::{exports, BoxedModule, ExportTable, ModuleInstance, SharedModule};
use crate::scratch::{len_u32, ScratchAllocator, WasmArg, SCRATCH_REGION_SIZE};
use crate::worker::MemoryLimits;

/// Size of each of the two buffers used by the msgpack call path.
pub const MSGPACK_SCRATCH_SIZE: u32 = 8 * 1024 * 1024;

/// `[u32 ptr][u32 size]` at the start of the output buffer.
const OUT_METADATA_LEN: u32 = 8;

/// Typed-export arguments live at the very bottom of module memory.
const SCRATCH_BASE: u32 = 0;

/// Engine module running on the caller's thread.
///
/// Cloning shares the instance. Blocking calls take the module lock for the
/// whole call; deferred calls queue behind each other and go through the
/// [`AsyncBridge`] so the module may suspend on host imports.
#[derive(Clone)]
pub struct WasmBackend {
    inner: Arc<Inner>,
}

struct Inner {
    module: SharedModule,
    bridge: AsyncBridge,
    serial: AsyncMutex<()>,
    lifecycle: Lifecycle,
    input_buf: u32,
    output_buf: u32,
    buf_size: u32,
}

/// Where one msgpack call's bytes live.
#[derive(Clone, Copy)]
struct Cbind {
    input: u32,
    input_len: u32,
    input_on_heap: bool,
    out_ptr_loc: u32,
    out_size_loc: u32,
    out_data: u32,
}

impl Cbind {
    fn args(&self) -> [u32; 4] {
        [self.input, self.input_len, self.out_ptr_loc, self.out_size_loc]
    }

    /// Reads the reply and frees it when the module put it on the heap, even
    /// if reading fails.
    fn read_response(&self, module: &mut dyn ModuleInstance) -> BackendResult<Vec<u8>> {
        let ptr = module.read_u32_le(self.out_ptr_loc)?;
        let response = module
            .read_u32_le(self.out_size_loc)
            .and_then(|size| module.read(ptr, size as usize));
        if ptr != self.out_data {
            let freed = module.call(exports::FREE, &[ptr]);
            if response.is_ok() {
                freed?;
            }
        }
        response
    }

    /// Releases a call that will never be read.
    fn discard(&self, module: &mut dyn ModuleInstance) -> BackendResult<()> {
        let ptr = module.read_u32_le(self.out_ptr_loc)?;
        if ptr != self.out_data && ptr != 0 {
            module.call(exports::FREE, &[ptr])?;
        }
        self.release(module)
    }

    fn release(&self, module: &mut dyn ModuleInstance) -> BackendResult<()> {
        if self.input_on_heap {
            module.call(exports::FREE, &[self.input])?;
        }
        Ok(())
    }
}

impl WasmBackend {
    pub fn new(module: BoxedModule, bridge: AsyncBridge) -> BackendResult<Self> {
        Self::with_buffer_size(module, bridge, MSGPACK_SCRATCH_SIZE)
    }

    /// Sizes the call buffers to fit the instance's memory limits.
    pub fn with_limits(
        module: BoxedModule,
        bridge: AsyncBridge,
        limits: &MemoryLimits,
    ) -> BackendResult<Self> {
        Self::with_buffer_size(module, bridge, limits.call_buffer_size())
    }

    /// Checks the export table, runs `_initialize` and allocates the call buffers.
    pub fn with_buffer_size(
        mut module: BoxedModule,
        bridge: AsyncBridge,
        buf_size: u32,
    ) -> BackendResult<Self> {
        if buf_size <= OUT_METADATA_LEN {
            return Err(BackendError::InvalidConfig(format!(
                "call buffer of {buf_size} bytes cannot hold a response"
            )));
        }
        ExportTable::engine().verify(&mut *module)?;
        module.call(exports::INITIALIZE, &[])?;
        bridge.init(&mut *module)?;
        let input_buf = module.call(exports::MALLOC, &[buf_size])?;
        let output_buf = module.call(exports::MALLOC, &[buf_size])?;
        if input_buf == 0 || output_buf == 0 {
            return Err(BackendError::wasm("could not allocate call buffers"));
        }
        debug!(
            memory = module.memory_size(),
            buf_size, "wasm module initialized"
        );
        Ok(Self {
            inner: Arc::new(Inner {
                module: Arc::new(Mutex::new(module)),
                bridge,
                serial: AsyncMutex::new(()),
                lifecycle: Lifecycle::new(),
                input_buf,
                output_buf,
                buf_size,
            }),
        })
    }

    pub fn module(&self) -> &SharedModule {
        &self.inner.module
    }

    /// Calls a typed export through the scratch allocator.
    ///
    /// `out_lens` has one entry per output: `Some(n)` reads `n` bytes from the
    /// slot, `None` reads a heap pointer to a big-endian length-prefixed
    /// buffer and frees it afterwards.
    pub fn call_export(
        &self,
        name: &str,
        inputs: &[WasmArg<'_>],
        out_lens: &[Option<u32>],
    ) -> BackendResult<Vec<Vec<u8>>> {
        self.inner.ensure_callable()?;
        let mut guard = self.inner.module.lock();
        let module: &mut dyn ModuleInstance = &mut **guard;
        if !module.has_export(name) {
            return Err(BackendError::wasm(format!("module has no export {name}")));
        }
        let mut scratch = ScratchAllocator::new(SCRATCH_BASE, SCRATCH_REGION_SIZE);
        let outcome = run_export(module, &mut scratch, name, inputs, out_lens);
        let freed = scratch.free_all(module);
        let outputs = outcome?;
        freed?;
        Ok(outputs)
    }
}

fn run_export(
    module: &mut dyn ModuleInstance,
    scratch: &mut ScratchAllocator,
    name: &str,
    inputs: &[WasmArg<'_>],
    out_lens: &[Option<u32>],
) -> BackendResult<Vec<Vec<u8>>> {
    let mut args = scratch.get_inputs(module, inputs)?;
    let out_ptrs = scratch.get_output_ptrs(module, out_lens)?;
    args.extend_from_slice(&out_ptrs);
    module.call(name, &args)?;
    out_lens
        .iter()
        .zip(out_ptrs)
        .map(|(len, slot)| match len {
            Some(len) => module.read(slot, *len as usize),
            None => {
                let ptr = module.read_u32_le(slot)?;
                scratch.add_output_ptr(ptr);
                let len = module.read_u32_be(ptr)?;
                module.read(ptr + 4, len as usize)
            }
        })
        .collect()
}

impl Inner {
    fn ensure_callable(&self) -> BackendResult<()> {
        self.lifecycle.ensure_live()?;
        if self.bridge.is_busy() {
            return Err(BackendError::Concurrency(
                "module is suspended in an async call".into(),
            ));
        }
        Ok(())
    }

    fn prepare(&self, module: &mut dyn ModuleInstance, request: &[u8]) -> BackendResult<Cbind> {
        let input_len = len_u32(request.len())?;
        let (input, input_on_heap) = if input_len <= self.buf_size {
            (self.input_buf, false)
        } else {
            let ptr = module.call(exports::MALLOC, &[input_len])?;
            if ptr == 0 {
                return Err(BackendError::wasm(format!(
                    "bbmalloc({input_len}) returned null"
                )));
            }
            (ptr, true)
        };
        let call = Cbind {
            input,
            input_len,
            input_on_heap,
            out_ptr_loc: self.output_buf,
            out_size_loc: self.output_buf + 4,
            out_data: self.output_buf + OUT_METADATA_LEN,
        };
        let written = module
            .write(input, request)
            .and_then(|()| module.write_u32_le(call.out_ptr_loc, call.out_data))
            .and_then(|()| module.write_u32_le(call.out_size_loc, self.buf_size - OUT_METADATA_LEN));
        if let Err(err) = written {
            let _ = call.release(module);
            return Err(err);
        }
        Ok(call)
    }

    fn finish(
        module: &mut dyn ModuleInstance,
        call: &Cbind,
        outcome: BackendResult<u32>,
    ) -> BackendResult<Vec<u8>> {
        if let Err(err) = outcome {
            if let Err(leak) = call.discard(module) {
                warn!(%leak, "failed call left memory behind");
            }
            return Err(err);
        }
        let response = call.read_response(module);
        let released = call.release(module);
        let response = response?;
        released?;
        Ok(response)
    }

    fn call_blocking(&self, request: &[u8]) -> BackendResult<Vec<u8>> {
        self.ensure_callable()?;
        let mut guard = self.module.lock();
        let module: &mut dyn ModuleInstance = &mut **guard;
        let call = self.prepare(module, request)?;
        let outcome = module.call(exports::CALL, &call.args());
        Self::finish(module, &call, outcome)
    }

    async fn call_deferred(self: Arc<Self>, request: Vec<u8>) -> BackendResult<Vec<u8>> {
        self.lifecycle.ensure_live()?;
        let _turn = self.serial.lock().await;
        self.lifecycle.ensure_live()?;
        let call = {
            let mut guard = self.module.lock();
            self.prepare(&mut **guard, &request)?
        };
        let args = call.args();
        let pending = PendingCall {
            inner: &self,
            call: Some(call),
        };
        let outcome = self.bridge.call(&self.module, exports::CALL, &args).await;
        pending.finish(outcome)
    }

    fn teardown(&self) {
        let mut guard = self.module.lock();
        let module: &mut dyn ModuleInstance = &mut **guard;
        let freed = self
            .bridge
            .release(module)
            .and_then(|()| module.call(exports::FREE, &[self.input_buf]))
            .and_then(|_| module.call(exports::FREE, &[self.output_buf]));
        if let Err(err) = freed {
            warn!(%err, "wasm teardown left memory behind");
        }
    }
}

/// A deferred call between `prepare` and `finish`. Dropping it early, as
/// when the caller abandons the future, frees the call's heap blocks.
struct PendingCall<'a> {
    inner: &'a Inner,
    call: Option<Cbind>,
}

impl PendingCall<'_> {
    fn finish(mut self, outcome: BackendResult<u32>) -> BackendResult<Vec<u8>> {
        let call = self
            .call
            .take()
            .ok_or_else(|| BackendError::wasm("deferred call finished twice"))?;
        let mut guard = self.inner.module.lock();
        Inner::finish(&mut **guard, &call, outcome)
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.call.take() {
            let mut guard = self.inner.module.lock();
            if let Err(err) = call.discard(&mut **guard) {
                warn!(%err, "abandoned call left memory behind");
            }
        }
    }
}

impl SyncBackend for WasmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wasm
    }

    fn call(&self, request: &[u8]) -> BackendResult<Vec<u8>> {
        self.inner.call_blocking(request)
    }

    fn destroy(&self) {
        if self.inner.lifecycle.begin_destroy() {
            self.inner.teardown();
        }
    }
}

impl AsyncBackend for WasmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wasm
    }

    fn call(&self, request: Vec<u8>) -> CallFuture {
        Arc::clone(&self.inner).call_deferred(request).boxed()
    }

    fn destroy(&self) {
        SyncBackend::destroy(self);
    }
}
