use smallvec::SmallVec;
use transport_fabric::{BackendError, BackendResult};

use crate::module::{exports, ModuleInstance};

/// Bytes reserved at the bottom of module memory for call arguments.
pub const SCRATCH_REGION_SIZE: u32 = 1024;

/// One argument to a typed export call.
#[derive(Clone, Copy, Debug)]
pub enum WasmArg<'a> {
    /// Copied into module memory; the export receives a pointer.
    Bytes(&'a [u8]),
    /// Passed through unchanged.
    Word(u32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapAllocation {
    pub ptr: u32,
    pub size: u32,
}

/// Per-call argument allocator.
///
/// Inputs grow up from the region base and outputs grow down from its end.
/// Anything that does not fit goes to the module heap and is tracked so
/// [`free_all`](Self::free_all) can release it, whether or not the call
/// succeeded.
#[derive(Debug)]
pub struct ScratchAllocator {
    base: u32,
    in_cursor: u32,
    out_cursor: u32,
    heap: SmallVec<[HeapAllocation; 4]>,
}

impl ScratchAllocator {
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            in_cursor: base,
            out_cursor: base.saturating_add(size),
            heap: SmallVec::new(),
        }
    }

    pub fn alloc_input(&mut self, module: &mut dyn ModuleInstance, size: u32) -> BackendResult<u32> {
        if let Some(end) = self.in_cursor.checked_add(size).filter(|end| *end <= self.out_cursor) {
            let ptr = self.in_cursor;
            self.in_cursor = end;
            return Ok(ptr);
        }
        self.heap_alloc(module, size)
    }

    pub fn alloc_output(&mut self, module: &mut dyn ModuleInstance, size: u32) -> BackendResult<u32> {
        if let Some(start) = self.out_cursor.checked_sub(size).filter(|start| *start >= self.in_cursor) {
            self.out_cursor = start;
            return Ok(start);
        }
        self.heap_alloc(module, size)
    }

    fn heap_alloc(&mut self, module: &mut dyn ModuleInstance, size: u32) -> BackendResult<u32> {
        let ptr = module.call(exports::MALLOC, &[size])?;
        if ptr == 0 {
            return Err(BackendError::wasm(format!("bbmalloc({size}) returned null")));
        }
        self.heap.push(HeapAllocation { ptr, size });
        Ok(ptr)
    }

    /// Lays out every argument and returns the words to pass to the export.
    pub fn get_inputs(
        &mut self,
        module: &mut dyn ModuleInstance,
        args: &[WasmArg<'_>],
    ) -> BackendResult<Vec<u32>> {
        args.iter()
            .map(|arg| match arg {
                WasmArg::Word(word) => Ok(*word),
                WasmArg::Bytes(bytes) => {
                    let ptr = self.alloc_input(module, len_u32(bytes.len())?)?;
                    module.write(ptr, bytes)?;
                    Ok(ptr)
                }
            })
            .collect()
    }

    /// Reserves one output slot per entry. Known lengths get that many
    /// bytes; unknown ones get a 4-byte slot the module fills with a heap
    /// pointer.
    pub fn get_output_ptrs(
        &mut self,
        module: &mut dyn ModuleInstance,
        out_lens: &[Option<u32>],
    ) -> BackendResult<Vec<u32>> {
        out_lens
            .iter()
            .map(|len| self.alloc_output(module, len.unwrap_or(4)))
            .collect()
    }

    /// Tracks a buffer the module allocated and handed back.
    pub fn add_output_ptr(&mut self, ptr: u32) {
        if ptr != 0 {
            self.heap.push(HeapAllocation { ptr, size: 0 });
        }
    }

    pub fn heap_allocations(&self) -> &[HeapAllocation] {
        &self.heap
    }

    /// Frees every heap block. Keeps going past failures and reports the first.
    pub fn free_all(&mut self, module: &mut dyn ModuleInstance) -> BackendResult<()> {
        let mut first_err = None;
        for alloc in self.heap.drain(..) {
            if let Err(err) = module.call(exports::FREE, &[alloc.ptr]) {
                first_err.get_or_insert(err);
            }
        }
        self.in_cursor = self.base;
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

pub(crate) fn len_u32(len: usize) -> BackendResult<u32> {
    u32::try_from(len).map_err(|_| BackendError::wasm(format!("{len} bytes exceed wasm32 memory")))
}
