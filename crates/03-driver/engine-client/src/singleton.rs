//! Opt-in process-wide backend slots, one async and one blocking.
//!
//! Nothing is created implicitly: callers initialize a slot once, fetch
//! it where needed, and tear it down explicitly.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::{const_mutex, Mutex};
use tracing::info;
use transport_fabric::{AsyncBackend, BackendError, BackendKind, BackendResult, SyncBackend};

use crate::factory::{BackendFactory, EngineBackend, EngineSyncBackend};
use crate::options::BackendOptions;

static ASYNC_SLOT: Slot<EngineBackend> = Slot::new("engine singleton", "init_singleton");
static SYNC_SLOT: Slot<EngineSyncBackend> =
    Slot::new("sync engine singleton", "init_sync_singleton");

struct Slot<T> {
    backend: ArcSwapOption<T>,
    /// Serializes init and teardown; readers never take it.
    init: Mutex<()>,
    name: &'static str,
    init_fn: &'static str,
}

impl<T> Slot<T> {
    const fn new(name: &'static str, init_fn: &'static str) -> Self {
        Self {
            backend: ArcSwapOption::const_empty(),
            init: const_mutex(()),
            name,
            init_fn,
        }
    }

    fn init(
        &self,
        build: impl FnOnce() -> BackendResult<T>,
        kind: impl Fn(&T) -> BackendKind,
    ) -> BackendResult<Arc<T>> {
        let _guard = self.init.lock();
        if self.backend.load().is_some() {
            return Err(BackendError::InvalidConfig(format!(
                "{} is already initialized; destroy it first",
                self.name
            )));
        }
        let backend = Arc::new(build()?);
        self.backend.store(Some(Arc::clone(&backend)));
        info!(backend = %kind(&backend), "{} initialized", self.name);
        Ok(backend)
    }

    fn get(&self) -> BackendResult<Arc<T>> {
        self.backend.load_full().ok_or_else(|| {
            BackendError::InvalidConfig(format!(
                "{} is not initialized; call {} first",
                self.name, self.init_fn
            ))
        })
    }

    fn destroy(&self, destroy: impl FnOnce(&T)) -> bool {
        let _guard = self.init.lock();
        match self.backend.swap(None) {
            Some(backend) => {
                destroy(&backend);
                info!("{} destroyed", self.name);
                true
            }
            None => false,
        }
    }
}

/// Builds the process-wide backend from `options`.
pub fn init_singleton(options: BackendOptions) -> BackendResult<Arc<EngineBackend>> {
    init_singleton_with(&BackendFactory::new(options))
}

/// Builds the process-wide backend with a configured factory. Fails if the
/// slot is already taken; a failed build leaves it empty.
pub fn init_singleton_with(factory: &BackendFactory) -> BackendResult<Arc<EngineBackend>> {
    ASYNC_SLOT.init(|| factory.create_async(), AsyncBackend::kind)
}

pub fn singleton() -> BackendResult<Arc<EngineBackend>> {
    ASYNC_SLOT.get()
}

/// Empties the slot and destroys its backend. Returns false if it was empty.
pub fn destroy_singleton() -> bool {
    ASYNC_SLOT.destroy(AsyncBackend::destroy)
}

/// Blocking counterpart of [`init_singleton`], independent of the async slot.
pub fn init_sync_singleton(options: BackendOptions) -> BackendResult<Arc<EngineSyncBackend>> {
    init_sync_singleton_with(&BackendFactory::new(options))
}

pub fn init_sync_singleton_with(
    factory: &BackendFactory,
) -> BackendResult<Arc<EngineSyncBackend>> {
    SYNC_SLOT.init(|| factory.create_sync(), SyncBackend::kind)
}

pub fn sync_singleton() -> BackendResult<Arc<EngineSyncBackend>> {
    SYNC_SLOT.get()
}

pub fn destroy_sync_singleton() -> bool {
    SYNC_SLOT.destroy(SyncBackend::destroy)
}

#[cfg(all(test, feature = "wasmtime"))]
mod tests {
    use super::*;

    use futures::executor::block_on;
    use runtime_wasm::WasmtimeFactory;
    use testdata::{echo_request, ENGINE_WAT};
    use transport_fabric::BackendKind;

    fn wasm_factory() -> BackendFactory {
        let modules = Arc::new(WasmtimeFactory::from_bytes(ENGINE_WAT.as_bytes()).unwrap());
        BackendFactory::new(BackendOptions::default().backend(BackendKind::Wasm))
            .with_module_factory(modules)
    }

    /// The slot goes through its whole life in order; one test owns the global.
    #[test]
    fn lifecycle() {
        assert!(singleton().is_err());
        assert!(!destroy_singleton());

        let broken = BackendFactory::new(BackendOptions::default().backend(BackendKind::Wasm));
        assert!(init_singleton_with(&broken).is_err());
        assert!(singleton().is_err());

        let factory = wasm_factory();
        let first = init_singleton_with(&factory).unwrap();
        assert!(matches!(
            init_singleton_with(&factory).err().unwrap(),
            BackendError::InvalidConfig(_)
        ));

        let fetched = singleton().unwrap();
        assert!(Arc::ptr_eq(&first, &fetched));
        assert_eq!(
            block_on(fetched.call(echo_request(9))).unwrap(),
            echo_request(9)
        );

        assert!(destroy_singleton());
        assert_eq!(
            block_on(fetched.call(echo_request(9))).err().unwrap(),
            BackendError::Destroyed
        );
        assert!(singleton().is_err());
        assert!(!destroy_singleton());
    }

    /// The blocking slot has the same life cycle and never touches the async one.
    #[test]
    fn sync_lifecycle() {
        assert!(sync_singleton().is_err());
        assert!(!destroy_sync_singleton());

        let worker = BackendOptions::default().backend(BackendKind::WasmWorker);
        let broken = BackendFactory::new(worker);
        assert!(matches!(
            init_sync_singleton_with(&broken).err().unwrap(),
            BackendError::InvalidConfig(_)
        ));
        assert!(sync_singleton().is_err());

        let first = init_sync_singleton_with(&wasm_factory()).unwrap();
        assert!(init_sync_singleton_with(&wasm_factory()).is_err());
        let fetched = sync_singleton().unwrap();
        assert!(Arc::ptr_eq(&first, &fetched));
        assert_eq!(fetched.call(&echo_request(4)).unwrap(), echo_request(4));

        assert!(destroy_sync_singleton());
        assert_eq!(fetched.call(&echo_request(4)), Err(BackendError::Destroyed));
        assert!(sync_singleton().is_err());
    }
}
