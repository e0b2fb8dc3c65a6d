#![allow(dead_code)]

use std::sync::Arc;

use engine_client::{BackendFactory, BackendKind, BackendOptions};
use futures::future::{self, FutureExt};
use runtime_wasm::{HostData, HostFuture, HostValue, ModuleFactory, WasmtimeFactory};
use tempfile::TempDir;
use testdata::ENGINE_WAT;

pub const ENGINE: &str = env!("CARGO_BIN_EXE_e2e-engine");

/// Reference bytes every suite hands the fixture module.
pub struct FixedCrs;

impl HostData for FixedCrs {
    fn load_verifier_crs(&self) -> HostFuture {
        future::ready(Ok(HostValue::Bytes(vec![0x42; 8]))).boxed()
    }

    fn load_prover_crs(&self, num_points: u32) -> HostFuture {
        future::ready(Ok(HostValue::Bytes(vec![num_points as u8; 8]))).boxed()
    }
}

pub fn modules() -> Arc<dyn ModuleFactory> {
    Arc::new(
        WasmtimeFactory::from_bytes(ENGINE_WAT.as_bytes())
            .expect("fixture compiles")
            .with_host_data(Arc::new(FixedCrs)),
    )
}

/// A factory that can build every kind: the fixture module for the wasm
/// family, the echo engine for the native ones.
pub fn factory(dir: &TempDir, kind: Option<BackendKind>) -> BackendFactory {
    let mut options = BackendOptions::default()
        .threads(2)
        .engine_path(ENGINE)
        .endpoint_dir(dir.path());
    options.backend = kind;
    BackendFactory::new(options).with_module_factory(modules())
}
