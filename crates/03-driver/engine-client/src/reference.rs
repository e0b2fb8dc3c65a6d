use futures::executor::block_on;
use tracing::{debug, info};
use transport_fabric::{AsyncBackend, BackendResult, SyncBackend};

/// Supplies the request that loads reference data into a fresh WASM-family
/// backend. The bytes are opaque here; only the engine interprets them.
pub trait ReferenceData: Send + Sync {
    fn init_request(&self) -> BackendResult<Vec<u8>>;
}

/// A fixed, pre-encoded init request.
#[derive(Clone, Debug)]
pub struct StaticReferenceData(pub Vec<u8>);

impl ReferenceData for StaticReferenceData {
    fn init_request(&self) -> BackendResult<Vec<u8>> {
        Ok(self.0.clone())
    }
}

pub(crate) fn init_async(
    data: Option<&dyn ReferenceData>,
    backend: &dyn AsyncBackend,
) -> BackendResult<()> {
    let Some(data) = data else {
        return Ok(());
    };
    let request = data.init_request()?;
    debug!(kind = %backend.kind(), len = request.len(), "loading reference data");
    let reply = block_on(backend.call(request))?;
    info!(kind = %backend.kind(), reply_len = reply.len(), "reference data loaded");
    Ok(())
}

pub(crate) fn init_sync(
    data: Option<&dyn ReferenceData>,
    backend: &dyn SyncBackend,
) -> BackendResult<()> {
    let Some(data) = data else {
        return Ok(());
    };
    let request = data.init_request()?;
    debug!(kind = %backend.kind(), len = request.len(), "loading reference data");
    let reply = backend.call(&request)?;
    info!(kind = %backend.kind(), reply_len = reply.len(), "reference data loaded");
    Ok(())
}
