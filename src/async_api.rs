//! Tokio entry points for the blocking device API.
//!
//! Device calls block on the instrument lock and on the transport, so async
//! callers run them on tokio's blocking pool instead of stalling a runtime
//! worker.

use crate::acquisition;
use crate::device::{Device, OptionValues};
use crate::error::{AppResult, DaqError};
use crate::value::Value;
use futures::future;
use std::sync::Arc;

async fn blocking<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DaqError::TaskJoin(e.to_string()))?
}

/// [`Device::get_with`] on the blocking pool.
pub async fn get(device: Arc<Device>, options: OptionValues) -> AppResult<Value> {
    blocking(move || device.get_with(&options)).await
}

/// [`Device::set_with`] on the blocking pool.
pub async fn set(device: Arc<Device>, value: Value, options: OptionValues) -> AppResult<()> {
    blocking(move || device.set_with(value, &options)).await
}

/// Independent reads, each on its own blocking task.
///
/// Unlike [`read_all`], triggered devices are not staged together: every
/// read runs its own cycle, queued behind any cycle already running on the
/// same instrument.
pub async fn get_many(requests: Vec<(Arc<Device>, OptionValues)>) -> AppResult<Vec<Value>> {
    future::try_join_all(requests.into_iter().map(|(device, options)| get(device, options))).await
}

/// [`acquisition::read_all`] on the blocking pool.
pub async fn read_all(requests: Vec<(Arc<Device>, OptionValues)>) -> AppResult<Vec<Value>> {
    blocking(move || acquisition::read_all(&requests)).await
}
