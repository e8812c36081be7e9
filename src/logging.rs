//! Tracing subscriber setup.

use crate::error::{AppResult, DaqError};
use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber.
///
/// `RUST_LOG` wins when set; otherwise events at `level` and above are shown.
/// A subscriber installed earlier (by a test harness or the host application)
/// is left in place.
pub fn init(level: &str) -> AppResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| DaqError::Configuration(format!("invalid log level '{level}': {e}")))?,
    };
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(())
}
