//! Custom error types for the instrument layer.
//!
//! This module defines the primary error type, `DaqError`, used by every device,
//! lock and acquisition operation. Using the `thiserror` crate, it provides a
//! centralized and consistent way to report the failures a caller has to tell apart.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidArgument`**: a value (or an explicitly supplied option) violates a
//!   device's own constraint. Raised before any hardware is touched.
//! - **`InvalidAutoArgument`**: an option that was *not* supplied could not be
//!   resolved from its default (the referenced device has no confirmed value, or
//!   that value is outside the option's limits). The caller can recover by passing
//!   the option explicitly, so bulk operations such as `force_get` skip these.
//! - **`ProtocolOrder`**: asynchronous acquisition stages were requested out of
//!   sequence. The in-flight task has already been cancelled when this is returned.
//! - **`LockTimeout`** / **`LockNotHeld`**: lock acquisition gave up, or a release
//!   was attempted by a thread that does not hold the lock.
//! - **`Communication`**: the transport failed. Device caches are left untouched.
//! - **`Interrupted`**: a blocking wait was aborted by the user-abort signal.
//!
//! By using `#[from]`, `DaqError` can be created from I/O and configuration
//! errors with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid automatic argument: {0}")]
    InvalidAutoArgument(String),

    #[error("Async stages called in the wrong order: requested stage {requested} while at level {level}")]
    ProtocolOrder { requested: i8, level: i8 },

    #[error("Timed out after {waited:?} waiting for lock '{lock}'")]
    LockTimeout { lock: String, waited: Duration },

    #[error("Lock '{0}' released by a thread that does not hold it")]
    LockNotHeld(String),

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Operation not implemented: {0}")]
    NotImplemented(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Wait interrupted by user abort")]
    Interrupted,

    #[error("Asynchronous acquisition failed: {0}")]
    AsyncFailed(String),

    #[error("Device '{0}' is detached from its instrument")]
    Detached(String),

    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    #[error("Device '{0}' already exists on this instrument")]
    DuplicateDevice(String),

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Background task failed to join: {0}")]
    TaskJoin(String),
}

impl DaqError {
    /// True for errors the caller can recover from by supplying options explicitly.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DaqError::InvalidAutoArgument(_))
    }

    /// True for validation failures raised before any hardware mutation.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            DaqError::InvalidArgument(_) | DaqError::InvalidAutoArgument(_)
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
