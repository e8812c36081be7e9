//! Core library for laboratory instrument control.
//!
//! This library contains the device and instrument abstractions used to read
//! and write values on heterogeneous hardware through an injected transport:
//! value codecs, per-device caches, option resolution, the reentrant
//! instrument lock (optionally shared across processes) and the staged
//! asynchronous acquisition protocol used by sweeps.
//!
//! Concrete drivers only supply command templates or backends, codecs and a
//! [`transport::Transport`].

pub mod acquisition;
pub mod async_api;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod instrument;
pub mod limits;
pub mod lock;
pub mod logging;
pub mod transport;
pub mod value;
pub mod wait;

pub use device::{Device, DeviceBuilder};
pub use error::{AppResult, DaqError};
pub use instrument::{Instrument, InstrumentBuilder};
pub use value::Value;
