//! Last confirmed value of a device.
//!
//! A shared slot, tagged with the option values in effect when it was filled,
//! plus a per-thread shadow so a worker's own reading is not clobbered by a
//! concurrent fetch on another thread.

use super::options::OptionValues;
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use tracing::debug;

#[derive(Debug, Default, Clone)]
struct Slot {
    value: Option<Value>,
    options: OptionValues,
}

/// Shared slot plus thread-local shadows.
#[derive(Debug, Default)]
pub struct DeviceCache {
    shared: Mutex<Slot>,
    local: Mutex<HashMap<ThreadId, Value>>,
}

impl DeviceCache {
    /// Record a confirmed value obtained with `options`, for every thread and
    /// as the calling thread's own view.
    pub fn store(&self, value: Value, options: OptionValues) {
        self.local.lock().insert(thread::current().id(), value.clone());
        *self.shared.lock() = Slot {
            value: Some(value),
            options,
        };
    }

    /// Record `value` as the calling thread's own view only.
    pub fn store_local(&self, value: Value) {
        self.local.lock().insert(thread::current().id(), value);
    }

    /// Shared value regardless of options.
    pub fn shared(&self) -> Option<Value> {
        self.shared.lock().value.clone()
    }

    /// Shared value if it was obtained with `options`; a mismatch empties the slot.
    pub fn shared_for(&self, options: &OptionValues) -> Option<Value> {
        let mut slot = self.shared.lock();
        if slot.value.is_some() && !same_options(&slot.options, options) {
            debug!(
                cached = ?slot.options,
                current = ?options,
                "Options changed, invalidating cache"
            );
            slot.value = None;
        }
        slot.value.clone()
    }

    /// The calling thread's own view.
    pub fn local(&self) -> Option<Value> {
        self.local.lock().get(&thread::current().id()).cloned()
    }

    /// Options in effect when the shared slot was filled.
    pub fn options(&self) -> OptionValues {
        self.shared.lock().options.clone()
    }

    /// Empty the shared slot and the calling thread's view.
    pub fn invalidate(&self) {
        self.shared.lock().value = None;
        self.local.lock().remove(&thread::current().id());
    }
}

/// Option keys compare numbers by value (`1` and `1.0` are the same channel).
fn same_options(a: &OptionValues, b: &OptionValues) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|((ka, va), (kb, vb))| ka == kb && va.loosely_equals(vb))
}
