//! Reference-counted process-wide instances.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// A lazily created shared instance that lives only while someone holds it.
///
/// The slot keeps a weak reference: once the last [`Arc`] handed out is dropped
/// the instance is torn down, and the next [`WeakSingleton::get_or_try_init`]
/// creates a fresh one.
pub struct WeakSingleton<T> {
    slot: Mutex<Weak<T>>,
}

impl<T> WeakSingleton<T> {
    pub const fn new() -> Self {
        Self { slot: Mutex::new(Weak::new()) }
    }

    /// Return the live instance, or create one with `init`.
    ///
    /// Concurrent callers serialize on the slot, so `init` runs at most once per lifetime.
    pub fn get_or_try_init<E>(&self, init: impl FnOnce() -> Result<T, E>) -> Result<Arc<T>, E> {
        let mut slot = self.slot.lock();
        if let Some(instance) = slot.upgrade() {
            return Ok(instance);
        }
        let instance = Arc::new(init()?);
        *slot = Arc::downgrade(&instance);
        Ok(instance)
    }

    /// The live instance, without creating one.
    pub fn get(&self) -> Option<Arc<T>> {
        self.slot.lock().upgrade()
    }
}

impl<T> Default for WeakSingleton<T> {
    fn default() -> Self {
        Self::new()
    }
}
