//! At-most-once completion callback dispatch
//!
//! A callback is bound to exactly one handle. `fire` removes the binding under
//! the registry lock before invoking it, so of two racing `fire` calls for the
//! same handle only the first finds anything to run.

use crate::errors::RegistryError;
use crate::types::{Completion, CompletionCallback, Handle};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, warn};

#[derive(Default)]
pub struct CallbackRegistry {
    bindings: Mutex<HashMap<Handle, CompletionCallback>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `callback` to `handle`. A second binding for the same handle is rejected.
    pub fn register(&self, handle: Handle, callback: CompletionCallback) -> Result<(), RegistryError> {
        let mut bindings = self.bindings.lock();
        if bindings.contains_key(&handle) {
            warn!(handle = %handle, "Refusing second callback for handle");
            return Err(RegistryError::AlreadyBound(handle));
        }
        bindings.insert(handle, callback);
        Ok(())
    }

    /// Invoke and drop the callback bound to `handle`, if any.
    ///
    /// Returns `true` when a callback ran. The lock is released before the
    /// callback executes, so callbacks may use the registry themselves.
    pub fn fire(&self, handle: &Handle, completion: &Completion) -> bool {
        let callback = self.bindings.lock().remove(handle);
        match callback {
            Some(callback) => {
                debug!(handle = %handle, state = %completion.state, "Firing completion callback");
                callback(completion);
                true
            }
            None => false,
        }
    }

    pub fn is_bound(&self, handle: &Handle) -> bool {
        self.bindings.lock().contains_key(handle)
    }

    /// Drop every binding without invoking it. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut bindings = self.bindings.lock();
        let dropped = bindings.len();
        bindings.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.bindings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
