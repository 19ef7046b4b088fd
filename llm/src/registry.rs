//! Resolver registry mapping opaque model identifiers to invokable handles.
//!
//! Resolvers are consulted in registration order; the first one returning a
//! handle wins. The registry is an ordinary value meant to be constructed at
//! startup and injected wherever resolution happens — tests build a fresh
//! instance instead of mutating process-wide state.

use std::sync::{Arc, RwLock};
use tracing::debug;

use crate::error::LlmError;
use crate::ModelHandle;

/// Idempotent pure resolver: identifier in, handle out (or no match).
pub type Resolver = Arc<dyn Fn(&str) -> Option<ModelHandle> + Send + Sync>;

/// Either an identifier still to be resolved, or an already concrete handle.
pub enum ModelRef {
    Id(String),
    Handle(ModelHandle),
}

impl From<&str> for ModelRef {
    fn from(id: &str) -> Self {
        ModelRef::Id(id.to_string())
    }
}

impl From<String> for ModelRef {
    fn from(id: String) -> Self {
        ModelRef::Id(id)
    }
}

impl From<ModelHandle> for ModelRef {
    fn from(handle: ModelHandle) -> Self {
        ModelRef::Handle(handle)
    }
}

pub struct ModelRegistry {
    // Vec keeps registration order; resolve is read-mostly after startup.
    resolvers: RwLock<Vec<(String, Resolver)>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            resolvers: RwLock::new(Vec::new()),
        }
    }

    /// Register a resolver under `key`. Re-registering an existing key swaps
    /// the resolver in place, keeping its original position in the order.
    pub fn register<F>(&self, key: impl Into<String>, resolver: F)
    where
        F: Fn(&str) -> Option<ModelHandle> + Send + Sync + 'static,
    {
        let key = key.into();
        let resolver: Resolver = Arc::new(resolver);
        let mut resolvers = self.resolvers.write().expect("registry lock poisoned");
        if let Some(entry) = resolvers.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = resolver;
        } else {
            resolvers.push((key, resolver));
        }
    }

    /// Remove the resolver registered under `key`. Returns whether one existed.
    pub fn unregister(&self, key: &str) -> bool {
        let mut resolvers = self.resolvers.write().expect("registry lock poisoned");
        let before = resolvers.len();
        resolvers.retain(|(k, _)| k != key);
        resolvers.len() != before
    }

    /// Registered keys, in registration order.
    pub fn keys(&self) -> Vec<String> {
        self.resolvers
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.resolvers
            .write()
            .expect("registry lock poisoned")
            .clear();
    }

    /// Resolve a reference to a concrete handle. A `Handle` passes through
    /// untouched without consulting any resolver; an `Id` walks resolvers in
    /// registration order and the first `Some` wins.
    pub fn resolve(&self, model: impl Into<ModelRef>) -> Result<ModelHandle, LlmError> {
        match model.into() {
            ModelRef::Handle(handle) => Ok(handle),
            ModelRef::Id(id) => {
                let resolvers = self.resolvers.read().expect("registry lock poisoned");
                for (key, resolver) in resolvers.iter() {
                    if let Some(handle) = resolver(&id) {
                        debug!(resolver = %key, model = %id, "model resolved");
                        return Ok(handle);
                    }
                }
                Err(LlmError::UnknownModel(id))
            }
        }
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
