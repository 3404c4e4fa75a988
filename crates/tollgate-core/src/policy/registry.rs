//! Process-wide registry of restriction methods.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::error::RegistryError;
use super::limit_over_duration::{LimitOverDuration, LIMIT_OVER_DURATION};
use super::RestrictionMethod;

/// Maps restriction method names to implementations.
///
/// Populated during initialization and effectively immutable afterwards;
/// lookups after init take the read path only.
pub struct MethodRegistry {
    methods: RwLock<HashMap<String, Arc<dyn RestrictionMethod>>>,
}

impl MethodRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with the built-in methods registered.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        // Built-in names cannot collide in a fresh registry.
        let _ = registry.register(LIMIT_OVER_DURATION, Arc::new(LimitOverDuration));
        registry
    }

    /// Registers a method implementation under a name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateMethod`] if the name is taken.
    pub fn register(
        &self,
        method: &str,
        implementation: Arc<dyn RestrictionMethod>,
    ) -> Result<(), RegistryError> {
        let mut methods = self
            .methods
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if methods.contains_key(method) {
            return Err(RegistryError::DuplicateMethod {
                method: method.to_string(),
            });
        }
        methods.insert(method.to_string(), implementation);
        Ok(())
    }

    /// Looks up a method implementation by name.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::MethodNotRegistered`] if absent.
    pub fn lookup(&self, method: &str) -> Result<Arc<dyn RestrictionMethod>, RegistryError> {
        self.methods
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(method)
            .cloned()
            .ok_or_else(|| RegistryError::MethodNotRegistered {
                method: method.to_string(),
            })
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
