//! Restriction definition management.
//!
//! Thin indexed CRUD over the restriction store, plus method registration.
//! Definitions naming the built-in method have their options validated at
//! write time so a malformed limit or duration is rejected before it can
//! fail a live request.

use std::sync::Arc;

use tollgate_core::acquisition::RecordMeta;
use tollgate_core::policy::{
    LimitOverDurationOptions, MethodRegistry, Restriction, RestrictionMethod, LIMIT_OVER_DURATION,
};

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::store::{RestrictionQuery, RestrictionRecord, RestrictionStore};

/// Manages stored restriction definitions and the method registry.
pub struct RestrictionManager {
    store: Arc<dyn RestrictionStore>,
    registry: Arc<MethodRegistry>,
    clock: Arc<dyn Clock>,
}

impl RestrictionManager {
    /// Creates a manager over a store and registry, using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn RestrictionStore>, registry: Arc<MethodRegistry>) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Inserts a new definition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRestriction`] for a malformed
    /// definition and surfaces [`StoreError::Duplicate`](crate::store::StoreError::Duplicate)
    /// on an id collision.
    pub async fn insert(&self, restriction: Restriction) -> Result<RestrictionRecord, EngineError> {
        validate_restriction(&restriction)?;
        let now = self.clock.now_millis();
        let record = RestrictionRecord {
            meta: RecordMeta {
                created: now,
                updated: now,
            },
            restriction,
        };
        self.store.insert(record.clone()).await?;
        Ok(record)
    }

    /// Inserts definitions in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// As [`insert`](Self::insert); definitions before the failure remain
    /// inserted.
    pub async fn bulk_insert(
        &self,
        restrictions: Vec<Restriction>,
    ) -> Result<Vec<RestrictionRecord>, EngineError> {
        let mut records = Vec::with_capacity(restrictions.len());
        for restriction in restrictions {
            records.push(self.insert(restriction).await?);
        }
        Ok(records)
    }

    /// Replaces an existing definition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidRestriction`] for a malformed
    /// definition and surfaces [`StoreError::NotFound`](crate::store::StoreError::NotFound)
    /// for an unknown id.
    pub async fn update(&self, restriction: Restriction) -> Result<(), EngineError> {
        validate_restriction(&restriction)?;
        let now = self.clock.now_millis();
        self.store.update(restriction, now).await?;
        Ok(())
    }

    /// Fetches one definition by id.
    ///
    /// # Errors
    ///
    /// Surfaces [`StoreError::NotFound`](crate::store::StoreError::NotFound).
    pub async fn get(&self, id: &str) -> Result<RestrictionRecord, EngineError> {
        Ok(self.store.get(id).await?)
    }

    /// Lists definitions matching a filter with pagination.
    ///
    /// # Errors
    ///
    /// Surfaces store failures.
    pub async fn get_all(
        &self,
        query: &RestrictionQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RestrictionRecord>, EngineError> {
        Ok(self.store.get_all(query, limit, offset).await?)
    }

    /// Removes one definition by id.
    ///
    /// # Errors
    ///
    /// Surfaces [`StoreError::NotFound`](crate::store::StoreError::NotFound).
    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        Ok(self.store.remove(id).await?)
    }

    /// Removes every definition for a `(zone, resource)` pair; returns how
    /// many were removed.
    ///
    /// # Errors
    ///
    /// Surfaces store failures.
    pub async fn remove_all(&self, zone: &str, resource: &str) -> Result<u64, EngineError> {
        Ok(self.store.remove_all(zone, resource).await?)
    }

    /// Registers a custom restriction method.
    ///
    /// # Errors
    ///
    /// Surfaces [`RegistryError::DuplicateMethod`](tollgate_core::policy::RegistryError::DuplicateMethod).
    pub fn register_method(
        &self,
        method: &str,
        implementation: Arc<dyn RestrictionMethod>,
    ) -> Result<(), EngineError> {
        Ok(self.registry.register(method, implementation)?)
    }
}

fn validate_restriction(restriction: &Restriction) -> Result<(), EngineError> {
    for (field, value) in [
        ("id", &restriction.id),
        ("zone", &restriction.zone),
        ("resource", &restriction.resource),
        ("method", &restriction.method),
    ] {
        if value.is_empty() {
            return Err(EngineError::InvalidRestriction {
                reason: format!("{field} must be a non-empty string"),
            });
        }
    }
    if restriction.method == LIMIT_OVER_DURATION {
        LimitOverDurationOptions::from_value(&restriction.method_options)?;
    }
    Ok(())
}
