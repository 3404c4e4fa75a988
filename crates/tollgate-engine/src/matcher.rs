//! Matches stored restrictions to a request.

use std::sync::Arc;

use tollgate_core::policy::{MethodRegistry, RestrictionMethod};

use crate::error::EngineError;
use crate::store::{RestrictionRecord, RestrictionStore};

/// A restriction matched to the current request, paired with its method
/// implementation.
pub struct MatchedPolicy {
    /// The stored definition.
    pub record: RestrictionRecord,
    /// The registered method it names.
    pub method: Arc<dyn RestrictionMethod>,
}

/// Loads every restriction whose zone is among `zones` and whose resource
/// is among `resources`, and resolves each method through the registry.
///
/// Order is unspecified and the engine must not depend on it. An empty zone
/// list matches nothing.
///
/// # Errors
///
/// Surfaces store failures and
/// [`RegistryError::MethodNotRegistered`](tollgate_core::policy::RegistryError::MethodNotRegistered)
/// for restrictions naming unknown methods.
pub async fn match_request(
    store: &dyn RestrictionStore,
    registry: &MethodRegistry,
    resources: &[String],
    zones: &[String],
) -> Result<Vec<MatchedPolicy>, EngineError> {
    if zones.is_empty() || resources.is_empty() {
        return Ok(Vec::new());
    }
    let records = store.find_matching(zones, resources).await?;
    records
        .into_iter()
        .map(|record| {
            let method = registry.lookup(&record.restriction.method)?;
            Ok(MatchedPolicy { record, method })
        })
        .collect()
}
