//! Store contracts for the two collections.
//!
//! `restrictions` holds policy definitions; `acquisitions` holds one record
//! per acquirer. The acquisition contract is deliberately narrow: find-one,
//! a conditional replace (with and without upsert) whose precondition is
//! equality on the prior `tokenized` value, a conditional delete, and a TTL
//! sweep over `expires`. Everything else the engine needs is derived from
//! those primitives.
//!
//! Backends that cannot compare the `tokenized` array structurally compare
//! its canonical serialization instead; token maps are ordered, so the
//! serialized form is deterministic.

mod memory;
mod sqlite;


use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tollgate_core::acquisition::{AcquisitionRecord, EpochMillis, RecordMeta, TokenizedGroup};
use tollgate_core::policy::Restriction;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// A stored restriction definition with persistence timestamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestrictionRecord {
    /// Persistence timestamps.
    pub meta: RecordMeta,
    /// The definition itself.
    pub restriction: Restriction,
}

/// Filter for restriction listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestrictionQuery {
    /// Restrict to one zone.
    pub zone: Option<String>,
    /// Restrict to one resource.
    pub resource: Option<String>,
}

/// The fields replaced by a conditional acquisition write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionState {
    /// The replacement `tokenized` array.
    pub tokenized: Vec<TokenizedGroup>,
    /// The new record expiration.
    pub expires: EpochMillis,
    /// The new retention.
    pub ttl: u64,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The precondition matched (or the upsert inserted); the write took
    /// effect.
    Applied,
    /// The precondition did not match, or an insert lost a race. The caller
    /// re-reads and retries.
    Conflict,
}

/// Errors from store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// An insert collided with an existing record on a unique index.
    #[error("duplicate record in {collection}: {id}")]
    Duplicate {
        /// The collection name.
        collection: &'static str,
        /// The colliding identifier.
        id: String,
    },

    /// The named record does not exist.
    #[error("record not found in {collection}: {id}")]
    NotFound {
        /// The collection name.
        collection: &'static str,
        /// The missing identifier.
        id: String,
    },

    /// The backend failed.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// The restriction definitions collection.
#[async_trait]
pub trait RestrictionStore: Send + Sync {
    /// Inserts a new definition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the id is taken.
    async fn insert(&self, record: RestrictionRecord) -> Result<(), StoreError>;

    /// Replaces an existing definition and bumps `meta.updated`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the id is absent.
    async fn update(&self, restriction: Restriction, now: EpochMillis) -> Result<(), StoreError>;

    /// Fetches one definition by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the id is absent.
    async fn get(&self, id: &str) -> Result<RestrictionRecord, StoreError>;

    /// Lists definitions matching a filter, ordered by id.
    async fn get_all(
        &self,
        query: &RestrictionQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RestrictionRecord>, StoreError>;

    /// Removes one definition by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the id is absent.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Removes every definition for a `(zone, resource)` pair; returns how
    /// many were removed.
    async fn remove_all(&self, zone: &str, resource: &str) -> Result<u64, StoreError>;

    /// Finds definitions where `zone` is among `zones` and `resource` among
    /// `resources`. Order is unspecified.
    async fn find_matching(
        &self,
        zones: &[String],
        resources: &[String],
    ) -> Result<Vec<RestrictionRecord>, StoreError>;
}

/// The per-acquirer acquisition records collection.
#[async_trait]
pub trait AcquisitionStore: Send + Sync {
    /// Fetches an acquirer's record, if any.
    async fn get(&self, acquirer_id: &str) -> Result<Option<AcquisitionRecord>, StoreError>;

    /// Conditionally replaces a record, inserting it when absent.
    ///
    /// The precondition for the replace path is equality of the stored
    /// `tokenized` with `expected`. An insert that loses a race to another
    /// writer reports [`WriteOutcome::Conflict`], never an error.
    async fn upsert(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
        state: AcquisitionState,
        now: EpochMillis,
    ) -> Result<WriteOutcome, StoreError>;

    /// Conditionally replaces a record that must already exist.
    async fn update(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
        state: AcquisitionState,
        now: EpochMillis,
    ) -> Result<WriteOutcome, StoreError>;

    /// Conditionally deletes a record.
    async fn delete(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
    ) -> Result<WriteOutcome, StoreError>;

    /// Deletes records whose `expires` has passed; returns how many.
    async fn sweep_expired(&self, now: EpochMillis) -> Result<u64, StoreError>;
}

/// Collection name for restriction definitions.
pub const RESTRICTIONS: &str = "restrictions";
/// Collection name for acquisition records.
pub const ACQUISITIONS: &str = "acquisitions";
