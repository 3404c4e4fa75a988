//! In-memory store for tests and embedded use.
//!
//! Implements both collection contracts over one `RwLock`-guarded map pair.
//! Conditional writes compare the prior `tokenized` structurally; because
//! each method holds the lock for its whole critical section, the
//! insert-race outcome of real backends is represented by the same
//! [`WriteOutcome::Conflict`] the engine expects.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tollgate_core::acquisition::{
    AcquisitionRecord, EpochMillis, RecordMeta, TokenizedGroup,
};
use tollgate_core::policy::Restriction;

use super::{
    AcquisitionState, AcquisitionStore, RestrictionQuery, RestrictionRecord, RestrictionStore,
    StoreError, WriteOutcome, RESTRICTIONS,
};

#[derive(Default)]
struct Collections {
    restrictions: BTreeMap<String, RestrictionRecord>,
    acquisitions: BTreeMap<String, AcquisitionRecord>,
}

/// An in-memory implementation of both stores.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Collections>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Collections> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Collections> {
        self.inner
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl RestrictionStore for MemoryStore {
    async fn insert(&self, record: RestrictionRecord) -> Result<(), StoreError> {
        let mut inner = self.write();
        let id = record.restriction.id.clone();
        if inner.restrictions.contains_key(&id) {
            return Err(StoreError::Duplicate {
                collection: RESTRICTIONS,
                id,
            });
        }
        inner.restrictions.insert(id, record);
        Ok(())
    }

    async fn update(&self, restriction: Restriction, now: EpochMillis) -> Result<(), StoreError> {
        let mut inner = self.write();
        match inner.restrictions.get_mut(&restriction.id) {
            Some(record) => {
                record.restriction = restriction;
                record.meta.updated = now;
                Ok(())
            }
            None => Err(StoreError::NotFound {
                collection: RESTRICTIONS,
                id: restriction.id,
            }),
        }
    }

    async fn get(&self, id: &str) -> Result<RestrictionRecord, StoreError> {
        self.read()
            .restrictions
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                collection: RESTRICTIONS,
                id: id.to_string(),
            })
    }

    async fn get_all(
        &self,
        query: &RestrictionQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RestrictionRecord>, StoreError> {
        Ok(self
            .read()
            .restrictions
            .values()
            .filter(|record| {
                query
                    .zone
                    .as_ref()
                    .is_none_or(|zone| record.restriction.zone == *zone)
                    && query
                        .resource
                        .as_ref()
                        .is_none_or(|resource| record.restriction.resource == *resource)
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        match self.write().restrictions.remove(id) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound {
                collection: RESTRICTIONS,
                id: id.to_string(),
            }),
        }
    }

    async fn remove_all(&self, zone: &str, resource: &str) -> Result<u64, StoreError> {
        let mut inner = self.write();
        let before = inner.restrictions.len();
        inner.restrictions.retain(|_, record| {
            record.restriction.zone != zone || record.restriction.resource != resource
        });
        Ok((before - inner.restrictions.len()) as u64)
    }

    async fn find_matching(
        &self,
        zones: &[String],
        resources: &[String],
    ) -> Result<Vec<RestrictionRecord>, StoreError> {
        if zones.is_empty() || resources.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .read()
            .restrictions
            .values()
            .filter(|record| {
                zones.contains(&record.restriction.zone)
                    && resources.contains(&record.restriction.resource)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AcquisitionStore for MemoryStore {
    async fn get(&self, acquirer_id: &str) -> Result<Option<AcquisitionRecord>, StoreError> {
        Ok(self.read().acquisitions.get(acquirer_id).cloned())
    }

    async fn upsert(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
        state: AcquisitionState,
        now: EpochMillis,
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.write();
        match inner.acquisitions.get_mut(acquirer_id) {
            None => {
                inner.acquisitions.insert(
                    acquirer_id.to_string(),
                    AcquisitionRecord {
                        acquirer_id: acquirer_id.to_string(),
                        tokenized: state.tokenized,
                        ttl: state.ttl,
                        expires: state.expires,
                        meta: Some(RecordMeta {
                            created: now,
                            updated: now,
                        }),
                    },
                );
                Ok(WriteOutcome::Applied)
            }
            Some(record) if record.tokenized == expected => {
                record.tokenized = state.tokenized;
                record.ttl = state.ttl;
                record.expires = state.expires;
                if let Some(meta) = record.meta.as_mut() {
                    meta.updated = now;
                }
                Ok(WriteOutcome::Applied)
            }
            Some(_) => Ok(WriteOutcome::Conflict),
        }
    }

    async fn update(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
        state: AcquisitionState,
        now: EpochMillis,
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.write();
        match inner.acquisitions.get_mut(acquirer_id) {
            Some(record) if record.tokenized == expected => {
                record.tokenized = state.tokenized;
                record.ttl = state.ttl;
                record.expires = state.expires;
                if let Some(meta) = record.meta.as_mut() {
                    meta.updated = now;
                }
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    async fn delete(
        &self,
        acquirer_id: &str,
        expected: &[TokenizedGroup],
    ) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.write();
        match inner.acquisitions.get(acquirer_id) {
            Some(record) if record.tokenized == expected => {
                inner.acquisitions.remove(acquirer_id);
                Ok(WriteOutcome::Applied)
            }
            _ => Ok(WriteOutcome::Conflict),
        }
    }

    async fn sweep_expired(&self, now: EpochMillis) -> Result<u64, StoreError> {
        let mut inner = self.write();
        let before = inner.acquisitions.len();
        inner.acquisitions.retain(|_, record| record.expires > now);
        Ok((before - inner.acquisitions.len()) as u64)
    }
}
