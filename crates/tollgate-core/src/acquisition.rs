//! Acquisition state records and request/decision value types.
//!
//! An [`AcquisitionRecord`] tracks, for one acquirer, every acquisition that
//! is still within its retention window. Resource identifiers never appear in
//! the record: each is replaced by a keyed token, and tokens computed under
//! different key generations live in separate [`TokenizedGroup`]s (at most
//! two, with position 0 being the older generation awaiting rotation).
//!
//! # Invariants
//!
//! - A record holds one or two groups; with two, the groups use different
//!   keys and the last group's key is the one used for new writes.
//! - Every entry in an acquisition list satisfies `requested + ttl >= now`
//!   at prune time; lists are sorted by `requested` ascending.
//! - `expires` is the maximum `requested` across all entries plus `ttl`; a
//!   record with no entries is deleted or reset to the synthesized default.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Absolute timestamp in milliseconds since the Unix epoch.
pub type EpochMillis = u64;

/// One recorded acquire event: a count taken at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcquisitionEntry {
    /// Number of units acquired.
    pub count: u64,
    /// When the units were requested (may be in the past or future).
    pub requested: EpochMillis,
}

/// One key generation within a record.
///
/// `resources` maps each tokenized resource identifier to the ordered list
/// of acquire events recorded under it. A `BTreeMap` keeps the serialized
/// form deterministic, which the optimistic-write precondition relies on
/// when a backend compares serialized strings instead of deep equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TokenizedGroup {
    /// Identifier of the key the tokens in this group were computed under.
    pub tokenizer_id: String,
    /// Token -> ordered acquisition list.
    pub resources: BTreeMap<String, Vec<AcquisitionEntry>>,
}

impl TokenizedGroup {
    /// Creates an empty group for the given key.
    #[must_use]
    pub fn empty(tokenizer_id: impl Into<String>) -> Self {
        Self {
            tokenizer_id: tokenizer_id.into(),
            resources: BTreeMap::new(),
        }
    }

    /// Returns `true` if the group holds no acquisitions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}

/// Returns `true` if no group in the slice holds any acquisition.
#[must_use]
pub fn tokenized_is_empty(groups: &[TokenizedGroup]) -> bool {
    groups.iter().all(TokenizedGroup::is_empty)
}

/// Returns the maximum `requested` timestamp across all entries of all
/// groups, or `None` when the groups hold no entries.
#[must_use]
pub fn max_requested(groups: &[TokenizedGroup]) -> Option<EpochMillis> {
    groups
        .iter()
        .flat_map(|g| g.resources.values())
        .flatten()
        .map(|e| e.requested)
        .max()
}

/// Creation/update timestamps of a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordMeta {
    /// When the record was first persisted.
    pub created: EpochMillis,
    /// When the record was last updated.
    pub updated: EpochMillis,
}

/// Per-acquirer acquisition state.
///
/// `meta` is `None` only on a synthesized default that has never been
/// persisted; the engine uses that marker to skip conditional deletes that
/// could never match a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquisitionRecord {
    /// The principal this record belongs to.
    pub acquirer_id: String,
    /// One or two key generations of tokenized acquisitions.
    pub tokenized: Vec<TokenizedGroup>,
    /// Maximum per-acquisition retention currently in force, in milliseconds.
    pub ttl: u64,
    /// When the whole record may be destroyed by the store's TTL sweep.
    pub expires: EpochMillis,
    /// Persistence timestamps; `None` marks a synthesized default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RecordMeta>,
}

impl AcquisitionRecord {
    /// Builds the synthesized default for an acquirer with no stored record:
    /// one empty group under the current key, `ttl = 0`, `expires = now`.
    #[must_use]
    pub fn synthesized(
        acquirer_id: impl Into<String>,
        current_key_id: impl Into<String>,
        now: EpochMillis,
    ) -> Self {
        Self {
            acquirer_id: acquirer_id.into(),
            tokenized: vec![TokenizedGroup::empty(current_key_id)],
            ttl: 0,
            expires: now,
            meta: None,
        }
    }

    /// Returns `true` if this record was read from the store.
    #[must_use]
    pub fn is_persisted(&self) -> bool {
        self.meta.is_some()
    }
}

/// One item of an acquire/check/release request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestItem {
    /// Untokenized resource identifier.
    pub resource: String,
    /// Number of units; must be positive.
    pub count: u64,
    /// Absolute request time in milliseconds. Required for acquire and
    /// check; ignored for release.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested: Option<EpochMillis>,
    /// Release only: consume the most recent stored acquisitions first.
    #[serde(default)]
    pub latest: bool,
}

impl RequestItem {
    /// Builds an acquire/check item.
    #[must_use]
    pub fn new(resource: impl Into<String>, count: u64, requested: EpochMillis) -> Self {
        Self {
            resource: resource.into(),
            count,
            requested: Some(requested),
            latest: false,
        }
    }

    /// Builds a release item consuming the earliest stored acquisitions.
    #[must_use]
    pub fn release(resource: impl Into<String>, count: u64) -> Self {
        Self {
            resource: resource.into(),
            count,
            requested: None,
            latest: false,
        }
    }

    /// Builds a release item consuming the most recent stored acquisitions.
    #[must_use]
    pub fn release_latest(resource: impl Into<String>, count: u64) -> Self {
        Self {
            resource: resource.into(),
            count,
            requested: None,
            latest: true,
        }
    }
}

/// Returns the distinct resources named by a request, in request order.
#[must_use]
pub fn distinct_resources(request: &[RequestItem]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for item in request {
        if seen.insert(item.resource.as_str()) {
            out.push(item.resource.clone());
        }
    }
    out
}

/// A per-resource count, as reported in decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCount {
    /// Untokenized resource identifier.
    pub resource: String,
    /// Unit count.
    pub count: u64,
}

/// Outcome of `check` and `acquire`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// `true` iff every matched restriction authorized the request.
    pub authorized: bool,
    /// Per-resource overflow counts for refusing restrictions.
    pub excess_resources: Vec<ResourceCount>,
    /// Requested resources no matched restriction asked to track.
    pub untracked_resources: Vec<String>,
}

/// Outcome of `release`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDecision {
    /// Always `true`; releasing more than is held is not a refusal.
    pub authorized: bool,
    /// Units that were requested but not held.
    pub excess_resources: Vec<ResourceCount>,
    /// The record's expiration after the release took effect.
    pub expires: EpochMillis,
}

/// Request shape violations.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    /// The acquirer id is missing or empty.
    #[error("acquirerId (string) is required")]
    MissingAcquirerId,

    /// An item's count is zero.
    #[error("request count for resource {resource} must be a positive integer")]
    NonPositiveCount {
        /// The offending resource.
        resource: String,
    },

    /// An acquire/check item has no `requested` timestamp.
    #[error("request item for resource {resource} requires a requested timestamp")]
    MissingRequested {
        /// The offending resource.
        resource: String,
    },
}

/// Validates the acquirer id shared by every public operation.
///
/// # Errors
///
/// Returns [`RequestError::MissingAcquirerId`] when the id is empty.
pub fn validate_acquirer_id(acquirer_id: &str) -> Result<(), RequestError> {
    if acquirer_id.is_empty() {
        return Err(RequestError::MissingAcquirerId);
    }
    Ok(())
}

/// Validates an acquire/check request: positive counts, `requested` present.
///
/// # Errors
///
/// Returns the first violation found.
pub fn validate_acquire_request(request: &[RequestItem]) -> Result<(), RequestError> {
    for item in request {
        if item.count == 0 {
            return Err(RequestError::NonPositiveCount {
                resource: item.resource.clone(),
            });
        }
        if item.requested.is_none() {
            return Err(RequestError::MissingRequested {
                resource: item.resource.clone(),
            });
        }
    }
    Ok(())
}

/// Validates a release request: positive counts (`requested` is ignored).
///
/// # Errors
///
/// Returns the first violation found.
pub fn validate_release_request(request: &[RequestItem]) -> Result<(), RequestError> {
    for item in request {
        if item.count == 0 {
            return Err(RequestError::NonPositiveCount {
                resource: item.resource.clone(),
            });
        }
    }
    Ok(())
}

/// Inserts an entry into a list sorted by `requested` ascending, after any
/// existing entries with the same timestamp.
pub fn insert_sorted(list: &mut Vec<AcquisitionEntry>, entry: AcquisitionEntry) {
    let idx = list.partition_point(|e| e.requested <= entry.requested);
    list.insert(idx, entry);
}

/// Merges two lists sorted by `requested` ascending into one.
#[must_use]
pub fn merge_sorted(a: &[AcquisitionEntry], b: &[AcquisitionEntry]) -> Vec<AcquisitionEntry> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i].requested <= b[j].requested {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(count: u64, requested: EpochMillis) -> AcquisitionEntry {
        AcquisitionEntry { count, requested }
    }

    #[test]
    fn insert_sorted_keeps_ascending_order() {
        let mut list = vec![entry(1, 10), entry(1, 30)];
        insert_sorted(&mut list, entry(2, 20));
        insert_sorted(&mut list, entry(3, 5));
        insert_sorted(&mut list, entry(4, 30));
        let times: Vec<_> = list.iter().map(|e| e.requested).collect();
        assert_eq!(times, vec![5, 10, 20, 30, 30]);
        // Ties insert after existing entries with the same timestamp.
        assert_eq!(list[4].count, 4);
    }

    #[test]
    fn merge_sorted_interleaves() {
        let a = vec![entry(1, 1), entry(1, 4), entry(1, 9)];
        let b = vec![entry(2, 2), entry(2, 4)];
        let merged = merge_sorted(&a, &b);
        let times: Vec<_> = merged.iter().map(|e| e.requested).collect();
        assert_eq!(times, vec![1, 2, 4, 4, 9]);
    }

    #[test]
    fn synthesized_record_has_no_meta() {
        let record = AcquisitionRecord::synthesized("alice", "k1", 42);
        assert!(!record.is_persisted());
        assert_eq!(record.ttl, 0);
        assert_eq!(record.expires, 42);
        assert_eq!(record.tokenized.len(), 1);
        assert!(tokenized_is_empty(&record.tokenized));
    }

    #[test]
    fn validate_rejects_empty_acquirer() {
        assert_eq!(
            validate_acquirer_id(""),
            Err(RequestError::MissingAcquirerId)
        );
        assert!(validate_acquirer_id("alice").is_ok());
    }

    #[test]
    fn validate_acquire_requires_count_and_requested() {
        let missing = vec![RequestItem::release("r", 1)];
        assert!(matches!(
            validate_acquire_request(&missing),
            Err(RequestError::MissingRequested { .. })
        ));
        let zero = vec![RequestItem::new("r", 0, 1)];
        assert!(matches!(
            validate_acquire_request(&zero),
            Err(RequestError::NonPositiveCount { .. })
        ));
        assert!(validate_acquire_request(&[RequestItem::new("r", 1, 1)]).is_ok());
    }

    #[test]
    fn release_validation_ignores_requested() {
        assert!(validate_release_request(&[RequestItem::release("r", 2)]).is_ok());
        assert!(validate_release_request(&[RequestItem::release("r", 0)]).is_err());
    }

    #[test]
    fn distinct_resources_preserves_request_order() {
        let request = vec![
            RequestItem::new("b", 1, 1),
            RequestItem::new("a", 1, 1),
            RequestItem::new("b", 1, 2),
        ];
        assert_eq!(distinct_resources(&request), vec!["b", "a"]);
    }

    #[test]
    fn max_requested_spans_groups() {
        let mut g1 = TokenizedGroup::empty("k1");
        g1.resources.insert("t1".into(), vec![entry(1, 10)]);
        let mut g2 = TokenizedGroup::empty("k2");
        g2.resources.insert("t2".into(), vec![entry(1, 25), entry(1, 7)]);
        assert_eq!(max_requested(&[g1.clone(), g2]), Some(25));
        assert_eq!(max_requested(&[TokenizedGroup::empty("k")]), None);
        assert_eq!(max_requested(&[g1]), Some(10));
    }

    #[test]
    fn record_round_trips_through_serde() {
        let mut group = TokenizedGroup::empty("k1");
        group.resources.insert("ab12".into(), vec![entry(2, 5)]);
        let record = AcquisitionRecord {
            acquirer_id: "alice".into(),
            tokenized: vec![group],
            ttl: 1000,
            expires: 1005,
            meta: Some(RecordMeta {
                created: 1,
                updated: 2,
            }),
        };
        let text = serde_json::to_string(&record).expect("serialize");
        assert!(text.contains("\"tokenizerId\":\"k1\""));
        assert!(text.contains("\"acquirerId\":\"alice\""));
        let back: AcquisitionRecord = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, record);
    }
}
