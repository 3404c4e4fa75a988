//! Keyed resource tokenization with lazy key rotation.
//!
//! Resources are stored only as tokens: the HMAC of an injective encoding of
//! `(acquirer_id, resource)` under a rotating key. The key lives behind the
//! [`TokenizerOracle`] trait; [`HmacKeyRing`] is the bundled in-process
//! implementation.
//!
//! [`ResourceTokenizer`] is the per-request helper. Given the acquirer's
//! current record it prunes expired entries, decides whether a rotation is
//! in progress, precomputes forward (`resource -> token`) and reverse
//! (`token -> resource`) maps for every key it needs, and synthesizes the
//! post-acquire or post-release `tokenized` state. Rotation is lazy: a
//! stale-key entry is translated to the write key only when a request names
//! its resource, because only then can the reverse map resolve the token.

mod error;
mod keyring;

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::acquisition::{
    insert_sorted, max_requested, merge_sorted, AcquisitionEntry, AcquisitionRecord, EpochMillis,
    RequestItem, TokenizedGroup, distinct_resources,
};

pub use error::TokenizerError;
pub use keyring::HmacKeyRing;

/// Oracle over the tokenizer key-management subsystem.
///
/// `sign` must be deterministic per key: the same `(key_id, payload)` pair
/// always yields the same bytes.
#[async_trait]
pub trait TokenizerOracle: Send + Sync {
    /// Returns the identifier of the key used for new tokens.
    async fn current_key_id(&self) -> Result<String, TokenizerError>;

    /// Computes the HMAC of `payload` under the named key.
    async fn sign(&self, key_id: &str, payload: &[u8]) -> Result<Vec<u8>, TokenizerError>;
}

/// On-demand access to untokenized acquisition lists.
///
/// Restriction methods receive this to look up acquisitions for resource
/// ids beyond those named in the request (e.g. a policy that pins one
/// resource based on another's history).
#[async_trait]
pub trait AcquisitionSource: Send + Sync {
    /// Returns the acquirer's stored acquisitions for the given resource
    /// ids, keyed by untokenized resource. Ids with no stored acquisitions
    /// are absent from the result.
    async fn untokenized_map(
        &self,
        resource_ids: &[String],
    ) -> Result<BTreeMap<String, Vec<AcquisitionEntry>>, TokenizerError>;
}

/// The injective HMAC payload for an `(acquirer, resource)` pair.
///
/// Both components are length-prefixed, so distinct pairs can never encode
/// to the same bytes.
#[must_use]
pub fn token_payload(acquirer_id: &str, resource: &str) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(8 + acquirer_id.len() + resource.len());
    payload.extend_from_slice(&u32::try_from(acquirer_id.len()).unwrap_or(u32::MAX).to_be_bytes());
    payload.extend_from_slice(acquirer_id.as_bytes());
    payload.extend_from_slice(&u32::try_from(resource.len()).unwrap_or(u32::MAX).to_be_bytes());
    payload.extend_from_slice(resource.as_bytes());
    payload
}

/// Result of synthesizing the post-acquire state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireUpdate {
    /// The replacement `tokenized` array.
    pub new_tokenized: Vec<TokenizedGroup>,
    /// New record expiration; `None` when no entries remain, in which case
    /// the caller must delete the record instead of writing it.
    pub expires: Option<EpochMillis>,
    /// The retention to store: `max(previous ttl, strictest policy ttl)`.
    pub ttl: u64,
}

/// Result of synthesizing the post-release state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseUpdate {
    /// The replacement `tokenized` array.
    pub new_tokenized: Vec<TokenizedGroup>,
    /// Units requested for release that were not held, per resource.
    pub excess_resources: BTreeMap<String, u64>,
    /// New record expiration; `None` when no entries remain.
    pub expires: Option<EpochMillis>,
    /// The retention carried forward; releases never extend it.
    pub ttl: u64,
}

struct ProcessedState {
    previous_ttl: u64,
    pruned: Vec<TokenizedGroup>,
    rotate: bool,
    write_key: String,
    /// key id -> resource -> token, for every resource in the request.
    forward: HashMap<String, BTreeMap<String, String>>,
    /// key id -> token -> resource, inverse of `forward`.
    reverse: HashMap<String, BTreeMap<String, String>>,
}

/// Per-request tokenization helper.
///
/// Construction does no I/O; [`process`](Self::process) performs the oracle
/// calls and must run before any other method.
pub struct ResourceTokenizer {
    acquirer_id: String,
    resources: Vec<String>,
    oracle: Arc<dyn TokenizerOracle>,
    state: Option<ProcessedState>,
}

impl ResourceTokenizer {
    /// Creates a tokenizer for one request.
    #[must_use]
    pub fn new(
        acquirer_id: impl Into<String>,
        request: &[RequestItem],
        oracle: Arc<dyn TokenizerOracle>,
    ) -> Self {
        Self {
            acquirer_id: acquirer_id.into(),
            resources: distinct_resources(request),
            oracle,
            state: None,
        }
    }

    /// Prunes the record, decides rotation, and precomputes token maps.
    ///
    /// Pruning drops entries whose `requested + record.ttl` has passed and
    /// any group that becomes empty. If everything is pruned the record
    /// resets to a single empty group under the current key with a zero
    /// carried-forward ttl, so a later acquire may legitimately shrink the
    /// stored ttl.
    ///
    /// # Errors
    ///
    /// Propagates oracle failures.
    pub async fn process(
        &mut self,
        record: &AcquisitionRecord,
        now: EpochMillis,
    ) -> Result<(), TokenizerError> {
        let mut previous_ttl = record.ttl;

        let mut pruned: Vec<TokenizedGroup> = Vec::with_capacity(record.tokenized.len());
        for group in &record.tokenized {
            let mut kept = TokenizedGroup::empty(&group.tokenizer_id);
            for (token, entries) in &group.resources {
                let surviving: Vec<AcquisitionEntry> = entries
                    .iter()
                    .copied()
                    .filter(|e| e.requested.saturating_add(record.ttl) >= now)
                    .collect();
                if !surviving.is_empty() {
                    kept.resources.insert(token.clone(), surviving);
                }
            }
            if !kept.is_empty() {
                pruned.push(kept);
            }
        }

        let current = self.oracle.current_key_id().await?;
        if pruned.is_empty() {
            pruned.push(TokenizedGroup::empty(&current));
            previous_ttl = 0;
        }

        let (rotate, write_key) = if pruned.len() == 1 && pruned[0].tokenizer_id == current {
            (false, current)
        } else if pruned.len() == 1 {
            (true, current)
        } else {
            // An unfinished rotation: keep writing under the newest group's
            // key and keep attempting conversion of the older generation.
            (true, pruned[pruned.len() - 1].tokenizer_id.clone())
        };

        let mut key_ids: BTreeSet<String> = pruned
            .iter()
            .map(|g| g.tokenizer_id.clone())
            .collect();
        key_ids.insert(write_key.clone());

        let mut forward = HashMap::new();
        let mut reverse = HashMap::new();
        for key_id in key_ids {
            let mut fwd = BTreeMap::new();
            let mut rev = BTreeMap::new();
            for resource in &self.resources {
                let token = self.compute_token(&key_id, resource).await?;
                fwd.insert(resource.clone(), token.clone());
                rev.insert(token, resource.clone());
            }
            forward.insert(key_id.clone(), fwd);
            reverse.insert(key_id, rev);
        }

        self.state = Some(ProcessedState {
            previous_ttl,
            pruned,
            rotate,
            write_key,
            forward,
            reverse,
        });
        Ok(())
    }

    /// The pruned groups, as they would be read back after a no-op write.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::NotProcessed`] before `process()`.
    pub fn pruned_tokenized(&self) -> Result<&[TokenizedGroup], TokenizerError> {
        Ok(&self.state()?.pruned)
    }

    /// The retention carried forward from the record (zero if fully pruned).
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::NotProcessed`] before `process()`.
    pub fn previous_ttl(&self) -> Result<u64, TokenizerError> {
        Ok(self.state()?.previous_ttl)
    }

    /// Untokenized view of the stored acquisitions for every resource in
    /// the request. Resources with no stored acquisitions are absent.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::NotProcessed`] before `process()`.
    pub fn untokenized_acquisition_map(
        &self,
    ) -> Result<BTreeMap<String, Vec<AcquisitionEntry>>, TokenizerError> {
        let state = self.state()?;
        let mut map = BTreeMap::new();
        for resource in &self.resources {
            let mut merged: Vec<AcquisitionEntry> = Vec::new();
            for group in &state.pruned {
                let Some(token) = state
                    .forward
                    .get(&group.tokenizer_id)
                    .and_then(|fwd| fwd.get(resource))
                else {
                    continue;
                };
                if let Some(entries) = group.resources.get(token) {
                    merged = merge_sorted(&merged, entries);
                }
            }
            if !merged.is_empty() {
                map.insert(resource.clone(), merged);
            }
        }
        Ok(map)
    }

    /// Synthesizes the post-acquire `tokenized` state.
    ///
    /// Request items that would already be expired under the new ttl are
    /// dropped; the rest are inserted (for tracked resources only) under the
    /// write key, keeping each list sorted by `requested` ascending.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::NotProcessed`] before `process()`, or
    /// [`TokenizerError::MissingToken`] if a tracked resource was not part
    /// of the request this tokenizer was built for.
    pub fn apply_acquire(
        &self,
        request: &[RequestItem],
        tracked_resources: &BTreeSet<String>,
        max_restriction_ttl: u64,
        now: EpochMillis,
    ) -> Result<AcquireUpdate, TokenizerError> {
        let state = self.state()?;
        let ttl = state.previous_ttl.max(max_restriction_ttl);

        let (mut new_tokenized, write_idx) = self.build_new_tokenized(state)?;
        let write_entry = &mut new_tokenized[write_idx];

        for item in request {
            let Some(requested) = item.requested else {
                continue;
            };
            if requested.saturating_add(ttl) < now {
                // Already stale under the retention that will be stored.
                continue;
            }
            if !tracked_resources.contains(&item.resource) {
                continue;
            }
            let token = self.write_token(state, &item.resource)?;
            insert_sorted(
                write_entry.resources.entry(token).or_default(),
                AcquisitionEntry {
                    count: item.count,
                    requested,
                },
            );
        }

        let expires = max_requested(&new_tokenized).map(|m| m.saturating_add(ttl));
        Ok(AcquireUpdate {
            new_tokenized,
            expires,
            ttl,
        })
    }

    /// Synthesizes the post-release `tokenized` state.
    ///
    /// Each item consumes units from the head of its resource's list, or
    /// from the tail when `latest` is set. Units that exceed the stored
    /// holdings are reported per resource instead of failing.
    ///
    /// # Errors
    ///
    /// Returns [`TokenizerError::NotProcessed`] before `process()`, or
    /// [`TokenizerError::MissingToken`] if an item names a resource this
    /// tokenizer was not built for.
    pub fn apply_release(&self, request: &[RequestItem]) -> Result<ReleaseUpdate, TokenizerError> {
        let state = self.state()?;
        let ttl = state.previous_ttl;

        let (mut new_tokenized, write_idx) = self.build_new_tokenized(state)?;
        let mut excess_resources: BTreeMap<String, u64> = BTreeMap::new();

        for item in request {
            let token = self.write_token(state, &item.resource)?;
            let write_entry = &mut new_tokenized[write_idx];
            let mut remaining = item.count;
            if let Some(list) = write_entry.resources.get_mut(&token) {
                while remaining > 0 && !list.is_empty() {
                    let idx = if item.latest { list.len() - 1 } else { 0 };
                    if list[idx].count <= remaining {
                        remaining -= list[idx].count;
                        list.remove(idx);
                    } else {
                        list[idx].count -= remaining;
                        remaining = 0;
                    }
                }
                if list.is_empty() {
                    write_entry.resources.remove(&token);
                }
            }
            if remaining > 0 {
                *excess_resources.entry(item.resource.clone()).or_default() += remaining;
            }
        }

        let expires = max_requested(&new_tokenized).map(|m| m.saturating_add(ttl));
        Ok(ReleaseUpdate {
            new_tokenized,
            excess_resources,
            expires,
            ttl,
        })
    }

    /// Builds the replacement groups and the index of the write entry.
    ///
    /// Without rotation this is the single pruned group. With rotation,
    /// older-generation entries whose tokens resolve through the reverse
    /// map are re-tokenized under the write key and merged (sorted) into
    /// the write entry; unresolvable tokens are retained verbatim under
    /// their old key as the unconverted group.
    fn build_new_tokenized(
        &self,
        state: &ProcessedState,
    ) -> Result<(Vec<TokenizedGroup>, usize), TokenizerError> {
        if !state.rotate {
            return Ok((vec![state.pruned[0].clone()], 0));
        }

        let (mut write_entry, older) = if state.pruned.len() > 1 {
            let (older, newest) = state.pruned.split_at(state.pruned.len() - 1);
            (newest[0].clone(), older)
        } else {
            (TokenizedGroup::empty(&state.write_key), &state.pruned[..])
        };

        let mut groups: Vec<TokenizedGroup> = Vec::with_capacity(2);
        for old in older {
            let reverse = state.reverse.get(&old.tokenizer_id);
            let mut unconverted = TokenizedGroup::empty(&old.tokenizer_id);
            for (token, entries) in &old.resources {
                match reverse.and_then(|rev| rev.get(token)) {
                    Some(resource) => {
                        let new_token = self.write_token(state, resource)?;
                        match write_entry.resources.get_mut(&new_token) {
                            Some(existing) => *existing = merge_sorted(existing, entries),
                            None => {
                                write_entry.resources.insert(new_token, entries.clone());
                            }
                        }
                    }
                    None => {
                        unconverted.resources.insert(token.clone(), entries.clone());
                    }
                }
            }
            if !unconverted.is_empty() {
                groups.push(unconverted);
            }
        }

        groups.push(write_entry);
        let write_idx = groups.len() - 1;
        Ok((groups, write_idx))
    }

    fn write_token(&self, state: &ProcessedState, resource: &str) -> Result<String, TokenizerError> {
        state
            .forward
            .get(&state.write_key)
            .and_then(|fwd| fwd.get(resource))
            .cloned()
            .ok_or_else(|| TokenizerError::MissingToken {
                resource: resource.to_string(),
                key_id: state.write_key.clone(),
            })
    }

    async fn compute_token(&self, key_id: &str, resource: &str) -> Result<String, TokenizerError> {
        let payload = token_payload(&self.acquirer_id, resource);
        let mac = self.oracle.sign(key_id, &payload).await?;
        Ok(hex::encode(mac))
    }

    fn state(&self) -> Result<&ProcessedState, TokenizerError> {
        self.state.as_ref().ok_or(TokenizerError::NotProcessed)
    }
}

#[async_trait]
impl AcquisitionSource for ResourceTokenizer {
    async fn untokenized_map(
        &self,
        resource_ids: &[String],
    ) -> Result<BTreeMap<String, Vec<AcquisitionEntry>>, TokenizerError> {
        let state = self.state()?;
        let mut map = BTreeMap::new();
        for resource in resource_ids {
            let mut merged: Vec<AcquisitionEntry> = Vec::new();
            for group in &state.pruned {
                let token = match state
                    .forward
                    .get(&group.tokenizer_id)
                    .and_then(|fwd| fwd.get(resource))
                {
                    Some(token) => token.clone(),
                    // A resource the maps were not prebuilt for.
                    None => self.compute_token(&group.tokenizer_id, resource).await?,
                };
                if let Some(entries) = group.resources.get(&token) {
                    merged = merge_sorted(&merged, entries);
                }
            }
            if !merged.is_empty() {
                map.insert(resource.clone(), merged);
            }
        }
        Ok(map)
    }
}
