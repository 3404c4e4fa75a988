//! The check/acquire/release decision engine.
//!
//! Every operation reads the acquirer's record (or synthesizes the default
//! for an unknown acquirer), builds a tokenizer over it, fans out to the
//! matched restrictions, and aggregates their outcomes: `authorized` is the
//! conjunction, per-resource excess takes the maximum across restrictions
//! governing the same resource, tracked resources are unioned, and the
//! retention is the maximum of the returned ttls with the caller's
//! `acquisition_ttl` standing in where a method returns none.
//!
//! Mutating operations replace the whole `tokenized` array under an
//! equality precondition on the value they read, and retry from the read on
//! a conflict. Within one acquirer this read-then-conditionally-write loop
//! linearizes writers; different acquirers never contend. The loop is
//! unbounded unless the caller supplies a deadline.


use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use tollgate_core::acquisition::{
    distinct_resources, validate_acquire_request, validate_acquirer_id, validate_release_request,
    AcquisitionRecord, Decision, EpochMillis, ReleaseDecision, RequestItem, ResourceCount,
};
use tollgate_core::policy::{MethodContext, MethodRegistry};
use tollgate_core::tokenizer::{ResourceTokenizer, TokenizerOracle};

use crate::clock::{Clock, SystemClock};
use crate::error::EngineError;
use crate::matcher;
use crate::store::{AcquisitionState, AcquisitionStore, RestrictionStore, WriteOutcome};

/// Parameters for [`AdmissionEngine::check`].
#[derive(Debug, Clone)]
pub struct CheckParams {
    /// The principal acquiring resources.
    pub acquirer_id: String,
    /// The resources and counts under evaluation.
    pub request: Vec<RequestItem>,
    /// Default retention for restrictions that do not declare their own,
    /// in milliseconds.
    pub acquisition_ttl: u64,
    /// Zones scoping which restrictions apply.
    pub zones: Vec<String>,
}

/// Parameters for [`AdmissionEngine::acquire`].
#[derive(Debug, Clone)]
pub struct AcquireParams {
    /// The principal acquiring resources.
    pub acquirer_id: String,
    /// The resources and counts to acquire.
    pub request: Vec<RequestItem>,
    /// Default retention for restrictions that do not declare their own,
    /// in milliseconds.
    pub acquisition_ttl: u64,
    /// Zones scoping which restrictions apply.
    pub zones: Vec<String>,
    /// Record the acquisition even when it is not authorized.
    pub force_acquisition: bool,
    /// Abort the retry loop once this instant passes.
    pub deadline: Option<Instant>,
}

/// Parameters for [`AdmissionEngine::release`].
#[derive(Debug, Clone)]
pub struct ReleaseParams {
    /// The principal releasing resources.
    pub acquirer_id: String,
    /// The resources and counts to release.
    pub request: Vec<RequestItem>,
    /// Abort the retry loop once this instant passes.
    pub deadline: Option<Instant>,
}

/// Aggregated outcome of all matched restrictions.
struct Aggregate {
    authorized: bool,
    excess: BTreeMap<String, u64>,
    tracked: BTreeSet<String>,
    max_restriction_ttl: u64,
}

impl Aggregate {
    fn decision(&self, request: &[RequestItem]) -> Decision {
        Decision {
            authorized: self.authorized,
            excess_resources: to_resource_counts(&self.excess),
            untracked_resources: distinct_resources(request)
                .into_iter()
                .filter(|resource| !self.tracked.contains(resource))
                .collect(),
        }
    }
}

fn to_resource_counts(excess: &BTreeMap<String, u64>) -> Vec<ResourceCount> {
    excess
        .iter()
        .map(|(resource, count)| ResourceCount {
            resource: resource.clone(),
            count: *count,
        })
        .collect()
}

struct CheckedState {
    record: AcquisitionRecord,
    tokenizer: ResourceTokenizer,
    aggregate: Aggregate,
}

/// The admission-control engine.
pub struct AdmissionEngine {
    restrictions: Arc<dyn RestrictionStore>,
    acquisitions: Arc<dyn AcquisitionStore>,
    registry: Arc<MethodRegistry>,
    oracle: Arc<dyn TokenizerOracle>,
    clock: Arc<dyn Clock>,
}

impl AdmissionEngine {
    /// Creates an engine over the given stores, registry, and key oracle,
    /// using the system clock.
    #[must_use]
    pub fn new(
        restrictions: Arc<dyn RestrictionStore>,
        acquisitions: Arc<dyn AcquisitionStore>,
        registry: Arc<MethodRegistry>,
        oracle: Arc<dyn TokenizerOracle>,
    ) -> Self {
        Self {
            restrictions,
            acquisitions,
            registry,
            oracle,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Evaluates a request without recording anything.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] for invalid input or store/oracle failures.
    /// A policy refusal is a successful decision, not an error.
    pub async fn check(&self, params: &CheckParams) -> Result<Decision, EngineError> {
        validate_acquirer_id(&params.acquirer_id)?;
        validate_acquire_request(&params.request)?;
        let now = self.clock.now_millis();
        let state = self
            .run_check(
                &params.acquirer_id,
                &params.request,
                &params.zones,
                params.acquisition_ttl,
                now,
            )
            .await?;
        Ok(state.aggregate.decision(&params.request))
    }

    /// Evaluates a request and, when authorized (or forced), durably
    /// records it.
    ///
    /// The write is a conditional replace of the record's `tokenized` array
    /// against the value read at the top of the iteration; a conflict
    /// (including a lost insert race) re-reads and retries. When no matched
    /// restriction tracks anything, nothing is written, and any expired
    /// acquisitions observed during the read are left for the next mutating
    /// call to prune.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeadlineExceeded`] when `deadline` passes
    /// between attempts; otherwise as [`check`](Self::check).
    pub async fn acquire(&self, params: &AcquireParams) -> Result<Decision, EngineError> {
        validate_acquirer_id(&params.acquirer_id)?;
        validate_acquire_request(&params.request)?;
        let now = self.clock.now_millis();
        let mut attempts: u32 = 0;
        loop {
            check_deadline(params.deadline, attempts)?;
            attempts += 1;

            let state = self
                .run_check(
                    &params.acquirer_id,
                    &params.request,
                    &params.zones,
                    params.acquisition_ttl,
                    now,
                )
                .await?;
            let decision = state.aggregate.decision(&params.request);
            if !decision.authorized && !params.force_acquisition {
                return Ok(decision);
            }
            if state.aggregate.tracked.is_empty() {
                // Nothing durable to record.
                return Ok(decision);
            }

            let update = state.tokenizer.apply_acquire(
                &params.request,
                &state.aggregate.tracked,
                state.aggregate.max_restriction_ttl,
                now,
            )?;
            let outcome = match update.expires {
                None => {
                    if !state.record.is_persisted() {
                        // Never stored, nothing to delete.
                        return Ok(decision);
                    }
                    self.acquisitions
                        .delete(&params.acquirer_id, &state.record.tokenized)
                        .await?
                }
                Some(expires) => {
                    self.acquisitions
                        .upsert(
                            &params.acquirer_id,
                            &state.record.tokenized,
                            AcquisitionState {
                                tokenized: update.new_tokenized,
                                expires,
                                ttl: update.ttl,
                            },
                            now,
                        )
                        .await?
                }
            };
            match outcome {
                WriteOutcome::Applied => return Ok(decision),
                WriteOutcome::Conflict => {
                    tracing::debug!(
                        acquirer_id = %params.acquirer_id,
                        attempts,
                        "acquire write conflict; re-reading"
                    );
                }
            }
        }
    }

    /// Releases previously acquired resources.
    ///
    /// Units beyond what is held are reported as excess rather than
    /// refused. A release that drains the record deletes it; releases never
    /// create records and never extend retention.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DeadlineExceeded`] when `deadline` passes
    /// between attempts; otherwise surfaces input and store/oracle errors.
    pub async fn release(&self, params: &ReleaseParams) -> Result<ReleaseDecision, EngineError> {
        validate_acquirer_id(&params.acquirer_id)?;
        validate_release_request(&params.request)?;
        let now = self.clock.now_millis();
        let mut attempts: u32 = 0;
        loop {
            check_deadline(params.deadline, attempts)?;
            attempts += 1;

            let Some(record) = self.acquisitions.get(&params.acquirer_id).await? else {
                // Nothing stored: every requested unit is excess.
                let mut excess: BTreeMap<String, u64> = BTreeMap::new();
                for item in &params.request {
                    *excess.entry(item.resource.clone()).or_default() += item.count;
                }
                return Ok(ReleaseDecision {
                    authorized: true,
                    excess_resources: to_resource_counts(&excess),
                    expires: now,
                });
            };

            let mut tokenizer =
                ResourceTokenizer::new(&params.acquirer_id, &params.request, self.oracle.clone());
            tokenizer.process(&record, now).await?;
            let update = tokenizer.apply_release(&params.request)?;
            let excess_resources = to_resource_counts(&update.excess_resources);

            let outcome = match update.expires {
                None => {
                    self.acquisitions
                        .delete(&params.acquirer_id, &record.tokenized)
                        .await?
                }
                Some(expires) => {
                    self.acquisitions
                        .update(
                            &params.acquirer_id,
                            &record.tokenized,
                            AcquisitionState {
                                tokenized: update.new_tokenized,
                                expires,
                                ttl: update.ttl,
                            },
                            now,
                        )
                        .await?
                }
            };
            match outcome {
                WriteOutcome::Applied => {
                    return Ok(ReleaseDecision {
                        authorized: true,
                        excess_resources,
                        expires: update.expires.unwrap_or(now),
                    });
                }
                WriteOutcome::Conflict => {
                    tracing::debug!(
                        acquirer_id = %params.acquirer_id,
                        attempts,
                        "release write conflict; re-reading"
                    );
                }
            }
        }
    }

    /// Reads (or synthesizes) the record, tokenizes, matches restrictions,
    /// and aggregates their outcomes.
    async fn run_check(
        &self,
        acquirer_id: &str,
        request: &[RequestItem],
        zones: &[String],
        acquisition_ttl: u64,
        now: EpochMillis,
    ) -> Result<CheckedState, EngineError> {
        let record = match self.acquisitions.get(acquirer_id).await? {
            Some(record) => record,
            None => {
                let current = self.oracle.current_key_id().await?;
                AcquisitionRecord::synthesized(acquirer_id, current, now)
            }
        };
        let mut tokenizer = ResourceTokenizer::new(acquirer_id, request, self.oracle.clone());
        tokenizer.process(&record, now).await?;
        let acquired = tokenizer.untokenized_acquisition_map()?;

        let policies = matcher::match_request(
            self.restrictions.as_ref(),
            &self.registry,
            &distinct_resources(request),
            zones,
        )
        .await?;

        let mut aggregate = Aggregate {
            authorized: true,
            excess: BTreeMap::new(),
            tracked: BTreeSet::new(),
            max_restriction_ttl: 0,
        };
        for policy in &policies {
            let restriction = &policy.record.restriction;
            let outcome = policy
                .method
                .apply(MethodContext {
                    acquirer_id,
                    acquired: &acquired,
                    request,
                    zones,
                    restriction,
                    now,
                    acquisitions: &tokenizer,
                })
                .await?;
            aggregate.authorized &= outcome.authorized;
            match &outcome.tracked_resources {
                Some(tracked) => aggregate.tracked.extend(tracked.iter().cloned()),
                None => {
                    aggregate.tracked.insert(restriction.resource.clone());
                }
            }
            if !outcome.authorized {
                let entry = aggregate.excess.entry(restriction.resource.clone()).or_default();
                *entry = (*entry).max(outcome.excess);
            }
            aggregate.max_restriction_ttl = aggregate
                .max_restriction_ttl
                .max(outcome.ttl.unwrap_or(acquisition_ttl));
        }

        Ok(CheckedState {
            record,
            tokenizer,
            aggregate,
        })
    }
}

/// Fails the retry loop once the caller's deadline passes. The first
/// attempt always runs; only retries are cut off.
fn check_deadline(deadline: Option<Instant>, attempts: u32) -> Result<(), EngineError> {
    if attempts > 0 {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(EngineError::DeadlineExceeded { attempts });
            }
        }
    }
    Ok(())
}
