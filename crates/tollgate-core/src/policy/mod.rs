//! Restriction definitions and the pluggable policy contract.
//!
//! A [`Restriction`] names a `method` and carries method-specific options;
//! the [`MethodRegistry`] maps method names to [`RestrictionMethod`]
//! implementations. The engine matches restrictions to a request by
//! `(zone, resource)` and applies each matched method, composing the
//! outcomes: a request is authorized only if every method authorized it.

mod error;
mod limit_over_duration;
mod registry;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::acquisition::{AcquisitionEntry, EpochMillis, RequestItem};
use crate::tokenizer::AcquisitionSource;

pub use error::{MethodError, RegistryError};
pub use limit_over_duration::{
    LimitOverDuration, LimitOverDurationOptions, LIMIT_OVER_DURATION,
};
pub use registry::MethodRegistry;

/// A stored restriction definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Restriction {
    /// Unique identifier.
    pub id: String,
    /// The restriction applies only when this zone is among the caller's.
    pub zone: String,
    /// The resource the restriction governs.
    pub resource: String,
    /// Name of a registered restriction method.
    pub method: String,
    /// Method-specific configuration.
    #[serde(default)]
    pub method_options: serde_json::Value,
}

/// What a restriction method decided for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodOutcome {
    /// Whether the request stays within this restriction.
    pub authorized: bool,
    /// How many units of the governed resource would overflow; positive
    /// whenever `authorized` is `false`.
    pub excess: u64,
    /// How long this method needs its tracked resources retained, in
    /// milliseconds. `None` defers to the caller-provided default.
    pub ttl: Option<u64>,
    /// Which requested resources this method wants tracked. `None` defaults
    /// to the restriction's own resource.
    pub tracked_resources: Option<Vec<String>>,
}

impl MethodOutcome {
    /// An authorization with no excess and default tracking.
    #[must_use]
    pub fn authorized(ttl: Option<u64>) -> Self {
        Self {
            authorized: true,
            excess: 0,
            ttl,
            tracked_resources: None,
        }
    }

    /// A refusal reporting `excess` overflowing units.
    #[must_use]
    pub fn denied(excess: u64, ttl: Option<u64>) -> Self {
        Self {
            authorized: false,
            excess,
            ttl,
            tracked_resources: None,
        }
    }
}

/// Everything a restriction method sees when applied.
pub struct MethodContext<'a> {
    /// The principal acquiring resources.
    pub acquirer_id: &'a str,
    /// Stored acquisitions for the requested resources, untokenized.
    pub acquired: &'a BTreeMap<String, Vec<AcquisitionEntry>>,
    /// The request under evaluation.
    pub request: &'a [RequestItem],
    /// The caller's zones.
    pub zones: &'a [String],
    /// The restriction being applied.
    pub restriction: &'a Restriction,
    /// The evaluation time.
    pub now: EpochMillis,
    /// On-demand untokenized lookups for resources beyond the request.
    pub acquisitions: &'a dyn AcquisitionSource,
}

/// A pluggable restriction method.
#[async_trait]
pub trait RestrictionMethod: Send + Sync + std::fmt::Debug {
    /// Evaluates the restriction against one request.
    ///
    /// # Errors
    ///
    /// Returns [`MethodError`] for malformed options or failed lookups; a
    /// policy refusal is expressed through the outcome, not an error.
    async fn apply(&self, ctx: MethodContext<'_>) -> Result<MethodOutcome, MethodError>;
}
