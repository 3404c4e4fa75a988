//! Engine-level error types.
//!
//! Policy refusals are not errors: they surface as `authorized: false` with
//! `excess_resources` in the decision. Errors cover malformed input, absent
//! records, unregistered methods, and store or oracle failures. Conditional
//! write conflicts never escape the engine; they are recovered by the
//! read-retry loop.

use thiserror::Error;
use tollgate_core::acquisition::RequestError;
use tollgate_core::policy::{MethodError, RegistryError};
use tollgate_core::tokenizer::TokenizerError;

use crate::store::StoreError;

/// Errors surfaced by engine operations and restriction management.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The request shape is invalid.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A restriction definition is invalid.
    #[error("invalid restriction: {reason}")]
    InvalidRestriction {
        /// Description of the violation.
        reason: String,
    },

    /// A restriction references an unregistered method, or a duplicate
    /// method registration was attempted.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A restriction method failed to apply.
    #[error(transparent)]
    Method(#[from] MethodError),

    /// Tokenization failed.
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),

    /// The datastore failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The caller-imposed deadline passed while retrying conditional
    /// writes; the operation may be retried.
    #[error("operation deadline exceeded after {attempts} attempts")]
    DeadlineExceeded {
        /// How many read-check-write attempts completed.
        attempts: u32,
    },
}
