//! Tokenizer-specific error types.

use thiserror::Error;

/// Errors from tokenization and key-oracle operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenizerError {
    /// The oracle does not know the requested key.
    #[error("unknown tokenizer key: {key_id}")]
    UnknownKey {
        /// The key identifier that failed to resolve.
        key_id: String,
    },

    /// The oracle failed for a reason other than an unknown key.
    #[error("tokenizer oracle failure: {reason}")]
    Oracle {
        /// Description of the failure.
        reason: String,
    },

    /// A tokenizer method that requires processed state was called before
    /// `process()`.
    #[error("tokenizer state is not processed; call process() first")]
    NotProcessed,

    /// No token was computed for a resource under the given key.
    #[error("no token computed for resource {resource} under key {key_id}")]
    MissingToken {
        /// The untokenized resource identifier.
        resource: String,
        /// The key the token was expected under.
        key_id: String,
    },
}
