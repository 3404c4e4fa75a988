//! Policy-specific error types.

use thiserror::Error;

use crate::tokenizer::TokenizerError;

/// Errors from applying a restriction method.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MethodError {
    /// The restriction's `methodOptions` do not fit the method.
    #[error("invalid methodOptions for {method}: {reason}")]
    InvalidOptions {
        /// The method name.
        method: String,
        /// Description of the violation.
        reason: String,
    },

    /// An on-demand acquisition lookup failed.
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
}

/// Errors from the restriction method registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RegistryError {
    /// A method with this name is already registered.
    #[error("restriction method already registered: {method}")]
    DuplicateMethod {
        /// The duplicate method name.
        method: String,
    },

    /// A restriction references a method that was never registered.
    #[error("restriction method not registered: {method}")]
    MethodNotRegistered {
        /// The missing method name.
        method: String,
    },
}
