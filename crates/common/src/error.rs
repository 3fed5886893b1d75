use thiserror::Error;

/// Canonical Basalt error taxonomy used across crates.
///
/// Classification guidance:
/// - [`BasaltError::InvalidInput`]: the query cannot be compiled into any
///   valid native query (unsupported construct, invalid period string,
///   disallowed NaN/infinite constant, ambiguous unnest target, bad context
///   value). Always surfaced to the caller, never retried.
/// - [`BasaltError::Forbidden`]: raised by the authorization collaborator
///   around compilation. The compiler itself never constructs this variant;
///   it exists so authorization failures propagate unmodified.
/// - [`BasaltError::Internal`]: compiler invariant violations (for example a
///   rewrite producing a malformed tree). These abort compilation rather
///   than silently emitting a wrong query.
#[derive(Debug, Error)]
pub enum BasaltError {
    /// Query shape/name/type issues discovered during compilation.
    ///
    /// Examples:
    /// - unknown column reference
    /// - non-boolean WHERE predicate
    /// - TopN limit above the configured maximum
    /// - NaN or infinite literal in an expression
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Authorization denial from the resource-policy collaborator.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Unexpected internal state. Indicates a compiler bug, not a user error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BasaltError {
    /// Shorthand for [`BasaltError::InvalidInput`].
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        BasaltError::InvalidInput(msg.into())
    }

    /// Shorthand for [`BasaltError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        BasaltError::Internal(msg.into())
    }
}

/// Standard Basalt result alias.
pub type Result<T> = std::result::Result<T, BasaltError>;
