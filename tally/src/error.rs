//! Error types for the tally statistics engine.
//!
//! Runtime errors are designed out: an observation for an unknown metric
//! is a legitimate no-op, and absent optional aggregate fields are always
//! handled by absence-aware logic in the merge algebra. What remains is
//! the configuration surface — filter and rollup registration — whose
//! failures are non-fatal by contract: [`Manager::add_filter`] reports
//! them on the warning channel and leaves no partial state, while the
//! fallible variants return these types for callers that want to inspect
//! the precise rejection.
//!
//! [`Manager::add_filter`]: crate::Manager::add_filter

use std::time::Duration;

use thiserror::Error;

/// The main error type for all tally operations.
#[derive(Error, Debug)]
pub enum TallyError {
    /// Error during filter or rollup registration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised while validating filter or rollup configuration.
///
/// All of these are rejected registrations: the engine's state is exactly
/// as it was before the call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A filter sets both a normalize hook and an aggregation mask; the
    /// two key transformations are mutually exclusive.
    #[error("filter '{name}' on metric '{metric}' sets both a normalize hook and an aggregation mask")]
    NormalizeConflict {
        /// The metric the filter was registered against.
        metric: String,
        /// The filter name.
        name: String,
    },

    /// A filter with this (metric, name) pair is already registered.
    #[error("filter '{name}' is already registered for metric '{metric}'")]
    DuplicateFilter {
        /// The metric the filter was registered against.
        metric: String,
        /// The conflicting filter name.
        name: String,
    },

    /// A filter names a rollup that has not been created.
    #[error("filter '{name}' references unknown rollup '{rollup}'")]
    UnknownRollup {
        /// The filter name.
        name: String,
        /// The rollup name that was not found.
        rollup: String,
    },

    /// A filter's epoch duration differs from the one already established
    /// by other members of its rollup.
    #[error(
        "filter '{name}' epoch {every:?} conflicts with rollup '{rollup}' epoch {expected:?}"
    )]
    EpochMismatch {
        /// The filter name.
        name: String,
        /// The rollup name.
        rollup: String,
        /// The filter's configured epoch duration.
        every: Duration,
        /// The epoch duration the rollup's existing members share.
        expected: Duration,
    },

    /// A rollup with this name already exists.
    #[error("rollup '{name}' already exists")]
    DuplicateRollup {
        /// The conflicting rollup name.
        name: String,
    },
}

/// Type alias for `Result<T, TallyError>`.
pub type Result<T> = std::result::Result<T, TallyError>;
