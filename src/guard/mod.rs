//! Resource guard.
//!
//! The guard works in two halves:
//!
//! - **Static**: [`GuardInjector`] rewrites a program so that every risky
//!   operation (function entry, allocation, loop back-edge, denied API call)
//!   is preceded by a check, and issues a [`GuardToken`] bound to the result.
//! - **Run time**: the token opens a [`GuardScope`] holding the live budget;
//!   the inserted checks charge against it and fail with a
//!   [`GuardViolation`].

mod injector;
mod policy;
mod token;

pub use injector::GuardInjector;
pub use policy::{
    ApiRules, GuardLimits, GuardPolicy, DEFAULT_ALLOWED_APIS, DEFAULT_DENIED_APIS,
    DEFAULT_EXPLICIT_LAYOUT_EXCEPTION,
};
pub use token::{GuardScope, GuardToken, GuardUsage};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A resource or API policy tripped at run time
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GuardViolation {
    /// Call stack grew past the limit
    #[error("call stack depth limit ({limit}) exceeded")]
    StackDepth {
        /// Configured limit
        limit: usize,
    },
    /// Cumulative allocation would exceed the budget
    #[error("allocation limit ({limit} bytes) exceeded by a request of {requested} bytes")]
    Allocation {
        /// Configured limit
        limit: u64,
        /// Size of the rejected request
        requested: u64,
    },
    /// Work budget (loop iterations and calls) exhausted
    #[error("iteration limit ({limit}) exceeded")]
    Iterations {
        /// Configured limit
        limit: u64,
    },
    /// Call to an API the policy denies
    #[error("API '{api}' is not allowed")]
    ApiDenied {
        /// Denied API
        api: String,
    },
}

/// Static guard rewrite failures
#[derive(Debug, Error)]
pub enum GuardRewriteError {
    /// A type declares explicit layout and is not a known-safe artifact
    #[error("type '{type_name}' declares explicit layout, which is not allowed")]
    ExplicitLayout {
        /// Offending type
        type_name: String,
    },
    /// The program already went through the injector
    #[error("program is already guarded")]
    AlreadyGuarded,
    /// Guarded image could not be encoded for fingerprinting
    #[error("failed to encode guarded program: {0}")]
    Encode(#[from] crate::program::ProgramError),
}

/// Guard policy construction errors
#[derive(Debug, Error)]
pub enum PolicyError {
    /// API pattern is not `library.member` or `library.*`
    #[error("invalid API pattern '{0}'")]
    InvalidApiPattern(String),
    /// Explicit-layout exception is not a valid regex
    #[error("invalid explicit-layout exception pattern: {0}")]
    InvalidPattern(String),
    /// The process-wide policy was already built or installed
    #[error("a process-wide guard policy is already installed")]
    AlreadyInstalled,
}
