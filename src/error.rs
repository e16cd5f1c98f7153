//! Call-level errors.
//!
//! Only failures that happen before isolation begins are errors; anything the
//! program does once it runs ends up in the execution result instead.

use thiserror::Error;

use crate::guard::GuardRewriteError;
use crate::isolation::IsolationError;
use crate::program::ProgramError;
use crate::rewriter::RewriteError;

/// Why an execution request failed as a whole
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The program or symbol stream is unreadable or malformed
    #[error(transparent)]
    Program(#[from] ProgramError),
    /// Neither a declared nor a conventionally named entry point exists
    #[error("program has no entry point")]
    NoEntryPoint,
    /// Entry point takes parameters other than none or a single string array
    #[error("entry point signature {0} is not supported")]
    UnsupportedEntrySignature(String),
    /// An instrumentation rewriter failed
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    /// Guard injection failed
    #[error(transparent)]
    Guard(#[from] GuardRewriteError),
    /// The isolation boundary failed
    #[error(transparent)]
    Isolation(#[from] IsolationError),
}

impl ExecutionError {
    /// Structural failures: the input program itself is unusable
    #[must_use]
    pub const fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::Program(_) | Self::NoEntryPoint | Self::UnsupportedEntrySignature(_)
        )
    }
}
