//! Instrumentation rewriter pipeline.
//!
//! Rewriters transform a [`CompiledProgram`] in place before it is guarded.
//! They run in registration order and must not touch anything outside the
//! program they are given.

mod entry_point;
mod flow;

pub use entry_point::EntryPointRewriter;
pub use flow::FlowRewriter;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::program::CompiledProgram;

/// Rewrite failures
#[derive(Debug, Error)]
pub enum RewriteError {
    /// A function has no symbol entry to attribute instrumentation to
    #[error("function #{function} has no symbols")]
    MissingSymbols {
        /// Function without symbols
        function: usize,
    },
    /// Any other rewriter-specific failure
    #[error("{0}")]
    Failed(String),
    /// Raised by a named rewriter inside a pipeline
    #[error("rewriter '{rewriter}' failed: {source}")]
    Rewriter {
        /// Name of the failing rewriter
        rewriter: &'static str,
        /// Underlying failure
        #[source]
        source: Box<RewriteError>,
    },
}

/// Per-execution context handed to every rewriter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSession {
    /// Caller-chosen identifier, used in logs and monitoring
    pub id: String,
    /// Record executed lines
    pub track_flow: bool,
    /// Record values stored into named locals
    pub track_notes: bool,
}

impl WorkSession {
    /// A session with flow and notes enabled
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            track_flow: true,
            track_notes: true,
        }
    }

    /// A session that records nothing beyond output
    #[must_use]
    pub fn output_only(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            track_flow: false,
            track_notes: false,
        }
    }
}

impl Default for WorkSession {
    fn default() -> Self {
        Self::new("default")
    }
}

/// A program transformation applied before guarding
pub trait ProgramRewriter: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &'static str;

    /// Rewrite the program in place
    ///
    /// # Errors
    /// Returns error if the program cannot be instrumented
    fn rewrite(&self, program: &mut CompiledProgram, session: &WorkSession) -> Result<(), RewriteError>;
}

/// Ordered list of rewriters
#[derive(Default)]
pub struct RewriterPipeline {
    rewriters: Vec<Box<dyn ProgramRewriter>>,
}

impl RewriterPipeline {
    /// Create an empty pipeline
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The default pipeline: entry point resolution, then flow instrumentation
    #[must_use]
    pub fn standard() -> Self {
        let mut pipeline = Self::new();
        pipeline.push(EntryPointRewriter);
        pipeline.push(FlowRewriter);
        pipeline
    }

    /// Append a rewriter
    pub fn push(&mut self, rewriter: impl ProgramRewriter + 'static) -> &mut Self {
        self.rewriters.push(Box::new(rewriter));
        self
    }

    /// Registered rewriter names, in order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.rewriters.iter().map(|r| r.name()).collect()
    }

    /// Number of rewriters
    #[must_use]
    pub fn len(&self) -> usize {
        self.rewriters.len()
    }

    /// Whether the pipeline is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rewriters.is_empty()
    }

    /// Apply every rewriter in order, stopping at the first failure
    ///
    /// # Errors
    /// Returns the first failure, tagged with the rewriter's name
    pub fn apply(&self, program: &mut CompiledProgram, session: &WorkSession) -> Result<(), RewriteError> {
        for rewriter in &self.rewriters {
            rewriter
                .rewrite(program, session)
                .map_err(|source| RewriteError::Rewriter {
                    rewriter: rewriter.name(),
                    source: Box::new(source),
                })?;
            debug!(session = %session.id, rewriter = rewriter.name(), "rewriter applied");
        }
        Ok(())
    }
}

impl std::fmt::Debug for RewriterPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    impl ProgramRewriter for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn rewrite(&self, _: &mut CompiledProgram, _: &WorkSession) -> Result<(), RewriteError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl ProgramRewriter for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn rewrite(&self, _: &mut CompiledProgram, _: &WorkSession) -> Result<(), RewriteError> {
            Err(RewriteError::Failed("nope".to_string()))
        }
    }

    #[test]
    fn test_failure_aborts_remaining_rewriters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pipeline = RewriterPipeline::new();
        pipeline
            .push(Counting(Arc::clone(&calls)))
            .push(Failing)
            .push(Counting(Arc::clone(&calls)));

        let err = pipeline
            .apply(&mut CompiledProgram::default(), &WorkSession::default())
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, RewriteError::Rewriter { rewriter: "failing", .. }));
        assert_eq!(err.to_string(), "rewriter 'failing' failed: nope");
    }

    #[test]
    fn test_standard_order() {
        assert_eq!(RewriterPipeline::standard().names(), vec!["entry_point", "flow"]);
    }
}
