//! The execution engine.
//!
//! One call to [`Executor::execute`] takes a compiled program through the
//! whole pipeline:
//!
//! 1. read the program and symbol streams
//! 2. apply the rewriter pipeline
//! 3. check the entry point
//! 4. inject guards and obtain the token
//! 5. run the guarded image in a fresh isolation context
//! 6. report guard and invalid-program faults to the monitor
//! 7. tear the context down
//!
//! Steps 1 to 4 fail the call with an [`ExecutionError`]. From step 5 on,
//! whatever the program does is captured in the [`ExecutionResult`].

mod lifecycle;

pub use lifecycle::ExecutionState;

use std::io::{self, Read};
use std::sync::Arc;

use tracing::{debug, info, info_span, warn};

use crate::capture::ExecutionResult;
use crate::config::{ConfigError, EngineConfig};
use crate::error::ExecutionError;
use crate::guard::{GuardInjector, GuardPolicy};
use crate::isolation::{ContextSetup, IsolationContext};
use crate::monitor::{Monitor, TracingMonitor};
use crate::program::{CompiledProgram, Function, ValueType};
use crate::rewriter::{ProgramRewriter, RewriterPipeline, WorkSession};
use crate::runtime::ProgramFault;
use crate::serialize::{serialize_result, JsonWriter};
use lifecycle::Lifecycle;

/// Result plus the fault that ended execution, if any.
///
/// The fault is for monitoring decisions only; the serialized surface
/// carries nothing but its kind name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Captured output and flow
    pub result: ExecutionResult,
    /// Fault raised by the program
    pub fault: Option<ProgramFault>,
}

impl ExecutionOutcome {
    /// Whether the fault must be reported to monitoring
    #[must_use]
    pub fn is_monitored(&self) -> bool {
        self.fault
            .as_ref()
            .is_some_and(|fault| fault.is_guard_violation() || fault.is_invalid_program())
    }
}

/// Builder for [`Executor`]
pub struct ExecutorBuilder {
    pipeline: RewriterPipeline,
    policy: Option<Arc<GuardPolicy>>,
    monitor: Arc<dyn Monitor>,
    setup: ContextSetup,
}

impl ExecutorBuilder {
    /// Replace the rewriter pipeline
    #[must_use]
    pub fn rewriters(mut self, pipeline: RewriterPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Append a rewriter to the pipeline
    #[must_use]
    pub fn rewriter(mut self, rewriter: impl ProgramRewriter + 'static) -> Self {
        self.pipeline.push(rewriter);
        self
    }

    /// Use a specific guard policy instead of the process-wide one
    #[must_use]
    pub fn policy(mut self, policy: Arc<GuardPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Monitor receiving guard and invalid-program faults
    #[must_use]
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Isolation context setup
    #[must_use]
    pub fn context(mut self, setup: ContextSetup) -> Self {
        self.setup = setup;
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> Executor {
        Executor {
            pipeline: self.pipeline,
            policy: self.policy.unwrap_or_else(GuardPolicy::global),
            monitor: self.monitor,
            setup: self.setup,
        }
    }
}

/// Runs compiled programs under guard and isolation
pub struct Executor {
    pipeline: RewriterPipeline,
    policy: Arc<GuardPolicy>,
    monitor: Arc<dyn Monitor>,
    setup: ContextSetup,
}

impl Executor {
    /// Start building an executor with the default rewriters, the
    /// process-wide policy and a [`TracingMonitor`]
    #[must_use]
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder {
            pipeline: RewriterPipeline::standard(),
            policy: None,
            monitor: Arc::new(TracingMonitor),
            setup: ContextSetup::default(),
        }
    }

    /// Build an executor from configuration
    ///
    /// # Errors
    /// Returns error if the configuration is invalid
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::builder()
            .policy(Arc::new(config.guard.policy()?))
            .context(config.isolation.clone())
            .build())
    }

    /// Guard policy in use
    #[must_use]
    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    /// Execute a program and return what it produced
    ///
    /// # Errors
    /// Returns error only for failures before isolation: unreadable program,
    /// missing or unsupported entry point, failed rewrite
    pub fn execute(
        &self,
        program: impl Read,
        symbols: impl Read,
        session: &WorkSession,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.execute_outcome(program, symbols, session)
            .map(|outcome| outcome.result)
    }

    /// Execute a program, also returning the fault that ended it
    ///
    /// # Errors
    /// See [`execute`](Self::execute)
    pub fn execute_outcome(
        &self,
        program: impl Read,
        symbols: impl Read,
        session: &WorkSession,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        let span = info_span!("execute", session = %session.id);
        let _entered = span.enter();

        let mut program = CompiledProgram::read(program, symbols)?;
        let mut lifecycle = Lifecycle::start(session, self.monitor.as_ref());

        self.pipeline.apply(&mut program, session)?;
        lifecycle.advance(ExecutionState::Rewritten);

        let (_, entry) = program.entry_point().ok_or(ExecutionError::NoEntryPoint)?;
        check_entry_signature(entry)?;

        let token = GuardInjector::new(&self.policy).rewrite(&mut program)?;
        let image = program.image.to_bytes()?;
        drop(program);
        lifecycle.advance(ExecutionState::GuardInjected);

        let mut context = IsolationContext::create(&self.setup)?;
        lifecycle.advance(ExecutionState::Isolated);

        let reply = match context.invoke(&image, token) {
            Ok(reply) => reply,
            Err(e) => {
                if let Err(teardown) = context.teardown() {
                    warn!(error = %teardown, "isolation context teardown failed");
                }
                lifecycle.advance(ExecutionState::TornDown);
                return Err(e.into());
            }
        };
        drop(image);
        lifecycle.advance(ExecutionState::Invoked);

        let outcome = ExecutionOutcome {
            result: reply.result,
            fault: reply.fault,
        };
        match &outcome.fault {
            None => lifecycle.advance(ExecutionState::Completed),
            Some(fault) => {
                lifecycle.advance(ExecutionState::Faulted);
                debug!(kind = fault.kind.name(), "program faulted");
                if outcome.is_monitored() {
                    self.monitor.exception(fault, session);
                }
            }
        }

        let teardown = context.teardown();
        lifecycle.advance(ExecutionState::TornDown);
        teardown?;

        info!(
            state = %lifecycle.state(),
            output = outcome.result.output.len(),
            flow = outcome.result.flow.len(),
            "execution finished"
        );
        Ok(outcome)
    }

    /// Render a result through a structured writer
    ///
    /// # Errors
    /// Returns error if the writer fails
    pub fn serialize<J: JsonWriter>(result: &ExecutionResult, writer: &mut J) -> io::Result<()> {
        serialize_result(result, writer)
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("pipeline", &self.pipeline)
            .field("limits", &self.policy.limits)
            .field("setup", &self.setup)
            .finish_non_exhaustive()
    }
}

fn check_entry_signature(entry: &Function) -> Result<(), ExecutionError> {
    match entry.signature.params.as_slice() {
        [] | [ValueType::StringArray] => Ok(()),
        params => Err(ExecutionError::UnsupportedEntrySignature(format!("{params:?}"))),
    }
}
