//! # Tracebox
//!
//! Guarded, isolated execution of compiled programs with output and flow
//! capture.
//!
//! ## Architecture
//!
//! An execution request passes through four stages:
//! - **Rewrite**: instrumentation rewriters add flow reporting
//! - **Guard**: run-time checks are injected and a token issued
//! - **Isolate**: the guarded image runs on a dedicated worker
//! - **Capture**: output and flow are collected and returned as a result
//!
//! ## Security Model
//!
//! - Stack depth, allocation volume (captured output included) and work
//!   (loop iterations plus function entries) are budgeted
//! - External APIs are allow/deny listed; denied calls fault at the call site
//! - Explicit-layout types are rejected unless known to be compiler artifacts
//! - Guard violations and invalid-program faults are reported to a monitor

#![forbid(unsafe_code)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms
)]
#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]

pub mod capture;
pub mod config;
pub mod error;
pub mod executor;
pub mod guard;
pub mod isolation;
pub mod logging;
pub mod monitor;
pub mod program;
pub mod rewriter;
pub mod runtime;
pub mod serialize;

pub use capture::{ExecutionResult, FlowStep, InspectionEntry, OutputItem};
pub use config::{ConfigError, EngineConfig};
pub use error::ExecutionError;
pub use executor::{ExecutionOutcome, ExecutionState, Executor, ExecutorBuilder};
pub use guard::{GuardInjector, GuardLimits, GuardPolicy, GuardToken, GuardViolation};
pub use isolation::{ContextSetup, IsolationContext, IsolationError};
pub use monitor::{Monitor, TracingMonitor};
pub use program::{CompiledProgram, ProgramBuilder, ProgramError};
pub use rewriter::{ProgramRewriter, RewriteError, RewriterPipeline, WorkSession};
pub use runtime::{FaultKind, ProgramFault};
pub use serialize::{parse_result, serialize_result, JsonWriter, StreamingJsonWriter};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
