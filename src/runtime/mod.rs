//! Execution of guarded programs.
//!
//! Everything here runs inside an isolation context's worker thread.
//! Values are reference counted without synchronization, so nothing in this
//! module crosses the boundary; only encoded images and results do.

mod fault;
mod host;
mod loader;
mod value;
mod vm;

pub use fault::{FaultKind, InvocationError, ProgramFault};
pub use host::{HostApi, HostFunction, STANDARD_LIBRARIES};
pub use loader::{entry_arguments, LoadedProgram};
pub use value::Value;
pub use vm::{Vm, VALUE_SLOT_BYTES};
