//! Monitoring side channel.
//!
//! Only two fault kinds reach a monitor: guard violations and run-time
//! invalid-program faults. Both mean either the program tried something the
//! policy forbids, or the rewrite let through something the runtime could
//! not load. Ordinary program exceptions stay in the result.

use tracing::{trace, warn};

use crate::executor::ExecutionState;
use crate::rewriter::WorkSession;
use crate::runtime::ProgramFault;

/// Receives security-relevant faults and lifecycle transitions
pub trait Monitor: Send + Sync {
    /// A guard violation or invalid-program fault ended an execution
    fn exception(&self, fault: &ProgramFault, session: &WorkSession);

    /// An execution entered a new state
    fn lifecycle(&self, _state: ExecutionState, _session: &WorkSession) {}
}

/// Reports faults as `tracing` warnings
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn exception(&self, fault: &ProgramFault, session: &WorkSession) {
        warn!(
            session = %session.id,
            kind = fault.kind.name(),
            message = %fault.message,
            "monitored fault"
        );
    }

    fn lifecycle(&self, state: ExecutionState, session: &WorkSession) {
        trace!(session = %session.id, %state, "execution state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::GuardViolation;

    #[test]
    fn test_tracing_monitor_accepts_faults() {
        let fault: ProgramFault = GuardViolation::StackDepth { limit: 1 }.into();
        let session = WorkSession::default();
        TracingMonitor.exception(&fault, &session);
        TracingMonitor.lifecycle(ExecutionState::Created, &session);
    }
}
