//! Per-execution state machine.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::monitor::Monitor;
use crate::rewriter::WorkSession;

/// Where an execution is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    /// Program read and accepted
    Created,
    /// Rewriter pipeline applied
    Rewritten,
    /// Guard checks inserted and token issued
    GuardInjected,
    /// Isolation context created
    Isolated,
    /// Entry point invoked inside the context
    Invoked,
    /// Entry point returned normally
    Completed,
    /// Entry point raised a fault
    Faulted,
    /// Isolation context released
    TornDown,
}

impl ExecutionState {
    /// Whether `next` may follow this state
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Rewritten)
                | (Self::Rewritten, Self::GuardInjected)
                | (Self::GuardInjected, Self::Isolated)
                | (Self::Isolated, Self::Invoked | Self::TornDown)
                | (Self::Invoked, Self::Completed | Self::Faulted)
                | (Self::Completed | Self::Faulted, Self::TornDown)
        )
    }

    /// Whether the state is final
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::TornDown)
    }

    /// Display name
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Rewritten => "rewritten",
            Self::GuardInjected => "guard_injected",
            Self::Isolated => "isolated",
            Self::Invoked => "invoked",
            Self::Completed => "completed",
            Self::Faulted => "faulted",
            Self::TornDown => "torn_down",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracks one execution and reports every transition
pub(crate) struct Lifecycle<'a> {
    state: ExecutionState,
    session: &'a WorkSession,
    monitor: &'a dyn Monitor,
}

impl<'a> Lifecycle<'a> {
    pub(crate) fn start(session: &'a WorkSession, monitor: &'a dyn Monitor) -> Self {
        debug!(session = %session.id, state = %ExecutionState::Created, "execution state");
        monitor.lifecycle(ExecutionState::Created, session);
        Self {
            state: ExecutionState::Created,
            session,
            monitor,
        }
    }

    pub(crate) const fn state(&self) -> ExecutionState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: ExecutionState) {
        let valid = self.state.can_transition_to(next);
        if !valid {
            error!(
                session = %self.session.id,
                from = %self.state,
                to = %next,
                "invalid execution state transition"
            );
        }
        debug_assert!(valid, "invalid transition {} -> {}", self.state, next);
        self.state = next;
        debug!(session = %self.session.id, state = %next, "execution state");
        self.monitor.lifecycle(next, self.session);
    }
}
