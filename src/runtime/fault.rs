//! Faults raised by running programs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::guard::GuardViolation;
use crate::program::FunctionId;

/// Category of a program fault
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// Guard policy tripped
    Guard(GuardViolation),
    /// The program is not loadable or executable as written
    InvalidProgram,
    /// Integer division or remainder by zero
    DivideByZero,
    /// Checked arithmetic overflowed, or a negative array length
    Overflow,
    /// Array index outside its bounds
    IndexOutOfRange,
    /// Operation on `null`
    NullReference,
    /// Operand of the wrong type
    InvalidCast,
    /// Raised by the program with a kind name of its choosing
    Thrown(String),
}

impl FaultKind {
    /// Name reported as the exception kind in flow and output
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Guard(_) => "GuardException",
            Self::InvalidProgram => "InvalidProgramException",
            Self::DivideByZero => "DivideByZeroException",
            Self::Overflow => "OverflowException",
            Self::IndexOutOfRange => "IndexOutOfRangeException",
            Self::NullReference => "NullReferenceException",
            Self::InvalidCast => "InvalidCastException",
            Self::Thrown(name) => name,
        }
    }
}

/// An exception raised while a program ran
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {}", .kind.name(), .message)]
pub struct ProgramFault {
    /// Category
    pub kind: FaultKind,
    /// Human-readable message
    pub message: String,
}

impl ProgramFault {
    /// Create a fault
    #[must_use]
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// An invalid-program fault
    #[must_use]
    pub fn invalid_program(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidProgram, message)
    }

    /// An operand type mismatch
    #[must_use]
    pub fn invalid_cast(expected: &str, actual: &str) -> Self {
        Self::new(
            FaultKind::InvalidCast,
            format!("expected {expected}, found {actual}"),
        )
    }

    /// Whether the fault is a guard violation
    #[must_use]
    pub const fn is_guard_violation(&self) -> bool {
        matches!(self.kind, FaultKind::Guard(_))
    }

    /// Whether the fault is an invalid-program fault
    #[must_use]
    pub const fn is_invalid_program(&self) -> bool {
        matches!(self.kind, FaultKind::InvalidProgram)
    }
}

impl From<GuardViolation> for ProgramFault {
    fn from(violation: GuardViolation) -> Self {
        let message = violation.to_string();
        Self::new(FaultKind::Guard(violation), message)
    }
}

/// Failure of an invocation through the VM.
///
/// Faults that escape the invoked function arrive wrapped in
/// [`Target`](Self::Target); faults raised before the function started
/// (loading, argument binding) arrive bare.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum InvocationError {
    /// The invoked function raised a fault
    #[error("invocation of function #{function} failed: {cause}")]
    Target {
        /// Invoked function
        function: FunctionId,
        /// What the function raised
        cause: ProgramFault,
    },
    /// The invocation never started
    #[error(transparent)]
    Fault(ProgramFault),
}

impl InvocationError {
    /// The fault that actually occurred
    #[must_use]
    pub fn into_cause(self) -> ProgramFault {
        match self {
            Self::Target { cause, .. } | Self::Fault(cause) => cause,
        }
    }
}

impl From<ProgramFault> for InvocationError {
    fn from(fault: ProgramFault) -> Self {
        Self::Fault(fault)
    }
}
