//! Captured control flow.

use serde::{Deserialize, Serialize};

/// One recorded execution of an instrumented source line
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowStep {
    /// Source line
    pub line: u32,
    /// Value notes recorded while on this line
    pub notes: Option<String>,
    /// Kind of the exception raised on this line
    pub exception: Option<String>,
}

impl FlowStep {
    /// A step with neither notes nor exception
    #[must_use]
    pub const fn bare(line: u32) -> Self {
        Self {
            line,
            notes: None,
            exception: None,
        }
    }

    /// Whether the step serializes as a bare line number
    #[must_use]
    pub const fn is_bare(&self) -> bool {
        self.notes.is_none() && self.exception.is_none()
    }
}

/// Ordered log of flow steps
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlowLog {
    steps: Vec<FlowStep>,
}

impl FlowLog {
    /// Create an empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a line started executing
    pub fn report_line(&mut self, line: u32) {
        self.steps.push(FlowStep::bare(line));
    }

    /// Attach a note to the current step
    pub fn report_note(&mut self, note: &str) {
        let Some(step) = self.steps.last_mut() else {
            return;
        };
        match &mut step.notes {
            Some(notes) => {
                notes.push_str(", ");
                notes.push_str(note);
            }
            None => step.notes = Some(note.to_string()),
        }
    }

    /// Mark the current step as the one that raised `kind`
    pub fn report_exception(&mut self, kind: &str) {
        if let Some(step) = self.steps.last_mut() {
            step.exception = Some(kind.to_string());
        }
    }

    /// Steps in execution order
    #[must_use]
    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    /// Consume into the step list
    #[must_use]
    pub fn into_steps(self) -> Vec<FlowStep> {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notes_accumulate_on_current_step() {
        let mut log = FlowLog::new();
        log.report_line(1);
        log.report_line(2);
        log.report_note("i: 0");
        log.report_note("total: 5");

        assert_eq!(log.steps()[0], FlowStep::bare(1));
        assert_eq!(log.steps()[1].notes.as_deref(), Some("i: 0, total: 5"));
    }

    #[test]
    fn test_exception_marks_last_step() {
        let mut log = FlowLog::new();
        log.report_line(4);
        log.report_line(7);
        log.report_exception("DivideByZeroException");

        assert!(log.steps()[0].is_bare());
        assert_eq!(log.steps()[1].exception.as_deref(), Some("DivideByZeroException"));
    }

    #[test]
    fn test_reports_before_any_line_are_dropped() {
        let mut log = FlowLog::new();
        log.report_note("x: 1");
        log.report_exception("GuardException");
        assert!(log.into_steps().is_empty());
    }
}
