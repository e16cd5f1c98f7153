//! Guard tokens and the scope they open.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{GuardLimits, GuardViolation};

/// Run-time capability for one guarded invocation.
///
/// Issued by the guard injector, bound to the fingerprint of the guarded
/// image, and carried across the isolation boundary as plain data. It is
/// consumed by [`enter`](Self::enter), so a token can scope at most one
/// invocation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardToken {
    fingerprint: [u8; 32],
    limits: GuardLimits,
}

impl GuardToken {
    pub(crate) const fn new(fingerprint: [u8; 32], limits: GuardLimits) -> Self {
        Self {
            fingerprint,
            limits,
        }
    }

    /// Fingerprint of the guarded image this token scopes
    #[must_use]
    pub const fn fingerprint(&self) -> &[u8; 32] {
        &self.fingerprint
    }

    /// Fingerprint as hex
    #[must_use]
    pub fn fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }

    /// Budget carried by the token
    #[must_use]
    pub const fn limits(&self) -> &GuardLimits {
        &self.limits
    }

    /// Open the guarded scope
    #[must_use]
    pub fn enter(self) -> GuardScope {
        debug!(program = %&self.fingerprint_hex()[..16], "entering guard scope");
        GuardScope {
            token: self,
            allocated_bytes: 0,
            iterations: 0,
            peak_stack_depth: 0,
            released: false,
        }
    }
}

impl fmt::Debug for GuardToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuardToken")
            .field("program", &&self.fingerprint_hex()[..16])
            .field("limits", &self.limits)
            .finish()
    }
}

/// Resource usage observed during a guarded invocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardUsage {
    /// Bytes charged against the allocation budget
    pub allocated_bytes: u64,
    /// Backward jumps taken plus functions entered
    pub iterations: u64,
    /// Deepest call stack observed
    pub peak_stack_depth: usize,
}

/// Live resource budget of one guarded invocation.
///
/// The scope is released exactly once: explicitly through
/// [`exit`](Self::exit), or on drop when an invocation unwinds early.
#[derive(Debug)]
pub struct GuardScope {
    token: GuardToken,
    allocated_bytes: u64,
    iterations: u64,
    peak_stack_depth: usize,
    released: bool,
}

impl GuardScope {
    /// Check the call-stack depth on function entry
    ///
    /// # Errors
    /// Returns a violation when `depth` exceeds the limit
    pub fn check_stack_depth(&mut self, depth: usize) -> Result<(), GuardViolation> {
        self.peak_stack_depth = self.peak_stack_depth.max(depth);
        let limit = self.token.limits.max_stack_depth;
        if depth > limit {
            return Err(GuardViolation::StackDepth { limit });
        }
        Ok(())
    }

    /// Check the stack depth and charge the entry against the work budget.
    ///
    /// Function entries share the iteration budget with loop back-edges,
    /// so recursion that fans out without looping is bounded as well.
    ///
    /// # Errors
    /// Returns a violation when either limit is exceeded
    pub fn enter_function(&mut self, depth: usize) -> Result<(), GuardViolation> {
        self.check_stack_depth(depth)?;
        self.tick_iteration()
    }

    /// Charge an allocation against the cumulative budget
    ///
    /// # Errors
    /// Returns a violation when the budget would be exceeded
    pub fn charge_allocation(&mut self, bytes: u64) -> Result<(), GuardViolation> {
        let limit = self.token.limits.max_allocated_bytes;
        let total = self.allocated_bytes.saturating_add(bytes);
        if total > limit {
            return Err(GuardViolation::Allocation {
                limit,
                requested: bytes,
            });
        }
        self.allocated_bytes = total;
        Ok(())
    }

    /// Count one unit of work (a loop iteration or a function entry)
    ///
    /// # Errors
    /// Returns a violation when the work budget is exhausted
    pub fn tick_iteration(&mut self) -> Result<(), GuardViolation> {
        let limit = self.token.limits.max_iterations;
        self.iterations += 1;
        if self.iterations > limit {
            return Err(GuardViolation::Iterations { limit });
        }
        Ok(())
    }

    /// Usage so far
    #[must_use]
    pub const fn usage(&self) -> GuardUsage {
        GuardUsage {
            allocated_bytes: self.allocated_bytes,
            iterations: self.iterations,
            peak_stack_depth: self.peak_stack_depth,
        }
    }

    /// Release the scope and report usage
    #[must_use]
    pub fn exit(mut self) -> GuardUsage {
        self.release();
        self.usage()
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            trace!(usage = ?self.usage(), "guard scope released");
        }
    }
}

impl Drop for GuardScope {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(limits: GuardLimits) -> GuardToken {
        GuardToken::new([7; 32], limits)
    }

    #[test]
    fn test_allocation_budget_is_cumulative() {
        let mut scope = token(GuardLimits {
            max_allocated_bytes: 100,
            ..GuardLimits::default()
        })
        .enter();

        assert!(scope.charge_allocation(60).is_ok());
        assert_eq!(
            scope.charge_allocation(50),
            Err(GuardViolation::Allocation {
                limit: 100,
                requested: 50
            })
        );
        assert_eq!(scope.usage().allocated_bytes, 60);
    }

    #[test]
    fn test_stack_depth_limit() {
        let mut scope = token(GuardLimits {
            max_stack_depth: 2,
            ..GuardLimits::default()
        })
        .enter();

        assert!(scope.check_stack_depth(2).is_ok());
        assert_eq!(
            scope.check_stack_depth(3),
            Err(GuardViolation::StackDepth { limit: 2 })
        );
        assert_eq!(scope.usage().peak_stack_depth, 3);
    }

    #[test]
    fn test_iteration_budget() {
        let mut scope = token(GuardLimits {
            max_iterations: 2,
            ..GuardLimits::default()
        })
        .enter();

        assert!(scope.tick_iteration().is_ok());
        assert!(scope.tick_iteration().is_ok());
        assert!(scope.tick_iteration().is_err());
    }

    #[test]
    fn test_function_entry_spends_work_budget() {
        let mut scope = token(GuardLimits {
            max_iterations: 3,
            ..GuardLimits::default()
        })
        .enter();

        assert!(scope.enter_function(1).is_ok());
        assert!(scope.tick_iteration().is_ok());
        assert!(scope.enter_function(2).is_ok());
        assert_eq!(
            scope.enter_function(1),
            Err(GuardViolation::Iterations { limit: 3 })
        );
        assert_eq!(scope.usage().peak_stack_depth, 2);
    }

    #[test]
    fn test_exit_reports_usage() {
        let mut scope = token(GuardLimits::default()).enter();
        scope.charge_allocation(8).unwrap();
        let usage = scope.exit();
        assert_eq!(usage.allocated_bytes, 8);
    }

    #[test]
    fn test_token_survives_bincode() {
        let original = token(GuardLimits::default());
        let bytes = bincode::serialize(&original).unwrap();
        let decoded: GuardToken = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, original);
    }
}
