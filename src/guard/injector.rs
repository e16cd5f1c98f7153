//! Static guard injection.

use std::convert::Infallible;

use tracing::debug;

use super::{GuardPolicy, GuardRewriteError, GuardToken};
use crate::program::{
    edit_function, fingerprint, AllocationKind, CompiledProgram, GuardCheck, Instr, TypeLayout,
};

/// Rewrites programs to enforce a [`GuardPolicy`]
#[derive(Debug, Clone, Copy)]
pub struct GuardInjector<'p> {
    policy: &'p GuardPolicy,
}

impl<'p> GuardInjector<'p> {
    /// Create an injector for a policy
    #[must_use]
    pub const fn new(policy: &'p GuardPolicy) -> Self {
        Self { policy }
    }

    /// Insert run-time checks and issue the token for the guarded program.
    ///
    /// The rewrite is deterministic: the same program and policy always
    /// produce the same guarded image and token. Nothing is modified when
    /// an error is returned.
    ///
    /// # Errors
    /// Returns error if the program was already guarded or declares a
    /// disallowed explicit-layout type
    pub fn rewrite(&self, program: &mut CompiledProgram) -> Result<GuardToken, GuardRewriteError> {
        if program.image.guarded {
            return Err(GuardRewriteError::AlreadyGuarded);
        }

        if let Some(decl) = program.image.types.iter().find(|decl| {
            decl.layout == TypeLayout::Explicit && !self.policy.allows_explicit_layout(&decl.name)
        }) {
            return Err(GuardRewriteError::ExplicitLayout {
                type_name: decl.name.clone(),
            });
        }

        let mut checks = 0usize;
        let mut denied = 0usize;
        for (index, function) in program.image.functions.iter_mut().enumerate() {
            let symbols = program.symbols.functions.get_mut(index);
            let result = edit_function(function, symbols, |offset, instr, out| {
                if offset == 0 {
                    out.emit(Instr::Guard(GuardCheck::StackDepth));
                    checks += 1;
                }
                if let Some(check) = self.check_for(offset, instr) {
                    if matches!(check, GuardCheck::DeniedApi(_)) {
                        denied += 1;
                    }
                    out.emit(Instr::Guard(check));
                    checks += 1;
                }
                out.emit(instr.clone());
                Ok::<(), Infallible>(())
            });
            if let Err(never) = result {
                match never {}
            }
        }
        program.image.guarded = true;

        let image = program.image.to_bytes()?;
        let token = GuardToken::new(fingerprint(&image), self.policy.limits);
        debug!(
            program = %&token.fingerprint_hex()[..16],
            checks,
            denied,
            "guard injected"
        );
        Ok(token)
    }

    fn check_for(&self, offset: u32, instr: &Instr) -> Option<GuardCheck> {
        match instr {
            Instr::NewArray => Some(GuardCheck::Allocation(AllocationKind::Array)),
            Instr::Concat => Some(GuardCheck::Allocation(AllocationKind::Concat)),
            Instr::Jump(target) | Instr::JumpIfFalse(target) if *target <= offset => {
                Some(GuardCheck::Iteration)
            }
            Instr::CallExternal { api, .. } if !self.policy.api.is_allowed(api) => {
                Some(GuardCheck::DeniedApi(api.clone()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ProgramBuilder, Signature};
    use proptest::prelude::*;

    fn counting_loop(limit: i64) -> CompiledProgram {
        let mut builder = ProgramBuilder::new();
        let main = builder.function("main", Signature::void(), |f| {
            let i = f.local("i");
            let top = f.label();
            let done = f.label();
            f.line(1).push_int(0).store(i);
            f.place(top);
            f.line(2).load(i).push_int(limit).emit(Instr::Lt).jump_if_false(done);
            f.line(3).load(i).push_int(1).emit(Instr::Add).store(i);
            f.push_int(4).emit(Instr::NewArray).emit(Instr::Pop);
            f.jump(top);
            f.place(done);
            f.line(4).ret();
        });
        builder.set_entry_point(main);
        builder.build()
    }

    #[test]
    fn test_checks_precede_risky_instructions() {
        let mut program = counting_loop(3);
        GuardInjector::new(&GuardPolicy::default())
            .rewrite(&mut program)
            .unwrap();
        let body = &program.image.functions[0].body;

        assert_eq!(body[0], Instr::Guard(GuardCheck::StackDepth));
        let array = body.iter().position(|i| *i == Instr::NewArray).unwrap();
        assert_eq!(
            body[array - 1],
            Instr::Guard(GuardCheck::Allocation(AllocationKind::Array))
        );
        let back_edge = body
            .iter()
            .position(|i| matches!(i, Instr::Jump(_)))
            .unwrap();
        assert_eq!(body[back_edge - 1], Instr::Guard(GuardCheck::Iteration));
        assert!(program.image.guarded);
    }

    #[test]
    fn test_forward_jumps_are_not_metered() {
        let mut program = counting_loop(3);
        GuardInjector::new(&GuardPolicy::default())
            .rewrite(&mut program)
            .unwrap();
        let iteration_checks = program.image.functions[0]
            .body
            .iter()
            .filter(|i| **i == Instr::Guard(GuardCheck::Iteration))
            .count();
        assert_eq!(iteration_checks, 1);
    }

    #[test]
    fn test_denied_api_is_guarded() {
        let mut builder = ProgramBuilder::new();
        let main = builder.function("main", Signature::void(), |f| {
            f.push_str("HOME").call_external("env.var", 1).emit(Instr::Pop).ret();
        });
        builder.set_entry_point(main);
        let mut program = builder.build();

        GuardInjector::new(&GuardPolicy::default())
            .rewrite(&mut program)
            .unwrap();
        assert!(program.image.functions[0]
            .body
            .contains(&Instr::Guard(GuardCheck::DeniedApi("env.var".to_string()))));
    }

    #[test]
    fn test_explicit_layout_rejected_unless_excepted() {
        let policy = GuardPolicy::default();

        let mut builder = ProgramBuilder::new();
        builder.declare_type("<StaticData>.Block8", TypeLayout::Explicit);
        assert!(GuardInjector::new(&policy).rewrite(&mut builder.build()).is_ok());

        let mut builder = ProgramBuilder::new();
        builder.declare_type("Overlay", TypeLayout::Explicit);
        let mut program = builder.build();
        let before = program.clone();
        let err = GuardInjector::new(&policy).rewrite(&mut program).unwrap_err();

        assert!(matches!(err, GuardRewriteError::ExplicitLayout { ref type_name } if type_name == "Overlay"));
        assert_eq!(program, before);
    }

    #[test]
    fn test_guarding_twice_is_rejected() {
        let mut program = counting_loop(1);
        let policy = GuardPolicy::default();
        let injector = GuardInjector::new(&policy);
        injector.rewrite(&mut program).unwrap();
        assert!(matches!(
            injector.rewrite(&mut program),
            Err(GuardRewriteError::AlreadyGuarded)
        ));
    }

    #[test]
    fn test_line_table_points_at_guard_prefix() {
        let mut program = counting_loop(3);
        GuardInjector::new(&GuardPolicy::default())
            .rewrite(&mut program)
            .unwrap();
        let symbols = program.symbols.function(0).unwrap();
        assert_eq!(symbols.line_at(0), Some(1));
    }

    proptest! {
        #[test]
        fn prop_rewrite_is_deterministic(limit in 0i64..1000) {
            let policy = GuardPolicy::default();
            let mut first = counting_loop(limit);
            let mut second = counting_loop(limit);

            let a = GuardInjector::new(&policy).rewrite(&mut first).unwrap();
            let b = GuardInjector::new(&policy).rewrite(&mut second).unwrap();

            prop_assert_eq!(a, b);
            prop_assert_eq!(first, second);
        }
    }
}
