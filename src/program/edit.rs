//! Instruction-level rewriting.
//!
//! Rewriters never patch a body in place. [`edit_function`] visits every
//! original instruction and lets the visitor emit a new sequence; jump
//! targets and the line table are then remapped so that anything emitted
//! before an instruction belongs to it (jumps land on the inserted prefix,
//! and the prefix is attributed to the instruction's source line).

use super::{Function, FunctionSymbols, Instr, LineEntry};

/// Collects the instructions emitted for one original instruction
#[derive(Debug, Default)]
pub struct Emitter {
    out: Vec<Instr>,
}

impl Emitter {
    /// Append an instruction
    pub fn emit(&mut self, instr: Instr) {
        self.out.push(instr);
    }
}

/// Rebuild a function body through `visit`.
///
/// `visit` receives the original index and instruction and must emit the
/// instruction itself (or a replacement) plus any instrumentation. Jumps
/// emitted by the visitor are expected to carry original targets.
///
/// # Errors
/// Propagates the first error returned by `visit`
pub fn edit_function<E>(
    function: &mut Function,
    symbols: Option<&mut FunctionSymbols>,
    mut visit: impl FnMut(u32, &Instr, &mut Emitter) -> Result<(), E>,
) -> Result<(), E> {
    let original = std::mem::take(&mut function.body);
    let mut emitter = Emitter {
        out: Vec::with_capacity(original.len()),
    };
    let mut starts = Vec::with_capacity(original.len() + 1);

    for (index, instr) in original.iter().enumerate() {
        starts.push(offset(emitter.out.len()));
        if let Err(e) = visit(offset(index), instr, &mut emitter) {
            function.body = original;
            return Err(e);
        }
    }
    starts.push(offset(emitter.out.len()));

    let remap = |old: u32| {
        starts
            .get(old as usize)
            .copied()
            .unwrap_or(old)
    };

    for instr in &mut emitter.out {
        if let Some(target) = instr.jump_target_mut() {
            *target = remap(*target);
        }
    }

    if let Some(symbols) = symbols {
        for LineEntry { offset, .. } in &mut symbols.lines {
            *offset = remap(*offset);
        }
    }

    function.body = emitter.out;
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
const fn offset(index: usize) -> u32 {
    index as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::Signature;
    use std::convert::Infallible;

    fn looping() -> Function {
        Function {
            signature: Signature::void(),
            locals: 0,
            body: vec![
                Instr::PushBool(true),  // 0
                Instr::JumpIfFalse(3),  // 1
                Instr::Jump(0),         // 2
                Instr::Return,          // 3
            ],
        }
    }

    #[test]
    fn test_inserted_prefix_receives_jumps() {
        let mut function = looping();
        edit_function::<Infallible>(&mut function, None, |_, instr, out| {
            if matches!(instr, Instr::Return) {
                out.emit(Instr::Nop);
            }
            out.emit(instr.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(
            function.body,
            vec![
                Instr::PushBool(true),
                Instr::JumpIfFalse(3),
                Instr::Jump(0),
                Instr::Nop,
                Instr::Return,
            ]
        );
    }

    #[test]
    fn test_line_table_follows_insertions() {
        let mut function = looping();
        let mut symbols = FunctionSymbols {
            name: "main".to_string(),
            lines: vec![LineEntry { offset: 0, line: 1 }, LineEntry { offset: 3, line: 2 }],
            locals: Vec::new(),
        };

        edit_function::<Infallible>(&mut function, Some(&mut symbols), |_, instr, out| {
            out.emit(Instr::Nop);
            out.emit(instr.clone());
            Ok(())
        })
        .unwrap();

        assert_eq!(symbols.lines[1].offset, 6);
        assert_eq!(function.body[3].jump_target(), Some(6));
        assert_eq!(function.body[5].jump_target(), Some(0));
    }

    #[test]
    fn test_failed_visit_leaves_body_untouched() {
        let mut function = looping();
        let result = edit_function(&mut function, None, |index, instr, out| {
            if index == 2 {
                return Err("nope");
            }
            out.emit(instr.clone());
            Ok(())
        });

        assert_eq!(result, Err("nope"));
        assert_eq!(function, looping());
    }
}
