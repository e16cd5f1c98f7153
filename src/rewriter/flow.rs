//! Flow instrumentation.

use std::collections::HashMap;

use tracing::debug;

use super::{ProgramRewriter, RewriteError, WorkSession};
use crate::program::{edit_function, CompiledProgram, Instr};

/// Reports every executed source line, and optionally the values stored
/// into named locals.
///
/// A `FlowLine` is inserted at each line-table entry; with notes enabled a
/// `FlowNote` follows every store into a local that has a source name.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowRewriter;

impl ProgramRewriter for FlowRewriter {
    fn name(&self) -> &'static str {
        "flow"
    }

    fn rewrite(&self, program: &mut CompiledProgram, session: &WorkSession) -> Result<(), RewriteError> {
        if !session.track_flow {
            return Ok(());
        }

        let mut inserted = 0usize;
        for (index, function) in program.image.functions.iter_mut().enumerate() {
            let symbols = program
                .symbols
                .functions
                .get_mut(index)
                .ok_or(RewriteError::MissingSymbols { function: index })?;

            let lines: HashMap<u32, u32> = symbols
                .lines
                .iter()
                .map(|entry| (entry.offset, entry.line))
                .collect();
            let locals = symbols.locals.clone();

            edit_function(function, Some(symbols), |offset, instr, out| {
                if let Some(line) = lines.get(&offset) {
                    out.emit(Instr::FlowLine(*line));
                    inserted += 1;
                }
                out.emit(instr.clone());
                if let (Instr::StoreLocal(slot), true) = (instr, session.track_notes) {
                    if let Some(name) = locals.get(usize::from(*slot)).and_then(Option::as_ref) {
                        out.emit(Instr::FlowNote {
                            local: *slot,
                            name: name.clone(),
                        });
                        inserted += 1;
                    }
                }
                Ok::<(), RewriteError>(())
            })?;
        }

        debug!(session = %session.id, inserted, "flow instrumentation inserted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{ProgramBuilder, Signature, SymbolMap};

    fn counter() -> CompiledProgram {
        let mut builder = ProgramBuilder::new();
        let main = builder.function("main", Signature::void(), |f| {
            let i = f.local("i");
            let scratch = f.temp();
            f.line(1).push_int(0).store(i);
            f.line(2).push_int(5).store(scratch);
            f.line(3).ret();
        });
        builder.set_entry_point(main);
        builder.build()
    }

    #[test]
    fn test_lines_and_notes_are_inserted() {
        let mut program = counter();
        FlowRewriter
            .rewrite(&mut program, &WorkSession::default())
            .unwrap();
        let body = &program.image.functions[0].body;

        assert_eq!(body[0], Instr::FlowLine(1));
        assert_eq!(
            body[3],
            Instr::FlowNote {
                local: 0,
                name: "i".to_string()
            }
        );
        assert_eq!(body[4], Instr::FlowLine(2));
        // temporaries have no source name
        assert_eq!(body[7], Instr::FlowLine(3));

        let lines = &program.symbols.functions[0].lines;
        assert_eq!(lines.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![0, 4, 7]);
    }

    #[test]
    fn test_notes_can_be_disabled() {
        let mut program = counter();
        let session = WorkSession {
            track_notes: false,
            ..WorkSession::default()
        };
        FlowRewriter.rewrite(&mut program, &session).unwrap();
        assert!(!program.image.functions[0]
            .body
            .iter()
            .any(|i| matches!(i, Instr::FlowNote { .. })));
    }

    #[test]
    fn test_disabled_session_is_untouched() {
        let mut program = counter();
        let before = program.clone();
        FlowRewriter
            .rewrite(&mut program, &WorkSession::output_only("s"))
            .unwrap();
        assert_eq!(program, before);
    }

    #[test]
    fn test_missing_symbols_fail() {
        let mut program = counter();
        program.symbols = SymbolMap::default();
        let err = FlowRewriter
            .rewrite(&mut program, &WorkSession::default())
            .unwrap_err();
        assert!(matches!(err, RewriteError::MissingSymbols { function: 0 }));
    }
}
