//! Entry point resolution by conventional name.

use tracing::debug;

use super::{ProgramRewriter, RewriteError, WorkSession};
use crate::program::CompiledProgram;

/// Name looked up when a program declares no entry point
pub const CONVENTIONAL_ENTRY: &str = "main";

/// Designates the function named `main` as entry point when none is declared.
///
/// A declared entry point is never overridden. Programs without a `main` are
/// left alone; the executor rejects them afterwards.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryPointRewriter;

impl ProgramRewriter for EntryPointRewriter {
    fn name(&self) -> &'static str {
        "entry_point"
    }

    fn rewrite(&self, program: &mut CompiledProgram, session: &WorkSession) -> Result<(), RewriteError> {
        if program.image.entry_point.is_some() {
            return Ok(());
        }
        if let Some(id) = program.symbols.find(CONVENTIONAL_ENTRY) {
            if program.image.function(id).is_some() {
                debug!(session = %session.id, function = id, "entry point resolved by name");
                program.image.entry_point = Some(id);
            }
        }
        Ok(())
    }
}
