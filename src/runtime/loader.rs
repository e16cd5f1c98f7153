//! Loading and verifying a guarded image inside the isolation boundary.

use super::ProgramFault;
use crate::guard::GuardToken;
use crate::program::{fingerprint, Function, FunctionId, Instr, ProgramImage, ValueType};

/// A verified, guarded program ready to run
#[derive(Debug)]
pub struct LoadedProgram {
    image: ProgramImage,
}

impl LoadedProgram {
    /// Decode and verify the raw image the token was issued for.
    ///
    /// # Errors
    /// Returns an invalid-program fault if the bytes do not match the token,
    /// cannot be decoded, were never guarded, or fail verification
    pub fn load(bytes: &[u8], token: &GuardToken) -> Result<Self, ProgramFault> {
        if fingerprint(bytes) != *token.fingerprint() {
            return Err(ProgramFault::invalid_program(
                "guard token was not issued for this program",
            ));
        }
        let image = ProgramImage::from_bytes(bytes)
            .map_err(|e| ProgramFault::invalid_program(e.to_string()))?;
        if !image.guarded {
            return Err(ProgramFault::invalid_program("program has not been guarded"));
        }
        verify(&image)?;
        Ok(Self { image })
    }

    /// The verified image
    #[must_use]
    pub const fn image(&self) -> &ProgramImage {
        &self.image
    }

    /// Entry point and its function
    ///
    /// # Errors
    /// Returns an invalid-program fault when no entry point is declared
    pub fn entry(&self) -> Result<(FunctionId, &Function), ProgramFault> {
        self.image
            .entry_point
            .and_then(|id| self.image.function(id).map(|function| (id, function)))
            .ok_or_else(|| ProgramFault::invalid_program("program has no entry point"))
    }
}

/// Arguments for an entry point: none, or a single empty string array
///
/// # Errors
/// Returns an invalid-program fault for any other signature
pub fn entry_arguments(function: &Function) -> Result<Vec<super::Value>, ProgramFault> {
    match function.signature.params.as_slice() {
        [] => Ok(Vec::new()),
        [ValueType::StringArray] => Ok(vec![super::Value::array(Vec::new())]),
        _ => Err(ProgramFault::invalid_program(
            "entry point must take no arguments or a single string array",
        )),
    }
}

fn verify(image: &ProgramImage) -> Result<(), ProgramFault> {
    let function_count = image.functions.len();
    for (id, function) in image.functions.iter().enumerate() {
        let fail = |pc: usize, what: &str| {
            ProgramFault::invalid_program(format!("function #{id} at {pc}: {what}"))
        };

        if usize::from(function.locals) < function.signature.params.len() {
            return Err(fail(0, "fewer locals than parameters"));
        }
        let body_len = function.body.len();
        let local_ok = |slot: u16| slot < function.locals;

        for (pc, instr) in function.body.iter().enumerate() {
            match instr {
                Instr::Jump(target) | Instr::JumpIfFalse(target) => {
                    if *target as usize >= body_len {
                        return Err(fail(pc, "jump target out of range"));
                    }
                }
                Instr::Call(target) => {
                    if *target as usize >= function_count {
                        return Err(fail(pc, "call to unknown function"));
                    }
                }
                Instr::LoadLocal(slot)
                | Instr::StoreLocal(slot)
                | Instr::FlowNote { local: slot, .. } => {
                    if !local_ok(*slot) {
                        return Err(fail(pc, "local slot out of range"));
                    }
                }
                _ => {}
            }
        }
    }

    if let Some(entry) = image.entry_point {
        if entry as usize >= function_count {
            return Err(ProgramFault::invalid_program("entry point does not exist"));
        }
    }
    Ok(())
}
