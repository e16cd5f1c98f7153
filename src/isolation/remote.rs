//! The fixed entry function run inside an isolation context.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::capture::{self, CaptureSession, ExecutionResult};
use crate::guard::GuardToken;
use crate::runtime::{entry_arguments, HostApi, InvocationError, LoadedProgram, ProgramFault, Vm};

/// What crosses into the boundary
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Encoded guarded image
    pub program: Vec<u8>,
    /// Token issued for exactly these bytes
    pub token: GuardToken,
}

/// What crosses back out
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteReply {
    /// Captured output and flow, partial if the program faulted
    pub result: ExecutionResult,
    /// The fault that ended execution, if any
    pub fault: Option<ProgramFault>,
}

/// Run one guarded program and capture everything it produced.
///
/// Never fails: faults are recorded as a flow exception marker plus an
/// `Exception` inspection, and returned alongside the partial result.
pub fn execute(host: &HostApi, request: RemoteRequest) -> RemoteReply {
    let session = CaptureSession::open();
    let fault = invoke(host, &request.program, request.token).err();
    if let Some(fault) = &fault {
        capture::report_exception(fault.kind.name());
        capture::inspect("Exception", fault.to_string());
    }
    RemoteReply {
        result: session.finish(),
        fault,
    }
}

fn invoke(host: &HostApi, program: &[u8], token: GuardToken) -> Result<(), ProgramFault> {
    let loaded = LoadedProgram::load(program, &token)?;
    let (entry, function) = loaded.entry()?;
    let args = entry_arguments(function)?;
    let returns = function.signature.returns.is_some();

    let mut scope = token.enter();
    let mut vm = Vm::new(&loaded, host, &mut scope);
    let value = vm
        .invoke(entry, args)
        .map_err(InvocationError::into_cause)?;
    if returns {
        capture::inspect("Return", value.to_string());
    }
    // the returned value must be rendered before the vm releases its arrays
    drop(value);
    drop(vm);
    let usage = scope.exit();
    trace!(?usage, "entry point returned");
    Ok(())
}

/// Decode a request, execute it and encode the reply
pub(super) fn dispatch(host: &HostApi, request: &[u8]) -> Vec<u8> {
    let reply = match bincode::deserialize::<RemoteRequest>(request) {
        Ok(request) => execute(host, request),
        Err(e) => RemoteReply {
            result: ExecutionResult::default(),
            fault: Some(ProgramFault::invalid_program(format!(
                "malformed isolation request: {e}"
            ))),
        },
    };
    // an empty reply surfaces as a decode error on the caller's side
    bincode::serialize(&reply).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FlowStep, InspectionEntry, OutputItem};
    use crate::guard::{GuardInjector, GuardPolicy};
    use crate::program::{FunctionBuilder, Instr, ProgramBuilder, Signature, ValueType};
    use crate::runtime::FaultKind;

    fn request(signature: Signature, assemble: impl FnOnce(&mut FunctionBuilder)) -> RemoteRequest {
        let mut builder = ProgramBuilder::new();
        let main = builder.function("main", signature, assemble);
        builder.set_entry_point(main);
        let mut program = builder.build();
        let token = GuardInjector::new(&GuardPolicy::default())
            .rewrite(&mut program)
            .unwrap();
        RemoteRequest {
            program: program.image.to_bytes().unwrap(),
            token,
        }
    }

    #[test]
    fn test_return_value_is_inspected() {
        let reply = execute(
            &HostApi::standard(),
            request(
                Signature {
                    params: Vec::new(),
                    returns: Some(ValueType::Int),
                },
                |f| {
                    f.push_int(7).ret();
                },
            ),
        );
        assert!(reply.fault.is_none());
        assert_eq!(
            reply.result.output,
            vec![OutputItem::Inspection(InspectionEntry {
                title: "Return".to_string(),
                value: "7".to_string(),
            })]
        );
    }

    #[test]
    fn test_string_array_entry_gets_empty_array() {
        let reply = execute(
            &HostApi::standard(),
            request(
                Signature {
                    params: vec![ValueType::StringArray],
                    returns: Some(ValueType::Int),
                },
                |f| {
                    f.load(0).emit(Instr::ArrayLen).ret();
                },
            ),
        );
        assert_eq!(
            reply.result.output,
            vec![OutputItem::Inspection(InspectionEntry {
                title: "Return".to_string(),
                value: "0".to_string(),
            })]
        );
    }

    #[test]
    fn test_fault_is_marked_and_inspected() {
        let reply = execute(
            &HostApi::standard(),
            request(Signature::void(), |f| {
                f.line(1).push_str("hi").call_external("console.write", 1);
                f.line(2).push_int(1).push_int(0).emit(Instr::Div).emit(Instr::Pop).ret();
            }),
        );
        let fault = reply.fault.unwrap();
        assert_eq!(fault.kind, FaultKind::DivideByZero);
        assert_eq!(reply.result.output.len(), 2);
        assert_eq!(reply.result.output[0], OutputItem::Text("hi".to_string()));
        assert!(matches!(
            &reply.result.output[1],
            OutputItem::Inspection(entry) if entry.title == "Exception"
        ));
        // no flow instrumentation was applied, so there is no step to mark
        assert!(reply.result.flow.is_empty());
    }

    #[test]
    fn test_flow_exception_marks_last_step() {
        let reply = execute(
            &HostApi::standard(),
            request(Signature::void(), |f| {
                f.emit(Instr::FlowLine(4));
                f.push_str("bad").throw("FormatException");
            }),
        );
        assert_eq!(
            reply.result.flow,
            vec![FlowStep {
                line: 4,
                notes: None,
                exception: Some("FormatException".to_string()),
            }]
        );
    }

    #[test]
    fn test_malformed_request_is_invalid_program() {
        let bytes = dispatch(&HostApi::standard(), b"junk");
        let reply: RemoteReply = bincode::deserialize(&bytes).unwrap();
        assert!(reply.fault.unwrap().is_invalid_program());
    }
}
