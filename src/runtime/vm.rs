//! Stack machine interpreter.
//!
//! Guest calls push frames onto an explicit frame stack, so guest recursion
//! never consumes host stack. Every fault escaping the invoked function is
//! wrapped in [`InvocationError::Target`].
//!
//! Arrays created during an invocation belong to the [`Vm`]: dropping it
//! empties every array still alive, so reference cycles built by the program
//! are freed with it.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::{FaultKind, HostApi, InvocationError, LoadedProgram, ProgramFault, Value};
use crate::capture;
use crate::guard::{GuardScope, GuardViolation};
use crate::program::{AllocationKind, FunctionId, GuardCheck, Instr, ProgramImage};

/// Bytes charged per array element
pub const VALUE_SLOT_BYTES: u64 = 16;

#[derive(Debug)]
struct Frame {
    function: FunctionId,
    pc: usize,
    locals: Vec<Value>,
    base: usize,
}

/// Executes one loaded program under a guard scope
pub struct Vm<'a> {
    program: &'a ProgramImage,
    host: &'a HostApi,
    guard: &'a mut GuardScope,
    frames: Vec<Frame>,
    stack: Vec<Value>,
    arrays: Vec<Weak<RefCell<Vec<Value>>>>,
}

impl<'a> Vm<'a> {
    /// Create a VM
    pub fn new(program: &'a LoadedProgram, host: &'a HostApi, guard: &'a mut GuardScope) -> Self {
        Self {
            program: program.image(),
            host,
            guard,
            frames: Vec::new(),
            stack: Vec::new(),
            arrays: Vec::new(),
        }
    }

    /// Invoke a function to completion
    ///
    /// # Errors
    /// Returns a bare fault if the arguments do not fit the signature, and a
    /// wrapped fault if the function itself faulted
    pub fn invoke(&mut self, id: FunctionId, args: Vec<Value>) -> Result<Value, InvocationError> {
        let function = self
            .program
            .function(id)
            .ok_or_else(|| ProgramFault::invalid_program(format!("function #{id} does not exist")))?;
        let params = &function.signature.params;
        if args.len() != params.len() {
            return Err(ProgramFault::invalid_program(format!(
                "function #{id} takes {} arguments, {} given",
                params.len(),
                args.len()
            ))
            .into());
        }
        if let Some((expected, actual)) = params
            .iter()
            .zip(&args)
            .find(|(expected, actual)| !actual.conforms_to(**expected))
        {
            return Err(ProgramFault::invalid_cast(&format!("{expected:?}"), actual.type_name()).into());
        }

        self.frames.clear();
        self.stack.clear();
        args.iter().for_each(|arg| self.track(arg));
        self.run(id, args)
            .map_err(|cause| InvocationError::Target { function: id, cause })
    }

    fn run(&mut self, entry: FunctionId, args: Vec<Value>) -> Result<Value, ProgramFault> {
        let program = self.program;
        self.push_frame(entry, args)?;

        loop {
            let (id, pc) = {
                let frame = self.frame_mut()?;
                frame.pc += 1;
                (frame.function, frame.pc - 1)
            };
            let instr = program
                .function(id)
                .and_then(|function| function.body.get(pc))
                .ok_or_else(|| {
                    ProgramFault::invalid_program("execution ran past the end of a function")
                })?;

            match instr {
                Instr::Nop => {}
                Instr::PushNull => self.push(Value::Null),
                Instr::PushInt(value) => self.push(Value::Int(*value)),
                Instr::PushBool(value) => self.push(Value::Bool(*value)),
                Instr::PushStr(value) => self.push(Value::str(value)),
                Instr::Pop => {
                    self.pop()?;
                }
                Instr::Dup => {
                    let value = self.peek(0)?.clone();
                    self.push(value);
                }
                Instr::LoadLocal(slot) => {
                    let value = self.local(*slot)?.clone();
                    self.push(value);
                }
                Instr::StoreLocal(slot) => {
                    let value = self.pop()?;
                    *self.local_mut(*slot)? = value;
                }
                Instr::Add | Instr::Sub | Instr::Mul | Instr::Div | Instr::Rem => {
                    self.arithmetic(instr)?;
                }
                Instr::Eq => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    self.push(Value::Bool(left == right));
                }
                Instr::Lt | Instr::Gt => {
                    let right = self.pop_int()?;
                    let left = self.pop_int()?;
                    let result = if matches!(instr, Instr::Lt) {
                        left < right
                    } else {
                        left > right
                    };
                    self.push(Value::Bool(result));
                }
                Instr::Not => {
                    let value = self.pop_bool()?;
                    self.push(Value::Bool(!value));
                }
                Instr::Concat => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    self.push(Value::str(&format!("{left}{right}")));
                }
                Instr::NewArray => {
                    let length = self.pop_int()?;
                    let length = usize::try_from(length).map_err(|_| {
                        ProgramFault::new(FaultKind::Overflow, "array length cannot be negative")
                    })?;
                    let array = Value::array(vec![Value::Null; length]);
                    self.track(&array);
                    self.push(array);
                }
                Instr::LoadElem => {
                    let index = self.pop_int()?;
                    let array = self.pop()?;
                    let element = with_array(&array, |items| {
                        element_index(items.len(), index).map(|i| items[i].clone())
                    })?;
                    self.push(element);
                }
                Instr::StoreElem => {
                    let value = self.pop()?;
                    let index = self.pop_int()?;
                    let array = self.pop()?;
                    let Value::Array(items) = &array else {
                        return Err(array_fault(&array));
                    };
                    let mut items = items.borrow_mut();
                    let i = element_index(items.len(), index)?;
                    items[i] = value;
                }
                Instr::ArrayLen => {
                    let array = self.pop()?;
                    let length = with_array(&array, |items| Ok(items.len()))?;
                    let length = i64::try_from(length).map_err(|_| {
                        ProgramFault::new(FaultKind::Overflow, "array length overflow")
                    })?;
                    self.push(Value::Int(length));
                }
                Instr::Jump(target) => self.jump(*target)?,
                Instr::JumpIfFalse(target) => {
                    if !self.pop_bool()? {
                        self.jump(*target)?;
                    }
                }
                Instr::Call(callee) => {
                    let params = program
                        .function(*callee)
                        .map(|function| function.signature.params.len())
                        .ok_or_else(|| ProgramFault::invalid_program("call to unknown function"))?;
                    let args = self.pop_n(params)?;
                    self.push_frame(*callee, args)?;
                }
                Instr::CallExternal { api, argc } => {
                    let host = self.host;
                    let function = host.resolve(api).ok_or_else(|| {
                        ProgramFault::invalid_program(format!("unresolved external '{api}'"))
                    })?;
                    if function.arity != usize::from(*argc) {
                        return Err(ProgramFault::invalid_program(format!(
                            "external '{api}' takes {} arguments, {argc} given",
                            function.arity
                        )));
                    }
                    let args = self.pop_n(function.arity)?;
                    let result = function.call(&args, self.guard)?;
                    if function.returns {
                        self.push(result);
                    }
                }
                Instr::Return => {
                    if let Some(value) = self.return_from(program)? {
                        return Ok(value);
                    }
                }
                Instr::Throw(kind) => {
                    let message = self.pop()?;
                    return Err(ProgramFault::new(
                        FaultKind::Thrown(kind.clone()),
                        message.to_string(),
                    ));
                }
                Instr::FlowLine(line) => capture::report_line(*line),
                Instr::FlowNote { local, name } => {
                    let bytes = name.len() + 2 + self.local(*local)?.display_len();
                    self.guard
                        .charge_allocation(u64::try_from(bytes).unwrap_or(u64::MAX))?;
                    let note = format!("{name}: {}", self.local(*local)?);
                    capture::report_note(&note);
                }
                Instr::Guard(check) => self.check(check)?,
            }
        }
    }

    /// Pops the current frame; returns the final value once the last frame is gone
    fn return_from(&mut self, program: &ProgramImage) -> Result<Option<Value>, ProgramFault> {
        let returns = {
            let frame = self.frame_mut()?;
            program
                .function(frame.function)
                .is_some_and(|function| function.signature.returns.is_some())
        };
        let value = if returns { self.pop()? } else { Value::Null };
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| ProgramFault::invalid_program("return without a frame"))?;
        self.stack.truncate(frame.base);

        if self.frames.is_empty() {
            return Ok(Some(value));
        }
        if returns {
            self.push(value);
        }
        Ok(None)
    }

    fn check(&mut self, check: &GuardCheck) -> Result<(), ProgramFault> {
        match check {
            GuardCheck::StackDepth => self.guard.enter_function(self.frames.len())?,
            GuardCheck::Allocation(AllocationKind::Array) => {
                let length = match self.peek(0)? {
                    Value::Int(length) => u64::try_from(*length).unwrap_or(0),
                    _ => 0,
                };
                self.guard
                    .charge_allocation(length.saturating_mul(VALUE_SLOT_BYTES))?;
            }
            GuardCheck::Allocation(AllocationKind::Concat) => {
                let bytes = self.peek(0)?.display_len() + self.peek(1)?.display_len();
                self.guard
                    .charge_allocation(u64::try_from(bytes).unwrap_or(u64::MAX))?;
            }
            GuardCheck::Iteration => self.guard.tick_iteration()?,
            GuardCheck::DeniedApi(api) => {
                return Err(GuardViolation::ApiDenied { api: api.clone() }.into());
            }
        }
        Ok(())
    }

    fn arithmetic(&mut self, instr: &Instr) -> Result<(), ProgramFault> {
        let right = self.pop_int()?;
        let left = self.pop_int()?;
        let result = match instr {
            Instr::Add => left.checked_add(right),
            Instr::Sub => left.checked_sub(right),
            Instr::Mul => left.checked_mul(right),
            Instr::Div | Instr::Rem if right == 0 => {
                return Err(ProgramFault::new(
                    FaultKind::DivideByZero,
                    "attempted to divide by zero",
                ));
            }
            Instr::Div => left.checked_div(right),
            Instr::Rem => left.checked_rem(right),
            _ => return Err(ProgramFault::invalid_program("not an arithmetic instruction")),
        };
        let value = result.ok_or_else(|| {
            ProgramFault::new(
                FaultKind::Overflow,
                "arithmetic operation resulted in an overflow",
            )
        })?;
        self.push(Value::Int(value));
        Ok(())
    }

    fn push_frame(&mut self, id: FunctionId, mut locals: Vec<Value>) -> Result<(), ProgramFault> {
        let function = self
            .program
            .function(id)
            .ok_or_else(|| ProgramFault::invalid_program("call to unknown function"))?;
        locals.resize(usize::from(function.locals), Value::Null);
        self.frames.push(Frame {
            function: id,
            pc: 0,
            locals,
            base: self.stack.len(),
        });
        Ok(())
    }

    fn track(&mut self, value: &Value) {
        let Value::Array(items) = value else {
            return;
        };
        if self.arrays.len() == self.arrays.capacity() {
            self.arrays.retain(|array| array.strong_count() > 0);
        }
        self.arrays.push(Rc::downgrade(items));
    }

    fn jump(&mut self, target: u32) -> Result<(), ProgramFault> {
        self.frame_mut()?.pc = target as usize;
        Ok(())
    }

    fn frame_mut(&mut self) -> Result<&mut Frame, ProgramFault> {
        self.frames
            .last_mut()
            .ok_or_else(|| ProgramFault::invalid_program("no active frame"))
    }

    fn local(&self, slot: u16) -> Result<&Value, ProgramFault> {
        self.frames
            .last()
            .and_then(|frame| frame.locals.get(usize::from(slot)))
            .ok_or_else(|| ProgramFault::invalid_program("local slot out of range"))
    }

    fn local_mut(&mut self, slot: u16) -> Result<&mut Value, ProgramFault> {
        self.frames
            .last_mut()
            .and_then(|frame| frame.locals.get_mut(usize::from(slot)))
            .ok_or_else(|| ProgramFault::invalid_program("local slot out of range"))
    }

    fn base(&self) -> usize {
        self.frames.last().map_or(0, |frame| frame.base)
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, ProgramFault> {
        if self.stack.len() <= self.base() {
            return Err(ProgramFault::invalid_program("evaluation stack underflow"));
        }
        self.stack
            .pop()
            .ok_or_else(|| ProgramFault::invalid_program("evaluation stack underflow"))
    }

    fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, ProgramFault> {
        let available = self.stack.len().saturating_sub(self.base());
        if available < count {
            return Err(ProgramFault::invalid_program("evaluation stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - count))
    }

    fn peek(&self, depth: usize) -> Result<&Value, ProgramFault> {
        let available = self.stack.len().saturating_sub(self.base());
        if depth >= available {
            return Err(ProgramFault::invalid_program("evaluation stack underflow"));
        }
        Ok(&self.stack[self.stack.len() - 1 - depth])
    }

    fn pop_int(&mut self) -> Result<i64, ProgramFault> {
        match self.pop()? {
            Value::Int(value) => Ok(value),
            Value::Null => Err(ProgramFault::new(
                FaultKind::NullReference,
                "integer operand was null",
            )),
            other => Err(ProgramFault::invalid_cast("Int64", other.type_name())),
        }
    }

    fn pop_bool(&mut self) -> Result<bool, ProgramFault> {
        match self.pop()? {
            Value::Bool(value) => Ok(value),
            other => Err(ProgramFault::invalid_cast("Boolean", other.type_name())),
        }
    }
}

impl Drop for Vm<'_> {
    fn drop(&mut self) {
        self.stack.clear();
        self.frames.clear();
        for array in self.arrays.drain(..) {
            let Some(array) = array.upgrade() else {
                continue;
            };
            let released = match array.try_borrow_mut() {
                Ok(mut items) => std::mem::take(&mut *items),
                Err(_) => continue,
            };
            drop(released);
        }
    }
}

fn array_fault(value: &Value) -> ProgramFault {
    match value {
        Value::Null => ProgramFault::new(FaultKind::NullReference, "array was null"),
        other => ProgramFault::invalid_cast("Array", other.type_name()),
    }
}

fn with_array<T>(
    value: &Value,
    f: impl FnOnce(&[Value]) -> Result<T, ProgramFault>,
) -> Result<T, ProgramFault> {
    match value {
        Value::Array(items) => f(&items.borrow()),
        other => Err(array_fault(other)),
    }
}

fn element_index(length: usize, index: i64) -> Result<usize, ProgramFault> {
    usize::try_from(index)
        .ok()
        .filter(|i| *i < length)
        .ok_or_else(|| {
            ProgramFault::new(
                FaultKind::IndexOutOfRange,
                format!("index {index} is outside an array of length {length}"),
            )
        })
}
