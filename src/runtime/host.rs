//! Host libraries callable through `CallExternal`.
//!
//! Libraries are resolved by name from the isolation context's search path,
//! so a context only exposes what its setup lists. Everything here is pure
//! apart from writes into the capture channel. Captured output and produced
//! strings are charged to the invocation's allocation budget before they
//! are appended or returned.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::warn;

use super::{FaultKind, ProgramFault, Value};
use crate::capture;
use crate::guard::GuardScope;

type HostFn = fn(&[Value], &mut GuardScope) -> Result<Value, ProgramFault>;

/// A host function exposed to programs
#[derive(Clone, Copy, Debug)]
pub struct HostFunction {
    /// Fully qualified name (`library.member`)
    pub name: &'static str,
    /// Number of arguments
    pub arity: usize,
    /// Whether a result is pushed onto the stack
    pub returns: bool,
    call: HostFn,
}

impl HostFunction {
    /// Invoke with already-popped arguments
    ///
    /// # Errors
    /// Returns the fault raised by the function, or a guard violation when
    /// what it produces does not fit the allocation budget
    pub fn call(&self, args: &[Value], guard: &mut GuardScope) -> Result<Value, ProgramFault> {
        (self.call)(args, guard)
    }
}

/// Names of every library this crate provides
pub const STANDARD_LIBRARIES: &[&str] = &["console", "output", "inspect", "string", "math"];

const fn function(name: &'static str, arity: usize, returns: bool, call: HostFn) -> HostFunction {
    HostFunction {
        name,
        arity,
        returns,
        call,
    }
}

fn library(name: &str) -> Option<&'static [HostFunction]> {
    const CONSOLE: &[HostFunction] = &[
        function("console.write", 1, false, console_write),
        function("console.write_line", 1, false, console_write_line),
    ];
    const OUTPUT: &[HostFunction] = &[function("output.write", 1, false, output_write)];
    const INSPECT: &[HostFunction] = &[function("inspect.value", 2, false, inspect_value)];
    const STRING: &[HostFunction] = &[
        function("string.length", 1, true, string_length),
        function("string.chars", 1, true, string_chars),
        function("string.upper", 1, true, string_upper),
    ];
    const MATH: &[HostFunction] = &[
        function("math.abs", 1, true, math_abs),
        function("math.min", 2, true, math_min),
        function("math.max", 2, true, math_max),
    ];

    match name {
        "console" => Some(CONSOLE),
        "output" => Some(OUTPUT),
        "inspect" => Some(INSPECT),
        "string" => Some(STRING),
        "math" => Some(MATH),
        _ => None,
    }
}

/// The set of host functions visible inside one isolation context
#[derive(Clone, Debug, Default)]
pub struct HostApi {
    functions: HashMap<&'static str, HostFunction>,
}

impl HostApi {
    /// Resolve the named libraries. Unknown names are skipped with a warning.
    #[must_use]
    pub fn from_libraries<S: AsRef<str>>(libraries: &[S]) -> Self {
        let mut functions = HashMap::new();
        for name in libraries {
            let name = name.as_ref();
            match library(name) {
                Some(members) => {
                    functions.extend(members.iter().map(|f| (f.name, *f)));
                }
                None => warn!(library = name, "unknown host library on search path"),
            }
        }
        Self { functions }
    }

    /// Every standard library
    #[must_use]
    pub fn standard() -> Self {
        Self::from_libraries(STANDARD_LIBRARIES)
    }

    /// Look up a function
    #[must_use]
    pub fn resolve(&self, api: &str) -> Option<&HostFunction> {
        self.functions.get(api)
    }
}

fn arg(args: &[Value], index: usize) -> Result<&Value, ProgramFault> {
    args.get(index)
        .ok_or_else(|| ProgramFault::invalid_program("host call is missing an argument"))
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, ProgramFault> {
    match arg(args, index)? {
        Value::Int(value) => Ok(*value),
        Value::Null => Err(ProgramFault::new(
            FaultKind::NullReference,
            "integer argument was null",
        )),
        other => Err(ProgramFault::invalid_cast("Int64", other.type_name())),
    }
}

fn charge(guard: &mut GuardScope, bytes: usize) -> Result<(), ProgramFault> {
    guard.charge_allocation(u64::try_from(bytes).unwrap_or(u64::MAX))?;
    Ok(())
}

fn print(value: &Value, guard: &mut GuardScope) -> Result<(), ProgramFault> {
    if matches!(value, Value::Null) {
        return Ok(());
    }
    charge(guard, value.display_len())?;
    match value {
        Value::Str(text) => capture::write_str(text),
        Value::Chars(chars) => capture::write_chars(chars),
        other => capture::write_str(&other.to_string()),
    }
    Ok(())
}

fn console_write(args: &[Value], guard: &mut GuardScope) -> Result<Value, ProgramFault> {
    print(arg(args, 0)?, guard)?;
    Ok(Value::Null)
}

fn console_write_line(args: &[Value], guard: &mut GuardScope) -> Result<Value, ProgramFault> {
    print(arg(args, 0)?, guard)?;
    charge(guard, 1)?;
    capture::write_str("\n");
    Ok(Value::Null)
}

fn output_write(args: &[Value], guard: &mut GuardScope) -> Result<Value, ProgramFault> {
    match arg(args, 0)? {
        Value::Null => {}
        value @ (Value::Str(_) | Value::Chars(_)) => print(value, guard)?,
        other => {
            charge(guard, other.type_name().len())?;
            capture::unsupported(other.type_name());
        }
    }
    Ok(Value::Null)
}

fn inspect_value(args: &[Value], guard: &mut GuardScope) -> Result<Value, ProgramFault> {
    let value = arg(args, 0)?;
    let title = match arg(args, 1)? {
        Value::Null => "Inspect".to_string(),
        title => title.to_string(),
    };
    charge(guard, title.len() + value.display_len())?;
    capture::inspect(&title, value.to_string());
    Ok(Value::Null)
}

fn string_length(args: &[Value], _: &mut GuardScope) -> Result<Value, ProgramFault> {
    let length = match arg(args, 0)? {
        Value::Str(text) => text.chars().count(),
        Value::Chars(chars) => chars.len(),
        Value::Null => {
            return Err(ProgramFault::new(
                FaultKind::NullReference,
                "string was null",
            ))
        }
        other => return Err(ProgramFault::invalid_cast("String", other.type_name())),
    };
    i64::try_from(length)
        .map(Value::Int)
        .map_err(|_| ProgramFault::new(FaultKind::Overflow, "string length overflow"))
}

fn string_chars(args: &[Value], guard: &mut GuardScope) -> Result<Value, ProgramFault> {
    match arg(args, 0)? {
        Value::Str(text) => {
            charge(guard, text.chars().count() * std::mem::size_of::<char>())?;
            Ok(Value::Chars(text.chars().collect::<Vec<_>>().into()))
        }
        Value::Chars(chars) => Ok(Value::Chars(Rc::clone(chars))),
        Value::Null => Err(ProgramFault::new(FaultKind::NullReference, "string was null")),
        other => Err(ProgramFault::invalid_cast("String", other.type_name())),
    }
}

fn string_upper(args: &[Value], guard: &mut GuardScope) -> Result<Value, ProgramFault> {
    match arg(args, 0)? {
        Value::Str(text) => {
            charge(guard, text.len())?;
            let upper = text.to_uppercase();
            if upper.len() > text.len() {
                charge(guard, upper.len() - text.len())?;
            }
            Ok(Value::str(&upper))
        }
        Value::Null => Err(ProgramFault::new(FaultKind::NullReference, "string was null")),
        other => Err(ProgramFault::invalid_cast("String", other.type_name())),
    }
}

fn math_abs(args: &[Value], _: &mut GuardScope) -> Result<Value, ProgramFault> {
    int_arg(args, 0)?
        .checked_abs()
        .map(Value::Int)
        .ok_or_else(|| ProgramFault::new(FaultKind::Overflow, "negating the minimum value overflows"))
}

fn math_min(args: &[Value], _: &mut GuardScope) -> Result<Value, ProgramFault> {
    Ok(Value::Int(int_arg(args, 0)?.min(int_arg(args, 1)?)))
}

fn math_max(args: &[Value], _: &mut GuardScope) -> Result<Value, ProgramFault> {
    Ok(Value::Int(int_arg(args, 0)?.max(int_arg(args, 1)?)))
}
