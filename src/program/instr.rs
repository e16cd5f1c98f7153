//! Instruction set of the stack machine.

use serde::{Deserialize, Serialize};

/// Index of a function inside a [`ProgramImage`](super::ProgramImage)
pub type FunctionId = u32;

/// Declared type of a parameter or return value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    /// 64-bit signed integer
    Int,
    /// Boolean
    Bool,
    /// UTF-8 string
    Str,
    /// Character buffer
    Chars,
    /// Array of arbitrary values
    Array,
    /// Array of strings (the conventional entry point argument)
    StringArray,
    /// Any value
    Any,
}

/// A single stack machine instruction
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instr {
    /// Does nothing
    Nop,
    /// Push `null`
    PushNull,
    /// Push an integer constant
    PushInt(i64),
    /// Push a boolean constant
    PushBool(bool),
    /// Push a string constant
    PushStr(String),
    /// Discard the top of the stack
    Pop,
    /// Duplicate the top of the stack
    Dup,
    /// Push the value of a local
    LoadLocal(u16),
    /// Pop into a local
    StoreLocal(u16),
    /// Checked integer addition
    Add,
    /// Checked integer subtraction
    Sub,
    /// Checked integer multiplication
    Mul,
    /// Checked integer division
    Div,
    /// Checked integer remainder
    Rem,
    /// Structural equality
    Eq,
    /// Integer less-than
    Lt,
    /// Integer greater-than
    Gt,
    /// Boolean negation
    Not,
    /// Concatenate the display form of the two topmost values
    Concat,
    /// Pop a length, push a new array of that many `null`s
    NewArray,
    /// Pop index and array, push the element
    LoadElem,
    /// Pop value, index and array, store the element
    StoreElem,
    /// Pop an array, push its length
    ArrayLen,
    /// Unconditional jump to an instruction index
    Jump(u32),
    /// Pop a boolean, jump when it is false
    JumpIfFalse(u32),
    /// Call a function of the same program
    Call(FunctionId),
    /// Call a host API (`library.member`) with `argc` arguments
    CallExternal {
        /// Fully qualified API name
        api: String,
        /// Number of arguments popped from the stack
        argc: u8,
    },
    /// Return from the current function, popping the return value if the
    /// signature declares one
    Return,
    /// Pop a message and raise an exception of the given kind
    Throw(String),
    /// Record that execution reached a source line
    FlowLine(u32),
    /// Annotate the current flow step with the value of a named local
    FlowNote {
        /// Local slot
        local: u16,
        /// Source name of the local
        name: String,
    },
    /// Run-time guard check
    Guard(GuardCheck),
}

impl Instr {
    /// Jump target of a branch instruction
    #[must_use]
    pub const fn jump_target(&self) -> Option<u32> {
        match self {
            Self::Jump(target) | Self::JumpIfFalse(target) => Some(*target),
            _ => None,
        }
    }

    /// Mutable jump target of a branch instruction
    pub fn jump_target_mut(&mut self) -> Option<&mut u32> {
        match self {
            Self::Jump(target) | Self::JumpIfFalse(target) => Some(target),
            _ => None,
        }
    }

    /// Whether this instruction was inserted by the guard injector
    #[must_use]
    pub const fn is_guard(&self) -> bool {
        matches!(self, Self::Guard(_))
    }
}

/// Checks inserted by the guard injector
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GuardCheck {
    /// Call-stack depth and work budget at function entry
    StackDepth,
    /// Cumulative allocation volume before an allocating instruction
    Allocation(AllocationKind),
    /// Loop budget before a backward jump
    Iteration,
    /// Call to an API the policy denies
    DeniedApi(String),
}

/// What an allocation check measures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationKind {
    /// Array length on top of the stack
    Array,
    /// Two topmost values about to be concatenated
    Concat,
}
