//! Assembler for compiled programs.
//!
//! Front-ends that lower source code into the stack machine use
//! [`ProgramBuilder`] to lay out functions, source lines and named locals,
//! then write the image and symbol streams the executor reads.

use super::{
    CompiledProgram, Function, FunctionId, FunctionSymbols, Instr, LineEntry, ProgramImage,
    Signature, SymbolMap, TypeDecl, TypeLayout,
};

/// A forward-referencable jump target
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

/// Builds a [`CompiledProgram`]
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    image: ProgramImage,
    symbols: SymbolMap,
}

impl ProgramBuilder {
    /// Create an empty builder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a function and assemble its body
    pub fn function(
        &mut self,
        name: &str,
        signature: Signature,
        assemble: impl FnOnce(&mut FunctionBuilder),
    ) -> FunctionId {
        let id = self.reserve(name);
        self.define(id, signature, assemble);
        id
    }

    /// Reserve a function id so bodies can call functions defined later
    pub fn reserve(&mut self, name: &str) -> FunctionId {
        let id = FunctionId::try_from(self.image.functions.len()).unwrap_or(FunctionId::MAX);
        self.image.functions.push(Function::default());
        self.symbols.functions.push(FunctionSymbols::new(name));
        id
    }

    /// Assemble the body of a reserved function
    pub fn define(
        &mut self,
        id: FunctionId,
        signature: Signature,
        assemble: impl FnOnce(&mut FunctionBuilder),
    ) {
        let index = id as usize;
        let name = self
            .symbols
            .functions
            .get(index)
            .map(|symbols| symbols.name.clone())
            .unwrap_or_default();

        let mut builder = FunctionBuilder::new(name, signature);
        assemble(&mut builder);
        let (function, symbols) = builder.finish();

        if let Some(slot) = self.image.functions.get_mut(index) {
            *slot = function;
        }
        if let Some(slot) = self.symbols.functions.get_mut(index) {
            *slot = symbols;
        }
    }

    /// Declare a type
    pub fn declare_type(&mut self, name: &str, layout: TypeLayout) -> &mut Self {
        self.image.types.push(TypeDecl {
            name: name.to_string(),
            layout,
        });
        self
    }

    /// Designate the entry point
    pub fn set_entry_point(&mut self, id: FunctionId) -> &mut Self {
        self.image.entry_point = Some(id);
        self
    }

    /// Finish the program
    #[must_use]
    pub fn build(self) -> CompiledProgram {
        CompiledProgram {
            image: self.image,
            symbols: self.symbols,
        }
    }
}

/// Assembles a single function body
#[derive(Debug)]
pub struct FunctionBuilder {
    signature: Signature,
    body: Vec<Instr>,
    symbols: FunctionSymbols,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl FunctionBuilder {
    fn new(name: String, signature: Signature) -> Self {
        let params = signature.params.len();
        Self {
            signature,
            body: Vec::new(),
            symbols: FunctionSymbols {
                name,
                lines: Vec::new(),
                locals: vec![None; params],
            },
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    fn offset(&self) -> u32 {
        u32::try_from(self.body.len()).unwrap_or(u32::MAX)
    }

    fn slot(&self) -> u16 {
        u16::try_from(self.symbols.locals.len()).unwrap_or(u16::MAX)
    }

    /// Mark the next instruction as the start of a source line
    pub fn line(&mut self, line: u32) -> &mut Self {
        let offset = self.offset();
        match self.symbols.lines.last_mut() {
            Some(last) if last.offset == offset => last.line = line,
            _ => self.symbols.lines.push(LineEntry { offset, line }),
        }
        self
    }

    /// Name a parameter slot
    pub fn param_name(&mut self, index: u16, name: &str) -> &mut Self {
        if let Some(slot) = self.symbols.locals.get_mut(usize::from(index)) {
            *slot = Some(name.to_string());
        }
        self
    }

    /// Allocate a named local
    pub fn local(&mut self, name: &str) -> u16 {
        let slot = self.slot();
        self.symbols.locals.push(Some(name.to_string()));
        slot
    }

    /// Allocate an unnamed (compiler-generated) local
    pub fn temp(&mut self) -> u16 {
        let slot = self.slot();
        self.symbols.locals.push(None);
        slot
    }

    /// Create a label to be placed later
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the next instruction
    pub fn place(&mut self, label: Label) -> &mut Self {
        let offset = self.offset();
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(offset);
        }
        self
    }

    /// Append a raw instruction
    pub fn emit(&mut self, instr: Instr) -> &mut Self {
        self.body.push(instr);
        self
    }

    /// Push an integer
    pub fn push_int(&mut self, value: i64) -> &mut Self {
        self.emit(Instr::PushInt(value))
    }

    /// Push a boolean
    pub fn push_bool(&mut self, value: bool) -> &mut Self {
        self.emit(Instr::PushBool(value))
    }

    /// Push a string
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        self.emit(Instr::PushStr(value.to_string()))
    }

    /// Push `null`
    pub fn push_null(&mut self) -> &mut Self {
        self.emit(Instr::PushNull)
    }

    /// Load a local
    pub fn load(&mut self, slot: u16) -> &mut Self {
        self.emit(Instr::LoadLocal(slot))
    }

    /// Store into a local
    pub fn store(&mut self, slot: u16) -> &mut Self {
        self.emit(Instr::StoreLocal(slot))
    }

    /// Call a function of the program
    pub fn call(&mut self, id: FunctionId) -> &mut Self {
        self.emit(Instr::Call(id))
    }

    /// Call a host API
    pub fn call_external(&mut self, api: &str, argc: u8) -> &mut Self {
        self.emit(Instr::CallExternal {
            api: api.to_string(),
            argc,
        })
    }

    /// Jump to a label
    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.fixups.push((self.body.len(), label));
        self.emit(Instr::Jump(0))
    }

    /// Jump to a label when the popped value is false
    pub fn jump_if_false(&mut self, label: Label) -> &mut Self {
        self.fixups.push((self.body.len(), label));
        self.emit(Instr::JumpIfFalse(0))
    }

    /// Return from the function
    pub fn ret(&mut self) -> &mut Self {
        self.emit(Instr::Return)
    }

    /// Throw an exception of the given kind with the popped message
    pub fn throw(&mut self, kind: &str) -> &mut Self {
        self.emit(Instr::Throw(kind.to_string()))
    }

    fn finish(mut self) -> (Function, FunctionSymbols) {
        for (index, label) in std::mem::take(&mut self.fixups) {
            let target = self
                .labels
                .get(label.0)
                .copied()
                .flatten()
                .unwrap_or(u32::MAX);
            if let Some(slot) = self.body.get_mut(index).and_then(Instr::jump_target_mut) {
                *slot = target;
            }
        }

        let locals = self.slot();
        (
            Function {
                signature: self.signature,
                locals,
                body: self.body,
            },
            self.symbols,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_resolve_forward_and_backward() {
        let mut builder = ProgramBuilder::new();
        let main = builder.function("main", Signature::void(), |f| {
            let top = f.label();
            let done = f.label();
            f.place(top);
            f.push_bool(false);
            f.jump_if_false(done);
            f.jump(top);
            f.place(done);
            f.ret();
        });
        let program = builder.build();
        let body = &program.image.functions[main as usize].body;

        assert_eq!(body[1], Instr::JumpIfFalse(3));
        assert_eq!(body[2], Instr::Jump(0));
    }

    #[test]
    fn test_locals_follow_parameters() {
        let mut builder = ProgramBuilder::new();
        let signature = Signature {
            params: vec![crate::program::ValueType::Int],
            returns: None,
        };
        let id = builder.function("f", signature, |f| {
            f.param_name(0, "n");
            let x = f.local("x");
            assert_eq!(x, 1);
            f.ret();
        });
        let program = builder.build();

        assert_eq!(program.image.functions[id as usize].locals, 2);
        let symbols = program.symbols.function(id).unwrap();
        assert_eq!(symbols.local_name(0), Some("n"));
        assert_eq!(symbols.local_name(1), Some("x"));
    }

    #[test]
    fn test_line_marks_collapse_on_same_offset() {
        let mut builder = ProgramBuilder::new();
        let id = builder.function("main", Signature::void(), |f| {
            f.line(1).line(2);
            f.ret();
        });
        let program = builder.build();
        let symbols = program.symbols.function(id).unwrap();

        assert_eq!(symbols.lines, vec![LineEntry { offset: 0, line: 2 }]);
    }
}
