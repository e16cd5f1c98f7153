//! Debug symbols: function names, line tables and local names.

use serde::{Deserialize, Serialize};

use super::FunctionId;

/// Maps an instruction offset to the source line it starts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineEntry {
    /// Instruction index within the function body
    pub offset: u32,
    /// 1-based source line
    pub line: u32,
}

/// Symbols for a single function
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSymbols {
    /// Source name of the function
    pub name: String,
    /// Line table, sorted by offset
    pub lines: Vec<LineEntry>,
    /// Source names of locals, indexed by slot
    pub locals: Vec<Option<String>>,
}

impl FunctionSymbols {
    /// Create symbols for a named function
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Source line of the instruction at `offset`, if covered by the table
    #[must_use]
    pub fn line_at(&self, offset: u32) -> Option<u32> {
        self.lines
            .iter()
            .take_while(|entry| entry.offset <= offset)
            .last()
            .map(|entry| entry.line)
    }

    /// Source name of a local slot
    #[must_use]
    pub fn local_name(&self, slot: u16) -> Option<&str> {
        self.locals
            .get(usize::from(slot))
            .and_then(Option::as_deref)
    }
}

/// Symbol data for a whole program, one entry per function
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolMap {
    /// Function symbols indexed by [`FunctionId`]
    pub functions: Vec<FunctionSymbols>,
}

impl SymbolMap {
    /// Whether no symbols were supplied
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Symbols of a function
    #[must_use]
    pub fn function(&self, id: FunctionId) -> Option<&FunctionSymbols> {
        self.functions.get(id as usize)
    }

    /// Mutable symbols of a function
    pub fn function_mut(&mut self, id: FunctionId) -> Option<&mut FunctionSymbols> {
        self.functions.get_mut(id as usize)
    }

    /// Look up a function by source name
    #[must_use]
    pub fn find(&self, name: &str) -> Option<FunctionId> {
        self.functions
            .iter()
            .position(|symbols| symbols.name == name)
            .and_then(|index| FunctionId::try_from(index).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_at_uses_nearest_preceding_entry() {
        let symbols = FunctionSymbols {
            name: "main".to_string(),
            lines: vec![
                LineEntry { offset: 0, line: 3 },
                LineEntry { offset: 4, line: 4 },
            ],
            locals: Vec::new(),
        };

        assert_eq!(symbols.line_at(0), Some(3));
        assert_eq!(symbols.line_at(3), Some(3));
        assert_eq!(symbols.line_at(9), Some(4));
    }

    #[test]
    fn test_find_by_name() {
        let map = SymbolMap {
            functions: vec![FunctionSymbols::new("helper"), FunctionSymbols::new("main")],
        };
        assert_eq!(map.find("main"), Some(1));
        assert_eq!(map.find("missing"), None);
    }
}
