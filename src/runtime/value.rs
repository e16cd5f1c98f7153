//! Run-time values.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::program::ValueType;

/// A value on the evaluation stack or in a local
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absence of a value
    #[default]
    Null,
    /// 64-bit signed integer
    Int(i64),
    /// Boolean
    Bool(bool),
    /// Immutable string
    Str(Rc<str>),
    /// Character buffer
    Chars(Rc<[char]>),
    /// Mutable array with reference semantics
    Array(Rc<RefCell<Vec<Value>>>),
}

impl Value {
    /// Build a string value
    #[must_use]
    pub fn str(value: &str) -> Self {
        Self::Str(Rc::from(value))
    }

    /// Build an array value
    #[must_use]
    pub fn array(items: Vec<Self>) -> Self {
        Self::Array(Rc::new(RefCell::new(items)))
    }

    /// Name of the value's type as reported in output and faults
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Int(_) => "Int64",
            Self::Bool(_) => "Boolean",
            Self::Str(_) => "String",
            Self::Chars(_) => "Char[]",
            Self::Array(_) => "Array",
        }
    }

    /// Whether the value satisfies a declared type
    #[must_use]
    pub fn conforms_to(&self, expected: ValueType) -> bool {
        match (expected, self) {
            (ValueType::Any, _)
            | (ValueType::Int, Self::Int(_))
            | (ValueType::Bool, Self::Bool(_))
            | (ValueType::Str | ValueType::Chars | ValueType::Array | ValueType::StringArray, Self::Null)
            | (ValueType::Str, Self::Str(_))
            | (ValueType::Chars, Self::Chars(_))
            | (ValueType::Array, Self::Array(_)) => true,
            (ValueType::StringArray, Self::Array(items)) => items
                .borrow()
                .iter()
                .all(|item| matches!(item, Self::Str(_) | Self::Null)),
            _ => false,
        }
    }

    /// Rendered length in bytes, used for allocation accounting.
    ///
    /// Arrays are measured without building the rendered text.
    #[must_use]
    pub fn display_len(&self) -> usize {
        match self {
            Self::Str(s) => s.len(),
            Self::Chars(chars) => chars.iter().map(|c| c.len_utf8()).sum(),
            Self::Array(_) => {
                let mut renderer = Renderer::counting();
                let _ = renderer.value(self, 0);
                renderer.len
            }
            other => other.to_string().len(),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Chars(a), Self::Chars(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Drop for Value {
    // Nested arrays are released iteratively so deep chains cannot
    // exhaust the worker's stack.
    fn drop(&mut self) {
        let Self::Array(items) = self else {
            return;
        };
        if Rc::strong_count(items) != 1 {
            return;
        }
        let mut pending = std::mem::take(&mut *items.borrow_mut());
        while let Some(mut value) = pending.pop() {
            if let Self::Array(inner) = &mut value {
                if Rc::strong_count(inner) == 1 {
                    pending.append(&mut inner.borrow_mut());
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
            Self::Chars(chars) => chars.iter().try_for_each(|c| write!(f, "{c}")),
            Self::Array(_) => {
                let mut text = String::new();
                let mut renderer = Renderer::writing_to(&mut text);
                let _ = renderer.value(self, 0);
                f.write_str(&text)
            }
        }
    }
}

/// Arrays nested deeper than this render as `{ ... }`
const MAX_DISPLAY_DEPTH: usize = 8;

/// Rendered arrays are cut off after this many bytes
pub const MAX_RENDERED_LEN: usize = 64 * 1024;

const ELIDED: &str = "{ ... }";
const TRUNCATED: &str = "...";

/// The length cap was reached
struct Truncated;

/// Array renderer. An array that contains itself, directly or through its
/// elements, renders as `{ ... }` at the point of recursion.
struct Renderer<'o> {
    out: Option<&'o mut String>,
    len: usize,
    ancestors: Vec<*const RefCell<Vec<Value>>>,
}

impl<'o> Renderer<'o> {
    const fn counting() -> Self {
        Self {
            out: None,
            len: 0,
            ancestors: Vec::new(),
        }
    }

    fn writing_to(out: &'o mut String) -> Self {
        Self {
            out: Some(out),
            len: 0,
            ancestors: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) -> Result<(), Truncated> {
        let room = MAX_RENDERED_LEN.saturating_sub(self.len);
        if text.len() <= room {
            self.len += text.len();
            if let Some(out) = self.out.as_deref_mut() {
                out.push_str(text);
            }
            return Ok(());
        }
        let mut cut = room;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        self.len += cut + TRUNCATED.len();
        if let Some(out) = self.out.as_deref_mut() {
            out.push_str(&text[..cut]);
            out.push_str(TRUNCATED);
        }
        Err(Truncated)
    }

    fn value(&mut self, value: &Value, depth: usize) -> Result<(), Truncated> {
        match value {
            Value::Null => self.push("null"),
            Value::Int(value) => self.push(&value.to_string()),
            Value::Bool(value) => self.push(if *value { "true" } else { "false" }),
            Value::Str(value) => self.push(value),
            Value::Chars(chars) => {
                let mut buf = [0u8; 4];
                chars
                    .iter()
                    .try_for_each(|c| self.push(c.encode_utf8(&mut buf)))
            }
            Value::Array(items) => {
                let id = Rc::as_ptr(items);
                if depth >= MAX_DISPLAY_DEPTH || self.ancestors.contains(&id) {
                    return self.push(ELIDED);
                }
                self.ancestors.push(id);
                self.push("{ ")?;
                for (index, item) in items.borrow().iter().enumerate() {
                    if index > 0 {
                        self.push(", ")?;
                    }
                    self.value(item, depth + 1)?;
                }
                self.push(" }")?;
                self.ancestors.pop();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(Value::Int(-4).to_string(), "-4");
        assert_eq!(Value::Chars(Rc::from(vec!['o', 'k'])).to_string(), "ok");
        assert_eq!(
            Value::array(vec![Value::Int(1), Value::str("a")]).to_string(),
            "{ 1, a }"
        );
    }

    fn self_filled(slots: usize) -> Value {
        let a = Value::array(vec![Value::Null; slots]);
        if let Value::Array(items) = &a {
            for slot in 0..slots {
                items.borrow_mut()[slot] = a.clone();
            }
        }
        a
    }

    #[test]
    fn test_self_containing_array_renders_once() {
        let a = Value::array(vec![Value::Int(1)]);
        if let Value::Array(items) = &a {
            items.borrow_mut().push(a.clone());
        }
        assert_eq!(a.to_string(), "{ 1, { ... } }");

        let wide = self_filled(8);
        let rendered = wide.to_string();
        assert_eq!(rendered, format!("{{ {} }}", ["{ ... }"; 8].join(", ")));
        assert_eq!(wide.display_len(), rendered.len());

        // break the cycles so the test does not leak
        for value in [a, wide] {
            if let Value::Array(items) = &value {
                items.borrow_mut().clear();
            }
        }
    }

    #[test]
    fn test_shared_arrays_are_not_elided() {
        let inner = Value::array(vec![Value::Int(1)]);
        let outer = Value::array(vec![inner.clone(), inner]);
        assert_eq!(outer.to_string(), "{ { 1 }, { 1 } }");
    }

    #[test]
    fn test_wide_sharing_is_cut_off() {
        let mut level = Value::array(vec![Value::str("leaf")]);
        for _ in 0..MAX_DISPLAY_DEPTH {
            level = Value::array(vec![level; 8]);
        }
        let rendered = level.to_string();

        assert!(rendered.len() <= MAX_RENDERED_LEN + TRUNCATED.len());
        assert!(rendered.ends_with(TRUNCATED));
        assert_eq!(level.display_len(), rendered.len());
    }

    #[test]
    fn test_deep_nesting_drops_without_recursion() {
        let mut chain = Value::array(vec![]);
        for _ in 0..200_000 {
            chain = Value::array(vec![chain]);
        }
        drop(chain);
    }

    #[test]
    fn test_array_equality_is_by_reference() {
        let a = Value::array(vec![]);
        let b = Value::array(vec![]);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
    }

    #[test]
    fn test_string_array_conformance() {
        assert!(Value::array(vec![Value::str("x")]).conforms_to(ValueType::StringArray));
        assert!(!Value::array(vec![Value::Int(1)]).conforms_to(ValueType::StringArray));
        assert!(Value::Null.conforms_to(ValueType::Str));
        assert!(!Value::Null.conforms_to(ValueType::Int));
    }
}
