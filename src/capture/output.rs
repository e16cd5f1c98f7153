//! Captured program output.

use serde::{Deserialize, Serialize};

/// A titled snapshot of a value produced during execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspectionEntry {
    /// What was inspected ("Return", "Exception", or a program-supplied title)
    pub title: String,
    /// Rendered value
    pub value: String,
}

/// One item of the output stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputItem {
    /// A run of printed text
    Text(String),
    /// An inspected value
    Inspection(InspectionEntry),
    /// An output object of a type the capture channel cannot render
    Unsupported {
        /// Type name of the rejected object
        type_name: String,
    },
}

/// Append-only output stream that merges adjacent text fragments
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputStream {
    items: Vec<OutputItem>,
}

impl OutputStream {
    /// Create an empty stream
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a text fragment, extending the open text run if there is one
    pub fn write_str(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(OutputItem::Text(run)) = self.items.last_mut() {
            run.push_str(text);
        } else {
            self.items.push(OutputItem::Text(text.to_string()));
        }
    }

    /// Append a character buffer fragment
    pub fn write_chars(&mut self, chars: &[char]) {
        if chars.is_empty() {
            return;
        }
        if let Some(OutputItem::Text(run)) = self.items.last_mut() {
            run.extend(chars);
        } else {
            self.items.push(OutputItem::Text(chars.iter().collect()));
        }
    }

    /// Append an inspection entry, closing any open text run
    pub fn inspect(&mut self, title: &str, value: String) {
        self.items.push(OutputItem::Inspection(InspectionEntry {
            title: title.to_string(),
            value,
        }));
    }

    /// Record an object that cannot be rendered as output
    pub fn unsupported(&mut self, type_name: &str) {
        self.items.push(OutputItem::Unsupported {
            type_name: type_name.to_string(),
        });
    }

    /// Items in emission order
    #[must_use]
    pub fn items(&self) -> &[OutputItem] {
        &self.items
    }

    /// Consume into the item list
    #[must_use]
    pub fn into_items(self) -> Vec<OutputItem> {
        self.items
    }
}
