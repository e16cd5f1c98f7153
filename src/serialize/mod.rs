//! Result document rendering.
//!
//! An [`ExecutionResult`] renders as
//!
//! ```json
//! {"output":["text",{"type":"inspection","title":"Return","value":"7"}],
//!  "flow":[1,{"line":2,"notes":"i: 0"},{"line":3,"exception":"GuardException"}]}
//! ```
//!
//! Rendering goes through a [`JsonWriter`] so the document is streamed to
//! its destination rather than built in memory.

mod writer;

pub use writer::{JsonWriter, OpenString, StreamingJsonWriter};

use std::io::{self, Read, Write};

use serde::Deserialize;
use thiserror::Error;

use crate::capture::{ExecutionResult, FlowStep, InspectionEntry, OutputItem};

/// Text rendered in place of an output object of unsupported type
pub const UNSUPPORTED_PREFIX: &str = "Unsupported output object type: ";

/// Document reading errors
#[derive(Debug, Error)]
pub enum SerializeError {
    /// Underlying stream failed
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Not a result document
    #[error("invalid result document: {0}")]
    Parse(#[from] serde_json::Error),
    /// An output object has a `type` other than `inspection`
    #[error("unknown output entry type '{0}'")]
    UnknownOutputType(String),
}

/// Render a result through a structured writer.
///
/// Adjacent text items are streamed into a single string value; an
/// inspection or unsupported item closes the open string first.
///
/// # Errors
/// Returns error if the writer fails
pub fn serialize_result<J: JsonWriter>(result: &ExecutionResult, writer: &mut J) -> io::Result<()> {
    writer.start_object()?;

    writer.write_property_start_array("output")?;
    serialize_output(&result.output, writer)?;
    writer.end_array()?;

    writer.write_property_start_array("flow")?;
    for step in &result.flow {
        serialize_flow_step(step, writer)?;
    }
    writer.end_array()?;

    writer.end_object()
}

fn serialize_output<J: JsonWriter>(output: &[OutputItem], writer: &mut J) -> io::Result<()> {
    let mut in_text = false;
    for item in output {
        match item {
            OutputItem::Text(text) => {
                if !in_text {
                    writer.begin_string()?;
                    in_text = true;
                }
                writer.write_string_fragment(text)?;
            }
            OutputItem::Inspection(InspectionEntry { title, value }) => {
                if std::mem::take(&mut in_text) {
                    writer.end_string()?;
                }
                writer.start_object()?;
                writer.write_property("type", "inspection")?;
                writer.write_property("title", title)?;
                writer.write_property("value", value)?;
                writer.end_object()?;
            }
            OutputItem::Unsupported { type_name } => {
                if std::mem::take(&mut in_text) {
                    writer.end_string()?;
                }
                writer.write_str(&format!("{UNSUPPORTED_PREFIX}{type_name}"))?;
            }
        }
    }
    if in_text {
        writer.end_string()?;
    }
    Ok(())
}

fn serialize_flow_step<J: JsonWriter>(step: &FlowStep, writer: &mut J) -> io::Result<()> {
    if step.is_bare() {
        return writer.write_i64(i64::from(step.line));
    }
    writer.start_object()?;
    writer.write_property_i64("line", i64::from(step.line))?;
    if let Some(notes) = &step.notes {
        writer.write_property("notes", notes)?;
    }
    if let Some(exception) = &step.exception {
        writer.write_property("exception", exception)?;
    }
    writer.end_object()
}

/// Render a result as compact JSON into a byte sink
///
/// # Errors
/// Returns error if writing fails
pub fn write_result<W: Write>(result: &ExecutionResult, out: W) -> io::Result<W> {
    let mut writer = StreamingJsonWriter::new(out);
    serialize_result(result, &mut writer)?;
    writer.finish()
}

/// Render a result as a JSON string
///
/// # Errors
/// Returns error if rendering fails
pub fn to_json_string(result: &ExecutionResult) -> io::Result<String> {
    let bytes = write_result(result, Vec::new())?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[derive(Deserialize)]
struct Document {
    output: Vec<OutputEntry>,
    flow: Vec<FlowEntry>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OutputEntry {
    Text(String),
    Object {
        #[serde(rename = "type")]
        kind: String,
        title: String,
        value: String,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlowEntry {
    Line(u32),
    Step {
        line: u32,
        notes: Option<String>,
        exception: Option<String>,
    },
}

/// Read a result document back.
///
/// Strings carrying the unsupported-type text become
/// [`OutputItem::Unsupported`] again. The document does not distinguish
/// them from printed text that happens to start with the same words, so
/// such text also reads back as [`OutputItem::Unsupported`].
///
/// # Errors
/// Returns error if the input is not a result document
pub fn parse_result(input: impl Read) -> Result<ExecutionResult, SerializeError> {
    let document: Document = serde_json::from_reader(input)?;

    let output = document
        .output
        .into_iter()
        .map(|entry| match entry {
            OutputEntry::Text(text) => Ok(match text.strip_prefix(UNSUPPORTED_PREFIX) {
                Some(type_name) => OutputItem::Unsupported {
                    type_name: type_name.to_string(),
                },
                None => OutputItem::Text(text),
            }),
            OutputEntry::Object { kind, title, value } if kind == "inspection" => {
                Ok(OutputItem::Inspection(InspectionEntry { title, value }))
            }
            OutputEntry::Object { kind, .. } => Err(SerializeError::UnknownOutputType(kind)),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let flow = document
        .flow
        .into_iter()
        .map(|entry| match entry {
            FlowEntry::Line(line) => FlowStep::bare(line),
            FlowEntry::Step {
                line,
                notes,
                exception,
            } => FlowStep {
                line,
                notes,
                exception,
            },
        })
        .collect();

    Ok(ExecutionResult { output, flow })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::OutputStream;

    fn inspection(title: &str, value: &str) -> OutputItem {
        OutputItem::Inspection(InspectionEntry {
            title: title.to_string(),
            value: value.to_string(),
        })
    }

    #[test]
    fn test_inspection_breaks_text_runs() {
        let mut output = OutputStream::new();
        output.write_str("a");
        output.write_str("b");
        output.inspect("Return", "1".to_string());
        output.write_str("c");
        let result = ExecutionResult {
            output: output.into_items(),
            flow: Vec::new(),
        };

        assert_eq!(
            to_json_string(&result).unwrap(),
            r#"{"output":["ab",{"type":"inspection","title":"Return","value":"1"},"c"],"flow":[]}"#
        );
    }

    #[test]
    fn test_adjacent_text_items_stream_into_one_string() {
        let result = ExecutionResult {
            output: vec![
                OutputItem::Text("x".to_string()),
                OutputItem::Text("y".to_string()),
            ],
            flow: Vec::new(),
        };
        assert_eq!(
            to_json_string(&result).unwrap(),
            r#"{"output":["xy"],"flow":[]}"#
        );
    }

    #[test]
    fn test_flow_steps_are_compact() {
        let result = ExecutionResult {
            output: Vec::new(),
            flow: vec![
                FlowStep::bare(1),
                FlowStep {
                    line: 2,
                    notes: Some("loop".to_string()),
                    exception: None,
                },
                FlowStep::bare(3),
            ],
        };
        assert_eq!(
            to_json_string(&result).unwrap(),
            r#"{"output":[],"flow":[1,{"line":2,"notes":"loop"},3]}"#
        );
    }

    #[test]
    fn test_unsupported_item_names_type() {
        let result = ExecutionResult {
            output: vec![
                OutputItem::Text("n=".to_string()),
                OutputItem::Unsupported {
                    type_name: "Array".to_string(),
                },
            ],
            flow: Vec::new(),
        };
        assert_eq!(
            to_json_string(&result).unwrap(),
            r#"{"output":["n=","Unsupported output object type: Array"],"flow":[]}"#
        );
    }

    #[test]
    fn test_round_trip() {
        let result = ExecutionResult {
            output: vec![
                OutputItem::Text("hello \"world\"\n".to_string()),
                inspection("Exception", "GuardException: iteration limit (5) exceeded"),
                OutputItem::Unsupported {
                    type_name: "Boolean".to_string(),
                },
                OutputItem::Text("tail".to_string()),
            ],
            flow: vec![
                FlowStep::bare(1),
                FlowStep {
                    line: 2,
                    notes: Some("i: 0, j: 1".to_string()),
                    exception: None,
                },
                FlowStep {
                    line: 3,
                    notes: None,
                    exception: Some("GuardException".to_string()),
                },
            ],
        };

        let json = to_json_string(&result).unwrap();
        assert_eq!(parse_result(json.as_bytes()).unwrap(), result);
    }

    #[test]
    fn test_unknown_output_type_rejected() {
        let err = parse_result(
            r#"{"output":[{"type":"image","title":"t","value":"v"}],"flow":[]}"#.as_bytes(),
        )
        .unwrap_err();
        assert!(matches!(err, SerializeError::UnknownOutputType(kind) if kind == "image"));
    }

    #[test]
    fn test_text_with_unsupported_wording_reads_back_as_unsupported() {
        let result = ExecutionResult {
            output: vec![
                OutputItem::Text("Unsupported output object type: Widget".to_string()),
                inspection("Return", "0"),
            ],
            flow: Vec::new(),
        };
        let json = to_json_string(&result).unwrap();
        assert_eq!(
            parse_result(json.as_bytes()).unwrap().output[0],
            OutputItem::Unsupported {
                type_name: "Widget".to_string()
            }
        );
    }
}
