//! Structured writers.

use std::io::{self, Write};

use serde_json::ser::{CharEscape, CompactFormatter, Formatter};

/// Sink for a JSON document, written front to back
pub trait JsonWriter {
    /// Start an object
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn start_object(&mut self) -> io::Result<()>;

    /// End the innermost object
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn end_object(&mut self) -> io::Result<()>;

    /// Start an array
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn start_array(&mut self) -> io::Result<()>;

    /// End the innermost array
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn end_array(&mut self) -> io::Result<()>;

    /// Write the name of the next property
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn write_property_name(&mut self, name: &str) -> io::Result<()>;

    /// Write a string value
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn write_str(&mut self, value: &str) -> io::Result<()>;

    /// Write an integer value
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn write_i64(&mut self, value: i64) -> io::Result<()>;

    /// Start a string value whose content follows in fragments
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn begin_string(&mut self) -> io::Result<()>;

    /// Append to the open string
    ///
    /// # Errors
    /// Returns error if no string is open or on I/O failure
    fn write_string_fragment(&mut self, fragment: &str) -> io::Result<()>;

    /// Close the open string
    ///
    /// # Errors
    /// Returns error if no string is open or on I/O failure
    fn end_string(&mut self) -> io::Result<()>;

    /// Open a string value that is closed when the returned guard drops
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn open_string(&mut self) -> io::Result<OpenString<'_, Self>>
    where
        Self: Sized,
    {
        self.begin_string()?;
        Ok(OpenString {
            writer: self,
            closed: false,
        })
    }

    /// Write a string property
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn write_property(&mut self, name: &str, value: &str) -> io::Result<()> {
        self.write_property_name(name)?;
        self.write_str(value)
    }

    /// Write an integer property
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn write_property_i64(&mut self, name: &str, value: i64) -> io::Result<()> {
        self.write_property_name(name)?;
        self.write_i64(value)
    }

    /// Write a property name and start its array value
    ///
    /// # Errors
    /// Returns error on misuse or I/O failure
    fn write_property_start_array(&mut self, name: &str) -> io::Result<()> {
        self.write_property_name(name)?;
        self.start_array()
    }
}

/// An open string value; closed on [`close`](Self::close) or drop
pub struct OpenString<'w, J: JsonWriter> {
    writer: &'w mut J,
    closed: bool,
}

impl<J: JsonWriter> OpenString<'_, J> {
    /// Append text
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn write(&mut self, fragment: &str) -> io::Result<()> {
        self.writer.write_string_fragment(fragment)
    }

    /// Append characters
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn write_chars(&mut self, chars: &[char]) -> io::Result<()> {
        let mut buf = [0u8; 4];
        for c in chars {
            self.writer.write_string_fragment(c.encode_utf8(&mut buf))?;
        }
        Ok(())
    }

    /// Close the string, reporting any error
    ///
    /// # Errors
    /// Returns error on I/O failure
    pub fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.writer.end_string()
    }
}

impl<J: JsonWriter> Drop for OpenString<'_, J> {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.writer.end_string();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Frame {
    Array { first: bool },
    Object { first: bool, awaiting_value: bool },
}

fn misuse(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, message.to_string())
}

/// Writes compact JSON straight to an [`io::Write`], holding no document
/// state beyond the current nesting
pub struct StreamingJsonWriter<W: Write> {
    out: W,
    formatter: CompactFormatter,
    frames: Vec<Frame>,
    root_written: bool,
    open_string: bool,
}

impl<W: Write> StreamingJsonWriter<W> {
    /// Wrap a byte sink
    pub fn new(out: W) -> Self {
        Self {
            out,
            formatter: CompactFormatter,
            frames: Vec::new(),
            root_written: false,
            open_string: false,
        }
    }

    /// Finish the document and return the sink
    ///
    /// # Errors
    /// Returns error if the document is incomplete or flushing fails
    pub fn finish(mut self) -> io::Result<W> {
        if self.open_string || !self.frames.is_empty() || !self.root_written {
            return Err(misuse("document is incomplete"));
        }
        self.out.flush()?;
        Ok(self.out)
    }

    fn before_value(&mut self) -> io::Result<()> {
        if self.open_string {
            return Err(misuse("a string is still open"));
        }
        match self.frames.last_mut() {
            None if self.root_written => Err(misuse("document already has a root value")),
            None => {
                self.root_written = true;
                Ok(())
            }
            Some(Frame::Array { first }) => {
                let was_first = std::mem::replace(first, false);
                self.formatter.begin_array_value(&mut self.out, was_first)
            }
            Some(Frame::Object {
                awaiting_value: awaiting @ true,
                ..
            }) => {
                *awaiting = false;
                self.formatter.begin_object_value(&mut self.out)
            }
            Some(Frame::Object { .. }) => Err(misuse("object value written without a property name")),
        }
    }

    fn after_value(&mut self) -> io::Result<()> {
        match self.frames.last() {
            None => Ok(()),
            Some(Frame::Array { .. }) => self.formatter.end_array_value(&mut self.out),
            Some(Frame::Object { .. }) => self.formatter.end_object_value(&mut self.out),
        }
    }

    fn write_escaped(&mut self, value: &str) -> io::Result<()> {
        let bytes = value.as_bytes();
        let mut start = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            let escape = match byte {
                b'"' => CharEscape::Quote,
                b'\\' => CharEscape::ReverseSolidus,
                b'\n' => CharEscape::LineFeed,
                b'\r' => CharEscape::CarriageReturn,
                b'\t' => CharEscape::Tab,
                0x08 => CharEscape::Backspace,
                0x0c => CharEscape::FormFeed,
                0x00..=0x1f => CharEscape::AsciiControl(byte),
                _ => continue,
            };
            if start < i {
                self.formatter
                    .write_string_fragment(&mut self.out, &value[start..i])?;
            }
            self.formatter.write_char_escape(&mut self.out, escape)?;
            start = i + 1;
        }
        if start < bytes.len() {
            self.formatter
                .write_string_fragment(&mut self.out, &value[start..])?;
        }
        Ok(())
    }

    fn write_quoted(&mut self, value: &str) -> io::Result<()> {
        self.formatter.begin_string(&mut self.out)?;
        self.write_escaped(value)?;
        self.formatter.end_string(&mut self.out)
    }
}

impl<W: Write> JsonWriter for StreamingJsonWriter<W> {
    fn start_object(&mut self) -> io::Result<()> {
        self.before_value()?;
        self.formatter.begin_object(&mut self.out)?;
        self.frames.push(Frame::Object {
            first: true,
            awaiting_value: false,
        });
        Ok(())
    }

    fn end_object(&mut self) -> io::Result<()> {
        match self.frames.last() {
            Some(Frame::Object {
                awaiting_value: false,
                ..
            }) if !self.open_string => {}
            _ => return Err(misuse("no object to end")),
        }
        self.frames.pop();
        self.formatter.end_object(&mut self.out)?;
        self.after_value()
    }

    fn start_array(&mut self) -> io::Result<()> {
        self.before_value()?;
        self.formatter.begin_array(&mut self.out)?;
        self.frames.push(Frame::Array { first: true });
        Ok(())
    }

    fn end_array(&mut self) -> io::Result<()> {
        match self.frames.last() {
            Some(Frame::Array { .. }) if !self.open_string => {}
            _ => return Err(misuse("no array to end")),
        }
        self.frames.pop();
        self.formatter.end_array(&mut self.out)?;
        self.after_value()
    }

    fn write_property_name(&mut self, name: &str) -> io::Result<()> {
        let first = match self.frames.last_mut() {
            Some(Frame::Object {
                first,
                awaiting_value: awaiting @ false,
            }) if !self.open_string => {
                *awaiting = true;
                std::mem::replace(first, false)
            }
            _ => return Err(misuse("property name outside an object")),
        };
        self.formatter.begin_object_key(&mut self.out, first)?;
        self.write_quoted(name)?;
        self.formatter.end_object_key(&mut self.out)
    }

    fn write_str(&mut self, value: &str) -> io::Result<()> {
        self.before_value()?;
        self.write_quoted(value)?;
        self.after_value()
    }

    fn write_i64(&mut self, value: i64) -> io::Result<()> {
        self.before_value()?;
        self.formatter.write_i64(&mut self.out, value)?;
        self.after_value()
    }

    fn begin_string(&mut self) -> io::Result<()> {
        self.before_value()?;
        self.formatter.begin_string(&mut self.out)?;
        self.open_string = true;
        Ok(())
    }

    fn write_string_fragment(&mut self, fragment: &str) -> io::Result<()> {
        if !self.open_string {
            return Err(misuse("no string is open"));
        }
        self.write_escaped(fragment)
    }

    fn end_string(&mut self) -> io::Result<()> {
        if !self.open_string {
            return Err(misuse("no string is open"));
        }
        self.open_string = false;
        self.formatter.end_string(&mut self.out)?;
        self.after_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(f: impl FnOnce(&mut StreamingJsonWriter<Vec<u8>>) -> io::Result<()>) -> String {
        let mut writer = StreamingJsonWriter::new(Vec::new());
        f(&mut writer).unwrap();
        String::from_utf8(writer.finish().unwrap()).unwrap()
    }

    #[test]
    fn test_nested_document() {
        let json = render(|w| {
            w.start_object()?;
            w.write_property_start_array("items")?;
            w.write_i64(1)?;
            w.start_object()?;
            w.write_property("k", "v")?;
            w.end_object()?;
            w.end_array()?;
            w.write_property_i64("n", -2)?;
            w.end_object()
        });
        assert_eq!(json, r#"{"items":[1,{"k":"v"}],"n":-2}"#);
    }

    #[test]
    fn test_open_string_streams_fragments() {
        let json = render(|w| {
            w.start_array()?;
            {
                let mut text = w.open_string()?;
                text.write("a\"b")?;
                text.write_chars(&['\n', 'c'])?;
            }
            w.write_i64(3)?;
            w.end_array()
        });
        assert_eq!(json, r#"["a\"b\nc",3]"#);
    }

    #[test]
    fn test_control_characters_are_escaped() {
        let json = render(|w| w.write_str("\u{1}\t\\"));
        assert_eq!(json, r#""\u0001\t\\""#);
        let parsed: String = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, "\u{1}\t\\");
    }

    #[test]
    fn test_misuse_is_invalid_input() {
        let mut w = StreamingJsonWriter::new(Vec::new());
        w.start_object().unwrap();
        let err = w.write_i64(1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(w.end_array().is_err());
        assert!(w.write_string_fragment("x").is_err());

        let mut w = StreamingJsonWriter::new(Vec::new());
        w.start_array().unwrap();
        assert!(w.finish().is_err());
    }
}
