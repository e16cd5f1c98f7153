//! Execution capture channel.
//!
//! Output and flow are collected in thread-local buffers that only exist
//! while a [`CaptureSession`] is open. Each isolated execution runs on its own
//! worker thread, so concurrent executions never share a buffer. Writes made
//! while no session is open are discarded.

mod flow;
mod output;

pub use flow::{FlowLog, FlowStep};
pub use output::{InspectionEntry, OutputItem, OutputStream};

use std::cell::RefCell;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Everything a single execution produced
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Output items in emission order
    pub output: Vec<OutputItem>,
    /// Flow steps in execution order
    pub flow: Vec<FlowStep>,
}

#[derive(Default)]
struct Channel {
    output: OutputStream,
    flow: FlowLog,
}

thread_local! {
    static CHANNEL: RefCell<Option<Channel>> = const { RefCell::new(None) };
}

fn with_channel(f: impl FnOnce(&mut Channel)) {
    CHANNEL.with(|cell| {
        if let Some(channel) = cell.borrow_mut().as_mut() {
            f(channel);
        }
    });
}

/// Scope of one capture on the current thread.
///
/// Opening a session installs fresh buffers; [`finish`](Self::finish)
/// takes them as an [`ExecutionResult`]. Dropping the session without
/// finishing discards whatever was captured.
pub struct CaptureSession {
    _thread_bound: PhantomData<*const ()>,
}

impl CaptureSession {
    /// Install fresh buffers on the current thread
    #[must_use]
    pub fn open() -> Self {
        CHANNEL.with(|cell| {
            if cell.borrow_mut().replace(Channel::default()).is_some() {
                tracing::warn!("capture session opened over an existing one");
            }
        });
        Self {
            _thread_bound: PhantomData,
        }
    }

    /// Take everything captured so far and close the session
    #[must_use]
    pub fn finish(self) -> ExecutionResult {
        let channel = CHANNEL
            .with(|cell| cell.borrow_mut().take())
            .unwrap_or_default();
        ExecutionResult {
            output: channel.output.into_items(),
            flow: channel.flow.into_steps(),
        }
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        CHANNEL.with(|cell| cell.borrow_mut().take());
    }
}

/// Append printed text
pub fn write_str(text: &str) {
    with_channel(|channel| channel.output.write_str(text));
}

/// Append a printed character buffer
pub fn write_chars(chars: &[char]) {
    with_channel(|channel| channel.output.write_chars(chars));
}

/// Record an inspection entry
pub fn inspect(title: &str, value: String) {
    with_channel(|channel| channel.output.inspect(title, value));
}

/// Record an output object of an unrenderable type
pub fn unsupported(type_name: &str) {
    with_channel(|channel| channel.output.unsupported(type_name));
}

/// Record that a source line started executing
pub fn report_line(line: u32) {
    with_channel(|channel| channel.flow.report_line(line));
}

/// Attach a note to the current flow step
pub fn report_note(note: &str) {
    with_channel(|channel| channel.flow.report_note(note));
}

/// Mark the current flow step with an exception kind
pub fn report_exception(kind: &str) {
    with_channel(|channel| channel.flow.report_exception(kind));
}
