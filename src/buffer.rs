//! Fixed-capacity buffer the metrics document is built in.
//!
//! The buffer reserves its full capacity once and never grows. A document is
//! written through an [`OpenDocument`] guard obtained from
//! [`MetricBuffer::open_document`]; the guard is the only way to append
//! entries and it writes the closing characters when it is closed or dropped,
//! so the content is always a well-formed JSON object once the guard is gone.
//!
//! Every append is checked against the remaining room before any byte is
//! written. A rejected append leaves the content untouched.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, error};

use crate::config::DocumentLayout;

/// Bytes kept free at the end of the region, the terminator slot of the
/// device firmware this format comes from.
const TERMINATOR_LEN: usize = 1;

const ENTRY_SEPARATOR: &str = ",";

/// Kind of a metric value, selecting its rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    String,
    Integer,
    Timestamp,
}

impl MetricKind {
    /// Key of the typed wrapper object in the `fields` layout.
    pub fn type_key(&self) -> &'static str {
        match self {
            MetricKind::String => "stringValue",
            MetricKind::Integer => "integerValue",
            MetricKind::Timestamp => "timestampValue",
        }
    }
}

/// Value of a single metric entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricValue<'a> {
    Str(&'a str),
    Integer(i64),
    Timestamp(DateTime<Utc>),
}

impl MetricValue<'_> {
    /// Integer value from an unsigned quantity, saturating at `i64::MAX`.
    pub fn unsigned(value: u64) -> Self {
        MetricValue::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Str(_) => MetricKind::String,
            MetricValue::Integer(_) => MetricKind::Integer,
            MetricValue::Timestamp(_) => MetricKind::Timestamp,
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            MetricValue::Str(s) => out.push_str(&quoted(s)),
            MetricValue::Integer(n) => out.push_str(&n.to_string()),
            MetricValue::Timestamp(ts) => {
                out.push('"');
                out.push_str(&ts.to_rfc3339_opts(SecondsFormat::Secs, true));
                out.push('"');
            }
        }
    }
}

impl From<i64> for MetricValue<'_> {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<i32> for MetricValue<'_> {
    fn from(value: i32) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<u32> for MetricValue<'_> {
    fn from(value: u32) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<u64> for MetricValue<'_> {
    fn from(value: u64) -> Self {
        MetricValue::unsigned(value)
    }
}

impl<'a> From<&'a str> for MetricValue<'a> {
    fn from(value: &'a str) -> Self {
        MetricValue::Str(value)
    }
}

impl From<DateTime<Utc>> for MetricValue<'_> {
    fn from(value: DateTime<Utc>) -> Self {
        MetricValue::Timestamp(value)
    }
}

/// JSON string literal for `s`, quotes included.
fn quoted(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

impl DocumentLayout {
    fn prefix(&self) -> &'static str {
        match self {
            DocumentLayout::Flat => "{",
            DocumentLayout::Fields => "{\"fields\":{",
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            DocumentLayout::Flat => "}",
            DocumentLayout::Fields => "}}",
        }
    }

    /// Render `"name":value` (flat) or `"name":{"kindValue":value}` (fields).
    fn render_entry(&self, name: &str, value: &MetricValue<'_>, out: &mut String) {
        out.push_str(&quoted(name));
        out.push(':');
        match self {
            DocumentLayout::Flat => value.render(out),
            DocumentLayout::Fields => {
                out.push_str("{\"");
                out.push_str(value.kind().type_key());
                out.push_str("\":");
                value.render(out);
                out.push('}');
            }
        }
    }
}

/// Errors that can occur during buffer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The backing region could not be reserved at construction
    NotAllocated,

    /// The entry does not fit in the remaining room
    BufferFull { needed: usize, remaining: usize },

    /// A document was opened without resetting the previous one
    NotReset,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::NotAllocated => write!(f, "Metrics buffer is not allocated"),
            BufferError::BufferFull { needed, remaining } => write!(
                f,
                "Metrics buffer is full: entry needs {} bytes, {} remaining",
                needed, remaining
            ),
            BufferError::NotReset => write!(f, "Metrics buffer must be reset before opening a document"),
        }
    }
}

impl std::error::Error for BufferError {}

/// Where the buffer is in its reset → open → close sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Empty,
    Open,
    Closed,
}

/// Read-only view of the buffer content, valid until the next reset.
#[derive(Debug, Clone, Copy)]
pub struct DocumentView<'a> {
    content: &'a str,
    closed: bool,
}

impl<'a> DocumentView<'a> {
    pub fn as_str(&self) -> &'a str {
        self.content
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Whether the closing characters have been written.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Fixed-capacity JSON metrics accumulator.
///
/// # Example
///
/// ```
/// use metrics_sender::buffer::{MetricBuffer, MetricValue};
/// use metrics_sender::config::DocumentLayout;
///
/// let mut buffer = MetricBuffer::new(64, DocumentLayout::Flat);
/// buffer.reset().unwrap();
/// let mut doc = buffer.open_document().unwrap();
/// doc.append("a", MetricValue::Integer(1)).unwrap();
/// doc.append("b", MetricValue::Integer(2)).unwrap();
/// doc.close();
/// assert_eq!(buffer.finalize().as_str(), r#"{"a":1,"b":2}"#);
/// ```
#[derive(Debug)]
pub struct MetricBuffer {
    content: String,
    capacity: usize,
    allocated: bool,
    layout: DocumentLayout,
    state: DocumentState,
    /// Bytes held back for the closing characters while a document is open
    reserved: usize,
    entries: usize,
    rejected: usize,
    scratch: String,
}

impl MetricBuffer {
    /// Create a buffer of `capacity` bytes for the given layout.
    ///
    /// The region is reserved here and never reallocated. If the reservation
    /// fails the buffer is kept in an unallocated state and every later
    /// operation reports [`BufferError::NotAllocated`].
    pub fn new(capacity: usize, layout: DocumentLayout) -> Self {
        let mut content = String::new();
        let allocated = capacity > TERMINATOR_LEN && content.try_reserve_exact(capacity).is_ok();
        if !allocated {
            error!(capacity = capacity, "Failed to allocate memory for metrics buffer");
        }

        Self {
            content,
            capacity,
            allocated,
            layout,
            state: DocumentState::Empty,
            reserved: 0,
            entries: 0,
            rejected: 0,
            scratch: String::new(),
        }
    }

    /// Clear the content so a new document can be opened.
    pub fn reset(&mut self) -> Result<(), BufferError> {
        if !self.allocated {
            return Err(BufferError::NotAllocated);
        }
        self.content.clear();
        self.state = DocumentState::Empty;
        self.reserved = 0;
        self.entries = 0;
        self.rejected = 0;
        Ok(())
    }

    /// Write the opening characters and return the guard used to append.
    ///
    /// Room for the closing characters is reserved here, so closing the
    /// document can never overflow.
    pub fn open_document(&mut self) -> Result<OpenDocument<'_>, BufferError> {
        if !self.allocated {
            return Err(BufferError::NotAllocated);
        }
        if self.state != DocumentState::Empty {
            return Err(BufferError::NotReset);
        }

        let prefix = self.layout.prefix();
        let suffix = self.layout.suffix();
        let needed = prefix.len() + suffix.len();
        let remaining = self.limit();
        if needed > remaining {
            return Err(BufferError::BufferFull { needed, remaining });
        }

        self.content.push_str(prefix);
        self.reserved = suffix.len();
        self.state = DocumentState::Open;
        Ok(OpenDocument { buffer: self })
    }

    /// Current content and whether it is closed. Never copies.
    pub fn finalize(&self) -> DocumentView<'_> {
        DocumentView {
            content: &self.content,
            closed: self.state == DocumentState::Closed,
        }
    }

    /// Exact number of bytes appending this entry would write, separator included.
    pub fn entry_cost(&mut self, name: &str, value: MetricValue<'_>) -> usize {
        self.render_into_scratch(name, &value)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    pub fn layout(&self) -> DocumentLayout {
        self.layout
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    /// Entries written since the last reset.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Appends rejected since the last reset.
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    /// Bytes still available to entries.
    pub fn remaining(&self) -> usize {
        self.limit()
            .saturating_sub(self.content.len())
            .saturating_sub(self.reserved)
    }

    fn limit(&self) -> usize {
        self.capacity.saturating_sub(TERMINATOR_LEN)
    }

    fn render_into_scratch(&mut self, name: &str, value: &MetricValue<'_>) -> usize {
        self.scratch.clear();
        if self.entries > 0 {
            self.scratch.push_str(ENTRY_SEPARATOR);
        }
        self.layout.render_entry(name, value, &mut self.scratch);
        self.scratch.len()
    }

    fn append(&mut self, name: &str, value: MetricValue<'_>) -> Result<(), BufferError> {
        let needed = self.render_into_scratch(name, &value);
        let remaining = self.remaining();
        if needed > remaining {
            self.rejected += 1;
            debug!(
                metric = name,
                needed = needed,
                remaining = remaining,
                "Rejected metric: buffer full"
            );
            return Err(BufferError::BufferFull { needed, remaining });
        }

        self.content.push_str(&self.scratch);
        self.entries += 1;
        Ok(())
    }

    fn seal(&mut self) {
        if self.state == DocumentState::Open {
            self.content.push_str(self.layout.suffix());
            self.reserved = 0;
            self.state = DocumentState::Closed;
        }
    }
}

/// Guard over an open document.
///
/// Appending is only possible through this type, and it closes the document
/// when [`close`](OpenDocument::close) is called or when it goes out of scope.
#[derive(Debug)]
pub struct OpenDocument<'a> {
    buffer: &'a mut MetricBuffer,
}

impl OpenDocument<'_> {
    /// Append one entry, or reject it with `BufferFull` leaving the content unchanged.
    pub fn append<'v>(
        &mut self,
        name: &str,
        value: impl Into<MetricValue<'v>>,
    ) -> Result<(), BufferError> {
        self.buffer.append(name, value.into())
    }

    pub fn entries(&self) -> usize {
        self.buffer.entries
    }

    pub fn remaining(&self) -> usize {
        self.buffer.remaining()
    }

    /// Exact cost of appending this entry next.
    pub fn entry_cost<'v>(&mut self, name: &str, value: impl Into<MetricValue<'v>>) -> usize {
        self.buffer.entry_cost(name, value.into())
    }

    /// Write the closing characters. Returns the number of entries written.
    pub fn close(self) -> usize {
        self.buffer.entries
    }
}

impl Drop for OpenDocument<'_> {
    fn drop(&mut self) {
        self.buffer.seal();
    }
}
