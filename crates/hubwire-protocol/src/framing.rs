//! Record framing for text transfer.
//!
//! Every record on a text pipe is a JSON document followed by the ASCII
//! record separator (`0x1E`). JSON string escaping guarantees the
//! separator never appears inside a record, so splitting is safe.
//!
//! ```text
//! {"type":6}␞{"type":1,"target":"send","arguments":["hi"]}␞
//! ```

use crate::ProtocolError;

/// Frames and splits `0x1E`-separated text records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextMessageFormat;

impl TextMessageFormat {
    /// The record separator byte.
    pub const RECORD_SEPARATOR: char = '\u{1e}';

    /// Appends the record separator to a serialized record.
    pub fn write(record: &str) -> String {
        let mut framed = String::with_capacity(record.len() + 1);
        framed.push_str(record);
        framed.push(Self::RECORD_SEPARATOR);
        framed
    }

    /// Splits `input` into its records.
    ///
    /// The input must end with a separator; the empty segment after the
    /// final separator is discarded.
    ///
    /// # Errors
    /// Returns [`ProtocolError::IncompleteRecord`] when the last record is
    /// not terminated.
    pub fn parse(input: &str) -> Result<Vec<&str>, ProtocolError> {
        if !input.ends_with(Self::RECORD_SEPARATOR) {
            return Err(ProtocolError::IncompleteRecord);
        }

        let mut records: Vec<&str> =
            input.split(Self::RECORD_SEPARATOR).collect();
        records.pop();
        Ok(records)
    }
}
