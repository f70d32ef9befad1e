//! On-disk layout of a job record.
//!
//! A record file is a block of `Key: Value` lines, one blank line, then the
//! body verbatim up to end of file:
//!
//! ```text
//! Job-ID: 6f1c...
//! Pipeline-Stage: 02_parsed
//!
//! body text, kept byte for byte
//! ```
//!
//! Exactly one space after the colon is consumed on read, so any value that
//! passes [`render`] comes back unchanged from [`parse`].

use std::collections::BTreeMap;

use thiserror::Error;

use super::JobRecord;

/// Reasons a header block could not be read or written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// End of input was reached before the blank line closing the headers.
    #[error("header block is not terminated by a blank line")]
    MissingSeparator,

    #[error("line {line} is not a `Key: Value` header: {content:?}")]
    MalformedLine { line: usize, content: String },

    #[error("line {line} has an empty header key")]
    EmptyKey { line: usize },

    #[error("header {key:?} appears more than once")]
    DuplicateKey { key: String },

    #[error("header key {key:?} cannot be stored: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("value of header {key:?} contains a line break")]
    InvalidValue { key: String },
}

/// Serializes a record into its file representation.
pub fn render(record: &JobRecord) -> Result<String, FormatError> {
    let mut out = String::with_capacity(record.body.len() + 64 * record.headers.len() + 1);
    for (key, value) in &record.headers {
        validate_key(key)?;
        if value.contains(['\n', '\r']) {
            return Err(FormatError::InvalidValue { key: key.clone() });
        }
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(&record.body);
    Ok(out)
}

/// Parses a record file.
pub fn parse(text: &str) -> Result<JobRecord, FormatError> {
    let mut headers = BTreeMap::new();
    let mut pos = 0;
    let mut line_no = 0;

    loop {
        let Some(offset) = text[pos..].find('\n') else {
            return Err(FormatError::MissingSeparator);
        };
        line_no += 1;
        let raw = &text[pos..pos + offset];
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        pos += offset + 1;

        if line.is_empty() {
            return Ok(JobRecord {
                headers,
                body: text[pos..].to_string(),
            });
        }

        // A bare carriage return could never be written back by `render`.
        let split = if line.contains('\r') {
            None
        } else {
            line.split_once(':')
        };
        let Some((key, value)) = split else {
            return Err(FormatError::MalformedLine {
                line: line_no,
                content: line.to_string(),
            });
        };
        if key.trim().is_empty() {
            return Err(FormatError::EmptyKey { line: line_no });
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        if headers.insert(key.to_string(), value.to_string()).is_some() {
            return Err(FormatError::DuplicateKey {
                key: key.to_string(),
            });
        }
    }
}

/// Decodes raw file bytes, falling back to ISO-8859-1 for non UTF-8 input.
pub fn decode(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => err.into_bytes().into_iter().map(char::from).collect(),
    }
}

fn validate_key(key: &str) -> Result<(), FormatError> {
    let reason = if key.trim().is_empty() {
        "key is empty"
    } else if key.contains(':') {
        "key contains ':'"
    } else if key.contains(['\n', '\r']) {
        "key contains a line break"
    } else {
        return Ok(());
    };
    Err(FormatError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}
