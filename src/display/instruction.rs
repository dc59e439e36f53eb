//! Display-protocol instruction codec
//!
//! Wire format: every element is `<len>.<value>` where `len` is the value's
//! length in bytes; elements are joined by `,` and the instruction ends with
//! `;`. The first element is the opcode:
//!
//! ```text
//! 6.select,3.vnc;
//! 4.size,4.1024,3.768,2.96;
//! ```
//!
//! Values may themselves contain `,` and `;`, so frames are always split by
//! length prefix, never by scanning for the terminator.

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::error::{DisplayError, InstructionError};

/// Largest single element accepted from the wire
pub const MAX_ELEMENT_LEN: usize = 4 * 1024 * 1024;

/// Longest length prefix accepted (digits only)
const MAX_PREFIX_DIGITS: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: String,
    pub args: Vec<String>,
}

impl Instruction {
    /// Build an instruction; the opcode must not be empty
    pub fn new<S: Into<String>>(
        opcode: impl Into<String>,
        args: impl IntoIterator<Item = S>,
    ) -> Result<Self, InstructionError> {
        let opcode = opcode.into();
        if opcode.is_empty() {
            return Err(InstructionError::EmptyOpcode);
        }
        Ok(Self {
            opcode,
            args: args.into_iter().map(Into::into).collect(),
        })
    }

    /// Serialize to wire format
    pub fn encode(&self) -> String {
        let mut out = String::new();
        push_element(&mut out, &self.opcode);
        for arg in &self.args {
            out.push(',');
            push_element(&mut out, arg);
        }
        out.push(';');
        out
    }

    /// Parse exactly one instruction
    pub fn parse(frame: &str) -> Result<Self, InstructionError> {
        let bytes = frame.as_bytes();
        let mut elements = Vec::new();
        let mut pos = 0;

        loop {
            let dot = bytes[pos..]
                .iter()
                .position(|b| *b == b'.')
                .ok_or_else(|| InstructionError::BadLength(frame[pos..].to_string()))?;
            let digits = &frame[pos..pos + dot];
            let len = parse_length(digits)?;

            let start = pos + dot + 1;
            let end = start + len;
            if end > bytes.len() {
                return Err(InstructionError::Truncated);
            }
            if end == bytes.len() {
                return Err(InstructionError::MissingTerminator);
            }
            // A length that splits a character is a bad prefix, not bad text
            let value = frame
                .get(start..end)
                .ok_or_else(|| InstructionError::BadLength(digits.to_string()))?;
            elements.push(value.to_string());

            match bytes[end] {
                b',' => pos = end + 1,
                b';' => {
                    if end + 1 != bytes.len() {
                        return Err(InstructionError::TrailingData);
                    }
                    break;
                }
                other => return Err(InstructionError::UnexpectedDelimiter(other as char)),
            }
        }

        let mut elements = elements.into_iter();
        let opcode = elements.next().unwrap_or_default();
        if opcode.is_empty() {
            return Err(InstructionError::EmptyOpcode);
        }
        Ok(Self {
            opcode,
            args: elements.collect(),
        })
    }

    /// Parse a raw frame as read by [`read_frame`]
    pub fn from_frame(frame: &[u8]) -> Result<Self, InstructionError> {
        let text = std::str::from_utf8(frame).map_err(|_| InstructionError::InvalidUtf8)?;
        Self::parse(text)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

fn push_element(out: &mut String, value: &str) {
    out.push_str(&value.len().to_string());
    out.push('.');
    out.push_str(value);
}

fn parse_length(digits: &str) -> Result<usize, InstructionError> {
    if digits.is_empty()
        || digits.len() > MAX_PREFIX_DIGITS
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(InstructionError::BadLength(digits.to_string()));
    }
    let len = digits
        .parse::<usize>()
        .map_err(|_| InstructionError::BadLength(digits.to_string()))?;
    if len > MAX_ELEMENT_LEN {
        return Err(InstructionError::TooLong(len));
    }
    Ok(len)
}

/// Read one complete instruction frame, terminator included
///
/// Returns `Ok(None)` when the stream ends cleanly between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>, DisplayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut frame = Vec::new();

    loop {
        let prefix_start = frame.len();
        // digits plus the dot
        let n = (&mut *reader)
            .take(MAX_PREFIX_DIGITS as u64 + 1)
            .read_until(b'.', &mut frame)
            .await?;
        if n == 0 {
            if frame.is_empty() {
                return Ok(None);
            }
            return Err(InstructionError::Truncated.into());
        }
        if frame.last() != Some(&b'.') {
            if n > MAX_PREFIX_DIGITS {
                let prefix = String::from_utf8_lossy(&frame[prefix_start..]).into_owned();
                return Err(InstructionError::BadLength(prefix).into());
            }
            return Err(InstructionError::Truncated.into());
        }

        let digits = std::str::from_utf8(&frame[prefix_start..frame.len() - 1])
            .map_err(|_| InstructionError::BadLength(String::from_utf8_lossy(&frame[prefix_start..]).into_owned()))?;
        let len = parse_length(digits)?;

        // value plus its delimiter
        let value_start = frame.len();
        frame.resize(value_start + len + 1, 0);
        reader
            .read_exact(&mut frame[value_start..])
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => DisplayError::from(InstructionError::Truncated),
                _ => DisplayError::Io(e),
            })?;

        match frame[frame.len() - 1] {
            b',' => continue,
            b';' => return Ok(Some(Bytes::from(frame))),
            other => return Err(InstructionError::UnexpectedDelimiter(other as char).into()),
        }
    }
}
