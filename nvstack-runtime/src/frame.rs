//! # Stack Frames
//!
//! Binary codec for one persistent call frame.
//!
//! ## Layout
//!
//! Every frame starts on a cache-line boundary and is encoded as
//!
//! ```text
//! [8B answer][2B name_len][name][2B args_len][args][1B marker]
//! ```
//!
//! with little-endian length prefixes. The answer slot is therefore the
//! first 8 bytes of the frame and shares its (aligned) start. The marker is
//! [`STACK_END_MARKER`] on the last frame of a stack and
//! [`FRAME_END_MARKER`] on every other frame.
//!
//! [`STACK_END_MARKER`]: crate::layout::STACK_END_MARKER
//! [`FRAME_END_MARKER`]: crate::layout::FRAME_END_MARKER

use crate::error::{Result, RuntimeError};
use crate::layout::{align_to_cache_line, ANSWER_SIZE};

/// Fixed bytes of a frame: answer slot, two length prefixes and the marker.
pub const FRAME_OVERHEAD: u64 = ANSWER_SIZE as u64 + 2 + 2 + 1;

/// Offset of the function name length prefix inside a frame.
pub(crate) const NAME_LEN_OFFSET: u64 = ANSWER_SIZE as u64;

/// A single call: the function name and its raw argument bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    function_name: String,
    args: Vec<u8>,
}

impl StackFrame {
    /// Create a frame, checking that both fields fit their 16-bit prefixes.
    pub fn new(function_name: impl Into<String>, args: impl Into<Vec<u8>>) -> Result<Self> {
        let function_name = function_name.into();
        let args = args.into();
        if function_name.len() > u16::MAX as usize {
            return Err(RuntimeError::FrameTooLarge {
                field: "function name",
                len: function_name.len(),
            });
        }
        if args.len() > u16::MAX as usize {
            return Err(RuntimeError::FrameTooLarge {
                field: "args",
                len: args.len(),
            });
        }
        Ok(Self {
            function_name,
            args,
        })
    }

    /// Name of the called function.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Raw argument bytes.
    pub fn args(&self) -> &[u8] {
        &self.args
    }

    /// Encoded length in bytes, without trailing alignment padding.
    pub fn size(&self) -> u64 {
        FRAME_OVERHEAD + self.function_name.len() as u64 + self.args.len() as u64
    }

    /// Encode the frame with the given answer slot contents and marker.
    pub fn encode(&self, answer: [u8; ANSWER_SIZE], marker: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size() as usize);
        buf.extend_from_slice(&answer);
        buf.extend_from_slice(&(self.function_name.len() as u16).to_le_bytes());
        buf.extend_from_slice(self.function_name.as_bytes());
        buf.extend_from_slice(&(self.args.len() as u16).to_le_bytes());
        buf.extend_from_slice(&self.args);
        buf.push(marker);
        buf
    }

    /// Decode a frame from exactly its encoded bytes.
    ///
    /// Returns the frame and its raw marker byte; interpreting the marker is
    /// left to the stack reader, which knows the frame's offset.
    pub fn decode(bytes: &[u8]) -> Result<(Self, u8)> {
        let short = |needed: usize| RuntimeError::MalformedArgs {
            function: "stack frame",
            expected: needed,
            actual: bytes.len(),
        };

        let mut pos = ANSWER_SIZE;
        let name_len = read_len(bytes, pos).ok_or_else(|| short(pos + 2))?;
        pos += 2;
        let name = bytes
            .get(pos..pos + name_len)
            .ok_or_else(|| short(pos + name_len))?;
        pos += name_len;
        let args_len = read_len(bytes, pos).ok_or_else(|| short(pos + 2))?;
        pos += 2;
        let args = bytes
            .get(pos..pos + args_len)
            .ok_or_else(|| short(pos + args_len))?;
        pos += args_len;
        let marker = *bytes.get(pos).ok_or_else(|| short(pos + 1))?;

        // Names are written from `&str`; a non UTF-8 name can only come from
        // a damaged stack and will fail the registry lookup anyway.
        let frame = Self {
            function_name: String::from_utf8_lossy(name).into_owned(),
            args: args.to_vec(),
        };
        Ok((frame, marker))
    }
}

fn read_len(bytes: &[u8], pos: usize) -> Option<usize> {
    let raw = bytes.get(pos..pos + 2)?;
    Some(u16::from_le_bytes([raw[0], raw[1]]) as usize)
}

/// A frame together with its byte offset inside the stack region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionedFrame {
    /// The frame itself.
    pub frame: StackFrame,
    /// Offset of the frame start; always cache-line aligned.
    pub position: u64,
}

impl PositionedFrame {
    /// Pair a frame with its offset.
    pub fn new(frame: StackFrame, position: u64) -> Self {
        Self { frame, position }
    }

    /// Offset one past the frame's last byte.
    pub fn end(&self) -> u64 {
        self.position + self.frame.size()
    }

    /// Offset of the frame's answer slot.
    pub fn answer_offset(&self) -> u64 {
        self.position
    }

    /// Offset of the frame's marker byte.
    pub fn marker_offset(&self) -> u64 {
        self.end() - 1
    }

    /// Offset at which the next frame would start.
    pub fn next_position(&self) -> u64 {
        align_to_cache_line(self.end())
    }
}
