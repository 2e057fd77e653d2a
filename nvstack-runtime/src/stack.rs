//! # Persistent Stack Protocol
//!
//! Appending and removing frames on a stack region so that every crash
//! point leaves a stack that [`read_stack`] can reconstruct.
//!
//! ## Ordering
//!
//! Push: the new frame, including its own `STACK_END_MARKER`, is flushed
//! before the previous frame's marker is downgraded to `FRAME_END_MARKER`.
//! A forward scan stops at the first `STACK_END_MARKER`, so a crash before
//! the downgrade simply hides the new frame.
//!
//! Pop: a single byte write restores `STACK_END_MARKER` on the new tail.

use tracing::trace;

use crate::error::{Result, RuntimeError};
use crate::frame::{PositionedFrame, StackFrame, FRAME_OVERHEAD, NAME_LEN_OFFSET};
use crate::layout::{
    align_to_cache_line, ANSWER_SIZE, FRAME_END_MARKER, STACK_END_MARKER, UNANSWERED,
};
use crate::ram_stack::RamStack;
use crate::region::Region;

/// Decode the frame at `offset`. The flag is true for the last frame.
pub fn read_frame(region: &Region, offset: u64) -> Result<(StackFrame, bool)> {
    let name_len = region.read_u16(offset + NAME_LEN_OFFSET)? as u64;
    let args_len = region.read_u16(offset + NAME_LEN_OFFSET + 2 + name_len)? as u64;
    let size = FRAME_OVERHEAD + name_len + args_len;

    let bytes = region.read_bytes(offset, size as usize)?;
    let (frame, marker) = StackFrame::decode(&bytes)?;
    match marker {
        STACK_END_MARKER => Ok((frame, true)),
        FRAME_END_MARKER => Ok((frame, false)),
        value => Err(RuntimeError::CorruptedMarker {
            offset: offset + size - 1,
            value,
        }),
    }
}

/// Rebuild the RAM mirror of a stack region by scanning from offset 0.
///
/// A region whose first frame was never made durable (its marker byte is
/// still zero) reads as an empty stack.
pub fn read_stack(region: &Region) -> Result<RamStack> {
    let mut stack = RamStack::new();
    let mut offset = 0;
    loop {
        let (frame, is_last) = match read_frame(region, offset) {
            Ok(decoded) => decoded,
            Err(RuntimeError::CorruptedMarker { value: 0, .. }) if offset == 0 => {
                return Ok(stack);
            }
            Err(e) => return Err(e),
        };
        let positioned = PositionedFrame::new(frame, offset);
        offset = positioned.next_position();
        stack.add_frame(positioned);
        if is_last {
            return Ok(stack);
        }
    }
}

/// Durably append `frame` to the stack.
///
/// `default_answer` (1 to 8 bytes) seeds the new frame's answer slot; the
/// remaining slot bytes are [`UNANSWERED`]. Returns the offset of the new
/// frame.
pub fn add_new_frame(
    ram_stack: &mut RamStack,
    frame: StackFrame,
    region: &Region,
    default_answer: Option<&[u8]>,
) -> Result<u64> {
    let mut answer = [UNANSWERED; ANSWER_SIZE];
    if let Some(seed) = default_answer {
        check_answer_len(seed.len())?;
        answer[..seed.len()].copy_from_slice(seed);
    }

    let old_end = ram_stack.get_stack_end();
    let position = align_to_cache_line(old_end);
    let size = frame.size();
    if position + size > region.len() {
        return Err(RuntimeError::OutOfBounds {
            offset: position,
            len: size,
            size: region.len(),
        });
    }

    region.write_bytes(position, &frame.encode(answer, STACK_END_MARKER))?;
    let is_first = ram_stack.is_empty();
    trace!(
        function = frame.function_name(),
        position,
        size,
        "pushing frame"
    );
    ram_stack.add_frame(PositionedFrame::new(frame, position));
    region.flush(position, size)?;

    if !is_first {
        region.write_u8(old_end - 1, FRAME_END_MARKER)?;
        region.flush(old_end - 1, 1)?;
    }
    Ok(position)
}

/// Durably remove the last frame. The root frame can never be removed.
pub fn remove_frame(ram_stack: &mut RamStack, region: &Region) -> Result<PositionedFrame> {
    if ram_stack.len() <= 1 {
        return Err(RuntimeError::FirstFrameRemoval);
    }
    let popped = ram_stack
        .remove_frame()
        .ok_or(RuntimeError::FirstFrameRemoval)?;
    let new_end = ram_stack.get_stack_end();
    region.write_u8(new_end - 1, STACK_END_MARKER)?;
    region.flush(new_end - 1, 1)?;
    trace!(
        function = popped.frame.function_name(),
        position = popped.position,
        "popped frame"
    );
    Ok(popped)
}

pub(crate) fn check_answer_len(len: usize) -> Result<()> {
    if len == 0 || len > ANSWER_SIZE {
        return Err(RuntimeError::AnswerSizeInvalid(len));
    }
    Ok(())
}
