//! Passing return values between frames through answer slots.
//!
//! A running function writes its result into its caller's slot with
//! [`write_answer`](ExecutionContext::write_answer). Once the call returns,
//! the caller reads it from its own slot, which is then the last frame's,
//! with [`read_answer`](ExecutionContext::read_answer).
//!
//! Writes of more than one byte are not crash-atomic. Callers that need to
//! tell "not answered yet" apart from a real answer seed the slot first
//! (`ans_filler` / `new_ans_filler`) with a value the callee never writes.

use tracing::trace;

use crate::context::{ExecutionContext, FaultPoint};
use crate::error::{Result, RuntimeError};
use crate::stack::check_answer_len;

impl ExecutionContext {
    /// Durably write `bytes` (1 to 8) into the caller's answer slot.
    pub fn write_answer(&self, bytes: &[u8]) -> Result<()> {
        check_answer_len(bytes.len())?;
        let slot = self
            .ram_stack
            .get_answer_position()
            .ok_or(RuntimeError::NoCallerFrame)?;
        self.stack.write_bytes(slot, bytes)?;
        self.stack.flush(slot, bytes.len() as u64)?;
        trace!(
            thread_id = self.thread_id(),
            function = self.current_function(),
            slot,
            len = bytes.len(),
            "answer written"
        );
        self.fault(FaultPoint::AfterAnswerWrite)
    }

    /// Read `n` bytes from the last frame's answer slot.
    pub fn read_answer(&self, n: usize) -> Result<Vec<u8>> {
        check_answer_len(n)?;
        let slot = self
            .ram_stack
            .get_last_frame()
            .ok_or(RuntimeError::NoCallerFrame)?
            .answer_offset();
        self.stack.read_bytes(slot, n)
    }

    /// Read `n` bytes from the slot [`write_answer`](Self::write_answer)
    /// targets.
    pub fn read_current_answer(&self, n: usize) -> Result<Vec<u8>> {
        check_answer_len(n)?;
        let slot = self
            .ram_stack
            .get_answer_position()
            .ok_or(RuntimeError::NoCallerFrame)?;
        self.stack.read_bytes(slot, n)
    }
}
