//! # Call Engine
//!
//! `do_call` runs one registered function inside a durable frame.
//!
//! ## State machine
//!
//! Each call moves through `{not pushed} -> {pushed, running} -> {popped}`.
//! A crash at any point freezes the persisted stack at exactly the frames
//! pushed and not yet popped, which is the only input restoration needs.

use tracing::trace;

use crate::context::{ExecutionContext, FaultPoint, SystemMode};
use crate::error::{Result, RuntimeError};
use crate::frame::StackFrame;
use crate::layout::{ANSWER_SIZE, UNANSWERED};
use crate::stack::{add_new_frame, check_answer_len};

const CLEARED_SLOT: [u8; ANSWER_SIZE] = [UNANSWERED; ANSWER_SIZE];

/// Optional knobs of [`ExecutionContext::do_call`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions<'a> {
    /// Written into the caller's own answer slot before the callee is pushed.
    /// Without it the whole slot is reset to [`UNANSWERED`].
    pub ans_filler: Option<&'a [u8]>,
    /// Seeds the callee's answer slot.
    pub new_ans_filler: Option<&'a [u8]>,
    /// Invoke the recovery entry point instead of the normal one.
    pub recover: bool,
}

impl<'a> CallOptions<'a> {
    /// Options selecting the execute or recover entry point.
    pub fn new(recover: bool) -> Self {
        Self {
            recover,
            ..Self::default()
        }
    }

    /// Seed the caller's answer slot.
    pub fn ans_filler(mut self, filler: &'a [u8]) -> Self {
        self.ans_filler = Some(filler);
        self
    }

    /// Seed the callee's answer slot.
    pub fn new_ans_filler(mut self, filler: &'a [u8]) -> Self {
        self.new_ans_filler = Some(filler);
        self
    }
}

impl ExecutionContext {
    /// Push a frame for `name`, run it, and pop the frame.
    ///
    /// The registry lookup and the mode check happen before anything is
    /// written, so a misuse leaves no durable trace. An error returned by the
    /// callee (or a fault hook) is propagated with the callee's frame still
    /// pushed, which is what a crash at that point would leave behind.
    pub fn do_call(&mut self, name: &str, args: &[u8], options: CallOptions<'_>) -> Result<()> {
        if options.recover && self.mode() != SystemMode::Recovery {
            return Err(RuntimeError::IllegalRecoveryCall);
        }
        let entry = self.system().registry().lookup(name, options.recover)?;
        let frame = StackFrame::new(name, args)?;

        // The caller's slot must not still hold an earlier callee's answer.
        let filler = options.ans_filler.unwrap_or(&CLEARED_SLOT);
        check_answer_len(filler.len())?;
        match self.ram_stack.get_last_frame() {
            Some(caller) => {
                let slot = caller.answer_offset();
                self.stack.write_bytes(slot, filler)?;
                self.stack.flush(slot, filler.len() as u64)?;
            }
            None if options.ans_filler.is_some() => return Err(RuntimeError::NoCallerFrame),
            None => {}
        }

        add_new_frame(
            &mut self.ram_stack,
            frame,
            &self.stack,
            options.new_ans_filler,
        )?;
        trace!(
            thread_id = self.thread_id(),
            function = name,
            depth = self.ram_stack.len(),
            recover = options.recover,
            "call"
        );
        self.fault(FaultPoint::AfterFramePush)?;

        entry(self, args)?;

        self.fault(FaultPoint::BeforeFrameRemove)?;
        self.pop_frame()
    }

    /// [`do_call`](Self::do_call) with default options.
    pub fn call(&mut self, name: &str, args: &[u8]) -> Result<()> {
        self.do_call(name, args, CallOptions::default())
    }
}
