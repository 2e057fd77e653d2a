//! Tasks executed by workers and the `exec_task` entry points.
//!
//! A [`CasTask`] runs inside its own `exec_task` frame, which calls the
//! registered `cas` function and publishes the one-byte result at the
//! task's answer offset in the heap. A [`ReadTask`] only loads the register
//! and needs no frame.

use tracing::{info, warn};

use crate::call::CallOptions;
use crate::cas::{self, le_u32, le_u64, load_register, CasArgs, CasRegister, CAS_FUNCTION};
use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use crate::layout::UNANSWERED;
use crate::registry::FunctionRegistry;

/// Registered name of the task entry points.
pub const EXEC_TASK_FUNCTION: &str = "exec_task";

/// Seed of an `exec_task` answer slot meaning "no answer yet".
pub const EXEC_TASK_ANSWER_SEED: u8 = UNANSWERED;

/// Type tag of a CAS task.
pub const TASK_TYPE_CAS: u8 = 0x00;

/// Encoded length of a [`CasTask`].
pub const CAS_TASK_LEN: usize = 33;

/// A unit of work for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Durable compare-and-swap.
    Cas(CasTask),
    /// Read of the register.
    Read(ReadTask),
}

/// Compare-and-swap whose result is written to `answer_offset` in the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasTask {
    /// Register offset in the heap.
    pub var_offset: u64,
    /// Expected current value.
    pub expected: u32,
    /// Value to install.
    pub new_value: u32,
    /// Heap byte receiving `1` on success, `0` on failure.
    pub answer_offset: u64,
    /// Notification matrix offset in the heap.
    pub matrix_offset: u64,
}

/// Read of the register at `var_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadTask {
    /// Register offset in the heap.
    pub var_offset: u64,
}

impl CasTask {
    /// Encode as
    /// `[1B type][8B answer][8B var][4B expected][4B new][8B matrix]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CAS_TASK_LEN);
        buf.push(TASK_TYPE_CAS);
        buf.extend_from_slice(&self.answer_offset.to_le_bytes());
        buf.extend_from_slice(&self.var_offset.to_le_bytes());
        buf.extend_from_slice(&self.expected.to_le_bytes());
        buf.extend_from_slice(&self.new_value.to_le_bytes());
        buf.extend_from_slice(&self.matrix_offset.to_le_bytes());
        buf
    }

    /// Decode an encoded task.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&TASK_TYPE_CAS) => {}
            Some(&other) => return Err(RuntimeError::UnknownTaskType(other)),
            None => return Err(malformed(0)),
        }
        if bytes.len() != CAS_TASK_LEN {
            return Err(malformed(bytes.len()));
        }
        Ok(Self {
            answer_offset: le_u64(&bytes[1..9]),
            var_offset: le_u64(&bytes[9..17]),
            expected: le_u32(&bytes[17..21]),
            new_value: le_u32(&bytes[21..25]),
            matrix_offset: le_u64(&bytes[25..33]),
        })
    }

    /// Arguments of the nested `cas` call.
    pub fn cas_args(&self) -> CasArgs {
        CasArgs {
            var_offset: self.var_offset,
            expected: self.expected,
            new_value: self.new_value,
            matrix_offset: self.matrix_offset,
        }
    }
}

fn malformed(actual: usize) -> RuntimeError {
    RuntimeError::MalformedArgs {
        function: EXEC_TASK_FUNCTION,
        expected: CAS_TASK_LEN,
        actual,
    }
}

/// Registered `exec_task`.
pub fn exec_task(ctx: &mut ExecutionContext, args: &[u8]) -> Result<()> {
    run_cas_task(ctx, args, false)
}

/// Registered recovery counterpart of [`exec_task`].
pub fn exec_task_recover(ctx: &mut ExecutionContext, args: &[u8]) -> Result<()> {
    run_cas_task(ctx, args, true)
}

fn run_cas_task(ctx: &mut ExecutionContext, args: &[u8], recover: bool) -> Result<()> {
    let task = CasTask::decode(args).map_err(|e| {
        warn!(thread_id = ctx.thread_id(), error = %e, "rejected task");
        e
    })?;

    if recover {
        // The nested cas frame already answered into our slot.
        let answer = ctx.read_answer(1)?[0];
        if answer <= 1 {
            return publish(ctx, &task, answer);
        }
    }

    let seed = [EXEC_TASK_ANSWER_SEED];
    let options = CallOptions::new(recover).ans_filler(&seed);
    ctx.do_call(CAS_FUNCTION, &task.cas_args().encode(), options)?;
    let answer = ctx.read_answer(1)?[0];
    publish(ctx, &task, answer)
}

fn publish(ctx: &ExecutionContext, task: &CasTask, answer: u8) -> Result<()> {
    let heap = ctx.heap()?;
    heap.write_u8(task.answer_offset, answer)?;
    heap.flush(task.answer_offset, 1)?;
    info!(
        thread_id = ctx.thread_id(),
        expected = task.expected,
        new = task.new_value,
        result = answer == 1,
        "cas task finished"
    );
    Ok(())
}

/// Load and log the register named by `task`.
pub fn read_task(ctx: &ExecutionContext, task: &ReadTask) -> Result<CasRegister> {
    let register = load_register(ctx.heap()?, task.var_offset)?;
    info!(
        thread_id = ctx.thread_id(),
        owner = register.owner,
        value = register.value,
        "read register"
    );
    Ok(register)
}

/// Run one task on the worker owning `ctx`.
pub fn dispatch(ctx: &mut ExecutionContext, task: &Task) -> Result<()> {
    match task {
        Task::Cas(cas_task) => {
            let seed = [EXEC_TASK_ANSWER_SEED];
            let options = CallOptions::default().new_ans_filler(&seed);
            ctx.do_call(EXEC_TASK_FUNCTION, &cas_task.encode(), options)
        }
        Task::Read(read) => read_task(ctx, read).map(|_| ()),
    }
}

/// Register `exec_task` and `cas` with their recovery counterparts.
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register(EXEC_TASK_FUNCTION, exec_task, exec_task_recover);
    registry.register(CAS_FUNCTION, cas::cas, cas::cas_recover);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::cas::{init_register, SENTINEL_OWNER};
    use crate::context::{SystemConfig, SystemMode};
    use crate::frame::StackFrame;
    use crate::region::Region;
    use crate::stack::add_new_frame;

    const VAR: u64 = 2048;
    const MATRIX: u64 = 3008;
    const ANSWER: u64 = 10;

    fn task(expected: u32, new_value: u32) -> CasTask {
        CasTask {
            var_offset: VAR,
            expected,
            new_value,
            answer_offset: ANSWER,
            matrix_offset: MATRIX,
        }
    }

    fn context(dir: &tempfile::TempDir, mode: SystemMode) -> (ExecutionContext, Arc<Region>) {
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);
        let system = Arc::new(SystemConfig::new(registry, mode, 2).unwrap());
        let heap = Arc::new(Region::create(dir.path().join("heap"), 4096).unwrap());
        let stack = Region::create(dir.path().join("stack_0"), 2048).unwrap();
        let mut ctx = ExecutionContext::new(system, 0, stack)
            .unwrap()
            .with_heap(Arc::clone(&heap));
        ctx.push_root("main_function").unwrap();
        (ctx, heap)
    }

    #[test]
    fn test_encode_layout() {
        let bytes = task(42, 24).encode();
        assert_eq!(bytes.len(), CAS_TASK_LEN);
        assert_eq!(bytes[0], TASK_TYPE_CAS);
        assert_eq!(&bytes[1..9], &ANSWER.to_le_bytes());
        assert_eq!(&bytes[9..17], &VAR.to_le_bytes());
        assert_eq!(&bytes[17..21], &42u32.to_le_bytes());
        assert_eq!(&bytes[21..25], &24u32.to_le_bytes());
        assert_eq!(CasTask::decode(&bytes).unwrap(), task(42, 24));
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let mut bytes = task(1, 2).encode();
        bytes[0] = 7;
        assert!(matches!(CasTask::decode(&bytes), Err(RuntimeError::UnknownTaskType(7))));
        assert!(matches!(
            CasTask::decode(&[]),
            Err(RuntimeError::MalformedArgs { actual: 0, .. })
        ));
        assert!(matches!(
            CasTask::decode(&[TASK_TYPE_CAS, 1, 2]),
            Err(RuntimeError::MalformedArgs { actual: 3, .. })
        ));
    }

    #[test]
    fn test_dispatch_publishes_answers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, heap) = context(&dir, SystemMode::Execution);
        init_register(&heap, VAR, 42).unwrap();

        dispatch(&mut ctx, &Task::Cas(task(42, 24))).unwrap();
        assert_eq!(heap.read_u8(ANSWER).unwrap(), 1);
        dispatch(&mut ctx, &Task::Cas(task(42, 53))).unwrap();
        assert_eq!(heap.read_u8(ANSWER).unwrap(), 0);

        let register = read_task(&ctx, &ReadTask { var_offset: VAR }).unwrap();
        assert_eq!(register, CasRegister::new(0, 24));
        assert_eq!(ctx.ram_stack().len(), 1);
    }

    #[test]
    fn test_unknown_task_type_leaves_frame() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _heap) = context(&dir, SystemMode::Execution);
        let mut bytes = task(42, 24).encode();
        bytes[0] = 3;
        let err = ctx.call(EXEC_TASK_FUNCTION, &bytes).unwrap_err();
        assert!(matches!(err, RuntimeError::UnknownTaskType(3)));
    }

    fn push_task_frame(ctx: &mut ExecutionContext, args: &[u8], seed: u8) {
        let frame = StackFrame::new(EXEC_TASK_FUNCTION, args).unwrap();
        add_new_frame(&mut ctx.ram_stack, frame, &ctx.stack, Some(&[seed])).unwrap();
    }

    #[test]
    fn test_recover_reports_finished_cas_without_rerunning() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, heap) = context(&dir, SystemMode::Recovery);
        init_register(&heap, VAR, 42).unwrap();
        heap.write_u8(ANSWER, 0xEE).unwrap();

        // The nested cas answered `0` before the crash. Running it again
        // would now succeed, so the recorded answer must win.
        let args = task(42, 24).encode();
        push_task_frame(&mut ctx, &args, 0);
        exec_task_recover(&mut ctx, &args).unwrap();

        assert_eq!(heap.read_u8(ANSWER).unwrap(), 0);
        assert_eq!(
            load_register(&heap, VAR).unwrap(),
            CasRegister::new(SENTINEL_OWNER, 42)
        );
    }

    #[test]
    fn test_recover_reruns_unanswered_cas() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, heap) = context(&dir, SystemMode::Recovery);
        init_register(&heap, VAR, 42).unwrap();

        let args = task(42, 24).encode();
        push_task_frame(&mut ctx, &args, EXEC_TASK_ANSWER_SEED);
        exec_task_recover(&mut ctx, &args).unwrap();

        assert_eq!(heap.read_u8(ANSWER).unwrap(), 1);
        assert_eq!(load_register(&heap, VAR).unwrap(), CasRegister::new(0, 24));
        assert_eq!(ctx.ram_stack().len(), 2);
    }

    #[test]
    fn test_exec_task_outside_recovery_cannot_recover() {
        let dir = tempfile::tempdir().unwrap();
        let (mut ctx, _heap) = context(&dir, SystemMode::Execution);
        let args = task(42, 24).encode();
        push_task_frame(&mut ctx, &args, EXEC_TASK_ANSWER_SEED);
        assert!(matches!(
            exec_task_recover(&mut ctx, &args),
            Err(RuntimeError::IllegalRecoveryCall)
        ));
    }
}
