//! # Execution Context
//!
//! Explicit replacements for process-wide and per-thread runtime state.
//!
//! ## Design
//!
//! - [`SystemConfig`] is built once before workers start (registry, mode,
//!   thread count) and shared read-only as `Arc<SystemConfig>`.
//! - [`ExecutionContext`] is owned by exactly one thread. It holds that
//!   thread's stack region and RAM mirror, its id, and a handle to the
//!   shared heap.
//! - A [`FaultHook`] lets tests stop an operation at a well-defined point,
//!   leaving the durable state exactly as a crash there would.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::frame::StackFrame;
use crate::ram_stack::RamStack;
use crate::region::Region;
use crate::registry::FunctionRegistry;
use crate::stack::{add_new_frame, read_stack, remove_frame};

/// Whether the process runs normally or replays a crashed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SystemMode {
    /// Normal execution.
    #[default]
    Execution,
    /// Restoration after a crash; recovery entry points may be called.
    Recovery,
}

impl SystemMode {
    /// Lowercase name, as used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Execution => "execution",
            SystemMode::Recovery => "recovery",
        }
    }
}

/// Process-wide configuration shared by all workers.
#[derive(Debug)]
pub struct SystemConfig {
    registry: FunctionRegistry,
    mode: SystemMode,
    thread_count: u32,
}

impl SystemConfig {
    /// Build the shared configuration.
    pub fn new(registry: FunctionRegistry, mode: SystemMode, thread_count: u32) -> Result<Self> {
        if thread_count == 0 {
            return Err(RuntimeError::InvalidConfig(
                "thread count must be at least 1".into(),
            ));
        }
        Ok(Self {
            registry,
            mode,
            thread_count,
        })
    }

    /// The function registry.
    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    /// Current process mode.
    pub fn mode(&self) -> SystemMode {
        self.mode
    }

    /// Total number of worker threads.
    pub fn thread_count(&self) -> u32 {
        self.thread_count
    }
}

/// Where a [`FaultHook`] is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// The callee's frame is durable, the callee has not started.
    AfterFramePush,
    /// The callee returned, its frame is still on the stack.
    BeforeFrameRemove,
    /// An answer was written and flushed into the caller's slot.
    AfterAnswerWrite,
}

/// Test hook: returning `true` stops the operation with
/// [`RuntimeError::SimulatedCrash`]. Receives the top frame's function name.
pub type FaultHook = Arc<dyn Fn(FaultPoint, &str) -> bool + Send + Sync>;

/// Per-thread execution state.
pub struct ExecutionContext {
    system: Arc<SystemConfig>,
    pub(crate) stack: Region,
    pub(crate) ram_stack: RamStack,
    thread_id: u32,
    heap: Option<Arc<Region>>,
    fault_hook: Option<FaultHook>,
}

impl ExecutionContext {
    /// Context over a freshly created stack region. Nothing is pushed.
    pub fn new(system: Arc<SystemConfig>, thread_id: u32, stack: Region) -> Result<Self> {
        if thread_id >= system.thread_count() {
            return Err(RuntimeError::InvalidThreadId {
                thread_id,
                thread_count: system.thread_count(),
            });
        }
        Ok(Self {
            system,
            stack,
            ram_stack: RamStack::new(),
            thread_id,
            heap: None,
            fault_hook: None,
        })
    }

    /// Context over an existing stack region; the RAM mirror is rebuilt
    /// from the durable bytes.
    pub fn resume(system: Arc<SystemConfig>, thread_id: u32, stack: Region) -> Result<Self> {
        let mut ctx = Self::new(system, thread_id, stack)?;
        ctx.reload_stack()?;
        Ok(ctx)
    }

    /// Attach the shared heap.
    pub fn with_heap(mut self, heap: Arc<Region>) -> Self {
        self.heap = Some(heap);
        self
    }

    /// Install or clear the fault hook.
    pub fn set_fault_hook(&mut self, hook: Option<FaultHook>) {
        self.fault_hook = hook;
    }

    /// Push the root frame, which never returns. The stack must be empty.
    pub fn push_root(&mut self, name: &str) -> Result<()> {
        if !self.ram_stack.is_empty() {
            return Err(RuntimeError::InvalidConfig(format!(
                "thread {} already has a root frame",
                self.thread_id
            )));
        }
        let frame = StackFrame::new(name, Vec::new())?;
        add_new_frame(&mut self.ram_stack, frame, &self.stack, None)?;
        Ok(())
    }

    /// Replace the RAM mirror with the stack persisted in the region.
    pub fn reload_stack(&mut self) -> Result<()> {
        self.ram_stack = read_stack(&self.stack)?;
        Ok(())
    }

    /// Pop the top frame from both the region and the mirror.
    pub(crate) fn pop_frame(&mut self) -> Result<()> {
        remove_frame(&mut self.ram_stack, &self.stack)?;
        Ok(())
    }

    /// Discard every frame above the root, most recent first. Returns the
    /// number of frames removed.
    pub fn unwind_to_root(&mut self) -> Result<usize> {
        let mut removed = 0;
        while self.ram_stack.len() > 1 {
            self.pop_frame()?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Shared process configuration.
    pub fn system(&self) -> &Arc<SystemConfig> {
        &self.system
    }

    /// Current process mode.
    pub fn mode(&self) -> SystemMode {
        self.system.mode()
    }

    /// This worker's id.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Total number of workers.
    pub fn thread_count(&self) -> u32 {
        self.system.thread_count()
    }

    /// RAM mirror of this thread's stack.
    pub fn ram_stack(&self) -> &RamStack {
        &self.ram_stack
    }

    /// This thread's stack region.
    pub fn stack_region(&self) -> &Region {
        &self.stack
    }

    /// The shared heap.
    pub fn heap(&self) -> Result<&Arc<Region>> {
        self.heap.as_ref().ok_or(RuntimeError::HeapNotAttached)
    }

    /// Name of the function on top of the stack, or `""` when empty.
    pub fn current_function(&self) -> &str {
        self.ram_stack
            .get_last_frame()
            .map_or("", |f| f.frame.function_name())
    }

    /// Consult the fault hook at `point`.
    pub(crate) fn fault(&self, point: FaultPoint) -> Result<()> {
        if let Some(hook) = &self.fault_hook {
            let function = self.current_function();
            if hook(point, function) {
                return Err(RuntimeError::SimulatedCrash {
                    point,
                    function: function.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("thread_id", &self.thread_id)
            .field("mode", &self.mode())
            .field("stack", &self.ram_stack.function_names())
            .field("heap", &self.heap.is_some())
            .finish()
    }
}
