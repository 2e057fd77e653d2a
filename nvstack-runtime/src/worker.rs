//! # Worker Pool
//!
//! A fixed set of OS threads, each owning one persistent stack, fed from a
//! bounded task queue.
//!
//! ## Design
//!
//! - Every worker builds its own [`ExecutionContext`], pushes the root frame
//!   and then dispatches tasks until all senders are gone. The root frame is
//!   never popped.
//! - A failed task is logged, its frames are unwound down to the root, and
//!   the worker moves on. A simulated crash
//!   freezes the worker instead: its stack is left exactly as the crash left
//!   it, and queued tasks it receives afterwards are dropped.
//! - Restoration runs one thread per stack through [`do_restoration`].
//!
//! ## Technical References
//!
//! - [crossbeam-channel](https://docs.rs/crossbeam-channel)

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};

use crate::context::{ExecutionContext, FaultHook, SystemConfig};
use crate::error::{Result, RuntimeError};
use crate::layout::ROOT_FUNCTION;
use crate::region::Region;
use crate::restoration::do_restoration;
use crate::task::{dispatch, Task};

/// What a worker did before its queue closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerReport {
    /// Worker thread id.
    pub thread_id: u32,
    /// Tasks that finished without error.
    pub completed: usize,
    /// Tasks that returned an error.
    pub failed: usize,
    /// Whether a fault hook stopped this worker.
    pub crashed: bool,
}

/// Pool of workers sharing one heap.
pub struct WorkerPool {
    sender: Option<Sender<Task>>,
    handles: Vec<JoinHandle<Result<WorkerReport>>>,
}

impl WorkerPool {
    /// Start one worker per stack region. Worker `i` owns `stacks[i]`.
    pub fn spawn(
        system: Arc<SystemConfig>,
        heap: Arc<Region>,
        stacks: Vec<Region>,
        queue_capacity: usize,
        fault_hook: Option<FaultHook>,
    ) -> Result<Self> {
        if stacks.len() != system.thread_count() as usize {
            return Err(RuntimeError::InvalidConfig(format!(
                "{} stacks for {} threads",
                stacks.len(),
                system.thread_count()
            )));
        }

        let (sender, receiver) = bounded(queue_capacity);
        let mut handles = Vec::with_capacity(stacks.len());
        for (id, stack) in stacks.into_iter().enumerate() {
            let id = id as u32;
            let mut ctx =
                ExecutionContext::new(Arc::clone(&system), id, stack)?.with_heap(Arc::clone(&heap));
            ctx.set_fault_hook(fault_hook.clone());
            let worker = Worker {
                ctx,
                receiver: receiver.clone(),
            };

            let handle = thread::Builder::new()
                .name(format!("nvstack-worker-{}", id))
                .spawn(move || worker.run_loop())
                .map_err(|e| RuntimeError::io("nvstack-worker", e))?;
            handles.push(handle);
        }
        info!(workers = handles.len(), queue_capacity, "worker pool started");

        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Queue a task, blocking while the queue is full.
    pub fn submit(&self, task: Task) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RuntimeError::Task("worker pool is closed".into()))?;
        sender
            .send(task)
            .map_err(|_| RuntimeError::Task("all workers have exited".into()))
    }

    /// Number of workers.
    pub fn num_workers(&self) -> usize {
        self.handles.len()
    }

    /// Close the queue and wait for every worker to drain it.
    pub fn close_and_join(mut self) -> Result<Vec<WorkerReport>> {
        drop(self.sender.take());
        let mut reports = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            let report = handle
                .join()
                .map_err(|_| RuntimeError::Task("worker thread panicked".into()))??;
            reports.push(report);
        }
        Ok(reports)
    }
}

/// A worker thread's state.
struct Worker {
    ctx: ExecutionContext,
    receiver: Receiver<Task>,
}

impl Worker {
    fn run_loop(mut self) -> Result<WorkerReport> {
        let thread_id = self.ctx.thread_id();
        self.ctx.push_root(ROOT_FUNCTION)?;
        debug!(thread_id, "worker started");

        let mut report = WorkerReport {
            thread_id,
            ..WorkerReport::default()
        };
        for task in self.receiver.iter() {
            if report.crashed {
                debug!(thread_id, ?task, "dropping task after simulated crash");
                continue;
            }
            match dispatch(&mut self.ctx, &task) {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_simulated_crash() => {
                    warn!(thread_id, error = %e, "worker stopped by simulated crash");
                    report.crashed = true;
                }
                Err(e) => {
                    warn!(thread_id, ?task, error = %e, "task failed");
                    report.failed += 1;
                    let discarded = self.ctx.unwind_to_root()?;
                    debug!(thread_id, discarded, "unwound failed task");
                }
            }
        }

        debug!(thread_id, completed = report.completed, "worker finished");
        Ok(report)
    }
}

/// Run restoration on every stack, one thread each. Stack `i` belongs to
/// thread `i`. Returns the number of frames recovered per stack.
pub fn restore_all(
    system: Arc<SystemConfig>,
    heap: Arc<Region>,
    stacks: Vec<Region>,
) -> Result<Vec<usize>> {
    let mut handles = Vec::with_capacity(stacks.len());
    for (id, stack) in stacks.into_iter().enumerate() {
        let mut ctx =
            ExecutionContext::new(Arc::clone(&system), id as u32, stack)?.with_heap(Arc::clone(&heap));
        let handle = thread::Builder::new()
            .name(format!("nvstack-restore-{}", id))
            .spawn(move || do_restoration(&mut ctx))
            .map_err(|e| RuntimeError::io("nvstack-restore", e))?;
        handles.push(handle);
    }

    let mut recovered = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(count)) => recovered.push(count),
            Ok(Err(e)) => {
                first_error.get_or_insert(e);
            }
            Err(_) => {
                first_error.get_or_insert(RuntimeError::Task("restore thread panicked".into()));
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(recovered),
    }
}
