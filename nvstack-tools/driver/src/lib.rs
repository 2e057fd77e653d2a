//! nvstack Driver
//!
//! Runs the CAS demonstration workload on top of the persistent call
//! runtime, and restores it after a crash.
//!
//! # Files
//!
//! - One heap file holding the allocator blocks, the CAS register and the
//!   notification matrix at the offsets named by [`RuntimeConfig`].
//! - One `stack_{id}` file per worker inside the stacks directory.
//!
//! # Example
//!
//! ```rust,ignore
//! use nvstack_driver::{run_exec, run_recover, CrashPlan, DemoPaths};
//!
//! let paths = DemoPaths::new("heap.bin", "stacks");
//! let summary = run_exec(&config, &paths, true, None)?;
//! let restored = run_recover(&config, &paths)?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use nvstack_runtime::{
    check_history_ordered, init_register, load_register, restore_all, system_with_builtins,
    CasOutcome, CasRegister, CasTask, FaultHook, FaultPoint, HistoryError, PmemAllocator,
    ReadTask, Region, RuntimeConfig, SystemMode, Task, WorkerPool, WorkerReport,
};

/// Register value installed when a heap is created.
pub const INITIAL_VALUE: u32 = 42;

/// The demonstration CAS tasks, as `(expected, new)` pairs.
pub const DEMO_TRANSITIONS: [(u32, u32); 4] = [(42, 24), (42, 53), (24, 117), (53, 48)];

/// Number of register reads queued after the CAS tasks.
pub const DEMO_READS: usize = 2;

/// Heap byte value meaning "task never published a result".
const UNANSWERED: u8 = 0xFF;

/// Locations of the heap file and the stacks directory.
#[derive(Debug, Clone)]
pub struct DemoPaths {
    /// Heap file.
    pub heap: PathBuf,
    /// Directory holding `stack_{id}` files.
    pub stacks: PathBuf,
}

impl DemoPaths {
    /// Paths for a heap file and a stacks directory.
    pub fn new(heap: impl Into<PathBuf>, stacks: impl Into<PathBuf>) -> Self {
        Self {
            heap: heap.into(),
            stacks: stacks.into(),
        }
    }

    /// Stack file of worker `id`.
    pub fn stack(&self, id: u32) -> PathBuf {
        self.stacks.join(format!("stack_{}", id))
    }
}

/// Injected crash: every worker stops at `point` inside `function`.
#[derive(Debug, Clone)]
pub struct CrashPlan {
    /// Where to stop.
    pub point: FaultPoint,
    /// Function on top of the stack when stopping.
    pub function: String,
}

impl CrashPlan {
    fn into_hook(self) -> FaultHook {
        Arc::new(move |point: FaultPoint, function: &str| {
            point == self.point && function == self.function
        })
    }
}

/// Result of an `exec` run.
#[derive(Debug, Clone)]
pub struct ExecSummary {
    /// One report per worker.
    pub reports: Vec<WorkerReport>,
    /// Outcome of every CAS task that published a result.
    pub outcomes: Vec<CasOutcome>,
    /// Register contents after the pool drained.
    pub register: CasRegister,
}

impl ExecSummary {
    /// Whether any worker stopped at an injected crash.
    pub fn crashed(&self) -> bool {
        self.reports.iter().any(|r| r.crashed)
    }

    /// Check the published outcomes against one chain from `init`.
    ///
    /// Tasks are submitted to a shared queue, so each outcome forms its own
    /// history.
    pub fn check_history(&self, init: u32) -> std::result::Result<(), HistoryError> {
        let per_task: Vec<Vec<CasOutcome>> = self.outcomes.iter().map(|&o| vec![o]).collect();
        check_history_ordered(&per_task, init)
    }
}

/// Result of a `recover` run.
#[derive(Debug, Clone)]
pub struct RecoverSummary {
    /// Frames recovered per stack.
    pub recovered: Vec<usize>,
    /// Register contents after restoration.
    pub register: CasRegister,
}

fn thread_count(config: &RuntimeConfig) -> Result<u32> {
    u32::try_from(config.workers.num_threads).context("thread count does not fit 32 bits")
}

fn open_heap(config: &RuntimeConfig, path: &Path, create: bool) -> Result<Arc<Region>> {
    let heap = Region::open_or_create(path, config.heap.size, create)
        .with_context(|| format!("failed to map heap {}", path.display()))?;
    Ok(Arc::new(heap))
}

/// Run the demonstration workload.
///
/// With `init_heap` the heap is created and formatted and the register set
/// to `<SENTINEL, 42>`; otherwise the existing heap and allocator are
/// recovered first. Worker stacks are always created afresh.
pub fn run_exec(
    config: &RuntimeConfig,
    paths: &DemoPaths,
    init_heap: bool,
    crash: Option<CrashPlan>,
) -> Result<ExecSummary> {
    config.validate().context("invalid runtime configuration")?;
    let threads = thread_count(config)?;
    let system = Arc::new(system_with_builtins(SystemMode::Execution, threads)?);

    let heap = open_heap(config, &paths.heap, init_heap)?;
    let allocator = PmemAllocator::new(
        Arc::clone(&heap),
        config.heap.block_size,
        config.heap.max_blocks,
        init_heap,
    )
    .context("failed to attach allocator")?;
    if init_heap {
        init_register(&heap, config.heap.register_offset, INITIAL_VALUE)?;
        info!(value = INITIAL_VALUE, "initialised register");
    }

    fs::create_dir_all(&paths.stacks)
        .with_context(|| format!("failed to create {}", paths.stacks.display()))?;
    let stacks = (0..threads)
        .map(|id| {
            let path = paths.stack(id);
            Region::create(&path, config.stack.size)
                .with_context(|| format!("failed to create stack {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut tasks = Vec::with_capacity(DEMO_TRANSITIONS.len());
    for (expected, new_value) in DEMO_TRANSITIONS {
        let answer_offset = allocator.alloc().context("no heap block for a task answer")?;
        heap.write_u8(answer_offset, UNANSWERED)?;
        heap.flush(answer_offset, 1)?;
        tasks.push(CasTask {
            var_offset: config.heap.register_offset,
            expected,
            new_value,
            answer_offset,
            matrix_offset: config.heap.matrix_offset,
        });
    }

    let pool = WorkerPool::spawn(
        system,
        Arc::clone(&heap),
        stacks,
        config.workers.queue_capacity,
        crash.map(CrashPlan::into_hook),
    )?;
    for task in &tasks {
        pool.submit(Task::Cas(*task))?;
    }
    for _ in 0..DEMO_READS {
        pool.submit(Task::Read(ReadTask {
            var_offset: config.heap.register_offset,
        }))?;
    }
    let reports = pool.close_and_join()?;

    let mut outcomes = Vec::with_capacity(tasks.len());
    for task in &tasks {
        match heap.read_u8(task.answer_offset)? {
            UNANSWERED => warn!(
                expected = task.expected,
                new = task.new_value,
                "task left unfinished"
            ),
            answer => {
                outcomes.push(CasOutcome::new(task.expected, task.new_value, answer == 1));
                allocator.free(task.answer_offset)?;
            }
        }
    }

    let register = load_register(&heap, config.heap.register_offset)?;
    info!(owner = register.owner, value = register.value, "exec finished");
    Ok(ExecSummary {
        reports,
        outcomes,
        register,
    })
}

/// Restore every worker stack left behind by a previous `exec`.
pub fn run_recover(config: &RuntimeConfig, paths: &DemoPaths) -> Result<RecoverSummary> {
    config.validate().context("invalid runtime configuration")?;
    let threads = thread_count(config)?;
    let system = Arc::new(system_with_builtins(SystemMode::Recovery, threads)?);

    let heap = open_heap(config, &paths.heap, false)?;
    let allocator = PmemAllocator::new(
        Arc::clone(&heap),
        config.heap.block_size,
        config.heap.max_blocks,
        false,
    )
    .context("failed to recover allocator")?;
    info!(
        border = allocator.border(),
        free = allocator.free_count(),
        "recovered allocator"
    );

    let mut stacks = Vec::with_capacity(threads as usize);
    for id in 0..threads {
        let path = paths.stack(id);
        if !path.exists() {
            bail!("missing stack {} for thread {}", path.display(), id);
        }
        let stack = Region::open(&path, config.stack.size)
            .with_context(|| format!("failed to open stack {}", path.display()))?;
        stacks.push(stack);
    }

    let recovered = restore_all(system, Arc::clone(&heap), stacks).context("restoration failed")?;
    let register = load_register(&heap, config.heap.register_offset)?;
    info!(
        frames = recovered.iter().sum::<usize>(),
        owner = register.owner,
        value = register.value,
        "recover finished"
    );
    Ok(RecoverSummary {
        recovered,
        register,
    })
}
