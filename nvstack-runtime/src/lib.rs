//! # nvstack Runtime Library
//!
//! A crash-consistent call runtime over memory-mapped persistent memory.
//!
//! The runtime provides:
//!
//! - **Persistent Call Stack**: per-thread frames recorded durably before a
//!   call runs, mirrored in RAM, rebuilt after a crash
//! - **Block Allocator**: fixed-size blocks recoverable from marker bytes
//! - **Durable CAS**: a `<owner, value>` register with a notification matrix
//!   that makes recovery idempotent
//! - **Restoration**: top-down replay of the recovery entry points of every
//!   suspended call
//!
//! ## Technical Standards
//!
//! - **Durability**: `msync` through
//!   [memmap2](https://docs.rs/memmap2)'s `flush_range`
//! - **Queues**: bounded MPMC channels per
//!   [crossbeam-channel](https://docs.rs/crossbeam-channel)
//! - **Atomics**: sequentially consistent 8-byte CAS on the mapped register
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        NVSTACK RUNTIME                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Worker Pool  │  │ Restoration  │  │    Tasks     │          │
//! │  │ (worker.rs)  │  │(restoration) │  │  (task.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Call Engine  │  │  Allocator   │  │     CAS      │          │
//! │  │  (call.rs)   │  │(allocator.rs)│  │   (cas.rs)   │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                    ┌──────────────┐                             │
//! │                    │    Region    │                             │
//! │                    │ (region.rs)  │                             │
//! │                    └──────────────┘                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod allocator;
pub mod answer;
pub mod call;
pub mod cas;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod history;
pub mod layout;
pub mod ram_stack;
pub mod region;
pub mod registry;
pub mod restoration;
pub mod stack;
pub mod task;
pub mod worker;

// Re-exports
pub use allocator::PmemAllocator;
pub use call::CallOptions;
pub use cas::{cas_internal, cas_recover_internal, init_register, load_register, CasArgs, CasRegister};
pub use config::{ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use context::{ExecutionContext, FaultHook, FaultPoint, SystemConfig, SystemMode};
pub use error::{Result, RuntimeError};
pub use frame::{PositionedFrame, StackFrame};
pub use history::{check_history, check_history_ordered, CasOutcome, HistoryError};
pub use ram_stack::RamStack;
pub use region::Region;
pub use registry::{EntryPoint, FunctionEntry, FunctionRegistry};
pub use restoration::do_restoration;
pub use stack::{add_new_frame, read_frame, read_stack, remove_frame};
pub use task::{register_builtins, CasTask, ReadTask, Task};
pub use worker::{restore_all, WorkerPool, WorkerReport};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build the process-wide configuration with the built-in `exec_task` and
/// `cas` functions registered.
pub fn system_with_builtins(mode: SystemMode, thread_count: u32) -> Result<SystemConfig> {
    let mut registry = FunctionRegistry::new();
    register_builtins(&mut registry);
    SystemConfig::new(registry, mode, thread_count)
}
