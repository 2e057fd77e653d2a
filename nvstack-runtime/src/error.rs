//! Runtime errors.
//!
//! Every contract violation is surfaced to the caller as a [`RuntimeError`].
//! Nothing in the runtime swallows an error except the worker loop, which
//! logs a failed task and moves on to the next one.

use std::path::PathBuf;

use thiserror::Error;

use crate::context::FaultPoint;

/// Errors produced by the persistent call runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A marker byte (frame terminator or block trailer) holds an unknown value.
    #[error("corrupted marker 0x{value:02x} at offset {offset}")]
    CorruptedMarker {
        /// Offset of the marker byte inside its region.
        offset: u64,
        /// The byte that was found.
        value: u8,
    },

    /// No free block is left and the allocation border reached its maximum.
    #[error("heap exhausted: all blocks are allocated")]
    HeapExhausted,

    /// An answer must be between 1 and 8 bytes long.
    #[error("cannot use answer of size {0}, expected 1..=8 bytes")]
    AnswerSizeInvalid(usize),

    /// The root frame of a stack never returns and cannot be removed.
    #[error("cannot remove the first frame of the stack")]
    FirstFrameRemoval,

    /// A recovery entry point was requested outside of recovery mode.
    #[error("recovery functions can only be called in recovery mode")]
    IllegalRecoveryCall,

    /// No function with this name is registered.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),

    /// The current frame is the only one, so there is no caller to answer to.
    #[error("cannot return a value from the first frame")]
    NoCallerFrame,

    /// Access outside of a mapped region.
    #[error("access of {len} bytes at offset {offset} exceeds region size {size}")]
    OutOfBounds {
        /// Start of the access.
        offset: u64,
        /// Length of the access.
        len: u64,
        /// Size of the region.
        size: u64,
    },

    /// An atomic register is not aligned to its own width.
    #[error("register at offset {offset} is not aligned to {align} bytes")]
    MisalignedRegister {
        /// Offset of the register.
        offset: u64,
        /// Required alignment.
        align: u64,
    },

    /// A frame field does not fit its 16-bit length prefix.
    #[error("frame {field} of {len} bytes exceeds 65535 bytes")]
    FrameTooLarge {
        /// Either `"function name"` or `"args"`.
        field: &'static str,
        /// Actual length.
        len: usize,
    },

    /// The offset does not name a block that can be freed.
    #[error("offset {offset} does not name an allocated block")]
    InvalidBlock {
        /// The rejected offset.
        offset: u64,
    },

    /// Thread id is not below the total thread count.
    #[error("thread id {thread_id} is out of range for {thread_count} threads")]
    InvalidThreadId {
        /// Offending id.
        thread_id: u32,
        /// Total thread count.
        thread_count: u32,
    },

    /// A heap operation was attempted on a context without a heap.
    #[error("no persistent heap is attached to this execution context")]
    HeapNotAttached,

    /// Invalid construction parameters.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A task carried an unknown type tag.
    #[error("cannot execute task of type 0x{0:02x}")]
    UnknownTaskType(u8),

    /// Argument bytes are shorter than the entry point expects.
    #[error("malformed arguments for `{function}`: expected {expected} bytes, got {actual}")]
    MalformedArgs {
        /// The entry point that decoded them.
        function: &'static str,
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// A fault hook stopped execution to emulate a crash.
    #[error("simulated crash in `{function}` at {point:?}")]
    SimulatedCrash {
        /// Where the hook fired.
        point: FaultPoint,
        /// Function whose frame was on top.
        function: String,
    },

    /// A registered function failed for its own reasons.
    #[error("task failed: {0}")]
    Task(String),

    /// Filesystem or mapping failure.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl RuntimeError {
    /// Wrap an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RuntimeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error reports a misuse of the runtime rather than an
    /// environmental failure or a simulated crash.
    pub fn is_programmer_error(&self) -> bool {
        matches!(
            self,
            RuntimeError::AnswerSizeInvalid(_)
                | RuntimeError::FirstFrameRemoval
                | RuntimeError::IllegalRecoveryCall
                | RuntimeError::UnknownFunction(_)
                | RuntimeError::NoCallerFrame
                | RuntimeError::MisalignedRegister { .. }
                | RuntimeError::InvalidBlock { .. }
                | RuntimeError::InvalidThreadId { .. }
        )
    }

    /// Whether the error came from a fault hook.
    pub fn is_simulated_crash(&self) -> bool {
        matches!(self, RuntimeError::SimulatedCrash { .. })
    }
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
