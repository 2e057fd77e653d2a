//! Layout constants shared by the stack and heap formats.
//!
//! These values are part of the on-disk format. Changing any of them makes
//! previously written stacks and heaps unreadable.

/// Cache line size assumed by the frame layout.
///
/// Fixed rather than queried so that a stack written on one machine reads
/// identically on another.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Size of the answer slot at the start of every frame.
pub const ANSWER_SIZE: usize = 8;

/// Terminator of the last frame on a persisted stack.
pub const STACK_END_MARKER: u8 = 0x53;

/// Terminator of every frame that has a successor.
pub const FRAME_END_MARKER: u8 = 0x46;

/// Fill byte of an answer slot that has not been written.
///
/// Neither `0` nor `1`, so a one-byte boolean answer can always be told
/// apart from an untouched slot.
pub const UNANSWERED: u8 = 0xFF;

/// Default size of a per-thread stack file (2 KiB).
pub const DEFAULT_STACK_SIZE: u64 = 2 * 1024;

/// Default size of the heap file (2 MiB).
pub const DEFAULT_HEAP_SIZE: u64 = 2 * 1024 * 1024;

/// Name of the root frame pushed by every worker.
pub const ROOT_FUNCTION: &str = "main_function";

/// Smallest `x >= offset` with `x % CACHE_LINE_SIZE == 0`.
#[inline]
pub const fn align_to_cache_line(offset: u64) -> u64 {
    (offset + CACHE_LINE_SIZE - 1) / CACHE_LINE_SIZE * CACHE_LINE_SIZE
}

/// OS page size, used only for diagnostics.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}
