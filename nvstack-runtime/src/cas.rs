//! # Durable Compare-And-Swap
//!
//! A CAS on a `<owner, value>` register living in the persistent heap, made
//! idempotent across crashes by an N×N notification matrix.
//!
//! ## Design
//!
//! - The register packs the owner thread id in the low 32 bits and the value
//!   in the high 32 bits, so it is updated with one 8-byte hardware CAS.
//! - Before overwriting a value written by thread `i`, thread `j` records the
//!   value in `matrix[i][j]`. After a crash, thread `i` can tell "my CAS never
//!   happened" from "my CAS happened and was overwritten" by scanning its row.
//! - Every matrix cell has a single writer and a single reader, so plain
//!   atomic stores and loads suffice; no lock is involved.
//!
//! The value 0 cannot be told apart from an untouched matrix cell, so a
//! recovering CAS whose new value is 0 always reports success.
//!
//! ## Technical References
//!
//! - [Attiya et al., Nesting-Safe Recoverable Linearizability](https://doi.org/10.1145/3212734.3212753)

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::context::ExecutionContext;
use crate::error::{Result, RuntimeError};
use crate::layout::CACHE_LINE_SIZE;
use crate::region::Region;

/// Owner id of a register no thread has written since initialisation.
pub const SENTINEL_OWNER: u32 = u32::MAX;

/// Encoded length of [`CasArgs`].
pub const CAS_ARGS_LEN: usize = 24;

/// Registered name of the CAS entry points.
pub const CAS_FUNCTION: &str = "cas";

/// Decoded contents of a CAS register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasRegister {
    /// Thread that wrote `value`, or [`SENTINEL_OWNER`].
    pub owner: u32,
    /// Current value.
    pub value: u32,
}

impl CasRegister {
    /// Register contents `<owner, value>`.
    pub const fn new(owner: u32, value: u32) -> Self {
        Self { owner, value }
    }

    /// Pack into the 8-byte register word.
    pub const fn pack(self) -> u64 {
        ((self.value as u64) << 32) | self.owner as u64
    }

    /// Unpack from the 8-byte register word.
    pub const fn unpack(word: u64) -> Self {
        Self {
            owner: word as u32,
            value: (word >> 32) as u32,
        }
    }
}

/// Bytes occupied by the notification matrix of `n_threads` threads.
pub const fn matrix_len_bytes(n_threads: u32) -> u64 {
    4 * n_threads as u64 * n_threads as u64
}

fn check_thread(thread_id: u32, n_threads: u32) -> Result<()> {
    if thread_id >= n_threads {
        return Err(RuntimeError::InvalidThreadId {
            thread_id,
            thread_count: n_threads,
        });
    }
    Ok(())
}

/// Offset of `matrix[row][col]`.
pub fn matrix_cell_offset(matrix_offset: u64, n_threads: u32, row: u32, col: u32) -> Result<u64> {
    check_thread(row, n_threads)?;
    check_thread(col, n_threads)?;
    Ok(matrix_offset + 4 * (row as u64 * n_threads as u64 + col as u64))
}

/// Atomic view of `matrix[row][col]`.
pub fn matrix_cell(
    heap: &Region,
    matrix_offset: u64,
    n_threads: u32,
    row: u32,
    col: u32,
) -> Result<&AtomicU32> {
    heap.atomic_u32(matrix_cell_offset(matrix_offset, n_threads, row, col)?)
}

fn register(heap: &Region, var_offset: u64) -> Result<&AtomicU64> {
    if var_offset % CACHE_LINE_SIZE != 0 {
        return Err(RuntimeError::MisalignedRegister {
            offset: var_offset,
            align: CACHE_LINE_SIZE,
        });
    }
    heap.atomic_u64(var_offset)
}

/// Durably initialise the register at `var_offset` to `<SENTINEL, value>`.
pub fn init_register(heap: &Region, var_offset: u64, value: u32) -> Result<()> {
    register(heap, var_offset)?.store(CasRegister::new(SENTINEL_OWNER, value).pack(), Ordering::SeqCst);
    heap.flush(var_offset, 8)
}

/// Load the register at `var_offset`.
pub fn load_register(heap: &Region, var_offset: u64) -> Result<CasRegister> {
    Ok(CasRegister::unpack(register(heap, var_offset)?.load(Ordering::SeqCst)))
}

/// Replace `expected` by `new` in the register, publishing the overwritten
/// value to its owner first. Returns whether the swap happened.
pub fn cas_internal(
    heap: &Region,
    var_offset: u64,
    expected: u32,
    new: u32,
    my_id: u32,
    n_threads: u32,
    matrix_offset: u64,
) -> Result<bool> {
    check_thread(my_id, n_threads)?;
    let reg = register(heap, var_offset)?;
    let current = CasRegister::unpack(reg.load(Ordering::SeqCst));
    if current.value != expected {
        return Ok(false);
    }

    if current.owner != SENTINEL_OWNER {
        let cell = matrix_cell_offset(matrix_offset, n_threads, current.owner, my_id)?;
        heap.atomic_u32(cell)?.store(current.value, Ordering::SeqCst);
        heap.flush(cell, 4)?;
    }

    let swapped = reg
        .compare_exchange(
            current.pack(),
            CasRegister::new(my_id, new).pack(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_ok();
    if swapped {
        heap.flush(var_offset, 8)?;
    }
    trace!(thread_id = my_id, expected, new, swapped, "cas");
    Ok(swapped)
}

/// Finish a CAS that may or may not have committed before a crash.
///
/// Reports success without touching the register when there is evidence
/// the earlier attempt committed; otherwise retries it.
pub fn cas_recover_internal(
    heap: &Region,
    var_offset: u64,
    expected: u32,
    new: u32,
    my_id: u32,
    n_threads: u32,
    matrix_offset: u64,
) -> Result<bool> {
    check_thread(my_id, n_threads)?;
    let current = load_register(heap, var_offset)?;
    if current == CasRegister::new(my_id, new) {
        debug!(thread_id = my_id, new, "cas already visible in register");
        return Ok(true);
    }

    for col in 0..n_threads {
        if matrix_cell(heap, matrix_offset, n_threads, my_id, col)?.load(Ordering::SeqCst) == new {
            debug!(thread_id = my_id, new, observer = col, "cas observed by another thread");
            return Ok(true);
        }
    }

    debug!(thread_id = my_id, expected, new, "no evidence of cas, retrying");
    cas_internal(heap, var_offset, expected, new, my_id, n_threads, matrix_offset)
}

/// Arguments of the registered `cas` entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CasArgs {
    /// Register offset in the heap.
    pub var_offset: u64,
    /// Expected current value.
    pub expected: u32,
    /// Value to install.
    pub new_value: u32,
    /// Notification matrix offset in the heap.
    pub matrix_offset: u64,
}

impl CasArgs {
    /// Encode as `[8B var][4B expected][4B new][8B matrix]`, little-endian.
    pub fn encode(&self) -> [u8; CAS_ARGS_LEN] {
        let mut buf = [0u8; CAS_ARGS_LEN];
        buf[0..8].copy_from_slice(&self.var_offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.expected.to_le_bytes());
        buf[12..16].copy_from_slice(&self.new_value.to_le_bytes());
        buf[16..24].copy_from_slice(&self.matrix_offset.to_le_bytes());
        buf
    }

    /// Decode from exactly [`CAS_ARGS_LEN`] bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bytes: &[u8; CAS_ARGS_LEN] = bytes.try_into().map_err(|_| RuntimeError::MalformedArgs {
            function: CAS_FUNCTION,
            expected: CAS_ARGS_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self {
            var_offset: le_u64(&bytes[0..8]),
            expected: le_u32(&bytes[8..12]),
            new_value: le_u32(&bytes[12..16]),
            matrix_offset: le_u64(&bytes[16..24]),
        })
    }
}

pub(crate) fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    u64::from_le_bytes(raw)
}

pub(crate) fn le_u32(bytes: &[u8]) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    u32::from_le_bytes(raw)
}

/// Registered `cas`: runs the CAS and answers `1` on success, `0` otherwise.
pub fn cas(ctx: &mut ExecutionContext, args: &[u8]) -> Result<()> {
    let args = CasArgs::decode(args)?;
    let ok = cas_internal(
        ctx.heap()?,
        args.var_offset,
        args.expected,
        args.new_value,
        ctx.thread_id(),
        ctx.thread_count(),
        args.matrix_offset,
    )?;
    ctx.write_answer(&[ok as u8])
}

/// Registered recovery counterpart of [`cas`].
///
/// An answer already present in the caller's slot is final: the CAS ran
/// to completion before the crash and is not repeated. Callers therefore
/// seed their slot with something other than `0`/`1` before calling.
pub fn cas_recover(ctx: &mut ExecutionContext, args: &[u8]) -> Result<()> {
    let args = CasArgs::decode(args)?;
    let previous = ctx.read_current_answer(1)?[0];
    if previous <= 1 {
        debug!(
            thread_id = ctx.thread_id(),
            answer = previous,
            "cas answered before crash"
        );
        return Ok(());
    }
    let ok = cas_recover_internal(
        ctx.heap()?,
        args.var_offset,
        args.expected,
        args.new_value,
        ctx.thread_id(),
        ctx.thread_count(),
        args.matrix_offset,
    )?;
    ctx.write_answer(&[ok as u8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::align_to_cache_line;

    const VAR: u64 = 0;
    const MATRIX: u64 = 64;

    fn heap(dir: &tempfile::TempDir) -> Region {
        Region::create(dir.path().join("heap"), 4096).unwrap()
    }

    #[test]
    fn test_register_packing() {
        let reg = CasRegister::new(1, 24);
        assert_eq!(reg.pack(), (24u64 << 32) | 1);
        assert_eq!(CasRegister::unpack(reg.pack()), reg);
        assert_eq!(
            CasRegister::new(SENTINEL_OWNER, 42).pack().to_le_bytes(),
            [0xFF, 0xFF, 0xFF, 0xFF, 42, 0, 0, 0]
        );
    }

    #[test]
    fn test_cas_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let heap = heap(&dir);
        init_register(&heap, VAR, 42).unwrap();

        assert!(!cas_internal(&heap, VAR, 7, 8, 0, 2, MATRIX).unwrap());
        assert_eq!(load_register(&heap, VAR).unwrap(), CasRegister::new(SENTINEL_OWNER, 42));

        assert!(cas_internal(&heap, VAR, 42, 24, 1, 2, MATRIX).unwrap());
        assert_eq!(load_register(&heap, VAR).unwrap(), CasRegister::new(1, 24));
        assert_eq!(heap.read_bytes(VAR, 8).unwrap(), vec![1, 0, 0, 0, 24, 0, 0, 0]);
    }

    #[test]
    fn test_cas_publishes_overwritten_value() {
        let dir = tempfile::tempdir().unwrap();
        let heap = heap(&dir);
        init_register(&heap, VAR, 42).unwrap();
        assert!(cas_internal(&heap, VAR, 42, 24, 1, 3, MATRIX).unwrap());
        assert!(cas_internal(&heap, VAR, 24, 53, 2, 3, MATRIX).unwrap());
        assert_eq!(load_register(&heap, VAR).unwrap(), CasRegister::new(2, 53));
        let cell = matrix_cell(&heap, MATRIX, 3, 1, 2).unwrap();
        assert_eq!(cell.load(Ordering::SeqCst), 24);
        assert_eq!(matrix_cell_offset(MATRIX, 3, 1, 2).unwrap(), MATRIX + 4 * 5);
    }

    #[test]
    fn test_recover_after_commit_does_not_remutate() {
        let dir = tempfile::tempdir().unwrap();
        let heap = heap(&dir);
        init_register(&heap, VAR, 42).unwrap();
        assert!(cas_internal(&heap, VAR, 42, 24, 0, 2, MATRIX).unwrap());

        assert!(cas_recover_internal(&heap, VAR, 42, 24, 0, 2, MATRIX).unwrap());
        assert_eq!(load_register(&heap, VAR).unwrap(), CasRegister::new(0, 24));

        // Superseded by thread 1: the matrix still proves the commit.
        assert!(cas_internal(&heap, VAR, 24, 42, 1, 2, MATRIX).unwrap());
        assert!(cas_recover_internal(&heap, VAR, 42, 24, 0, 2, MATRIX).unwrap());
        assert_eq!(load_register(&heap, VAR).unwrap(), CasRegister::new(1, 42));
    }

    #[test]
    fn test_recover_without_evidence_retries() {
        let dir = tempfile::tempdir().unwrap();
        let heap = heap(&dir);
        init_register(&heap, VAR, 42).unwrap();
        assert!(cas_recover_internal(&heap, VAR, 42, 24, 1, 2, MATRIX).unwrap());
        assert_eq!(load_register(&heap, VAR).unwrap(), CasRegister::new(1, 24));
        assert!(!cas_recover_internal(&heap, VAR, 42, 99, 0, 2, MATRIX).unwrap());
    }

    #[test]
    fn test_preconditions() {
        let dir = tempfile::tempdir().unwrap();
        let heap = heap(&dir);
        assert!(matches!(
            cas_internal(&heap, VAR, 0, 1, 2, 2, MATRIX),
            Err(RuntimeError::InvalidThreadId { thread_id: 2, thread_count: 2 })
        ));
        assert!(matches!(
            cas_internal(&heap, 8, 0, 1, 0, 2, MATRIX),
            Err(RuntimeError::MisalignedRegister { offset: 8, align: 64 })
        ));
        assert!(matches!(
            matrix_cell(&heap, 2, 2, 0, 0),
            Err(RuntimeError::MisalignedRegister { .. })
        ));
        assert!(init_register(&heap, align_to_cache_line(4090), 1).is_err());
    }

    #[test]
    fn test_args_codec() {
        let args = CasArgs {
            var_offset: 2048,
            expected: 42,
            new_value: 24,
            matrix_offset: 3008,
        };
        let bytes = args.encode();
        assert_eq!(&bytes[0..8], &2048u64.to_le_bytes());
        assert_eq!(CasArgs::decode(&bytes).unwrap(), args);
        assert!(matches!(
            CasArgs::decode(&bytes[..23]),
            Err(RuntimeError::MalformedArgs { expected: 24, actual: 23, .. })
        ));
        assert_eq!(matrix_len_bytes(3), 36);
    }
}
