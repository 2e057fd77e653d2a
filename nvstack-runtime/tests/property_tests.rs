//! Property-based tests for the nvstack runtime.
//!
//! Uses proptest to generate random stacks and allocation sequences and
//! checks that what is read back from the regions matches what was written.

use std::sync::Arc;

use nvstack_runtime::{add_new_frame, read_stack, remove_frame, PmemAllocator, RamStack, Region, StackFrame};
use proptest::prelude::*;

/// Strategy for function names
fn function_name() -> impl Strategy<Value = String> {
    "[a-z_][a-z0-9_]{0,23}"
}

/// Strategy for a frame's name and argument bytes
fn frame() -> impl Strategy<Value = (String, Vec<u8>)> {
    (function_name(), prop::collection::vec(any::<u8>(), 0..96))
}

#[derive(Debug, Clone)]
enum AllocOp {
    Alloc,
    Free(usize),
}

fn alloc_ops() -> impl Strategy<Value = Vec<AllocOp>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(AllocOp::Alloc),
            2 => any::<usize>().prop_map(AllocOp::Free),
        ],
        0..64,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Frames survive reopening the region, and popping restores the
    /// previous stack exactly.
    #[test]
    fn stack_survives_reopen(frames in prop::collection::vec(frame(), 1..12), pops in 0usize..12) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack");
        let pops = pops.min(frames.len() - 1);

        {
            let region = Region::create(&path, 16 * 1024).unwrap();
            let mut ram = RamStack::new();
            for (name, args) in &frames {
                let frame = StackFrame::new(name.clone(), args.clone()).unwrap();
                add_new_frame(&mut ram, frame, &region, None).unwrap();
            }
            for _ in 0..pops {
                remove_frame(&mut ram, &region).unwrap();
            }
            prop_assert_eq!(read_stack(&region).unwrap(), ram);
        }

        let region = Region::open(&path, 16 * 1024).unwrap();
        let restored = read_stack(&region).unwrap();
        let kept = &frames[..frames.len() - pops];
        prop_assert_eq!(restored.len(), kept.len());
        for (positioned, (name, args)) in restored.iter().zip(kept) {
            prop_assert_eq!(positioned.frame.function_name(), name.as_str());
            prop_assert_eq!(positioned.frame.args(), args.as_slice());
            prop_assert_eq!(positioned.position % 64, 0);
        }
    }

    /// Recovering an allocator from its heap reproduces the live state.
    #[test]
    fn allocator_recovery_matches(ops in alloc_ops()) {
        let dir = tempfile::tempdir().unwrap();
        let heap = Arc::new(Region::create(dir.path().join("heap"), 4096).unwrap());
        let allocator = PmemAllocator::new(Arc::clone(&heap), 4, 32, true).unwrap();
        let mut live: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                AllocOp::Alloc => match allocator.alloc() {
                    Ok(offset) => {
                        prop_assert!(!live.contains(&offset));
                        live.push(offset);
                    }
                    Err(_) => prop_assert_eq!(live.len() as u64, allocator.max_border()),
                },
                AllocOp::Free(pick) if !live.is_empty() => {
                    let offset = live.swap_remove(pick % live.len());
                    allocator.free(offset).unwrap();
                }
                AllocOp::Free(_) => {}
            }
        }

        let recovered = PmemAllocator::new(Arc::clone(&heap), 4, 32, false).unwrap();
        prop_assert_eq!(recovered.border(), allocator.border());
        prop_assert_eq!(recovered.free_count(), allocator.free_count());
        for &offset in &live {
            prop_assert!(recovered.is_allocated(offset).unwrap());
        }

        // Recovery from a recovered heap changes nothing.
        let again = PmemAllocator::new(heap, 4, 32, false).unwrap();
        prop_assert_eq!(again.border(), recovered.border());
        prop_assert_eq!(again.free_count(), recovered.free_count());
    }
}
