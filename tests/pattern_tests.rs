use std::collections::HashMap;

use rand::prelude::*;

use onnx_exec::memory::allocator::ALLOC_ALIGNMENT;
use onnx_exec::memory::pattern::{MemPatternPlanner, MemoryBlock};

// Random interleavings of allocations and frees must keep live blocks disjoint and aligned
#[test]
fn test_random_trace_keeps_live_blocks_disjoint() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..20 {
        let mut planner = MemPatternPlanner::new();
        let mut live: HashMap<usize, MemoryBlock> = HashMap::new();
        let mut next_value = 0usize;

        for _ in 0..200 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=512);
                let block = planner.trace_allocation(next_value, size).unwrap();
                assert_eq!(block.offset % ALLOC_ALIGNMENT, 0);
                assert_eq!(block.size, size);
                for other in live.values() {
                    assert!(!block.overlaps(other), "{:?} overlaps live {:?}", block, other);
                }
                live.insert(next_value, block);
                next_value += 1;
            } else {
                let victim = *live.keys().choose(&mut rng).unwrap();
                live.remove(&victim);
                planner.trace_free(victim);
            }
        }

        let pattern = planner.generate_pattern();
        assert_eq!(pattern.blocks.len(), next_value);
        let furthest = pattern.blocks.values().map(MemoryBlock::end).max().unwrap_or(0);
        assert_eq!(pattern.peak_size, furthest);
    }
}

#[test]
fn test_freed_gap_is_reused_by_best_fit() {
    let mut planner = MemPatternPlanner::new();
    planner.trace_allocation(0, 100).unwrap();
    planner.trace_allocation(1, 300).unwrap();
    planner.trace_allocation(2, 10).unwrap();
    planner.trace_allocation(3, 10).unwrap();
    // two gaps open up: 128 bytes at 0 and 64 bytes at 448
    planner.trace_free(0);
    planner.trace_free(2);

    let block = planner.trace_allocation(4, 50).unwrap();
    assert_eq!(block, MemoryBlock { offset: 448, size: 50 });
    let block = planner.trace_allocation(5, 120).unwrap();
    assert_eq!(block, MemoryBlock { offset: 0, size: 120 });
    assert_eq!(planner.generate_pattern().peak_size, 522);
}

#[test]
fn test_double_allocation_is_rejected() {
    let mut planner = MemPatternPlanner::new();
    planner.trace_allocation(7, 16).unwrap();
    assert!(planner.trace_allocation(7, 16).is_err());
    planner.trace_free(7);
    // freeing twice is harmless and the value may be traced again
    planner.trace_free(7);
    assert_eq!(planner.trace_allocation(7, 16).unwrap().offset, 0);
}
