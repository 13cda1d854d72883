use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::enforce;
use crate::error::{Error, Result};
use crate::execution::value::ValueIndex;
use crate::memory::allocator::{align_offset, MemoryLocation, ALLOC_ALIGNMENT};

/// A byte range inside a location's pattern buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBlock {
    pub offset: usize,
    pub size: usize,
}

impl MemoryBlock {
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn overlaps(&self, other: &MemoryBlock) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// Layout of every traced value at one location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPattern {
    pub peak_size: usize,
    pub blocks: BTreeMap<ValueIndex, MemoryBlock>,
}

impl MemoryPattern {
    pub fn get_block(&self, value_index: ValueIndex) -> Option<&MemoryBlock> {
        self.blocks.get(&value_index)
    }
}

/// Packs a trace of allocate/free events into offsets within a single buffer.
///
/// Each allocation goes to the smallest aligned gap between live blocks that can hold it,
/// or after the last live block when no gap fits.
#[derive(Debug, Default)]
pub struct MemPatternPlanner {
    /// Live blocks keyed by offset
    live: BTreeMap<usize, (ValueIndex, usize)>,
    live_offsets: HashMap<ValueIndex, usize>,
    blocks: BTreeMap<ValueIndex, MemoryBlock>,
    peak_size: usize,
}

impl MemPatternPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace_allocation(&mut self, value_index: ValueIndex, size: usize) -> Result<MemoryBlock> {
        if self.live_offsets.contains_key(&value_index) {
            return Err(Error::Fail(format!(
                "Value {} is traced as allocated twice without a free",
                value_index
            )));
        }

        let mut best: Option<(usize, usize)> = None; // (gap, offset)
        let mut cursor = 0usize;
        for (&offset, &(_, block_size)) in &self.live {
            if offset >= cursor {
                let gap = offset - cursor;
                if gap >= size && best.map_or(true, |(g, _)| gap < g) {
                    best = Some((gap, cursor));
                }
            }
            let end = offset + block_size;
            cursor = align_offset(end.max(cursor), ALLOC_ALIGNMENT)
                .ok_or_else(|| Error::Fail("size overflow".to_string()))?;
        }
        let offset = best.map_or(cursor, |(_, offset)| offset);

        let block = MemoryBlock { offset, size };
        // empty blocks occupy no range and may share an offset with a live block
        if size > 0 {
            self.live.insert(offset, (value_index, size));
        }
        self.live_offsets.insert(value_index, offset);
        self.blocks.insert(value_index, block);
        self.peak_size = self.peak_size.max(block.end());
        Ok(block)
    }

    /// Release a traced value; untraced values are ignored
    pub fn trace_free(&mut self, value_index: ValueIndex) {
        if let Some(offset) = self.live_offsets.remove(&value_index) {
            if self.live.get(&offset).map_or(false, |&(owner, _)| owner == value_index) {
                self.live.remove(&offset);
            }
        }
    }

    pub fn generate_pattern(&self) -> MemoryPattern {
        MemoryPattern {
            peak_size: self.peak_size,
            blocks: self.blocks.clone(),
        }
    }
}

/// Patterns for every location touched by one traced run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryPatternGroup {
    pub locations: Vec<MemoryLocation>,
    pub patterns: Vec<MemoryPattern>,
}

impl MemoryPatternGroup {
    pub fn push(&mut self, location: MemoryLocation, pattern: MemoryPattern) {
        enforce!(
            !self.locations.contains(&location),
            "Memory pattern group already has a pattern for {}",
            location
        );
        self.locations.push(location);
        self.patterns.push(pattern);
    }

    pub fn get_patterns(&self, location: &MemoryLocation) -> Option<&MemoryPattern> {
        self.locations
            .iter()
            .position(|l| l == location)
            .and_then(|i| self.patterns.get(i))
    }

    pub fn total_peak_size(&self) -> usize {
        self.patterns.iter().map(|p| p.peak_size).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MemoryLocation, &MemoryPattern)> {
        self.locations.iter().zip(self.patterns.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block() {
        let mut planner = MemPatternPlanner::new();
        let block = planner.trace_allocation(3, 16).unwrap();
        assert_eq!(block, MemoryBlock { offset: 0, size: 16 });
        let pattern = planner.generate_pattern();
        assert_eq!(pattern.peak_size, 16);
        assert_eq!(pattern.get_block(3), Some(&MemoryBlock { offset: 0, size: 16 }));
    }

    #[test]
    fn test_freed_range_is_reused() {
        let mut planner = MemPatternPlanner::new();
        planner.trace_allocation(0, 100).unwrap();
        let b = planner.trace_allocation(1, 40).unwrap();
        assert_eq!(b.offset, 128);
        planner.trace_free(0);
        let c = planner.trace_allocation(2, 64).unwrap();
        assert_eq!(c.offset, 0);
        // the 64..128 gap left after c is the tightest fit
        let d = planner.trace_allocation(3, 10).unwrap();
        assert_eq!(d.offset, 64);
        assert_eq!(planner.generate_pattern().peak_size, 168);
    }

    #[test]
    fn test_best_fit_prefers_smallest_gap() {
        let mut planner = MemPatternPlanner::new();
        for (i, size) in [256usize, 64, 64, 64].iter().enumerate() {
            planner.trace_allocation(i, *size).unwrap();
        }
        // gaps: [0,256) and [320,384)
        planner.trace_free(0);
        planner.trace_free(2);
        let block = planner.trace_allocation(9, 50).unwrap();
        assert_eq!(block.offset, 320);
    }

    #[test]
    fn test_double_allocation_fails() {
        let mut planner = MemPatternPlanner::new();
        planner.trace_allocation(1, 8).unwrap();
        assert!(matches!(planner.trace_allocation(1, 8), Err(Error::Fail(_))));
        planner.trace_free(1);
        planner.trace_free(42);
        assert!(planner.trace_allocation(1, 8).is_ok());
    }

    #[test]
    fn test_empty_block_does_not_evict_live_block() {
        let mut planner = MemPatternPlanner::new();
        planner.trace_allocation(0, 0).unwrap();
        planner.trace_allocation(1, 32).unwrap();
        planner.trace_free(0);
        // value 1 still holds [0, 32)
        assert_eq!(planner.trace_allocation(2, 16).unwrap().offset, 64);
    }

    #[test]
    #[should_panic(expected = "Invariant violation")]
    fn test_group_rejects_duplicate_location() {
        let mut group = MemoryPatternGroup::default();
        group.push(MemoryLocation::cpu(), MemoryPattern::default());
        group.push(MemoryLocation::cpu(), MemoryPattern::default());
    }
}
