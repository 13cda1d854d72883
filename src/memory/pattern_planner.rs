use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::execution::plan::SequentialExecutionPlan;
use crate::execution::value::ValueIndex;
use crate::memory::allocator::MemoryLocation;
use crate::memory::pattern::{MemPatternPlanner, MemoryBlock, MemoryPatternGroup};

/// Routes allocation traces to one pattern planner per memory location
#[derive(Debug)]
pub struct ValuePatternPlanner {
    value_locations: Vec<MemoryLocation>,
    planners: BTreeMap<MemoryLocation, MemPatternPlanner>,
}

impl ValuePatternPlanner {
    pub fn new(plan: &SequentialExecutionPlan) -> Self {
        let value_locations: Vec<MemoryLocation> =
            plan.allocation_plan.iter().map(|p| p.location).collect();
        let planners = plan
            .locations()
            .into_iter()
            .map(|location| (location, MemPatternPlanner::new()))
            .collect();
        Self {
            value_locations,
            planners,
        }
    }

    fn planner_for(&mut self, value_index: ValueIndex) -> Option<&mut MemPatternPlanner> {
        let location = self.value_locations.get(value_index)?;
        self.planners.get_mut(location)
    }

    pub fn trace_allocation(&mut self, value_index: ValueIndex, size: usize) -> Result<MemoryBlock> {
        match self.planner_for(value_index) {
            Some(planner) => planner.trace_allocation(value_index, size),
            None => Err(Error::InvalidArgument(format!(
                "Value index {} is not part of the allocation plan",
                value_index
            ))),
        }
    }

    pub fn trace_free(&mut self, value_index: ValueIndex) -> Result<()> {
        match self.planner_for(value_index) {
            Some(planner) => {
                planner.trace_free(value_index);
                Ok(())
            }
            None => Err(Error::InvalidArgument(format!(
                "Value index {} is not part of the allocation plan",
                value_index
            ))),
        }
    }

    /// One pattern per location, in location order
    pub fn generate_patterns(&self) -> MemoryPatternGroup {
        let mut group = MemoryPatternGroup::default();
        for (location, planner) in &self.planners {
            group.push(*location, planner.generate_pattern());
        }
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::plan::AllocPlanPerValue;
    use crate::memory::allocator::{DeviceType, MemType};

    #[test]
    fn test_routes_by_location() {
        let gpu = MemoryLocation::new(DeviceType::Gpu, 0, MemType::Default);
        let plan = SequentialExecutionPlan {
            allocation_plan: vec![
                AllocPlanPerValue::default(),
                AllocPlanPerValue { location: gpu, ..Default::default() },
                AllocPlanPerValue::default(),
            ],
            ..Default::default()
        };
        let mut planner = ValuePatternPlanner::new(&plan);
        planner.trace_allocation(0, 16).unwrap();
        planner.trace_allocation(1, 32).unwrap();
        planner.trace_allocation(2, 8).unwrap();
        assert!(matches!(planner.trace_allocation(7, 8), Err(Error::InvalidArgument(_))));

        let group = planner.generate_patterns();
        assert_eq!(group.locations, vec![MemoryLocation::cpu(), gpu]);
        let cpu = group.get_patterns(&MemoryLocation::cpu()).unwrap();
        assert_eq!(cpu.get_block(2), Some(&MemoryBlock { offset: 64, size: 8 }));
        assert_eq!(group.get_patterns(&gpu).unwrap().peak_size, 32);
        assert_eq!(group.total_peak_size(), 72 + 32);
    }
}
