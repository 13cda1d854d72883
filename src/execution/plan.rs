use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use strum_macros::{Display, EnumString};

use crate::execution::value::ValueIndex;
use crate::memory::allocator::MemoryLocation;
use crate::model::NodeIndex;
use crate::ops::tensor::DataType;

/// How a value's buffer is obtained at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum AllocKind {
    /// Fresh buffer from the location's allocator
    Allocate,
    /// Bind to the buffer of `reused_buffer`
    Reuse,
    /// Supplied by the caller as a feed
    PreExisting,
    /// Weight materialised once at session creation
    AllocateStatically,
    /// Graph output handed back to the caller
    AllocateOutput,
    Share,
    AllocatedExternally,
}

/// Constructor for a value that is not a tensor (sequence, map, opaque state)
#[derive(Clone)]
pub struct NonTensorType {
    pub name: String,
    pub create: fn() -> Arc<dyn Any + Send + Sync>,
}

impl fmt::Debug for NonTensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonTensorType").field("name", &self.name).finish()
    }
}

impl PartialEq for NonTensorType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValueType {
    Tensor(DataType),
    NonTensor(NonTensorType),
}

impl ValueType {
    pub fn is_tensor(&self) -> bool {
        matches!(self, ValueType::Tensor(_))
    }

    pub fn data_type(&self) -> Option<DataType> {
        match self {
            ValueType::Tensor(data_type) => Some(*data_type),
            ValueType::NonTensor(_) => None,
        }
    }
}

/// Allocation decision for one value
#[derive(Debug, Clone)]
pub struct AllocPlanPerValue {
    pub alloc_kind: AllocKind,
    /// `None` when the graph carries no type information for the value
    pub value_type: Option<ValueType>,
    pub location: MemoryLocation,
    /// Buffer owner for `AllocKind::Reuse`
    pub reused_buffer: Option<ValueIndex>,
    pub create_fence_if_async: bool,
}

impl Default for AllocPlanPerValue {
    fn default() -> Self {
        Self {
            alloc_kind: AllocKind::Allocate,
            value_type: None,
            location: MemoryLocation::cpu(),
            reused_buffer: None,
            create_fence_if_async: false,
        }
    }
}

/// One step of the sequential plan: run `node_index`, then release
/// `to_be_freed[free_range]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeExecutionPlan {
    pub node_index: NodeIndex,
    pub free_range: Range<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct SequentialExecutionPlan {
    pub allocation_plan: Vec<AllocPlanPerValue>,
    pub execution_plan: Vec<NodeExecutionPlan>,
    pub to_be_freed: Vec<ValueIndex>,
}

impl SequentialExecutionPlan {
    /// Distinct locations used by the plan, sorted
    pub fn locations(&self) -> Vec<MemoryLocation> {
        let mut locations: Vec<MemoryLocation> =
            self.allocation_plan.iter().map(|p| p.location).collect();
        locations.sort();
        locations.dedup();
        locations
    }

    /// Values released after step `step`
    pub fn freed_after(&self, step: usize) -> &[ValueIndex] {
        match self.execution_plan.get(step) {
            Some(plan) => &self.to_be_freed[plan.free_range.clone()],
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator::{DeviceType, MemType};

    #[test]
    fn test_alloc_kind_names() {
        assert_eq!(AllocKind::Reuse.to_string(), "Reuse");
        assert_eq!("AllocateOutput".parse::<AllocKind>().unwrap(), AllocKind::AllocateOutput);
    }

    #[test]
    fn test_locations_are_distinct_and_sorted() {
        let gpu = MemoryLocation::new(DeviceType::Gpu, 0, MemType::Default);
        let plan = SequentialExecutionPlan {
            allocation_plan: vec![
                AllocPlanPerValue { location: gpu, ..Default::default() },
                AllocPlanPerValue::default(),
                AllocPlanPerValue { location: gpu, ..Default::default() },
            ],
            execution_plan: vec![NodeExecutionPlan { node_index: 0, free_range: 0..2 }],
            to_be_freed: vec![2, 0],
        };
        assert_eq!(plan.locations(), vec![MemoryLocation::cpu(), gpu]);
        assert_eq!(plan.freed_after(0), &[2, 0]);
        assert!(plan.freed_after(1).is_empty());
    }
}
