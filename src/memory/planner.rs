use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::Result;
use crate::execution::plan::{
    AllocKind, AllocPlanPerValue, NodeExecutionPlan, NonTensorType, SequentialExecutionPlan, ValueType,
};
use crate::execution::value::{Value, ValueIndex};
use crate::execution::value_map::ValueNameIdxMap;
use crate::memory::allocator::{MemType, MemoryLocation};
use crate::model::{Dimension, Graph, Node, NodeIndex, TypeInfo};
use crate::ops::registry::{KernelDef, KernelRegistryManager};
use crate::providers::ExecutionProviders;

fn create_sequence() -> Arc<dyn std::any::Any + Send + Sync> {
    Arc::new(Mutex::new(Vec::<Value>::new()))
}

fn create_map() -> Arc<dyn std::any::Any + Send + Sync> {
    Arc::new(Mutex::new(BTreeMap::<String, Value>::new()))
}

fn value_type_of(type_info: &TypeInfo) -> ValueType {
    match type_info {
        TypeInfo::Tensor { elem_type, .. } => ValueType::Tensor(*elem_type),
        TypeInfo::Sequence { .. } => ValueType::NonTensor(NonTensorType {
            name: type_info.type_name(),
            create: create_sequence,
        }),
        TypeInfo::Map { .. } => ValueType::NonTensor(NonTensorType {
            name: type_info.type_name(),
            create: create_map,
        }),
    }
}

/// Values a node reads: explicit inputs, then names its subgraphs pull from this scope
fn node_reads(node: &Node) -> Vec<String> {
    let mut names: Vec<String> = node
        .inputs
        .iter()
        .filter(|a| a.exists())
        .map(|a| a.name.clone())
        .collect();
    names.extend(node.implicit_inputs());
    names
}

/// Static analysis deciding how every value of a partitioned graph gets its buffer.
///
/// Buffers are reused in place when a kernel allows it and the input dies at that node,
/// otherwise from a free list of dead buffers of equal size at the same location.
pub struct AllocationPlanner<'a> {
    graph: &'a Graph,
    providers: &'a ExecutionProviders,
    registry_mgr: &'a KernelRegistryManager,
    value_map: &'a ValueNameIdxMap,
    order: Vec<NodeIndex>,
    plan: Vec<AllocPlanPerValue>,
    value_info: Vec<Option<TypeInfo>>,
    /// Owner of the buffer each value ends up in
    buffer_of: Vec<ValueIndex>,
    /// Remaining uses per buffer owner
    use_count: Vec<usize>,
    freelist: VecDeque<ValueIndex>,
}

impl<'a> AllocationPlanner<'a> {
    pub fn create_plan(
        graph: &'a Graph,
        providers: &'a ExecutionProviders,
        registry_mgr: &'a KernelRegistryManager,
        value_map: &'a ValueNameIdxMap,
    ) -> Result<SequentialExecutionPlan> {
        let count = value_map.len();
        let mut planner = Self {
            graph,
            providers,
            registry_mgr,
            value_map,
            order: graph.topological_order()?,
            plan: vec![AllocPlanPerValue::default(); count],
            value_info: vec![None; count],
            buffer_of: (0..count).collect(),
            use_count: vec![0; count],
            freelist: VecDeque::new(),
        };
        planner.compute_value_types();
        planner.compute_alloc_kinds()?;
        planner.compute_locations()?;
        planner.compute_use_counts()?;
        planner.compute_reuse_plan()?;
        let (execution_plan, to_be_freed) = planner.generate_deallocation_plan()?;
        Ok(SequentialExecutionPlan {
            allocation_plan: planner.plan,
            execution_plan,
            to_be_freed,
        })
    }

    fn index(&self, name: &str) -> Result<ValueIndex> {
        self.value_map.get_idx(name)
    }

    fn kernel_def(&self, node: &Node) -> Option<&'a KernelDef> {
        if !node.is_assigned() {
            return None;
        }
        self.registry_mgr.search_kernel(node).ok().map(|info| &info.def)
    }

    fn location_for(&self, node: &Node, mem_type: MemType) -> MemoryLocation {
        self.providers
            .get(&node.execution_provider)
            .map(|p| p.allocator(mem_type).location())
            .unwrap_or_else(MemoryLocation::cpu)
    }

    fn compute_value_types(&mut self) {
        for (index, name) in self.value_map.iter() {
            let type_info = self.graph.node_arg(name).and_then(|arg| arg.type_info);
            self.plan[index].value_type = type_info.as_ref().map(value_type_of);
            self.value_info[index] = type_info;
        }
    }

    fn compute_alloc_kinds(&mut self) -> Result<()> {
        for output in self.graph.outputs() {
            let index = self.index(&output.name)?;
            self.plan[index].alloc_kind = AllocKind::AllocateOutput;
        }
        for initializer in self.graph.initializers() {
            let index = self.index(&initializer.name)?;
            self.plan[index].alloc_kind = AllocKind::AllocateStatically;
        }
        for input in self.graph.inputs() {
            let index = self.index(&input.name)?;
            self.plan[index].alloc_kind = AllocKind::PreExisting;
        }
        Ok(())
    }

    fn compute_locations(&mut self) -> Result<()> {
        for &node_index in &self.order {
            let node = match self.graph.node(node_index) {
                Some(node) => node,
                None => continue,
            };
            let def = self.kernel_def(node);
            for (i, output) in node.outputs.iter().enumerate().filter(|(_, o)| o.exists()) {
                let mem_type = def.map_or(MemType::Default, |d| d.output_memory_type(i));
                let index = self.index(&output.name)?;
                self.plan[index].location = self.location_for(node, mem_type);
            }
        }

        // inputs and weights live where their first consumer wants them
        let sources: Vec<String> = self
            .graph
            .inputs()
            .iter()
            .map(|a| a.name.clone())
            .chain(self.graph.initializers().iter().map(|i| i.name.clone()))
            .collect();
        for name in sources {
            let index = self.index(&name)?;
            if let Some(location) = self.first_consumer_location(&name) {
                self.plan[index].location = location;
            }
        }

        for entry in &mut self.plan {
            entry.create_fence_if_async = !entry.location.is_cpu();
        }
        Ok(())
    }

    fn first_consumer_location(&self, name: &str) -> Option<MemoryLocation> {
        for &node_index in &self.order {
            let node = self.graph.node(node_index)?;
            if let Some(slot) = node.inputs.iter().position(|a| a.exists() && a.name == name) {
                let mem_type = self
                    .kernel_def(node)
                    .map_or(MemType::Default, |d| d.input_memory_type(slot));
                return Some(self.location_for(node, mem_type));
            }
            if node.implicit_inputs().iter().any(|n| n == name) {
                return Some(self.location_for(node, MemType::Default));
            }
        }
        None
    }

    fn compute_use_counts(&mut self) -> Result<()> {
        // values visible outside the run are never released
        let pinned: Vec<String> = self
            .graph
            .inputs()
            .iter()
            .chain(self.graph.outputs().iter())
            .map(|a| a.name.clone())
            .chain(self.graph.initializers().iter().map(|i| i.name.clone()))
            .collect();
        for name in pinned {
            let index = self.index(&name)?;
            self.use_count[index] += 1;
        }
        for &node_index in &self.order {
            if let Some(node) = self.graph.node(node_index) {
                for name in node_reads(node) {
                    let index = self.index(&name)?;
                    self.use_count[index] += 1;
                }
            }
        }
        Ok(())
    }

    /// Strings and non-tensors need constructed elements and never share raw buffers
    fn is_reusable(&self, index: ValueIndex) -> bool {
        matches!(&self.plan[index].value_type, Some(ValueType::Tensor(dt)) if !dt.is_string())
    }

    /// Equal byte size, decidable from static shapes; symbolic dims match by name
    fn same_size(&self, a: ValueIndex, b: ValueIndex) -> bool {
        if !self.is_reusable(a) || !self.is_reusable(b) {
            return false;
        }
        let (ta, tb) = match (&self.value_info[a], &self.value_info[b]) {
            (Some(ta), Some(tb)) => (ta, tb),
            _ => return false,
        };
        let same_elem = match (ta.elem_type(), tb.elem_type()) {
            (Some(x), Some(y)) => x.size_in_bytes() == y.size_in_bytes(),
            _ => false,
        };
        if !same_elem {
            return false;
        }
        match (ta.dims(), tb.dims()) {
            (Some(da), Some(db)) => {
                da.len() == db.len()
                    && da.iter().zip(db.iter()).all(|pair| match pair {
                        (Dimension::Value(x), Dimension::Value(y)) => x == y,
                        (Dimension::Param(x), Dimension::Param(y)) => x == y,
                        _ => false,
                    })
            }
            _ => false,
        }
    }

    fn reuse(&mut self, index: ValueIndex, owner: ValueIndex) {
        debug!(
            "{} reuses the buffer of {}",
            self.value_map.name(index).unwrap_or("?"),
            self.value_map.name(owner).unwrap_or("?")
        );
        self.plan[index].alloc_kind = AllocKind::Reuse;
        self.plan[index].reused_buffer = Some(owner);
        self.buffer_of[index] = owner;
        self.use_count[owner] += self.use_count[index];
    }

    fn release_if_dead(&mut self, owner: ValueIndex) {
        if self.use_count[owner] == 0
            && self.plan[owner].alloc_kind == AllocKind::Allocate
            && !self.freelist.contains(&owner)
        {
            self.freelist.push_front(owner);
        }
    }

    fn compute_reuse_plan(&mut self) -> Result<()> {
        for step in 0..self.order.len() {
            let node = match self.graph.node(self.order[step]) {
                Some(node) => node,
                None => continue,
            };
            let def = self.kernel_def(node);

            for (slot, output) in node.outputs.iter().enumerate().filter(|(_, o)| o.exists()) {
                let index = self.index(&output.name)?;
                if self.plan[index].alloc_kind != AllocKind::Allocate || !self.is_reusable(index) {
                    continue;
                }
                let location = self.plan[index].location;

                let mut in_place = None;
                for &(input_slot, output_slot) in def.map_or(&[][..], |d| &d.may_inplace[..]) {
                    if output_slot != slot {
                        continue;
                    }
                    let input = match node.inputs.get(input_slot) {
                        Some(input) if input.exists() => input,
                        _ => continue,
                    };
                    let input_index = self.index(&input.name)?;
                    let owner = self.buffer_of[input_index];
                    if self.plan[owner].alloc_kind == AllocKind::Allocate
                        && self.use_count[owner] == 1
                        && self.plan[owner].location == location
                        && self.same_size(input_index, index)
                    {
                        in_place = Some(owner);
                        break;
                    }
                }
                if let Some(owner) = in_place {
                    self.reuse(index, owner);
                    continue;
                }

                let free = self
                    .freelist
                    .iter()
                    .position(|&owner| self.plan[owner].location == location && self.same_size(owner, index));
                if let Some(position) = free {
                    if let Some(owner) = self.freelist.remove(position) {
                        self.reuse(index, owner);
                    }
                }
            }

            for name in node_reads(node) {
                let owner = self.buffer_of[self.index(&name)?];
                self.use_count[owner] = self.use_count[owner].saturating_sub(1);
                self.release_if_dead(owner);
            }
            for output in node.outputs.iter().filter(|o| o.exists()) {
                let owner = self.buffer_of[self.index(&output.name)?];
                self.release_if_dead(owner);
            }
        }
        Ok(())
    }

    /// Release each buffer after the last step that produces or reads any value in it,
    /// aliases before their owner
    fn generate_deallocation_plan(&self) -> Result<(Vec<NodeExecutionPlan>, Vec<ValueIndex>)> {
        let is_planned = |index: ValueIndex| {
            matches!(self.plan[index].alloc_kind, AllocKind::Allocate | AllocKind::Reuse)
        };

        let mut last_step: BTreeMap<ValueIndex, usize> = BTreeMap::new();
        let mut members: BTreeMap<ValueIndex, Vec<ValueIndex>> = BTreeMap::new();
        let mut seen: HashSet<ValueIndex> = HashSet::new();
        for (step, &node_index) in self.order.iter().enumerate() {
            let node = match self.graph.node(node_index) {
                Some(node) => node,
                None => continue,
            };
            let touched = node_reads(node)
                .into_iter()
                .chain(node.outputs.iter().filter(|o| o.exists()).map(|o| o.name.clone()));
            for name in touched {
                let index = self.index(&name)?;
                if !is_planned(index) {
                    continue;
                }
                let owner = self.buffer_of[index];
                last_step.insert(owner, step);
                if seen.insert(index) {
                    members.entry(owner).or_default().push(index);
                }
            }
        }

        let mut freed_at: Vec<Vec<ValueIndex>> = vec![Vec::new(); self.order.len()];
        for (owner, step) in last_step {
            let mut group = members.remove(&owner).unwrap_or_default();
            group.sort_unstable_by_key(|&i| (i == owner, i));
            freed_at[step].extend(group);
        }

        let mut execution_plan = Vec::with_capacity(self.order.len());
        let mut to_be_freed = Vec::new();
        for (step, &node_index) in self.order.iter().enumerate() {
            let start = to_be_freed.len();
            to_be_freed.extend(freed_at[step].iter().copied());
            execution_plan.push(NodeExecutionPlan {
                node_index,
                free_range: start..to_be_freed.len(),
            });
        }
        Ok((execution_plan, to_be_freed))
    }
}
