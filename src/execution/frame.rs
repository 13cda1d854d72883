use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::warn;

use crate::enforce;
use crate::error::{Error, Result};
use crate::execution::plan::{AllocKind, AllocPlanPerValue, ValueType};
use crate::execution::session::SessionState;
use crate::execution::value::{Value, ValueIndex};
use crate::memory::allocator::{calc_mem_size_with_alignment, Buffer, MemoryLocation, ALLOC_ALIGNMENT};
use crate::memory::pattern::MemoryPatternGroup;
use crate::memory::pattern_cache::ShapeSignature;
use crate::memory::pattern_planner::ValuePatternPlanner;
use crate::model::NodeIndex;
use crate::ops::tensor::{DataType, Tensor, TensorShape};

/// Caller-supplied allocation for a fetch: fills the value with a tensor of the given shape
pub type CustomAllocator =
    Arc<dyn Fn(&TensorShape, &MemoryLocation, &mut Value) -> Result<()> + Send + Sync>;

/// What a node tells the frame when asking for one of its outputs
#[derive(Debug, Clone, PartialEq)]
pub struct ValueAllocationParameters {
    pub shape: TensorShape,
}

impl ValueAllocationParameters {
    pub fn new(shape: TensorShape) -> Self {
        Self { shape }
    }
}

/// Shape signature of a set of feeds; `None` if any feed is not a tensor
pub fn feed_shape_signature(feeds: &[Value]) -> Option<ShapeSignature> {
    feeds
        .iter()
        .map(|v| v.tensor().map(|t| t.shape().dims().to_vec()))
        .collect::<Option<Vec<_>>>()
        .map(ShapeSignature::new)
}

/// The value table of one inference call.
///
/// Values start out from feeds, weights and caller-provided fetches; everything else is
/// allocated on demand as nodes ask for their outputs, following the session's allocation
/// plan. With memory patterns enabled, a run either replays a cached layout (one buffer per
/// location, tensors carved by offset) or traces its allocations so a layout can be generated.
pub struct ExecutionFrame<'a> {
    session_state: &'a SessionState,
    all_values: Vec<Value>,
    fetch_value_idxs: Vec<ValueIndex>,
    fetch_set: HashSet<ValueIndex>,
    custom_allocators: HashMap<ValueIndex, CustomAllocator>,
    mem_patterns: Option<Arc<MemoryPatternGroup>>,
    planner: Option<ValuePatternPlanner>,
    buffers: HashMap<MemoryLocation, Buffer>,
}

impl<'a> ExecutionFrame<'a> {
    /// Build the frame. `fetch_allocators` is keyed by position in `fetch_idxs`.
    pub fn new(
        feed_idxs: &[ValueIndex],
        feeds: &[Value],
        fetch_idxs: &[ValueIndex],
        fetches: &[Value],
        fetch_allocators: &HashMap<usize, CustomAllocator>,
        session_state: &'a SessionState,
    ) -> Result<Self> {
        if feed_idxs.len() != feeds.len() {
            return Err(Error::InvalidArgument(format!(
                "Got {} feed values for {} feed names",
                feeds.len(),
                feed_idxs.len()
            )));
        }
        let value_count = session_state.value_map().len();
        let mut frame = Self {
            session_state,
            all_values: vec![Value::new(); value_count],
            fetch_value_idxs: fetch_idxs.to_vec(),
            fetch_set: fetch_idxs.iter().copied().collect(),
            custom_allocators: HashMap::new(),
            mem_patterns: None,
            planner: None,
            buffers: HashMap::new(),
        };

        for (&position, allocator) in fetch_allocators {
            let index = fetch_idxs.get(position).ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "Custom allocator given for fetch {} but only {} fetches were requested",
                    position,
                    fetch_idxs.len()
                ))
            })?;
            frame.custom_allocators.insert(*index, Arc::clone(allocator));
        }

        // fetches, then weights, then feeds: later sources win
        if !fetches.is_empty() {
            if fetches.len() != fetch_idxs.len() {
                return Err(Error::InvalidArgument(format!(
                    "Got {} pre-allocated fetches for {} fetch names",
                    fetches.len(),
                    fetch_idxs.len()
                )));
            }
            for (&index, value) in fetch_idxs.iter().zip(fetches) {
                frame.check_index(index)?;
                frame.all_values[index] = value.clone();
            }
        }
        for (&index, value) in session_state.initializers() {
            frame.check_index(index)?;
            frame.all_values[index] = value.clone();
        }
        for (&index, value) in feed_idxs.iter().zip(feeds) {
            frame.check_index(index)?;
            frame.all_values[index] = value.clone();
        }

        if session_state.options().enable_mem_pattern {
            if let Some(signature) = feed_shape_signature(feeds) {
                match session_state.get_memory_pattern_group(&signature) {
                    Some(group) => frame.allocate_pattern_buffers(group)?,
                    None => {
                        frame.planner = Some(ValuePatternPlanner::new(session_state.execution_plan()));
                    }
                }
            }
        }
        Ok(frame)
    }

    fn allocate_pattern_buffers(&mut self, group: Arc<MemoryPatternGroup>) -> Result<()> {
        for (location, pattern) in group.iter() {
            if pattern.peak_size == 0 {
                continue;
            }
            enforce!(
                !self.buffers.contains_key(location),
                "Pattern buffer for {} is already allocated",
                location
            );
            let size = calc_mem_size_with_alignment(pattern.peak_size, 1, ALLOC_ALIGNMENT)
                .ok_or_else(|| Error::Fail("size overflow".to_string()))?;
            let allocator = self.session_state.allocator(location)?;
            self.buffers.insert(*location, allocator.alloc(size)?);
        }
        self.mem_patterns = Some(group);
        Ok(())
    }

    fn check_index(&self, index: ValueIndex) -> Result<()> {
        if index >= self.all_values.len() {
            return Err(Error::InvalidArgument(format!(
                "invalid index {} for {} values",
                index,
                self.all_values.len()
            )));
        }
        Ok(())
    }

    pub fn get_allocation_plan(&self, index: ValueIndex) -> &AllocPlanPerValue {
        let plan = &self.session_state.execution_plan().allocation_plan;
        enforce!(
            index < plan.len(),
            "Value index {} is out of range for an allocation plan of {} values",
            index,
            plan.len()
        );
        &plan[index]
    }

    pub fn node_offset(&self, node: NodeIndex) -> usize {
        self.session_state.node_index_info().node_offset(node)
    }

    pub fn has_memory_pattern_planner(&self) -> bool {
        self.planner.is_some()
    }

    /// True when this run carves tensors from a cached pattern
    pub fn uses_memory_pattern(&self) -> bool {
        self.mem_patterns.is_some()
    }

    pub fn value(&self, index: ValueIndex) -> Option<&Value> {
        self.all_values.get(index)
    }

    /// Value behind node slot `offset`; `None` for an omitted optional argument
    pub fn get_node_input_or_output_value(&self, offset: usize) -> Option<&Value> {
        let index = self.session_state.node_index_info().value_index(offset)?;
        self.all_values.get(index)
    }

    /// Value behind output slot `offset`, allocated per the plan if it is still empty.
    ///
    /// Returns `Ok(None)` for an optional output nobody asked for.
    pub fn get_or_create_node_output_value(
        &mut self,
        offset: usize,
        parameters: Option<&ValueAllocationParameters>,
    ) -> Result<Option<&mut Value>> {
        let index = match self.session_state.node_index_info().value_index(offset) {
            Some(index) => index,
            None => return Ok(None),
        };
        self.check_index(index)?;

        if self.all_values[index].is_allocated() {
            if let (Some(tensor), Some(parameters)) = (self.all_values[index].tensor(), parameters) {
                enforce!(
                    tensor.shape() == &parameters.shape,
                    "Value {} is already allocated with shape {} but shape {} was requested",
                    index,
                    tensor.shape(),
                    parameters.shape
                );
            }
        } else {
            self.allocate_as_per_allocation_plan(index, parameters)?;
        }
        Ok(Some(&mut self.all_values[index]))
    }

    pub fn allocate_as_per_allocation_plan(
        &mut self,
        index: ValueIndex,
        parameters: Option<&ValueAllocationParameters>,
    ) -> Result<()> {
        self.check_index(index)?;
        let plan = self.get_allocation_plan(index).clone();

        if let Some(allocator) = self.custom_allocators.get(&index).cloned() {
            let shape = Self::required_shape(index, parameters)?;
            return allocator(&shape, &plan.location, &mut self.all_values[index]);
        }

        let value_type = plan.value_type.as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Tried to allocate without valid type information, value index={}",
                index
            ))
        })?;

        let data_type = match value_type {
            ValueType::NonTensor(non_tensor) => {
                self.all_values[index] = Value::from_non_tensor(&non_tensor.name, (non_tensor.create)());
                return Ok(());
            }
            ValueType::Tensor(data_type) => *data_type,
        };

        let shape = Self::required_shape(index, parameters)?;
        match plan.alloc_kind {
            AllocKind::Allocate | AllocKind::AllocateOutput => self.allocate_tensor_self_own_buffer(
                index,
                data_type,
                plan.location,
                &shape,
                plan.create_fence_if_async,
            ),
            AllocKind::Reuse => {
                let donor = match plan.reused_buffer {
                    Some(donor) => donor,
                    None => {
                        return Err(Error::Fail(format!(
                            "Value {} is planned to reuse a buffer but names no donor",
                            index
                        )))
                    }
                };
                self.allocate_tensor_pre_allocated_buffer(index, donor, data_type, &shape)
            }
            other => Err(Error::Fail(format!(
                "Value {} has allocation kind {} which cannot be allocated by the frame",
                index, other
            ))),
        }
    }

    fn required_shape(index: ValueIndex, parameters: Option<&ValueAllocationParameters>) -> Result<TensorShape> {
        parameters.map(|p| p.shape.clone()).ok_or_else(|| {
            Error::InvalidArgument(format!("A shape is required to allocate tensor value {}", index))
        })
    }

    /// Give `index` a buffer of its own, carved from the pattern buffer when a matching
    /// block exists.
    pub fn allocate_tensor_self_own_buffer(
        &mut self,
        index: ValueIndex,
        data_type: DataType,
        location: MemoryLocation,
        shape: &TensorShape,
        create_fence: bool,
    ) -> Result<()> {
        self.check_index(index)?;
        if data_type.is_string() {
            self.all_values[index] = Value::from_tensor(Tensor::new_strings(shape.clone(), location)?);
            return Ok(());
        }

        let size = Tensor::required_bytes(data_type, shape)?;
        if size == 0 {
            self.all_values[index] = Value::from_tensor(Tensor::empty(data_type, shape.clone(), location));
            return Ok(());
        }
        let aligned = calc_mem_size_with_alignment(size, 1, ALLOC_ALIGNMENT)
            .ok_or_else(|| Error::Fail("size overflow".to_string()))?;

        let is_output = self.get_allocation_plan(index).alloc_kind == AllocKind::AllocateOutput;
        let carved = if is_output { None } else { self.carve_from_pattern(index, location, size)? };

        let allocator = self.session_state.allocator(&location)?;
        let buffer = match carved {
            Some(buffer) => buffer,
            None => allocator.alloc(aligned)?,
        };
        let mut value = Value::from_tensor(Tensor::new(data_type, shape.clone(), buffer)?);

        if create_fence {
            enforce!(
                self.all_values[index].fence().is_none(),
                "Value {} already holds a fence",
                index
            );
            value.set_fence(allocator.create_fence());
        }
        self.all_values[index] = value;

        if !is_output {
            if let Some(planner) = self.planner.as_mut() {
                if let Err(e) = planner.trace_allocation(index, size) {
                    warn!("TraceAllocation for value {} failed: {}", index, e);
                }
            }
        }
        Ok(())
    }

    fn carve_from_pattern(&self, index: ValueIndex, location: MemoryLocation, size: usize) -> Result<Option<Buffer>> {
        let block = match self
            .mem_patterns
            .as_ref()
            .and_then(|group| group.get_patterns(&location))
            .and_then(|pattern| pattern.get_block(index))
        {
            Some(block) => *block,
            None => return Ok(None),
        };
        let buffer = match self.buffers.get(&location) {
            Some(buffer) => buffer,
            None => return Ok(None),
        };
        if block.size != size || block.end() > buffer.size() {
            warn!(
                "Memory pattern block for value {} at {} records {} bytes but {} are needed; allocating directly",
                index, location, block.size, size
            );
            return Ok(None);
        }
        buffer.slice(block.offset, block.size).map(Some)
    }

    /// Bind `index` to the buffer (and fence) of `donor`
    pub fn allocate_tensor_pre_allocated_buffer(
        &mut self,
        index: ValueIndex,
        donor: ValueIndex,
        data_type: DataType,
        shape: &TensorShape,
    ) -> Result<()> {
        self.check_index(index)?;
        self.check_index(donor)?;
        if !self.all_values[donor].is_allocated() {
            // the donor's producer may have been skipped for this run
            self.allocate_as_per_allocation_plan(donor, Some(&ValueAllocationParameters::new(shape.clone())))?;
        }

        let donor_value = &self.all_values[donor];
        let donor_tensor = donor_value.tensor().ok_or_else(|| {
            Error::Fail(format!("Value {} cannot reuse non-tensor value {}", index, donor))
        })?;
        let location = donor_tensor.location();
        let tensor = match donor_tensor.buffer() {
            Some(buffer) => Tensor::new(data_type, shape.clone(), buffer.clone())?,
            None if Tensor::required_bytes(data_type, shape)? == 0 => {
                Tensor::empty(data_type, shape.clone(), location)
            }
            None => {
                return Err(Error::Fail(format!(
                    "Value {} cannot reuse value {}: it has no raw buffer",
                    index, donor
                )))
            }
        };
        let fence = donor_value.fence().cloned();

        let mut value = Value::from_tensor(tensor);
        value.set_fence(fence);
        self.all_values[index] = value;
        Ok(())
    }

    /// Drop the frame's reference to a value and record the free for pattern generation
    pub fn release_value(&mut self, index: ValueIndex) -> Result<()> {
        self.check_index(index)?;
        self.all_values[index].reset();
        self.trace_free(index);
        Ok(())
    }

    fn trace_free(&mut self, index: ValueIndex) {
        if self.fetch_set.contains(&index) || self.custom_allocators.contains_key(&index) {
            return;
        }
        let traceable = matches!(
            &self.get_allocation_plan(index).value_type,
            Some(ValueType::Tensor(dt)) if !dt.is_string()
        );
        if !traceable {
            return;
        }
        if let Some(planner) = self.planner.as_mut() {
            if let Err(e) = planner.trace_free(index) {
                warn!("TraceFree for value {} failed: {}", index, e);
            }
        }
    }

    /// Copy the fetched values out. A non-empty `fetches` must already have one slot per fetch.
    pub fn get_outputs(&self, fetches: &mut Vec<Value>) -> Result<()> {
        let count = self.fetch_value_idxs.len();
        if fetches.is_empty() {
            fetches.resize(count, Value::new());
        } else if fetches.len() != count {
            return Err(Error::Fail(format!(
                "Fetches vector passed to GetOutputs contains {} entries which doesn't match the number of fetches the frame was initialized with of {}",
                fetches.len(),
                count
            )));
        }
        for (slot, &index) in fetches.iter_mut().zip(&self.fetch_value_idxs) {
            *slot = self.all_values[index].clone();
        }
        Ok(())
    }

    pub fn generate_patterns(&self) -> Result<MemoryPatternGroup> {
        match &self.planner {
            Some(planner) => Ok(planner.generate_patterns()),
            None => Err(Error::Fail(
                "Memory pattern planner is not enabled on this execution frame.".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::SessionOptions;
    use crate::memory::allocator::CpuAllocator;
    use crate::memory::pattern::MemoryBlock;
    use crate::model::{Graph, Node, NodeArg};
    use crate::providers::{CpuExecutionProvider, ExecutionProviders};

    fn relu_session(options: SessionOptions) -> SessionState {
        let mut graph = Graph::new("relu");
        graph.add_input(NodeArg::float("x", &[1, 4]));
        graph.add_node(Node::new("relu", "Relu", vec![NodeArg::named("x")], vec![NodeArg::float("h", &[1, 4])]));
        graph.add_node(Node::new("tanh", "Tanh", vec![NodeArg::named("h")], vec![NodeArg::float("y", &[1, 4])]));
        graph.add_output(NodeArg::named("y"));
        let mut providers = ExecutionProviders::new();
        providers.add(Arc::new(CpuExecutionProvider::default())).unwrap();
        SessionState::create(graph, providers, options).unwrap()
    }

    fn feed(state: &SessionState) -> (Vec<ValueIndex>, Vec<Value>) {
        let allocator = CpuAllocator::new(None);
        let x = Tensor::from_f32([1, 4], &[1.0, -2.0, 3.0, -4.0], &allocator).unwrap();
        (vec![state.value_map().get_idx("x").unwrap()], vec![Value::from_tensor(x)])
    }

    #[test]
    fn test_trace_records_unaligned_block() {
        let state = relu_session(SessionOptions::default());
        let (feed_idxs, feeds) = feed(&state);
        let y = state.value_map().get_idx("y").unwrap();
        let h = state.value_map().get_idx("h").unwrap();
        let mut frame = ExecutionFrame::new(&feed_idxs, &feeds, &[y], &[], &HashMap::new(), &state).unwrap();
        assert!(frame.has_memory_pattern_planner());

        let offset = frame.node_offset(0) + 1;
        let params = ValueAllocationParameters::new([1, 4].into());
        let value = frame.get_or_create_node_output_value(offset, Some(&params)).unwrap().unwrap();
        assert_eq!(value.tensor().unwrap().size_in_bytes(), 16);

        let group = frame.generate_patterns().unwrap();
        let pattern = group.get_patterns(&MemoryLocation::cpu()).unwrap();
        assert_eq!(pattern.get_block(h), Some(&MemoryBlock { offset: 0, size: 16 }));
        assert_eq!(pattern.peak_size, 16);
    }

    #[test]
    fn test_release_and_bad_index() {
        let state = relu_session(SessionOptions::default());
        let (feed_idxs, feeds) = feed(&state);
        let mut frame = ExecutionFrame::new(&feed_idxs, &feeds, &[], &[], &HashMap::new(), &state).unwrap();
        assert!(matches!(frame.release_value(99), Err(Error::InvalidArgument(_))));
        frame.release_value(feed_idxs[0]).unwrap();
        assert!(!frame.value(feed_idxs[0]).unwrap().is_allocated());
    }

    #[test]
    fn test_pattern_generation_needs_planner() {
        let state = relu_session(SessionOptions::default().enable_mem_pattern(false));
        let (feed_idxs, feeds) = feed(&state);
        let frame = ExecutionFrame::new(&feed_idxs, &feeds, &[], &[], &HashMap::new(), &state).unwrap();
        assert!(!frame.has_memory_pattern_planner());
        match frame.generate_patterns() {
            Err(Error::Fail(msg)) => assert!(msg.contains("not enabled")),
            other => panic!("unexpected: {:?}", other.map(|g| g.locations.len())),
        }
    }

    #[test]
    #[should_panic(expected = "Invariant violation")]
    fn test_shape_mismatch_on_allocated_output() {
        let state = relu_session(SessionOptions::default());
        let (feed_idxs, feeds) = feed(&state);
        let mut frame = ExecutionFrame::new(&feed_idxs, &feeds, &[], &[], &HashMap::new(), &state).unwrap();
        let offset = frame.node_offset(0) + 1;
        frame
            .get_or_create_node_output_value(offset, Some(&ValueAllocationParameters::new([1, 4].into())))
            .unwrap();
        let _ = frame.get_or_create_node_output_value(offset, Some(&ValueAllocationParameters::new([2, 4].into())));
    }

    #[test]
    #[should_panic(expected = "Invariant violation")]
    fn test_plan_index_out_of_range() {
        let state = relu_session(SessionOptions::default());
        let frame = ExecutionFrame::new(&[], &[], &[], &[], &HashMap::new(), &state).unwrap();
        frame.get_allocation_plan(1000);
    }

    #[test]
    fn test_negative_shape_is_invalid_argument() {
        let state = relu_session(SessionOptions::default());
        let (feed_idxs, feeds) = feed(&state);
        let mut frame = ExecutionFrame::new(&feed_idxs, &feeds, &[], &[], &HashMap::new(), &state).unwrap();
        let h = state.value_map().get_idx("h").unwrap();
        let result = frame.allocate_tensor_self_own_buffer(h, DataType::Float, MemoryLocation::cpu(), &[-1, 4].into(), false);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
