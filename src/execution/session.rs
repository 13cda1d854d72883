use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::error::{Error, Result};
use crate::execution::context::SessionOptions;
use crate::execution::node_index_info::NodeIndexInfo;
use crate::execution::plan::SequentialExecutionPlan;
use crate::execution::value::{Value, ValueIndex};
use crate::execution::value_map::ValueNameIdxMap;
use crate::memory::allocator::{AllocatorPtr, MemType, MemoryLocation};
use crate::memory::pattern::MemoryPatternGroup;
use crate::memory::pattern_cache::{MemoryPatternCache, ShapeSignature};
use crate::memory::planner::AllocationPlanner;
use crate::model::{Graph, NodeIndex};
use crate::ops::registry::{KernelCreateContext, KernelRegistryManager, OpKernel};
use crate::ops::tensor::{Tensor, TensorShape};
use crate::partition::func_manager::FuncManager;
use crate::partition::partitioner::GraphPartitioner;
use crate::providers::ExecutionProviders;

/// Everything about a loaded model that does not change between runs.
///
/// Built once by [`SessionState::create`] and shared read-only by every inference call; the
/// only mutable part is the memory pattern cache, which has its own lock.
pub struct SessionState {
    graph: Graph,
    providers: ExecutionProviders,
    options: SessionOptions,
    value_map: ValueNameIdxMap,
    node_index_info: NodeIndexInfo,
    plan: SequentialExecutionPlan,
    initializers: HashMap<ValueIndex, Value>,
    kernels: HashMap<NodeIndex, Box<dyn OpKernel>>,
    allocators: HashMap<MemoryLocation, AllocatorPtr>,
    pattern_cache: MemoryPatternCache,
    registry_manager: KernelRegistryManager,
    func_manager: FuncManager,
}

impl SessionState {
    /// Partition, plan and instantiate kernels for `graph`
    pub fn create(mut graph: Graph, providers: ExecutionProviders, options: SessionOptions) -> Result<Self> {
        graph.resolve()?;

        let mut registry_manager = KernelRegistryManager::new();
        for provider in providers.iter() {
            if let Some(registry) = provider.kernel_registry()? {
                registry_manager.register_provider_registry(registry);
            }
        }

        let mut func_manager = FuncManager::new();
        GraphPartitioner::new(&providers, options.partition_options()).partition(
            &mut graph,
            &mut func_manager,
            &mut registry_manager,
            options.partition_mode,
        )?;

        let value_map = ValueNameIdxMap::from_graph(&graph)?;
        let node_index_info = NodeIndexInfo::new(&graph, &value_map)?;

        // first provider to claim a location serves it
        let mut allocators: HashMap<MemoryLocation, AllocatorPtr> = HashMap::new();
        for provider in providers.iter() {
            for mem_type in [MemType::Default, MemType::CpuInput, MemType::CpuOutput] {
                let allocator = provider.allocator(mem_type);
                allocators.entry(allocator.location()).or_insert(allocator);
            }
        }

        let plan = AllocationPlanner::create_plan(&graph, &providers, &registry_manager, &value_map)?;

        let mut initializers = HashMap::new();
        for initializer in graph.initializers() {
            let index = value_map.get_idx(&initializer.name)?;
            let location = plan
                .allocation_plan
                .get(index)
                .map(|p| p.location)
                .unwrap_or_else(MemoryLocation::cpu);
            let allocator = Self::lookup_allocator(&allocators, &location)?;
            let tensor = Tensor::from_bytes(
                initializer.data_type,
                TensorShape::new(initializer.dims.clone()),
                initializer.element_count(),
                &initializer.raw_data,
                allocator.as_ref(),
            )?;
            initializers.insert(index, Value::from_tensor(tensor));
        }

        let mut kernels = HashMap::new();
        for node_index in graph.topological_order()? {
            let node = match graph.node(node_index) {
                Some(node) => node,
                None => continue,
            };
            let info = registry_manager.search_kernel(node)?;
            let ctx = KernelCreateContext {
                node,
                def: &info.def,
                func_manager: &func_manager,
            };
            let kernel = (info.create)(&ctx)?;
            debug!("Created kernel for node '{}' ({}) on {}", node.name, node.op_type, node.execution_provider);
            kernels.insert(node_index, kernel);
        }

        info!(
            "Session for graph '{}' ready: {} kernels, {} values, {} initializers",
            graph.name,
            kernels.len(),
            value_map.len(),
            initializers.len()
        );

        Ok(Self {
            graph,
            providers,
            options,
            value_map,
            node_index_info,
            plan,
            initializers,
            kernels,
            allocators,
            pattern_cache: MemoryPatternCache::new(),
            registry_manager,
            func_manager,
        })
    }

    fn lookup_allocator(
        allocators: &HashMap<MemoryLocation, AllocatorPtr>,
        location: &MemoryLocation,
    ) -> Result<AllocatorPtr> {
        allocators
            .get(location)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("No allocator registered for {}", location)))
    }

    pub fn allocator(&self, location: &MemoryLocation) -> Result<AllocatorPtr> {
        Self::lookup_allocator(&self.allocators, location)
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn providers(&self) -> &ExecutionProviders {
        &self.providers
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn value_map(&self) -> &ValueNameIdxMap {
        &self.value_map
    }

    pub fn node_index_info(&self) -> &NodeIndexInfo {
        &self.node_index_info
    }

    pub fn execution_plan(&self) -> &SequentialExecutionPlan {
        &self.plan
    }

    /// Weights, already placed at their planned locations
    pub fn initializers(&self) -> &HashMap<ValueIndex, Value> {
        &self.initializers
    }

    pub fn kernel(&self, node: NodeIndex) -> Option<&dyn OpKernel> {
        self.kernels.get(&node).map(|k| k.as_ref())
    }

    pub fn registry_manager(&self) -> &KernelRegistryManager {
        &self.registry_manager
    }

    pub fn func_manager(&self) -> &FuncManager {
        &self.func_manager
    }

    pub fn pattern_cache(&self) -> &MemoryPatternCache {
        &self.pattern_cache
    }

    pub fn get_memory_pattern_group(&self, signature: &ShapeSignature) -> Option<Arc<MemoryPatternGroup>> {
        self.pattern_cache.get(signature)
    }

    /// Store the pattern traced for `signature`, replacing any earlier one
    pub fn update_memory_pattern_group(&self, signature: ShapeSignature, group: MemoryPatternGroup) -> Result<()> {
        self.pattern_cache.insert(signature, group)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("graph", &self.graph.name)
            .field("providers", &self.providers.len())
            .field("values", &self.value_map.len())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}
