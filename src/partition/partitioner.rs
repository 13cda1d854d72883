use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::enforce;
use crate::error::{Error, Result};
use crate::memory::allocator::DeviceType;
use crate::model::{Function, Graph, NodeIndex};
use crate::ops::registry::{
    KernelCreateContext, KernelCreateFn, KernelDefBuilder, KernelRegistry, KernelRegistryManager, OpKernel,
};
use crate::partition::capability::{ComputeCapability, IndexedSubGraph};
use crate::partition::cpu_fallback::cpu_preferred_nodes;
use crate::partition::func_manager::{FuncInfo, FuncManager, FunctionKernel};
use crate::providers::{ExecutionProvider, ExecutionProviders, CPU_EXECUTION_PROVIDER};

/// What the partitioner does with multi-node capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString)]
pub enum PartitionMode {
    /// Fuse claimed sub-graphs into single nodes and compile them
    #[default]
    Normal,
    /// Only tag the member nodes with the claiming provider
    AssignOnly,
}

#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub export_dll: bool,
    pub enable_cpu_fallback: bool,
    pub small_initializer_threshold: usize,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            export_dll: false,
            enable_cpu_fallback: true,
            small_initializer_threshold: 100,
        }
    }
}

/// Assigns graph nodes to execution providers in priority order
pub struct GraphPartitioner<'a> {
    providers: &'a ExecutionProviders,
    options: PartitionOptions,
}

/// Counts work left for inlining; strictly decreases every time a function node is expanded
fn function_weight(function: &Function) -> usize {
    1 + function
        .nodes
        .iter()
        .filter_map(|n| n.function_body.as_ref())
        .map(function_weight)
        .sum::<usize>()
}

fn inline_potential(graph: &Graph) -> usize {
    graph
        .nodes()
        .map(|node| {
            let own = match &node.function_body {
                Some(body) if !node.is_assigned() => function_weight(body),
                _ => 0,
            };
            own + node.subgraphs().into_iter().map(inline_potential).sum::<usize>()
        })
        .sum()
}

/// Expand unclaimed function nodes, innermost graphs first; returns how many were expanded
fn inline_nodes(graph: &mut Graph) -> Result<usize> {
    let mut inlined = 0;
    for index in graph.node_indices() {
        if let Some(node) = graph.node_mut(index) {
            for subgraph in node.subgraphs_mut() {
                inlined += inline_nodes(subgraph)?;
            }
        }
        let pending = graph
            .node(index)
            .filter(|n| !n.is_assigned() && n.function_body.is_some())
            .map(|n| (n.name.clone(), n.op_type.clone()));
        if let Some((name, op_type)) = pending {
            warn!(
                "No provider claimed function node '{}' ({}); inlining its body",
                name, op_type
            );
            graph.inline_function(index)?;
            inlined += 1;
        }
    }
    Ok(inlined)
}

impl<'a> GraphPartitioner<'a> {
    pub fn new(providers: &'a ExecutionProviders, options: PartitionOptions) -> Self {
        Self { providers, options }
    }

    /// Assign every node the providers can take, fusing and compiling sub-graphs as requested.
    ///
    /// Function nodes nobody claims are inlined and the providers get another pass, until a
    /// pass inlines nothing.
    pub fn partition(
        &self,
        graph: &mut Graph,
        func_mgr: &mut FuncManager,
        registry_mgr: &mut KernelRegistryManager,
        mode: PartitionMode,
    ) -> Result<()> {
        if self.providers.is_empty() {
            return Err(Error::InvalidArgument("No provider specified.".to_string()));
        }
        info!(
            "Partitioning graph '{}' ({} nodes) across {} providers",
            graph.name,
            graph.num_nodes(),
            self.providers.len()
        );

        let mut fused_registry = KernelRegistry::new();
        let mut fused_count = 0usize;
        let mut potential = inline_potential(graph);
        loop {
            for provider in self.providers.iter() {
                self.partition_impl(
                    graph,
                    provider.as_ref(),
                    func_mgr,
                    registry_mgr,
                    &mut fused_registry,
                    &mut fused_count,
                    mode,
                )?;
            }
            graph.resolve()?;

            if inline_nodes(graph)? == 0 {
                break;
            }
            graph.resolve()?;
            let next = inline_potential(graph);
            if next >= potential {
                return Err(Error::Fail(format!(
                    "Inlining function nodes in graph '{}' made no progress",
                    graph.name
                )));
            }
            potential = next;
        }

        if !fused_registry.is_empty() {
            registry_mgr.register_kernel_registry(Arc::new(fused_registry));
        }
        info!(
            "Partitioned graph '{}': {} nodes, {} fused",
            graph.name,
            graph.num_nodes(),
            fused_count
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn partition_impl(
        &self,
        graph: &mut Graph,
        provider: &dyn ExecutionProvider,
        func_mgr: &mut FuncManager,
        registry_mgr: &KernelRegistryManager,
        fused_registry: &mut KernelRegistry,
        fused_count: &mut usize,
        mode: PartitionMode,
    ) -> Result<()> {
        if graph.num_nodes() == 0 {
            return Ok(());
        }

        for index in graph.node_indices() {
            if let Some(node) = graph.node_mut(index) {
                for subgraph in node.subgraphs_mut() {
                    self.partition_impl(
                        subgraph,
                        provider,
                        func_mgr,
                        registry_mgr,
                        fused_registry,
                        fused_count,
                        mode,
                    )?;
                }
            }
        }

        let provider_type = provider.provider_type().to_string();
        let capabilities = {
            let lookup = registry_mgr.lookup_for(&provider_type);
            let mut capabilities = provider.get_capability(graph, &lookup);
            if self.options.enable_cpu_fallback && provider.device() != DeviceType::Cpu {
                capabilities = self.apply_cpu_fallback(graph, &provider_type, registry_mgr, capabilities)?;
            }
            capabilities
        };

        let mut to_compile = Vec::new();
        for capability in capabilities {
            if let Some(index) = self.place_node(
                graph,
                capability.sub_graph,
                &provider_type,
                registry_mgr,
                fused_count,
                mode,
            )? {
                to_compile.push(index);
            }
        }

        if !to_compile.is_empty() {
            self.compile(graph, provider, &to_compile, func_mgr, fused_registry)?;
        }
        Ok(())
    }

    fn apply_cpu_fallback(
        &self,
        graph: &Graph,
        provider_type: &str,
        registry_mgr: &KernelRegistryManager,
        capabilities: Vec<ComputeCapability>,
    ) -> Result<Vec<ComputeCapability>> {
        let candidates: Vec<NodeIndex> = capabilities
            .iter()
            .filter(|c| c.sub_graph.meta_def.is_none())
            .flat_map(|c| c.sub_graph.nodes.iter().copied())
            .collect();
        let target_lookup = registry_mgr.lookup_for(provider_type);
        let cpu_lookup = registry_mgr.lookup_for(CPU_EXECUTION_PROVIDER);
        let cpu_nodes = cpu_preferred_nodes(
            graph,
            provider_type,
            &target_lookup,
            &cpu_lookup,
            &candidates,
            self.options.small_initializer_threshold,
        )?;
        if cpu_nodes.is_empty() {
            return Ok(capabilities);
        }
        Ok(capabilities
            .into_iter()
            .filter(|c| {
                c.sub_graph.meta_def.is_some()
                    || !c.sub_graph.nodes.iter().any(|n| cpu_nodes.contains(n))
            })
            .collect())
    }

    /// Apply one capability. Returns the fused node when it still needs compiling.
    fn place_node(
        &self,
        graph: &mut Graph,
        sub_graph: IndexedSubGraph,
        provider_type: &str,
        registry_mgr: &KernelRegistryManager,
        fused_count: &mut usize,
        mode: PartitionMode,
    ) -> Result<Option<NodeIndex>> {
        if sub_graph.nodes.is_empty() {
            return Ok(None);
        }

        let meta = match &sub_graph.meta_def {
            None => {
                enforce!(
                    sub_graph.nodes.len() == 1,
                    "A capability without a MetaDef must hold exactly one node, got {}",
                    sub_graph.nodes.len()
                );
                if let Some(node) = graph.node_mut(sub_graph.nodes[0]) {
                    if !node.is_assigned() {
                        debug!("Assigning node '{}' ({}) to {}", node.name, node.op_type, provider_type);
                        node.execution_provider = provider_type.to_string();
                    }
                }
                return Ok(None);
            }
            Some(meta) => meta,
        };

        if mode == PartitionMode::AssignOnly {
            // tagging overrides earlier assignments; the last provider to claim a node keeps it
            for &index in &sub_graph.nodes {
                if let Some(node) = graph.node_mut(index) {
                    node.execution_provider = provider_type.to_string();
                }
            }
            return Ok(None);
        }

        let claimable = sub_graph.nodes.iter().all(|&index| {
            graph
                .node(index)
                .map_or(false, |n| !n.is_assigned() || n.execution_provider == provider_type)
        });
        if !claimable {
            debug!(
                "{} cannot take sub-graph '{}': some of its {} nodes are missing or claimed elsewhere",
                provider_type,
                meta.name,
                sub_graph.nodes.len()
            );
            return Ok(None);
        }

        let fused_name = format!("{}_{}_{}", provider_type, meta.name, *fused_count);
        *fused_count += 1;
        let fused = graph.fuse_sub_graph(&sub_graph, &fused_name)?;
        let node = match graph.node_mut(fused) {
            Some(node) => node,
            None => return Err(Error::Fail(format!("fused node '{}' vanished", fused_name))),
        };
        node.execution_provider = provider_type.to_string();
        info!(
            "Fused {} nodes into '{}' ({}) on {}",
            sub_graph.nodes.len(),
            fused_name,
            meta.name,
            provider_type
        );

        if registry_mgr.has_implementation_of(node, provider_type) {
            Ok(None)
        } else {
            Ok(Some(fused))
        }
    }

    fn compile(
        &self,
        graph: &Graph,
        provider: &dyn ExecutionProvider,
        fused: &[NodeIndex],
        func_mgr: &mut FuncManager,
        fused_registry: &mut KernelRegistry,
    ) -> Result<()> {
        let provider_type = provider.provider_type();
        let nodes: Vec<_> = fused.iter().filter_map(|&i| graph.node(i)).collect();

        if self.options.export_dll {
            let path = provider.compile_to_dll(&nodes)?;
            for node in &nodes {
                func_mgr.add_func_info(&node.name, FuncInfo::Dll(path.clone()))?;
            }
        } else {
            let infos = provider.compile(&nodes)?;
            if infos.len() != nodes.len() {
                return Err(Error::Fail(format!(
                    "{} did not return correct number of compiled functions",
                    provider_type
                )));
            }
            for (node, info) in nodes.iter().zip(infos) {
                func_mgr.add_func_info(&node.name, FuncInfo::Compute(info))?;
            }
        }

        for node in &nodes {
            let def = KernelDefBuilder::new(&node.op_type)
                .domain(&node.domain)
                .version_range(node.since_version, node.since_version)
                .provider(provider_type)
                .build();
            if fused_registry.contains(&def) {
                continue;
            }
            let create: KernelCreateFn =
                Arc::new(|ctx: &KernelCreateContext<'_>| -> Result<Box<dyn OpKernel>> { FunctionKernel::create(ctx) });
            fused_registry.register(def, create)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Node, NodeArg};
    use crate::providers::CpuExecutionProvider;

    #[test]
    fn test_no_providers() {
        let providers = ExecutionProviders::new();
        let partitioner = GraphPartitioner::new(&providers, PartitionOptions::default());
        let mut graph = Graph::new("g");
        let result = partitioner.partition(
            &mut graph,
            &mut FuncManager::new(),
            &mut KernelRegistryManager::new(),
            PartitionMode::Normal,
        );
        match result {
            Err(Error::InvalidArgument(msg)) => assert_eq!(msg, "No provider specified."),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_cpu_takes_supported_nodes() {
        let mut providers = ExecutionProviders::new();
        let cpu = Arc::new(CpuExecutionProvider::default());
        providers.add(cpu.clone()).unwrap();
        let mut registry_mgr = KernelRegistryManager::new();
        if let Some(registry) = cpu.kernel_registry().unwrap() {
            registry_mgr.register_provider_registry(registry);
        }

        let mut graph = Graph::new("g");
        graph.add_input(NodeArg::float("x", &[4]));
        graph.add_node(Node::new("relu", "Relu", vec![NodeArg::named("x")], vec![NodeArg::named("a")]));
        graph.add_node(Node::new("odd", "NoSuchOp", vec![NodeArg::named("a")], vec![NodeArg::named("y")]));
        graph.add_output(NodeArg::named("y"));

        GraphPartitioner::new(&providers, PartitionOptions::default())
            .partition(&mut graph, &mut FuncManager::new(), &mut registry_mgr, PartitionMode::Normal)
            .unwrap();
        assert_eq!(graph.node(0).unwrap().execution_provider, CPU_EXECUTION_PROVIDER);
        // left for kernel lookup to report
        assert!(!graph.node(1).unwrap().is_assigned());
    }
}
