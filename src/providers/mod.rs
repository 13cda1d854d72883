pub mod cpu;

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::memory::allocator::{AllocatorPtr, DeviceType, MemType};
use crate::model::{Graph, Node};
use crate::ops::registry::{KernelLookup, KernelRegistry};
use crate::partition::capability::ComputeCapability;
use crate::partition::func_manager::NodeComputeInfo;

pub use cpu::CpuExecutionProvider;

pub const CPU_EXECUTION_PROVIDER: &str = "CPUExecutionProvider";

/// A backend that can run graph nodes
pub trait ExecutionProvider: Send + Sync + Debug {
    fn provider_type(&self) -> &str;

    fn device(&self) -> DeviceType {
        DeviceType::Cpu
    }

    /// Nodes or fusible sub-graphs this provider can take.
    ///
    /// By default every node that is unassigned (or already ours) and has a kernel is
    /// claimed on its own.
    fn get_capability(&self, graph: &Graph, kernel_lookup: &dyn KernelLookup) -> Vec<ComputeCapability> {
        graph
            .nodes()
            .filter(|n| !n.is_assigned() || n.execution_provider == self.provider_type())
            .filter(|n| kernel_lookup.lookup(n).is_some())
            .map(|n| ComputeCapability::single(n.index))
            .collect()
    }

    /// Build in-process compute functions for fused nodes, one per node in order
    fn compile(&self, fused_nodes: &[&Node]) -> Result<Vec<NodeComputeInfo>> {
        Err(Error::NotImplemented(format!(
            "{} cannot compile {} fused nodes",
            self.provider_type(),
            fused_nodes.len()
        )))
    }

    /// Compile fused nodes into a shared library and return its path
    fn compile_to_dll(&self, fused_nodes: &[&Node]) -> Result<PathBuf> {
        Err(Error::NotImplemented(format!(
            "{} cannot export {} fused nodes to a shared library",
            self.provider_type(),
            fused_nodes.len()
        )))
    }

    fn kernel_registry(&self) -> Result<Option<Arc<KernelRegistry>>> {
        Ok(None)
    }

    /// Allocator serving values of the given memory type
    fn allocator(&self, mem_type: MemType) -> AllocatorPtr;
}

/// Providers in priority order
#[derive(Debug, Default, Clone)]
pub struct ExecutionProviders {
    providers: Vec<Arc<dyn ExecutionProvider>>,
}

impl ExecutionProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, provider: Arc<dyn ExecutionProvider>) -> Result<()> {
        if self.get(provider.provider_type()).is_some() {
            return Err(Error::InvalidArgument(format!(
                "Provider {} has already been registered",
                provider.provider_type()
            )));
        }
        self.providers.push(provider);
        Ok(())
    }

    pub fn get(&self, provider_type: &str) -> Option<&Arc<dyn ExecutionProvider>> {
        self.providers.iter().find(|p| p.provider_type() == provider_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ExecutionProvider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
