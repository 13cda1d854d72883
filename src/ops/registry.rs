use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, OnceLock, RwLock};

use crate::error::{Error, Result};
use crate::execution::context::OpKernelContext;
use crate::memory::allocator::MemType;
use crate::model::Node;
use crate::partition::func_manager::FuncManager;
use crate::providers::CPU_EXECUTION_PROVIDER;

/// Trait for implementing ONNX operators
pub trait OpKernel: Send + Sync + Debug {
    /// Compute the node's outputs from its inputs
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()>;
}

/// Describes which nodes a kernel implements and how it wants its arguments placed
#[derive(Debug, Clone, PartialEq)]
pub struct KernelDef {
    pub op_type: String,
    pub domain: String,
    pub since_version: i64,
    pub end_version: i64,
    pub provider: String,
    pub input_memory_types: HashMap<usize, MemType>,
    pub output_memory_types: HashMap<usize, MemType>,
    /// (input, output) pairs where the output may overwrite the input's buffer
    pub may_inplace: Vec<(usize, usize)>,
}

impl KernelDef {
    pub fn input_memory_type(&self, index: usize) -> MemType {
        self.input_memory_types.get(&index).copied().unwrap_or(MemType::Default)
    }

    pub fn output_memory_type(&self, index: usize) -> MemType {
        self.output_memory_types.get(&index).copied().unwrap_or(MemType::Default)
    }

    pub fn is_input_on_cpu(&self, index: usize) -> bool {
        self.input_memory_type(index) == MemType::CpuInput
    }

    pub fn is_output_on_cpu(&self, index: usize) -> bool {
        self.output_memory_type(index) == MemType::CpuOutput
    }

    pub fn version_matches(&self, version: i64) -> bool {
        self.since_version <= version && version <= self.end_version
    }

    /// Two defs conflict when they would both claim the same node for the same provider
    pub fn conflicts_with(&self, other: &KernelDef) -> bool {
        self.op_type == other.op_type
            && self.domain == other.domain
            && self.provider == other.provider
            && self.since_version <= other.end_version
            && other.since_version <= self.end_version
    }
}

pub struct KernelDefBuilder {
    def: KernelDef,
}

impl KernelDefBuilder {
    pub fn new(op_type: &str) -> Self {
        Self {
            def: KernelDef {
                op_type: op_type.to_string(),
                domain: String::new(),
                since_version: 1,
                end_version: i64::MAX,
                provider: CPU_EXECUTION_PROVIDER.to_string(),
                input_memory_types: HashMap::new(),
                output_memory_types: HashMap::new(),
                may_inplace: Vec::new(),
            },
        }
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.def.domain = domain.to_string();
        self
    }

    pub fn since_version(mut self, version: i64) -> Self {
        self.def.since_version = version;
        self
    }

    pub fn version_range(mut self, since: i64, end: i64) -> Self {
        self.def.since_version = since;
        self.def.end_version = end;
        self
    }

    pub fn provider(mut self, provider: &str) -> Self {
        self.def.provider = provider.to_string();
        self
    }

    pub fn input_memory_type(mut self, index: usize, mem_type: MemType) -> Self {
        self.def.input_memory_types.insert(index, mem_type);
        self
    }

    pub fn output_memory_type(mut self, index: usize, mem_type: MemType) -> Self {
        self.def.output_memory_types.insert(index, mem_type);
        self
    }

    pub fn may_inplace(mut self, input: usize, output: usize) -> Self {
        self.def.may_inplace.push((input, output));
        self
    }

    pub fn build(self) -> KernelDef {
        self.def
    }
}

/// What a kernel factory gets to look at
pub struct KernelCreateContext<'a> {
    pub node: &'a Node,
    pub def: &'a KernelDef,
    pub func_manager: &'a FuncManager,
}

pub type KernelCreateFn = Arc<dyn Fn(&KernelCreateContext<'_>) -> Result<Box<dyn OpKernel>> + Send + Sync>;

#[derive(Clone)]
pub struct KernelCreateInfo {
    pub def: KernelDef,
    pub create: KernelCreateFn,
}

impl Debug for KernelCreateInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelCreateInfo").field("def", &self.def).finish()
    }
}

/// Resolves the kernel a provider would use for a node
pub trait KernelLookup {
    fn lookup(&self, node: &Node) -> Option<&KernelCreateInfo>;
}

/// Registry for kernels, keyed by (domain, op type)
#[derive(Debug, Default)]
pub struct KernelRegistry {
    kernels: HashMap<(String, String), Vec<KernelCreateInfo>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kernel
    pub fn register(&mut self, def: KernelDef, create: KernelCreateFn) -> Result<()> {
        let key = (def.domain.clone(), def.op_type.clone());
        let entries = self.kernels.entry(key).or_default();
        if let Some(existing) = entries.iter().find(|e| e.def.conflicts_with(&def)) {
            return Err(Error::Fail(format!(
                "Failed to add kernel for {}.{} (version {}-{}) on {}: conflicting with an existing kernel for version {}-{}",
                def.domain,
                def.op_type,
                def.since_version,
                def.end_version,
                def.provider,
                existing.def.since_version,
                existing.def.end_version
            )));
        }
        entries.push(KernelCreateInfo { def, create });
        Ok(())
    }

    /// Register a kernel whose type has a `Default` constructor
    pub fn register_default<K>(&mut self, def: KernelDef) -> Result<()>
    where
        K: OpKernel + Default + 'static,
    {
        let create: KernelCreateFn =
            Arc::new(|_ctx: &KernelCreateContext<'_>| -> Result<Box<dyn OpKernel>> { Ok(Box::new(K::default())) });
        self.register(def, create)
    }

    /// The kernel `provider` offers for `node`
    pub fn lookup(&self, node: &Node, provider: &str) -> Option<&KernelCreateInfo> {
        let key = (node.domain.clone(), node.op_type.clone());
        self.kernels
            .get(&key)?
            .iter()
            .find(|e| e.def.provider == provider && e.def.version_matches(node.since_version))
    }

    /// True when an identical def is already registered
    pub fn contains(&self, def: &KernelDef) -> bool {
        let key = (def.domain.clone(), def.op_type.clone());
        self.kernels
            .get(&key)
            .map_or(false, |entries| entries.iter().any(|e| &e.def == def))
    }

    pub fn len(&self) -> usize {
        self.kernels.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered set of registries consulted when creating kernels.
///
/// Session-local registries (fused kernels, custom ops) come before provider registries.
#[derive(Debug, Default)]
pub struct KernelRegistryManager {
    custom_registries: Vec<Arc<KernelRegistry>>,
    provider_registries: Vec<Arc<KernelRegistry>>,
}

impl KernelRegistryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session-local registry ahead of everything registered so far
    pub fn register_kernel_registry(&mut self, registry: Arc<KernelRegistry>) {
        self.custom_registries.insert(0, registry);
    }

    pub fn register_provider_registry(&mut self, registry: Arc<KernelRegistry>) {
        if !self.provider_registries.iter().any(|r| Arc::ptr_eq(r, &registry)) {
            self.provider_registries.push(registry);
        }
    }

    fn registries(&self) -> impl Iterator<Item = &Arc<KernelRegistry>> {
        self.custom_registries.iter().chain(self.provider_registries.iter())
    }

    /// Kernel for `node` on the provider it is assigned to
    pub fn search_kernel(&self, node: &Node) -> Result<&KernelCreateInfo> {
        self.find(node, &node.execution_provider).ok_or_else(|| {
            Error::KernelNotFound(format!(
                "Could not find an implementation for {}({}) node with name '{}' on provider '{}'",
                node.op_type, node.since_version, node.name, node.execution_provider
            ))
        })
    }

    pub fn has_implementation_of(&self, node: &Node, provider: &str) -> bool {
        self.find(node, provider).is_some()
    }

    fn find(&self, node: &Node, provider: &str) -> Option<&KernelCreateInfo> {
        self.registries().find_map(|r| r.lookup(node, provider))
    }

    /// Lookup bound to one provider, as handed to `get_capability`
    pub fn lookup_for<'a>(&'a self, provider: &str) -> ProviderKernelLookup<'a> {
        ProviderKernelLookup {
            manager: self,
            provider: provider.to_string(),
        }
    }
}

pub struct ProviderKernelLookup<'a> {
    manager: &'a KernelRegistryManager,
    provider: String,
}

impl KernelLookup for ProviderKernelLookup<'_> {
    fn lookup(&self, node: &Node) -> Option<&KernelCreateInfo> {
        self.manager.find(node, &self.provider)
    }
}

fn cpu_registry_slot() -> &'static RwLock<Option<Arc<KernelRegistry>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<KernelRegistry>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// The process-wide CPU kernel registry, built on first use.
///
/// Two threads racing on first use may both build it; the last one stored wins.
pub fn cpu_kernel_registry() -> Result<Arc<KernelRegistry>> {
    let slot = cpu_registry_slot();
    if let Some(registry) = slot
        .read()
        .map_err(|_| Error::Fail("CPU kernel registry lock poisoned".to_string()))?
        .as_ref()
    {
        return Ok(Arc::clone(registry));
    }

    let mut registry = KernelRegistry::new();
    crate::ops::register_cpu_kernels(&mut registry)?;
    let registry = Arc::new(registry);
    let mut guard = slot
        .write()
        .map_err(|_| Error::Fail("CPU kernel registry lock poisoned".to_string()))?;
    *guard = Some(Arc::clone(&registry));
    Ok(registry)
}

/// Drop the process-wide CPU registry; the next call to `cpu_kernel_registry` rebuilds it
pub fn reset_cpu_kernel_registry() {
    if let Ok(mut guard) = cpu_registry_slot().write() {
        *guard = None;
    }
}
