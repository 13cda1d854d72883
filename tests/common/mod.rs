#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use onnx_exec::error::Result;
use onnx_exec::execution::context::OpKernelContext;
use onnx_exec::execution::value::Value;
use onnx_exec::memory::allocator::{
    create_default_allocator, Allocator, AllocatorPtr, Arena, Buffer, CpuAllocator, DeviceType, MemType,
    MemoryLocation,
};
use onnx_exec::memory::fence::Fence;
use onnx_exec::model::{Dimension, Graph, Node, NodeArg, NodeIndex, TypeInfo};
use onnx_exec::ops::activations::{Relu, Sigmoid, Tanh};
use onnx_exec::ops::math::elementwise::{Add, Mul};
use onnx_exec::ops::registry::{KernelDefBuilder, KernelLookup, KernelRegistry};
use onnx_exec::ops::tensor::{DataType, Tensor};
use onnx_exec::partition::capability::{ComputeCapability, MetaDef};
use onnx_exec::partition::func_manager::{FunctionState, NodeComputeInfo};
use onnx_exec::providers::{CpuExecutionProvider, ExecutionProvider, ExecutionProviders};

pub const FAKE_GPU: &str = "FakeGpuExecutionProvider";

pub fn gpu_location() -> MemoryLocation {
    MemoryLocation::new(DeviceType::Gpu, 0, MemType::Default)
}

/// Device memory that lives on the host but hands out a fence per tensor
#[derive(Debug, Default)]
pub struct FakeGpuAllocator {
    pub fences_created: AtomicUsize,
}

impl Allocator for FakeGpuAllocator {
    fn location(&self) -> MemoryLocation {
        gpu_location()
    }

    fn alloc(&self, size: usize) -> Result<Buffer> {
        Ok(Buffer::new(Arena::new(gpu_location(), size)))
    }

    fn create_fence(&self) -> Option<Fence> {
        self.fences_created.fetch_add(1, Ordering::SeqCst);
        Some(Fence::new())
    }

    fn allocated_bytes(&self) -> usize {
        0
    }
}

/// A device provider with its own kernels; ops in `host_output_ops` write output 0 to host memory
#[derive(Debug)]
pub struct FakeGpu {
    pub device_allocator: Arc<FakeGpuAllocator>,
    host_allocator: AllocatorPtr,
    registry: Arc<KernelRegistry>,
}

impl FakeGpu {
    pub fn new(host_output_ops: &[&str]) -> Arc<Self> {
        let def = |op: &str| {
            let builder = KernelDefBuilder::new(op).provider(FAKE_GPU).may_inplace(0, 0);
            if host_output_ops.contains(&op) {
                builder.output_memory_type(0, MemType::CpuOutput).build()
            } else {
                builder.build()
            }
        };
        let mut registry = KernelRegistry::new();
        registry.register_default::<Relu>(def("Relu")).unwrap();
        registry.register_default::<Sigmoid>(def("Sigmoid")).unwrap();
        registry.register_default::<Tanh>(def("Tanh")).unwrap();
        registry.register_default::<Add>(def("Add")).unwrap();
        registry.register_default::<Mul>(def("Mul")).unwrap();
        Arc::new(Self {
            device_allocator: Arc::new(FakeGpuAllocator::default()),
            host_allocator: create_default_allocator(None),
            registry: Arc::new(registry),
        })
    }
}

impl ExecutionProvider for FakeGpu {
    fn provider_type(&self) -> &str {
        FAKE_GPU
    }

    fn device(&self) -> DeviceType {
        DeviceType::Gpu
    }

    fn kernel_registry(&self) -> Result<Option<Arc<KernelRegistry>>> {
        Ok(Some(Arc::clone(&self.registry)))
    }

    fn allocator(&self, mem_type: MemType) -> AllocatorPtr {
        match mem_type {
            MemType::Default => self.device_allocator.clone() as AllocatorPtr,
            MemType::CpuInput | MemType::CpuOutput => Arc::clone(&self.host_allocator),
        }
    }
}

/// Claims every unassigned node whose op type is listed, without consulting kernels
#[derive(Debug)]
pub struct ClaimOps {
    name: &'static str,
    ops: Vec<&'static str>,
    allocator: AllocatorPtr,
}

impl ClaimOps {
    pub fn new(name: &'static str, ops: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            name,
            ops: ops.to_vec(),
            allocator: create_default_allocator(None),
        })
    }
}

impl ExecutionProvider for ClaimOps {
    fn provider_type(&self) -> &str {
        self.name
    }

    fn get_capability(&self, graph: &Graph, _kernel_lookup: &dyn KernelLookup) -> Vec<ComputeCapability> {
        graph
            .nodes()
            .filter(|n| !n.is_assigned() && self.ops.contains(&n.op_type.as_str()))
            .map(|n| ComputeCapability::single(n.index))
            .collect()
    }

    fn allocator(&self, _mem_type: MemType) -> AllocatorPtr {
        Arc::clone(&self.allocator)
    }
}

#[derive(Debug, Clone)]
pub enum CompileBehavior {
    /// One compute function per fused node: doubled ReLU of input 0
    Compute,
    /// Returns no functions at all
    WrongCount,
    /// Claims to have written a shared library at the path
    Dll(PathBuf),
}

/// Fuses a fixed set of nodes into one `FusedChain` node and compiles it
#[derive(Debug)]
pub struct Fuser {
    members: Vec<NodeIndex>,
    behavior: CompileBehavior,
    pub compiled: AtomicUsize,
    allocator: AllocatorPtr,
}

pub const FUSER: &str = "Fuser";

impl Fuser {
    pub fn new(members: &[NodeIndex], behavior: CompileBehavior) -> Arc<Self> {
        Arc::new(Self {
            members: members.to_vec(),
            behavior,
            compiled: AtomicUsize::new(0),
            allocator: create_default_allocator(None),
        })
    }
}

fn doubled_relu_info() -> NodeComputeInfo {
    NodeComputeInfo {
        create_state: Arc::new(|_node: &Node| -> Result<FunctionState> { Ok(Box::new(2.0f32)) }),
        compute: Arc::new(|state: &mut FunctionState, ctx: &mut OpKernelContext<'_, '_>| -> Result<()> {
            let scale = state.downcast_ref::<f32>().copied().unwrap_or(1.0);
            let x = ctx.required_input(0)?;
            let values: Vec<f32> = x.to_f32_vec()?.into_iter().map(|v| v.max(0.0) * scale).collect();
            if let Some(y) = ctx.output(0, x.shape().clone())? {
                y.write_f32(&values)?;
            }
            Ok(())
        }),
        release_state: Arc::new(|_state: FunctionState| {}),
    }
}

impl ExecutionProvider for Fuser {
    fn provider_type(&self) -> &str {
        FUSER
    }

    fn get_capability(&self, graph: &Graph, _kernel_lookup: &dyn KernelLookup) -> Vec<ComputeCapability> {
        if self.members.iter().any(|&i| graph.node(i).is_none()) {
            return Vec::new();
        }
        let meta = MetaDef {
            name: "FusedChain".to_string(),
            domain: "test.fused".to_string(),
            since_version: 1,
            inputs: vec!["x".to_string()],
            outputs: vec!["y".to_string()],
            ..Default::default()
        };
        vec![ComputeCapability::fused(self.members.clone(), meta)]
    }

    fn compile(&self, fused_nodes: &[&Node]) -> Result<Vec<NodeComputeInfo>> {
        self.compiled.fetch_add(fused_nodes.len(), Ordering::SeqCst);
        match self.behavior {
            CompileBehavior::WrongCount => Ok(Vec::new()),
            _ => Ok(fused_nodes.iter().map(|_| doubled_relu_info()).collect()),
        }
    }

    fn compile_to_dll(&self, fused_nodes: &[&Node]) -> Result<PathBuf> {
        self.compiled.fetch_add(fused_nodes.len(), Ordering::SeqCst);
        match &self.behavior {
            CompileBehavior::Dll(path) => Ok(path.clone()),
            _ => Ok(PathBuf::from("fused.so")),
        }
    }

    fn allocator(&self, _mem_type: MemType) -> AllocatorPtr {
        Arc::clone(&self.allocator)
    }
}

pub fn providers(list: Vec<Arc<dyn ExecutionProvider>>) -> ExecutionProviders {
    let mut providers = ExecutionProviders::new();
    for provider in list {
        providers.add(provider).unwrap();
    }
    providers
}

pub fn ep<P: ExecutionProvider + 'static>(provider: Arc<P>) -> Arc<dyn ExecutionProvider> {
    provider
}

pub fn cpu() -> Arc<dyn ExecutionProvider> {
    Arc::new(CpuExecutionProvider::default())
}

/// `x -> op0 -> t0 -> op1 -> ... -> y`, all `[1, 4]` floats
pub fn chain(ops: &[&str]) -> Graph {
    let mut graph = Graph::new("chain");
    graph.add_input(NodeArg::float("x", &[1, 4]));
    let mut prev = "x".to_string();
    for (i, op) in ops.iter().enumerate() {
        let out = if i + 1 == ops.len() { "y".to_string() } else { format!("t{}", i) };
        graph.add_node(Node::new(&format!("n{}", i), op, vec![NodeArg::named(&prev)], vec![NodeArg::float(&out, &[1, 4])]));
        prev = out;
    }
    graph.add_output(NodeArg::named("y"));
    graph
}

/// A float `[N, 4]` argument with a symbolic batch dimension
pub fn batched(name: &str) -> NodeArg {
    NodeArg::new(
        name,
        Some(TypeInfo::Tensor {
            elem_type: DataType::Float,
            shape: Some(vec![Dimension::Param("N".to_string()), Dimension::Value(4)]),
        }),
    )
}

/// `y = tanh(relu(x) + sigmoid(x))` with a symbolic batch size
pub fn diamond() -> Graph {
    let mut graph = Graph::new("diamond");
    graph.add_input(batched("x"));
    graph.add_node(Node::new("relu", "Relu", vec![NodeArg::named("x")], vec![batched("a")]));
    graph.add_node(Node::new("sigmoid", "Sigmoid", vec![NodeArg::named("x")], vec![batched("b")]));
    graph.add_node(Node::new("add", "Add", vec![NodeArg::named("a"), NodeArg::named("b")], vec![batched("c")]));
    graph.add_node(Node::new("tanh", "Tanh", vec![NodeArg::named("c")], vec![batched("y")]));
    graph.add_output(NodeArg::named("y"));
    graph
}

pub fn diamond_expected(x: &[f32]) -> Vec<f32> {
    x.iter()
        .map(|&v| (v.max(0.0) + 1.0 / (1.0 + (-v).exp())).tanh())
        .collect()
}

pub fn float_value(dims: &[i64], data: &[f32]) -> Value {
    let tensor = Tensor::from_f32(dims.to_vec(), data, &CpuAllocator::new(None)).unwrap();
    Value::from_tensor(tensor)
}

pub fn feeds(name: &str, dims: &[i64], data: &[f32]) -> HashMap<String, Value> {
    HashMap::from([(name.to_string(), float_value(dims, data))])
}

pub fn f32s(value: &Value) -> Vec<f32> {
    value.tensor().unwrap().to_f32_vec().unwrap()
}

pub fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (a, e) in actual.iter().zip(expected) {
        assert!((a - e).abs() < 1e-5, "{:?} != {:?}", actual, expected);
    }
}
