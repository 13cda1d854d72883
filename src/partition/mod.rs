pub mod capability;
pub mod cpu_fallback;
pub mod func_manager;
pub mod partitioner;

pub use capability::{ComputeCapability, IndexedSubGraph, MetaDef};
pub use func_manager::{FuncInfo, FuncManager, FunctionKernel, NodeComputeInfo};
pub use partitioner::{GraphPartitioner, PartitionMode, PartitionOptions};
