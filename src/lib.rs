pub mod error;
pub mod model;
pub mod ops;
pub mod memory;
pub mod execution;
pub mod providers;
pub mod partition;

// Re-export commonly used types
pub use error::{Error, Result};
pub use model::{Attribute, Function, Graph, Initializer, Node, NodeArg, NodeIndex, TypeInfo};
pub use ops::registry::{KernelDef, KernelDefBuilder, KernelRegistry, KernelRegistryManager, OpKernel};
pub use ops::tensor::{DataType, Tensor, TensorShape};
pub use memory::{MemoryLocation, MemoryPatternGroup};
pub use execution::engine::{ExecutionEngine, SequentialExecutor};
pub use execution::context::{OpKernelContext, SessionOptions};
pub use execution::frame::ExecutionFrame;
pub use execution::session::SessionState;
pub use execution::value::Value;
pub use providers::{CpuExecutionProvider, ExecutionProvider, ExecutionProviders};
pub use partition::{GraphPartitioner, PartitionMode};
