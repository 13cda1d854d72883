pub mod context;
pub mod engine;
pub mod frame;
pub mod node_index_info;
pub mod plan;
pub mod session;
pub mod value;
pub mod value_map;

pub use context::{OpKernelContext, SessionOptions};
pub use engine::{ExecutionEngine, SequentialExecutor};
pub use frame::{CustomAllocator, ExecutionFrame, ValueAllocationParameters};
pub use plan::{AllocKind, AllocPlanPerValue, SequentialExecutionPlan, ValueType};
pub use session::SessionState;
pub use value::{Value, ValueIndex};
