use std::sync::Arc;

use crate::error::Result;
use crate::memory::allocator::{create_default_allocator, AllocatorPtr, MemType};
use crate::ops::registry::{cpu_kernel_registry, KernelRegistry};
use crate::providers::{ExecutionProvider, CPU_EXECUTION_PROVIDER};

/// Host execution provider backed by the process-wide CPU kernel registry
#[derive(Debug)]
pub struct CpuExecutionProvider {
    allocator: AllocatorPtr,
}

impl CpuExecutionProvider {
    pub fn new(memory_limit: Option<usize>) -> Self {
        Self {
            allocator: create_default_allocator(memory_limit),
        }
    }

    pub fn with_allocator(allocator: AllocatorPtr) -> Self {
        Self { allocator }
    }
}

impl Default for CpuExecutionProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn provider_type(&self) -> &str {
        CPU_EXECUTION_PROVIDER
    }

    fn kernel_registry(&self) -> Result<Option<Arc<KernelRegistry>>> {
        cpu_kernel_registry().map(Some)
    }

    fn allocator(&self, _mem_type: MemType) -> AllocatorPtr {
        Arc::clone(&self.allocator)
    }
}
