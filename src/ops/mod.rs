pub mod activations;
pub mod registry;
pub mod tensor;

pub mod math {
    pub mod elementwise;
}

pub mod prelude {
    pub use super::registry::{KernelDef, KernelDefBuilder, KernelRegistry, OpKernel};
    pub use super::tensor::{DataType, Tensor, TensorShape};
}

pub use registry::{KernelDef, KernelDefBuilder, KernelRegistry, OpKernel};
pub use tensor::{DataType, Tensor, TensorShape};

use crate::error::Result;

/// Register every reference CPU kernel
pub fn register_cpu_kernels(registry: &mut KernelRegistry) -> Result<()> {
    activations::register(registry)?;
    math::elementwise::register(registry)?;
    Ok(())
}
