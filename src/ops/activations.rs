use crate::error::Result;
use crate::execution::context::OpKernelContext;
use crate::ops::registry::{KernelDefBuilder, KernelRegistry, OpKernel};

/// Apply `f` elementwise from input 0 to output 0
fn unary_compute(ctx: &mut OpKernelContext<'_, '_>, f: impl Fn(f32) -> f32) -> Result<()> {
    let x = ctx.required_input(0)?;
    let values = x.to_f32_vec()?;
    if let Some(y) = ctx.output(0, x.shape().clone())? {
        let out: Vec<f32> = values.into_iter().map(f).collect();
        y.write_f32(&out)?;
    }
    Ok(())
}

/// ReLU activation operator
#[derive(Debug, Clone, Default)]
pub struct Relu;

impl OpKernel for Relu {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        unary_compute(ctx, |v| v.max(0.0))
    }
}

/// LeakyReLU activation operator
#[derive(Debug, Clone, Default)]
pub struct LeakyRelu;

impl OpKernel for LeakyRelu {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        let alpha = ctx.attribute_f32("alpha", 0.01);
        unary_compute(ctx, move |v| if v >= 0.0 { v } else { alpha * v })
    }
}

/// Sigmoid activation operator
#[derive(Debug, Clone, Default)]
pub struct Sigmoid;

impl OpKernel for Sigmoid {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        unary_compute(ctx, |v| 1.0 / (1.0 + (-v).exp()))
    }
}

/// Tanh activation operator
#[derive(Debug, Clone, Default)]
pub struct Tanh;

impl OpKernel for Tanh {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        unary_compute(ctx, f32::tanh)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Identity;

impl OpKernel for Identity {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        let x = ctx.required_input(0)?;
        if let Some(y) = ctx.output(0, x.shape().clone())? {
            if !y.shares_buffer_with(&x) {
                y.write_bytes(&x.bytes()?)?;
            }
        }
        Ok(())
    }
}

/// Register the activation kernels. All of them may write their output over their input.
pub fn register(registry: &mut KernelRegistry) -> Result<()> {
    registry.register_default::<Relu>(KernelDefBuilder::new("Relu").may_inplace(0, 0).build())?;
    registry.register_default::<LeakyRelu>(KernelDefBuilder::new("LeakyRelu").may_inplace(0, 0).build())?;
    registry.register_default::<Sigmoid>(KernelDefBuilder::new("Sigmoid").may_inplace(0, 0).build())?;
    registry.register_default::<Tanh>(KernelDefBuilder::new("Tanh").may_inplace(0, 0).build())?;
    registry.register_default::<Identity>(KernelDefBuilder::new("Identity").may_inplace(0, 0).build())?;
    Ok(())
}
