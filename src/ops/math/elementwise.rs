use ndarray::{IxDyn, Zip};

use crate::error::{Error, Result};
use crate::execution::context::OpKernelContext;
use crate::ops::registry::{KernelDefBuilder, KernelRegistry, OpKernel};

/// Numpy-style broadcast of two shapes
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "Incompatible dimensions for broadcasting: {:?} and {:?}",
                    a, b
                )))
            }
        };
    }
    Ok(out)
}

fn binary_compute(ctx: &mut OpKernelContext<'_, '_>, f: impl Fn(f32, f32) -> f32) -> Result<()> {
    let a = ctx.required_input(0)?.to_ndarray_f32()?;
    let b = ctx.required_input(1)?.to_ndarray_f32()?;
    let shape = broadcast_shapes(a.shape(), b.shape())?;
    let av = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| Error::Fail(format!("cannot broadcast {:?} to {:?}", a.shape(), shape)))?;
    let bv = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| Error::Fail(format!("cannot broadcast {:?} to {:?}", b.shape(), shape)))?;
    let result = Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y));

    let dims: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    if let Some(out) = ctx.output(0, dims)? {
        let values: Vec<f32> = result.iter().copied().collect();
        out.write_f32(&values)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct Add;

impl OpKernel for Add {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        binary_compute(ctx, |x, y| x + y)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sub;

impl OpKernel for Sub {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        binary_compute(ctx, |x, y| x - y)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Mul;

impl OpKernel for Mul {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        binary_compute(ctx, |x, y| x * y)
    }
}

pub fn register(registry: &mut KernelRegistry) -> Result<()> {
    registry.register_default::<Add>(KernelDefBuilder::new("Add").may_inplace(0, 0).build())?;
    registry.register_default::<Sub>(KernelDefBuilder::new("Sub").may_inplace(0, 0).build())?;
    registry.register_default::<Mul>(KernelDefBuilder::new("Mul").may_inplace(0, 0).build())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[2, 3], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shapes(&[4, 1], &[1, 5]).unwrap(), vec![4, 5]);
        assert_eq!(broadcast_shapes(&[], &[2]).unwrap(), vec![2]);
        assert!(broadcast_shapes(&[2, 3], &[4]).is_err());
    }
}
