use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::execution::context::OpKernelContext;
use crate::model::Node;
use crate::ops::registry::{KernelCreateContext, OpKernel};

/// Opaque per-kernel state produced by a compiled function
pub type FunctionState = Box<dyn Any + Send + Sync>;

pub type CreateStateFn = Arc<dyn Fn(&Node) -> Result<FunctionState> + Send + Sync>;
pub type ComputeFn =
    Arc<dyn Fn(&mut FunctionState, &mut OpKernelContext<'_, '_>) -> Result<()> + Send + Sync>;
pub type ReleaseStateFn = Arc<dyn Fn(FunctionState) + Send + Sync>;

/// In-process functions a provider returns for one compiled node
#[derive(Clone)]
pub struct NodeComputeInfo {
    pub create_state: CreateStateFn,
    pub compute: ComputeFn,
    pub release_state: ReleaseStateFn,
}

impl fmt::Debug for NodeComputeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NodeComputeInfo")
    }
}

#[derive(Debug, Clone)]
pub enum FuncInfo {
    /// Compiled into a shared library at this path
    Dll(PathBuf),
    Compute(NodeComputeInfo),
}

/// Compiled functions keyed by fused node name
#[derive(Debug, Default)]
pub struct FuncManager {
    funcs: HashMap<String, FuncInfo>,
}

impl FuncManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_func_info(&mut self, name: &str, info: FuncInfo) -> Result<()> {
        if self.funcs.contains_key(name) {
            return Err(Error::Fail(format!("func info for node: {} already exist.", name)));
        }
        self.funcs.insert(name.to_string(), info);
        Ok(())
    }

    pub fn get_func_info(&self, name: &str) -> Result<&FuncInfo> {
        self.funcs
            .get(name)
            .ok_or_else(|| Error::Fail(format!("undefined function: {}", name)))
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}

/// Kernel for a fused node, running the functions its provider compiled
pub struct FunctionKernel {
    node_name: String,
    compute: ComputeFn,
    release_state: ReleaseStateFn,
    state: Mutex<Option<FunctionState>>,
}

impl FunctionKernel {
    pub fn create(ctx: &KernelCreateContext<'_>) -> Result<Box<dyn OpKernel>> {
        match ctx.func_manager.get_func_info(&ctx.node.name)? {
            FuncInfo::Dll(path) => Err(Error::NotImplemented(format!(
                "loading fused function '{}' from {} is not supported",
                ctx.node.name,
                path.display()
            ))),
            FuncInfo::Compute(info) => {
                let state = (info.create_state)(ctx.node)?;
                Ok(Box::new(Self {
                    node_name: ctx.node.name.clone(),
                    compute: Arc::clone(&info.compute),
                    release_state: Arc::clone(&info.release_state),
                    state: Mutex::new(Some(state)),
                }))
            }
        }
    }
}

impl OpKernel for FunctionKernel {
    fn compute(&self, ctx: &mut OpKernelContext<'_, '_>) -> Result<()> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| Error::Fail(format!("state of '{}' is poisoned", self.node_name)))?;
        let state = guard
            .as_mut()
            .ok_or_else(|| Error::Fail(format!("state of '{}' was released", self.node_name)))?;
        (self.compute)(state, ctx)
    }
}

impl Drop for FunctionKernel {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(state) = state {
            (self.release_state)(state);
        }
    }
}

impl fmt::Debug for FunctionKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionKernel").field("node", &self.node_name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::registry::KernelDefBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_duplicate_func_info() {
        let mut manager = FuncManager::new();
        manager.add_func_info("f", FuncInfo::Dll(PathBuf::from("/tmp/f.so"))).unwrap();
        assert!(matches!(
            manager.add_func_info("f", FuncInfo::Dll(PathBuf::from("/tmp/g.so"))),
            Err(Error::Fail(_))
        ));
        assert!(manager.get_func_info("missing").is_err());
    }

    #[test]
    fn test_state_released_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let info = NodeComputeInfo {
            create_state: Arc::new(|_node: &Node| -> Result<FunctionState> { Ok(Box::new(7u32)) }),
            compute: Arc::new(|_state: &mut FunctionState, _ctx: &mut OpKernelContext<'_, '_>| -> Result<()> { Ok(()) }),
            release_state: Arc::new(move |state: FunctionState| {
                assert_eq!(state.downcast_ref::<u32>(), Some(&7));
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        };
        let mut manager = FuncManager::new();
        manager.add_func_info("fused", FuncInfo::Compute(info)).unwrap();

        let node = Node::new("fused", "Fused", vec![], vec![]);
        let def = KernelDefBuilder::new("Fused").build();
        let ctx = KernelCreateContext {
            node: &node,
            def: &def,
            func_manager: &manager,
        };
        let kernel = FunctionKernel::create(&ctx).unwrap();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(kernel);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dll_functions_not_loadable() {
        let mut manager = FuncManager::new();
        manager.add_func_info("fused", FuncInfo::Dll(PathBuf::from("/tmp/fused.so"))).unwrap();
        let node = Node::new("fused", "Fused", vec![], vec![]);
        let def = KernelDefBuilder::new("Fused").build();
        let ctx = KernelCreateContext {
            node: &node,
            def: &def,
            func_manager: &manager,
        };
        assert!(matches!(FunctionKernel::create(&ctx), Err(Error::NotImplemented(_))));
    }
}
