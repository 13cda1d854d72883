use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::memory::fence::Fence;
use crate::ops::tensor::Tensor;

/// Index of a value in the session's name map
pub type ValueIndex = usize;

#[derive(Clone)]
pub enum ValueData {
    Tensor(Arc<Tensor>),
    NonTensor {
        type_name: String,
        data: Arc<dyn Any + Send + Sync>,
    },
}

/// Runtime container for one graph value. Empty until allocated.
#[derive(Clone, Default)]
pub struct Value {
    data: Option<ValueData>,
    fence: Option<Fence>,
}

impl Value {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tensor(tensor: Tensor) -> Self {
        Self::from_tensor_arc(Arc::new(tensor))
    }

    pub fn from_tensor_arc(tensor: Arc<Tensor>) -> Self {
        Self {
            data: Some(ValueData::Tensor(tensor)),
            fence: None,
        }
    }

    pub fn from_non_tensor(type_name: &str, data: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            data: Some(ValueData::NonTensor {
                type_name: type_name.to_string(),
                data,
            }),
            fence: None,
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self.data, Some(ValueData::Tensor(_)))
    }

    pub fn tensor(&self) -> Option<&Tensor> {
        match &self.data {
            Some(ValueData::Tensor(tensor)) => Some(tensor),
            _ => None,
        }
    }

    pub fn tensor_arc(&self) -> Option<Arc<Tensor>> {
        match &self.data {
            Some(ValueData::Tensor(tensor)) => Some(Arc::clone(tensor)),
            _ => None,
        }
    }

    pub fn non_tensor<T: Any + Send + Sync>(&self) -> Option<&T> {
        match &self.data {
            Some(ValueData::NonTensor { data, .. }) => data.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        match &self.data {
            Some(ValueData::NonTensor { type_name, .. }) => Some(type_name),
            Some(ValueData::Tensor(_)) => Some("tensor"),
            None => None,
        }
    }

    pub fn fence(&self) -> Option<&Fence> {
        self.fence.as_ref()
    }

    pub fn set_fence(&mut self, fence: Option<Fence>) {
        self.fence = fence;
    }

    /// Drop the contents, returning the value to the unallocated state
    pub fn reset(&mut self) {
        self.data = None;
        self.fence = None;
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            None => write!(f, "Value(empty)"),
            Some(ValueData::Tensor(tensor)) => write!(
                f,
                "Value(tensor {} {} at {})",
                tensor.data_type(),
                tensor.shape(),
                tensor.location()
            ),
            Some(ValueData::NonTensor { type_name, .. }) => write!(f, "Value({})", type_name),
        }
    }
}
