use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::execution::frame::{ExecutionFrame, ValueAllocationParameters};
use crate::execution::value::Value;
use crate::model::{Attribute, Node};
use crate::ops::tensor::{Tensor, TensorShape};
use crate::partition::partitioner::{PartitionMode, PartitionOptions};

/// Options for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Record allocation patterns on the first run of each input shape and replay them
    pub enable_mem_pattern: bool,
    /// Keep small shape computations on the CPU when a device provider claims them
    pub enable_cpu_fallback: bool,
    /// Initializers with at most this many elements count as small
    pub small_initializer_threshold: usize,
    /// Ask providers to compile fused nodes into a shared library
    pub export_dll: bool,
    /// Skip nodes that do not contribute to the requested outputs
    pub only_execute_path_to_fetches: bool,
    /// Number of threads for concurrent runs (0 = use system default)
    pub thread_count: usize,
    /// Memory limit in bytes for the default CPU allocator (0 = no limit)
    pub memory_limit_bytes: usize,
    pub partition_mode: PartitionMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            enable_mem_pattern: true,
            enable_cpu_fallback: true,
            small_initializer_threshold: 100,
            export_dll: false,
            only_execute_path_to_fetches: false,
            thread_count: 0,
            memory_limit_bytes: 0,
            partition_mode: PartitionMode::Normal,
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_mem_pattern(mut self, enable: bool) -> Self {
        self.enable_mem_pattern = enable;
        self
    }

    pub fn enable_cpu_fallback(mut self, enable: bool) -> Self {
        self.enable_cpu_fallback = enable;
        self
    }

    pub fn set_small_initializer_threshold(mut self, threshold: usize) -> Self {
        self.small_initializer_threshold = threshold;
        self
    }

    pub fn enable_export_dll(mut self, enable: bool) -> Self {
        self.export_dll = enable;
        self
    }

    pub fn enable_only_execute_path_to_fetches(mut self, enable: bool) -> Self {
        self.only_execute_path_to_fetches = enable;
        self
    }

    /// Set the number of threads to use
    pub fn set_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Set the memory limit
    pub fn set_memory_limit(mut self, memory_limit_bytes: usize) -> Self {
        self.memory_limit_bytes = memory_limit_bytes;
        self
    }

    pub fn set_partition_mode(mut self, mode: PartitionMode) -> Self {
        self.partition_mode = mode;
        self
    }

    pub fn memory_limit(&self) -> Option<usize> {
        (self.memory_limit_bytes > 0).then_some(self.memory_limit_bytes)
    }

    pub fn partition_options(&self) -> PartitionOptions {
        PartitionOptions {
            export_dll: self.export_dll,
            enable_cpu_fallback: self.enable_cpu_fallback,
            small_initializer_threshold: self.small_initializer_threshold,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

/// A kernel's view of the frame while it computes one node
pub struct OpKernelContext<'f, 's> {
    frame: &'f mut ExecutionFrame<'s>,
    node: &'f Node,
    input_base: usize,
    output_base: usize,
}

impl<'f, 's> OpKernelContext<'f, 's> {
    pub fn new(frame: &'f mut ExecutionFrame<'s>, node: &'f Node) -> Self {
        let input_base = frame.node_offset(node.index);
        let output_base = input_base + node.inputs.len() + node.implicit_inputs().len();
        Self {
            frame,
            node,
            input_base,
            output_base,
        }
    }

    pub fn node(&self) -> &Node {
        self.node
    }

    pub fn input_count(&self) -> usize {
        self.node.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.node.outputs.len()
    }

    pub fn input_value(&self, index: usize) -> Option<&Value> {
        if index >= self.input_count() {
            return None;
        }
        self.frame
            .get_node_input_or_output_value(self.input_base + index)
            .filter(|v| v.is_allocated())
    }

    /// Input tensor `index`; `None` when the optional input is absent
    pub fn input(&self, index: usize) -> Option<Arc<Tensor>> {
        self.input_value(index).and_then(Value::tensor_arc)
    }

    pub fn required_input(&self, index: usize) -> Result<Arc<Tensor>> {
        self.input(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Node '{}' is missing required input {}",
                self.node.name, index
            ))
        })
    }

    /// Output tensor `index` with the given shape, allocated on first request.
    ///
    /// Returns `None` when the output is an unused optional one.
    pub fn output(&mut self, index: usize, shape: impl Into<TensorShape>) -> Result<Option<Arc<Tensor>>> {
        if index >= self.output_count() {
            return Ok(None);
        }
        let parameters = ValueAllocationParameters::new(shape.into());
        let value = self
            .frame
            .get_or_create_node_output_value(self.output_base + index, Some(&parameters))?;
        Ok(value.and_then(|v| v.tensor_arc()))
    }

    /// Output value `index` for non-tensor outputs
    pub fn output_value(&mut self, index: usize) -> Result<Option<&mut Value>> {
        if index >= self.output_count() {
            return Ok(None);
        }
        self.frame.get_or_create_node_output_value(self.output_base + index, None)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.node.attributes.get(name)
    }

    pub fn attribute_f32(&self, name: &str, default: f32) -> f32 {
        match self.attribute(name) {
            Some(Attribute::Float(v)) => *v,
            Some(Attribute::Int(v)) => *v as f32,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_json() {
        let options = SessionOptions::from_json_str(
            r#"{"enable_mem_pattern": false, "small_initializer_threshold": 8, "partition_mode": "AssignOnly"}"#,
        )
        .unwrap();
        assert!(!options.enable_mem_pattern);
        assert!(options.enable_cpu_fallback);
        assert_eq!(options.small_initializer_threshold, 8);
        assert_eq!(options.partition_mode, PartitionMode::AssignOnly);
        assert_eq!(options.memory_limit(), None);
        assert!(SessionOptions::from_json_str("{not json").is_err());
    }

    #[test]
    fn test_builder() {
        let options = SessionOptions::new()
            .set_memory_limit(1024)
            .enable_only_execute_path_to_fetches(true)
            .set_thread_count(2);
        assert_eq!(options.memory_limit(), Some(1024));
        assert!(options.only_execute_path_to_fetches);
        assert_eq!(options.partition_options().small_initializer_threshold, 100);
    }
}
