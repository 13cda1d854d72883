use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::execution::value::ValueIndex;
use crate::model::Graph;

/// Name to index mapping for every value a session touches
#[derive(Debug, Clone, Default)]
pub struct ValueNameIdxMap {
    indices: HashMap<String, ValueIndex>,
    names: Vec<String>,
}

impl ValueNameIdxMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index graph inputs and initializers, then node outputs in execution order, then
    /// any graph output not yet seen.
    pub fn from_graph(graph: &Graph) -> Result<Self> {
        let mut map = Self::new();
        for input in graph.inputs() {
            map.add(&input.name);
        }
        for initializer in graph.initializers() {
            map.add(&initializer.name);
        }
        for index in graph.topological_order()? {
            if let Some(node) = graph.node(index) {
                for output in node.outputs.iter().filter(|o| o.exists()) {
                    map.add(&output.name);
                }
            }
        }
        for output in graph.outputs() {
            map.add(&output.name);
        }
        Ok(map)
    }

    /// Add `name` if it is new; returns its index either way
    pub fn add(&mut self, name: &str) -> ValueIndex {
        if let Some(&index) = self.indices.get(name) {
            return index;
        }
        let index = self.names.len();
        self.indices.insert(name.to_string(), index);
        self.names.push(name.to_string());
        index
    }

    pub fn get_idx(&self, name: &str) -> Result<ValueIndex> {
        self.indices
            .get(name)
            .copied()
            .ok_or_else(|| Error::InvalidArgument(format!("Could not find MLValue with name '{}'", name)))
    }

    pub fn name(&self, index: ValueIndex) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueIndex, &str)> {
        self.names.iter().enumerate().map(|(i, n)| (i, n.as_str()))
    }
}
