use std::collections::HashMap;

use crate::enforce;
use crate::error::Result;
use crate::execution::value::ValueIndex;
use crate::execution::value_map::ValueNameIdxMap;
use crate::model::{Graph, NodeIndex};

/// Flat table of the value index behind every node argument slot.
///
/// A node's slots are its explicit inputs, then its implicit (subgraph) inputs, then its
/// outputs, starting at `node_offset(node)`. A missing optional argument maps to `None`.
#[derive(Debug, Clone, Default)]
pub struct NodeIndexInfo {
    node_offsets: HashMap<NodeIndex, usize>,
    node_values: Vec<Option<ValueIndex>>,
    max_value_index: usize,
}

impl NodeIndexInfo {
    pub fn new(graph: &Graph, value_map: &ValueNameIdxMap) -> Result<Self> {
        let mut info = Self {
            max_value_index: value_map.len(),
            ..Default::default()
        };
        for index in graph.topological_order()? {
            let node = match graph.node(index) {
                Some(node) => node,
                None => continue,
            };
            info.node_offsets.insert(index, info.node_values.len());
            let implicit = node.implicit_inputs();
            let names = node
                .inputs
                .iter()
                .map(|a| a.exists().then(|| a.name.as_str()))
                .chain(implicit.iter().map(|n| Some(n.as_str())))
                .chain(node.outputs.iter().map(|a| a.exists().then(|| a.name.as_str())));
            for name in names {
                let slot = match name {
                    Some(name) => Some(value_map.get_idx(name)?),
                    None => None,
                };
                info.node_values.push(slot);
            }
        }
        Ok(info)
    }

    /// First slot of `node`
    pub fn node_offset(&self, node: NodeIndex) -> usize {
        let offset = self.node_offsets.get(&node);
        enforce!(offset.is_some(), "Node {} has no entry in the node index info", node);
        offset.copied().unwrap_or_default()
    }

    /// Value behind slot `offset`; `None` for an omitted optional argument
    pub fn value_index(&self, offset: usize) -> Option<ValueIndex> {
        enforce!(
            offset < self.node_values.len(),
            "Slot {} is out of range for {} slots",
            offset,
            self.node_values.len()
        );
        self.node_values[offset]
    }

    pub fn max_value_index(&self) -> usize {
        self.max_value_index
    }
}
