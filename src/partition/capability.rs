use std::collections::HashMap;

use crate::model::{Attribute, NodeIndex};

/// Descriptor of the single node a fused sub-graph becomes
#[derive(Debug, Clone, Default)]
pub struct MetaDef {
    pub name: String,
    pub domain: String,
    pub since_version: i64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: HashMap<String, Attribute>,
    pub doc_string: String,
}

/// Nodes a provider claims, plus the fused-node descriptor when they should be fused
#[derive(Debug, Clone, Default)]
pub struct IndexedSubGraph {
    pub nodes: Vec<NodeIndex>,
    pub meta_def: Option<MetaDef>,
}

#[derive(Debug, Clone, Default)]
pub struct ComputeCapability {
    pub sub_graph: IndexedSubGraph,
}

impl ComputeCapability {
    /// Claim one node as is
    pub fn single(node: NodeIndex) -> Self {
        Self {
            sub_graph: IndexedSubGraph {
                nodes: vec![node],
                meta_def: None,
            },
        }
    }

    /// Claim several nodes to be fused into one
    pub fn fused(nodes: Vec<NodeIndex>, meta_def: MetaDef) -> Self {
        Self {
            sub_graph: IndexedSubGraph {
                nodes,
                meta_def: Some(meta_def),
            },
        }
    }
}
