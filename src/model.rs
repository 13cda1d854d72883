use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex as PetIndex};
use petgraph::Direction;

use crate::error::{Error, Result};
use crate::ops::tensor::DataType;
use crate::partition::capability::IndexedSubGraph;

/// Index of a node inside its graph. Stable across node removal.
pub type NodeIndex = usize;

/// One dimension of a declared tensor shape
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Value(i64),
    Param(String),
}

/// Type information for values
#[derive(Debug, Clone, PartialEq)]
pub enum TypeInfo {
    Tensor {
        elem_type: DataType,
        shape: Option<Vec<Dimension>>,
    },
    Sequence {
        elem_type: Box<TypeInfo>,
    },
    Map {
        key_type: DataType,
        value_type: Box<TypeInfo>,
    },
}

impl TypeInfo {
    /// A tensor type with a fully static shape
    pub fn tensor(elem_type: DataType, dims: &[i64]) -> Self {
        TypeInfo::Tensor {
            elem_type,
            shape: Some(dims.iter().map(|&d| Dimension::Value(d)).collect()),
        }
    }

    /// A tensor type whose shape is unknown
    pub fn tensor_unknown_shape(elem_type: DataType) -> Self {
        TypeInfo::Tensor {
            elem_type,
            shape: None,
        }
    }

    pub fn is_tensor(&self) -> bool {
        matches!(self, TypeInfo::Tensor { .. })
    }

    /// Element type for tensor types
    pub fn elem_type(&self) -> Option<DataType> {
        match self {
            TypeInfo::Tensor { elem_type, .. } => Some(*elem_type),
            _ => None,
        }
    }

    /// Declared dimensions for tensor types
    pub fn dims(&self) -> Option<&[Dimension]> {
        match self {
            TypeInfo::Tensor { shape: Some(dims), .. } => Some(dims),
            _ => None,
        }
    }

    /// Textual type name, e.g. `tensor(Float)` or `seq(tensor(Int64))`
    pub fn type_name(&self) -> String {
        match self {
            TypeInfo::Tensor { elem_type, .. } => format!("tensor({})", elem_type),
            TypeInfo::Sequence { elem_type } => format!("seq({})", elem_type.type_name()),
            TypeInfo::Map { key_type, value_type } => {
                format!("map({},{})", key_type, value_type.type_name())
            }
        }
    }

    /// Whether two declarations of the same value can both hold
    fn is_compatible_with(&self, other: &TypeInfo) -> bool {
        match (self, other) {
            (
                TypeInfo::Tensor { elem_type: a, shape: sa },
                TypeInfo::Tensor { elem_type: b, shape: sb },
            ) => {
                if a != b {
                    return false;
                }
                match (sa, sb) {
                    (Some(x), Some(y)) => {
                        x.len() == y.len()
                            && x.iter().zip(y.iter()).all(|pair| match pair {
                                (Dimension::Value(m), Dimension::Value(n)) => m == n,
                                _ => true,
                            })
                    }
                    _ => true,
                }
            }
            (a, b) => a.type_name() == b.type_name(),
        }
    }
}

/// A named value slot on a node or graph. An empty name marks a missing optional argument.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeArg {
    pub name: String,
    pub type_info: Option<TypeInfo>,
}

impl NodeArg {
    pub fn new(name: &str, type_info: Option<TypeInfo>) -> Self {
        Self {
            name: name.to_string(),
            type_info,
        }
    }

    /// An argument without declared type information
    pub fn named(name: &str) -> Self {
        Self::new(name, None)
    }

    /// A float tensor argument with a static shape
    pub fn float(name: &str, dims: &[i64]) -> Self {
        Self::new(name, Some(TypeInfo::tensor(DataType::Float, dims)))
    }

    /// The placeholder for an omitted optional argument
    pub fn missing() -> Self {
        Self::named("")
    }

    pub fn exists(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Node attribute
#[derive(Debug, Clone)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
    Graph(Box<Graph>),
    Graphs(Vec<Graph>),
}

/// A function body: the nodes a function node expands to
#[derive(Debug, Clone, Default)]
pub struct Function {
    pub name: String,
    pub domain: String,
    pub since_version: i64,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub nodes: Vec<Node>,
}

/// Node in the computation graph
#[derive(Debug, Clone)]
pub struct Node {
    pub index: NodeIndex,
    pub name: String,
    pub op_type: String,
    pub domain: String,
    pub since_version: i64,
    pub inputs: Vec<NodeArg>,
    pub outputs: Vec<NodeArg>,
    pub attributes: HashMap<String, Attribute>,
    /// Provider the node is assigned to; empty while unassigned
    pub execution_provider: String,
    /// Body for nodes that can be expanded into primitive nodes
    pub function_body: Option<Function>,
}

impl Node {
    pub fn new(name: &str, op_type: &str, inputs: Vec<NodeArg>, outputs: Vec<NodeArg>) -> Self {
        Self {
            index: 0,
            name: name.to_string(),
            op_type: op_type.to_string(),
            domain: String::new(),
            since_version: 1,
            inputs,
            outputs,
            attributes: HashMap::new(),
            execution_provider: String::new(),
            function_body: None,
        }
    }

    pub fn with_domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    pub fn with_since_version(mut self, since_version: i64) -> Self {
        self.since_version = since_version;
        self
    }

    pub fn with_attribute(mut self, name: &str, attribute: Attribute) -> Self {
        self.attributes.insert(name.to_string(), attribute);
        self
    }

    pub fn with_function_body(mut self, body: Function) -> Self {
        self.function_body = Some(body);
        self
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.execution_provider = provider.to_string();
        self
    }

    pub fn is_assigned(&self) -> bool {
        !self.execution_provider.is_empty()
    }

    /// Nested graphs held in attributes (control-flow bodies)
    pub fn subgraphs(&self) -> Vec<&Graph> {
        let mut graphs = Vec::new();
        for attribute in self.attributes.values() {
            match attribute {
                Attribute::Graph(g) => graphs.push(g.as_ref()),
                Attribute::Graphs(gs) => graphs.extend(gs.iter()),
                _ => {}
            }
        }
        graphs
    }

    pub fn subgraphs_mut(&mut self) -> Vec<&mut Graph> {
        let mut graphs = Vec::new();
        for attribute in self.attributes.values_mut() {
            match attribute {
                Attribute::Graph(g) => graphs.push(g.as_mut()),
                Attribute::Graphs(gs) => graphs.extend(gs.iter_mut()),
                _ => {}
            }
        }
        graphs
    }

    pub fn has_subgraphs(&self) -> bool {
        self.attributes
            .values()
            .any(|a| matches!(a, Attribute::Graph(_) | Attribute::Graphs(_)))
    }

    /// Outer-scope names read by this node's subgraphs
    pub fn implicit_inputs(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for subgraph in self.subgraphs() {
            names.extend(subgraph.outer_scope_names());
        }
        names.into_iter().collect()
    }
}

/// A constant tensor stored in the graph
#[derive(Debug, Clone)]
pub struct Initializer {
    pub name: String,
    pub data_type: DataType,
    pub dims: Vec<i64>,
    pub raw_data: Vec<u8>,
}

impl Initializer {
    pub fn new(name: &str, data_type: DataType, dims: &[i64], raw_data: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            dims: dims.to_vec(),
            raw_data,
        }
    }

    pub fn from_f32(name: &str, dims: &[i64], values: &[f32]) -> Self {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(name, DataType::Float, dims, raw)
    }

    pub fn from_i64(name: &str, dims: &[i64], values: &[i64]) -> Self {
        let raw = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(name, DataType::Int64, dims, raw)
    }

    /// Total number of elements
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|&d| d.max(0) as usize).product()
    }

    pub fn type_info(&self) -> TypeInfo {
        TypeInfo::tensor(self.data_type, &self.dims)
    }
}

/// Graph structure containing nodes and named values.
///
/// Nodes live in index-stable slots: removing a node leaves a hole, so a `NodeIndex` handed
/// out earlier never refers to a different node.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub name: String,
    nodes: Vec<Option<Node>>,
    inputs: Vec<NodeArg>,
    outputs: Vec<NodeArg>,
    initializers: Vec<Initializer>,
    is_subgraph: bool,
    inline_counter: usize,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// A graph nested inside a node attribute; names it cannot resolve locally come from the parent
    pub fn new_subgraph(name: &str) -> Self {
        Self {
            name: name.to_string(),
            is_subgraph: true,
            ..Default::default()
        }
    }

    pub fn is_subgraph(&self) -> bool {
        self.is_subgraph
    }

    pub fn add_input(&mut self, arg: NodeArg) {
        self.inputs.push(arg);
    }

    pub fn add_output(&mut self, arg: NodeArg) {
        self.outputs.push(arg);
    }

    pub fn add_initializer(&mut self, initializer: Initializer) {
        self.initializers.retain(|i| i.name != initializer.name);
        self.initializers.push(initializer);
    }

    /// Add a node and return its index
    pub fn add_node(&mut self, mut node: Node) -> NodeIndex {
        let index = self.nodes.len();
        node.index = index;
        self.nodes.push(Some(node));
        index
    }

    pub fn remove_node(&mut self, index: NodeIndex) -> Option<Node> {
        self.nodes.get_mut(index).and_then(Option::take)
    }

    pub fn node(&self, index: NodeIndex) -> Option<&Node> {
        self.nodes.get(index).and_then(Option::as_ref)
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Option<&mut Node> {
        self.nodes.get_mut(index).and_then(Option::as_mut)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter_map(Option::as_ref)
    }

    pub fn node_indices(&self) -> Vec<NodeIndex> {
        self.nodes().map(|n| n.index).collect()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes().count()
    }

    /// One past the largest index ever handed out
    pub fn max_node_index(&self) -> usize {
        self.nodes.len()
    }

    pub fn inputs(&self) -> &[NodeArg] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeArg] {
        &self.outputs
    }

    pub fn initializers(&self) -> &[Initializer] {
        &self.initializers
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.iter().find(|i| i.name == name)
    }

    pub fn is_graph_input(&self, name: &str) -> bool {
        self.inputs.iter().any(|a| a.name == name)
    }

    pub fn is_graph_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|a| a.name == name)
    }

    pub fn is_initializer(&self, name: &str) -> bool {
        self.initializer(name).is_some()
    }

    /// Node producing `name`, if any
    pub fn producer(&self, name: &str) -> Option<NodeIndex> {
        self.nodes()
            .find(|n| n.outputs.iter().any(|o| o.exists() && o.name == name))
            .map(|n| n.index)
    }

    /// Nodes reading `name`, explicitly or through a subgraph, in index order
    pub fn consumers(&self, name: &str) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|n| {
                n.inputs.iter().any(|i| i.exists() && i.name == name)
                    || n.implicit_inputs().iter().any(|i| i == name)
            })
            .map(|n| n.index)
            .collect()
    }

    /// The most specific declaration of a value: graph input, producer output, initializer, or any use
    pub fn node_arg(&self, name: &str) -> Option<NodeArg> {
        if let Some(arg) = self.inputs.iter().find(|a| a.name == name) {
            if arg.type_info.is_some() {
                return Some(arg.clone());
            }
        }
        for node in self.nodes() {
            if let Some(arg) = node.outputs.iter().find(|a| a.name == name && a.type_info.is_some()) {
                return Some(arg.clone());
            }
        }
        if let Some(init) = self.initializer(name) {
            return Some(NodeArg::new(name, Some(init.type_info())));
        }
        self.nodes()
            .flat_map(|n| n.inputs.iter())
            .chain(self.outputs.iter())
            .find(|a| a.name == name && a.type_info.is_some())
            .cloned()
            .or_else(|| {
                let known = self.inputs.iter().any(|a| a.name == name)
                    || self.nodes().any(|n| {
                        n.outputs.iter().chain(n.inputs.iter()).any(|a| a.name == name)
                    });
                if known {
                    Some(NodeArg::named(name))
                } else {
                    None
                }
            })
    }

    /// Names defined inside this graph
    fn local_names(&self) -> HashSet<String> {
        let mut names: HashSet<String> = self.inputs.iter().map(|a| a.name.clone()).collect();
        names.extend(self.initializers.iter().map(|i| i.name.clone()));
        for node in self.nodes() {
            names.extend(node.outputs.iter().filter(|o| o.exists()).map(|o| o.name.clone()));
        }
        names
    }

    /// Names this graph reads but does not define
    pub fn outer_scope_names(&self) -> BTreeSet<String> {
        let local = self.local_names();
        let mut names = BTreeSet::new();
        for node in self.nodes() {
            for input in node.inputs.iter().filter(|i| i.exists()) {
                if !local.contains(&input.name) {
                    names.insert(input.name.clone());
                }
            }
            for name in node.implicit_inputs() {
                if !local.contains(&name) {
                    names.insert(name);
                }
            }
        }
        for output in &self.outputs {
            if !local.contains(&output.name) {
                names.insert(output.name.clone());
            }
        }
        names
    }

    /// Node indices in a deterministic topological order.
    ///
    /// Among ready nodes the one with the smallest index runs first. Cycles are reported as
    /// `Error::InvalidGraph`.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>> {
        let mut dag: DiGraph<NodeIndex, ()> = DiGraph::new();
        let mut pet_of: HashMap<NodeIndex, PetIndex> = HashMap::new();
        for node in self.nodes() {
            pet_of.insert(node.index, dag.add_node(node.index));
        }

        let mut producers: HashMap<&str, NodeIndex> = HashMap::new();
        for node in self.nodes() {
            for output in node.outputs.iter().filter(|o| o.exists()) {
                producers.insert(output.name.as_str(), node.index);
            }
        }
        for node in self.nodes() {
            let implicit = node.implicit_inputs();
            let reads = node
                .inputs
                .iter()
                .filter(|i| i.exists())
                .map(|i| i.name.as_str())
                .chain(implicit.iter().map(String::as_str));
            for name in reads {
                if let Some(&producer) = producers.get(name) {
                    dag.update_edge(pet_of[&producer], pet_of[&node.index], ());
                }
            }
        }

        if let Err(cycle) = toposort(&dag, None) {
            let index = dag[cycle.node_id()];
            let name = self.node(index).map(|n| n.name.clone()).unwrap_or_default();
            return Err(Error::InvalidGraph(format!(
                "This is an invalid model. Graph '{}' has a cycle through node '{}'",
                self.name, name
            )));
        }

        let mut in_degree: HashMap<PetIndex, usize> = dag
            .node_indices()
            .map(|n| (n, dag.neighbors_directed(n, Direction::Incoming).count()))
            .collect();
        let mut ready: BinaryHeap<Reverse<NodeIndex>> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| Reverse(dag[n]))
            .collect();
        let mut order = Vec::with_capacity(dag.node_count());
        while let Some(Reverse(index)) = ready.pop() {
            order.push(index);
            let pet = pet_of[&index];
            for next in dag.neighbors_directed(pet, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(dag[next]));
                    }
                }
            }
        }
        Ok(order)
    }

    /// Validate edges and declared types, and propagate producer types onto untyped uses
    pub fn resolve(&mut self) -> Result<()> {
        self.resolve_in_scope(&HashSet::new())
    }

    fn resolve_in_scope(&mut self, outer_scope: &HashSet<String>) -> Result<()> {
        let mut defined: HashMap<String, Option<TypeInfo>> = HashMap::new();
        for input in &self.inputs {
            defined.insert(input.name.clone(), input.type_info.clone());
        }
        for init in &self.initializers {
            defined.entry(init.name.clone()).or_insert_with(|| Some(init.type_info()));
        }
        for node in self.nodes() {
            for output in node.outputs.iter().filter(|o| o.exists()) {
                if defined.contains_key(&output.name) {
                    return Err(Error::InvalidGraph(format!(
                        "Duplicate definition of '{}' by node '{}' in graph '{}'",
                        output.name, node.name, self.name
                    )));
                }
                defined.insert(output.name.clone(), output.type_info.clone());
            }
        }

        // nested graphs see everything visible here
        let mut visible: HashSet<String> = outer_scope.clone();
        visible.extend(defined.keys().cloned());
        for index in self.node_indices() {
            if let Some(node) = self.node_mut(index) {
                for subgraph in node.subgraphs_mut() {
                    subgraph.resolve_in_scope(&visible)?;
                }
            }
        }

        let graph_name = self.name.clone();
        let is_subgraph = self.is_subgraph;
        for node in self.nodes.iter_mut().flatten() {
            for input in node.inputs.iter_mut().filter(|i| i.exists()) {
                match defined.get(&input.name) {
                    Some(declared) => {
                        if let (Some(used), Some(declared)) = (&input.type_info, declared) {
                            if !used.is_compatible_with(declared) {
                                return Err(Error::InvalidGraph(format!(
                                    "Type mismatch for '{}' consumed by node '{}': expected {}, found {}",
                                    input.name,
                                    node.name,
                                    declared.type_name(),
                                    used.type_name()
                                )));
                            }
                        }
                        if input.type_info.is_none() {
                            input.type_info = declared.clone();
                        }
                    }
                    None if is_subgraph && outer_scope.contains(&input.name) => {}
                    None => {
                        return Err(Error::InvalidGraph(format!(
                            "Node '{}' input '{}' is not a graph input, initializer, or output of a previous node in graph '{}'",
                            node.name, input.name, graph_name
                        )));
                    }
                }
            }
        }

        for output in self.outputs.iter_mut() {
            match defined.get(&output.name) {
                Some(declared) => {
                    if output.type_info.is_none() {
                        output.type_info = declared.clone();
                    }
                }
                None if self.is_subgraph && outer_scope.contains(&output.name) => {}
                None => {
                    return Err(Error::InvalidGraph(format!(
                        "Graph output '{}' of graph '{}' is not produced by any node",
                        output.name, self.name
                    )));
                }
            }
        }

        self.topological_order().map(|_| ())
    }

    /// Replace the nodes of `sub_graph` by one node carrying them as its function body.
    ///
    /// The new node takes its op type, domain, version, and arguments from the MetaDef.
    pub fn fuse_sub_graph(&mut self, sub_graph: &IndexedSubGraph, fused_name: &str) -> Result<NodeIndex> {
        let meta = sub_graph.meta_def.as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!("Cannot fuse into '{}' without a MetaDef", fused_name))
        })?;
        if let Some(&missing) = sub_graph.nodes.iter().find(|&&i| self.node(i).is_none()) {
            return Err(Error::InvalidArgument(format!(
                "Cannot fuse into '{}': node {} does not exist",
                fused_name, missing
            )));
        }

        let lookup = |name: &String| self.node_arg(name).unwrap_or_else(|| NodeArg::named(name));
        let inputs: Vec<NodeArg> = meta.inputs.iter().map(lookup).collect();
        let outputs: Vec<NodeArg> = meta.outputs.iter().map(lookup).collect();

        let mut body = Vec::with_capacity(sub_graph.nodes.len());
        for &index in &sub_graph.nodes {
            if let Some(node) = self.remove_node(index) {
                body.push(node);
            }
        }

        let mut fused = Node::new(fused_name, &meta.name, inputs, outputs)
            .with_domain(&meta.domain)
            .with_since_version(meta.since_version)
            .with_function_body(Function {
                name: meta.name.clone(),
                domain: meta.domain.clone(),
                since_version: meta.since_version,
                inputs: meta.inputs.clone(),
                outputs: meta.outputs.clone(),
                nodes: body,
            });
        fused.attributes = meta.attributes.clone();
        Ok(self.add_node(fused))
    }

    /// Expand a function node into its body. Returns the indices of the new nodes.
    pub fn inline_function(&mut self, index: NodeIndex) -> Result<Vec<NodeIndex>> {
        let has_body = self.node(index).map_or(false, |n| n.function_body.is_some());
        if !has_body {
            return Err(Error::InvalidArgument(format!(
                "Node {} has no function body to inline",
                index
            )));
        }
        let node = match self.remove_node(index) {
            Some(node) => node,
            None => return Err(Error::InvalidArgument(format!("Node {} does not exist", index))),
        };
        let function = match node.function_body {
            Some(function) => function,
            None => return Err(Error::InvalidArgument(format!("Node {} has no function body", index))),
        };

        let prefix = format!("{}_inline_{}", function.name, self.inline_counter);
        self.inline_counter += 1;

        let mut rename: HashMap<String, String> = HashMap::new();
        for (formal, actual) in function.inputs.iter().zip(node.inputs.iter()) {
            rename.insert(formal.clone(), actual.name.clone());
        }
        for (formal, actual) in function.outputs.iter().zip(node.outputs.iter()) {
            rename.insert(formal.clone(), actual.name.clone());
        }
        for body_node in &function.nodes {
            for output in body_node.outputs.iter().filter(|o| o.exists()) {
                rename
                    .entry(output.name.clone())
                    .or_insert_with(|| format!("{}__{}", prefix, output.name));
            }
        }

        let remap = |arg: &NodeArg| -> NodeArg {
            match rename.get(&arg.name) {
                Some(name) if arg.exists() => NodeArg::new(name, arg.type_info.clone()),
                _ => arg.clone(),
            }
        };

        let mut added = Vec::with_capacity(function.nodes.len());
        for body_node in &function.nodes {
            let mut expanded = body_node.clone();
            expanded.name = format!("{}__{}", prefix, body_node.name);
            expanded.inputs = body_node.inputs.iter().map(&remap).collect();
            expanded.outputs = body_node.outputs.iter().map(&remap).collect();
            expanded.execution_provider.clear();
            added.push(self.add_node(expanded));
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::capability::MetaDef;

    fn chain_graph() -> Graph {
        let mut graph = Graph::new("chain");
        graph.add_input(NodeArg::float("x", &[1, 4]));
        graph.add_node(Node::new("relu", "Relu", vec![NodeArg::named("x")], vec![NodeArg::float("a", &[1, 4])]));
        graph.add_node(Node::new("sigmoid", "Sigmoid", vec![NodeArg::named("a")], vec![NodeArg::float("b", &[1, 4])]));
        graph.add_node(Node::new("tanh", "Tanh", vec![NodeArg::named("b")], vec![NodeArg::float("y", &[1, 4])]));
        graph.add_output(NodeArg::named("y"));
        graph
    }

    #[test]
    fn test_resolve_propagates_types() {
        let mut graph = chain_graph();
        graph.resolve().unwrap();
        let relu = graph.node(0).unwrap();
        assert_eq!(relu.inputs[0].type_info, Some(TypeInfo::tensor(DataType::Float, &[1, 4])));
        assert!(graph.outputs()[0].type_info.is_some());
    }

    #[test]
    fn test_resolve_rejects_dangling_input() {
        let mut graph = chain_graph();
        graph.add_node(Node::new("bad", "Relu", vec![NodeArg::named("nope")], vec![NodeArg::named("z")]));
        assert!(matches!(graph.resolve(), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn test_resolve_rejects_type_mismatch() {
        let mut graph = chain_graph();
        graph.add_node(Node::new(
            "cast_view",
            "Identity",
            vec![NodeArg::new("a", Some(TypeInfo::tensor(DataType::Int64, &[1, 4])))],
            vec![NodeArg::named("c")],
        ));
        assert!(matches!(graph.resolve(), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn test_cycle_detected() {
        let mut graph = Graph::new("cycle");
        graph.add_node(Node::new("a", "Relu", vec![NodeArg::named("q")], vec![NodeArg::named("p")]));
        graph.add_node(Node::new("b", "Relu", vec![NodeArg::named("p")], vec![NodeArg::named("q")]));
        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn test_topological_order_prefers_lower_index() {
        let mut graph = Graph::new("diamond");
        graph.add_input(NodeArg::float("x", &[2]));
        graph.add_node(Node::new("join", "Add", vec![NodeArg::named("l"), NodeArg::named("r")], vec![NodeArg::named("y")]));
        graph.add_node(Node::new("left", "Relu", vec![NodeArg::named("x")], vec![NodeArg::named("l")]));
        graph.add_node(Node::new("right", "Tanh", vec![NodeArg::named("x")], vec![NodeArg::named("r")]));
        assert_eq!(graph.topological_order().unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_fuse_then_inline_restores_structure() {
        let mut graph = chain_graph();
        graph.resolve().unwrap();
        let sub = IndexedSubGraph {
            nodes: vec![0, 1],
            meta_def: Some(MetaDef {
                name: "ReluSigmoid".to_string(),
                domain: "test.fused".to_string(),
                since_version: 1,
                inputs: vec!["x".to_string()],
                outputs: vec!["b".to_string()],
                ..Default::default()
            }),
        };
        let fused = graph.fuse_sub_graph(&sub, "fused_0").unwrap();
        assert_eq!(graph.num_nodes(), 2);
        let node = graph.node(fused).unwrap();
        assert_eq!(node.op_type, "ReluSigmoid");
        assert_eq!(node.outputs[0].type_info, Some(TypeInfo::tensor(DataType::Float, &[1, 4])));
        assert_eq!(node.function_body.as_ref().unwrap().nodes.len(), 2);
        graph.resolve().unwrap();

        let added = graph.inline_function(fused).unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(graph.num_nodes(), 3);
        graph.resolve().unwrap();
        // boundary names survive, internal names are made unique
        assert_eq!(graph.producer("b"), Some(added[1]));
        let inner = &graph.node(added[0]).unwrap().outputs[0].name;
        assert!(inner.starts_with("ReluSigmoid_inline_0__"));
    }

    #[test]
    fn test_subgraph_outer_scope() {
        let mut body = Graph::new_subgraph("then");
        body.add_node(Node::new("inner", "Relu", vec![NodeArg::named("a")], vec![NodeArg::named("t")]));
        body.add_output(NodeArg::named("t"));

        let mut graph = chain_graph();
        graph.add_input(NodeArg::new("cond", Some(TypeInfo::tensor(DataType::Bool, &[]))));
        graph.add_node(
            Node::new("if", "If", vec![NodeArg::named("cond")], vec![NodeArg::named("branch")])
                .with_attribute("then_branch", Attribute::Graph(Box::new(body))),
        );
        graph.resolve().unwrap();

        let if_node = graph.node(3).unwrap();
        assert_eq!(if_node.implicit_inputs(), vec!["a".to_string()]);
        assert_eq!(graph.consumers("a"), vec![1, 3]);
        let order = graph.topological_order().unwrap();
        let pos = |i| order.iter().position(|&n| n == i).unwrap();
        assert!(pos(0) < pos(3));
    }
}
