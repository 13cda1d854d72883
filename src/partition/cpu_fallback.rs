use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use log::debug;

use crate::error::Result;
use crate::model::{Graph, NodeIndex};
use crate::ops::registry::KernelLookup;

fn is_small_initializer(graph: &Graph, name: &str, threshold: usize) -> bool {
    graph
        .initializer(name)
        .map_or(false, |init| init.element_count() <= threshold)
}

/// Nodes a device provider claimed that are better left on the CPU.
///
/// Starting from the outputs the target kernels produce in host memory, walks consumers in
/// topological order and moves a candidate to the CPU when a CPU kernel exists and every
/// input is a small initializer, a graph input, or a host-resident output that the target
/// kernel does not itself read from host memory.
pub fn cpu_preferred_nodes(
    graph: &Graph,
    provider_type: &str,
    target_lookup: &dyn KernelLookup,
    cpu_lookup: &dyn KernelLookup,
    candidates: &[NodeIndex],
    small_initializer_threshold: usize,
) -> Result<HashSet<NodeIndex>> {
    let order = graph.topological_order()?;
    let position: HashMap<NodeIndex, usize> =
        order.iter().enumerate().map(|(pos, &idx)| (idx, pos)).collect();
    let candidate_set: HashSet<NodeIndex> = candidates.iter().copied().collect();

    let mut queue: BinaryHeap<Reverse<(usize, NodeIndex)>> = BinaryHeap::new();
    let mut cpu_output_args: HashSet<String> = HashSet::new();

    let push_consumers = |queue: &mut BinaryHeap<Reverse<(usize, NodeIndex)>>, name: &str| {
        for consumer in graph.consumers(name) {
            if let Some(&pos) = position.get(&consumer) {
                queue.push(Reverse((pos, consumer)));
            }
        }
    };

    for &index in candidates {
        let node = match graph.node(index) {
            Some(node) => node,
            None => continue,
        };
        let info = match target_lookup.lookup(node) {
            Some(info) => info,
            None => continue,
        };
        for (i, output) in node.outputs.iter().enumerate() {
            if output.exists() && info.def.is_output_on_cpu(i) {
                cpu_output_args.insert(output.name.clone());
                push_consumers(&mut queue, &output.name);
            }
        }
    }

    let mut visited: HashSet<NodeIndex> = HashSet::new();
    let mut cpu_nodes: HashSet<NodeIndex> = HashSet::new();
    while let Some(Reverse((_, index))) = queue.pop() {
        if !visited.insert(index) || !candidate_set.contains(&index) {
            continue;
        }
        let node = match graph.node(index) {
            Some(node) => node,
            None => continue,
        };
        if cpu_lookup.lookup(node).is_none() {
            continue;
        }
        let target = target_lookup.lookup(node);

        let mut place_on_cpu = true;
        for (i, input) in node.inputs.iter().enumerate().filter(|(_, a)| a.exists()) {
            if is_small_initializer(graph, &input.name, small_initializer_threshold)
                || graph.is_graph_input(&input.name)
            {
                continue;
            }
            if !cpu_output_args.contains(&input.name) {
                place_on_cpu = false;
                break;
            }
            if target.map_or(false, |t| t.def.is_input_on_cpu(i)) {
                place_on_cpu = false;
                break;
            }
        }

        if place_on_cpu {
            debug!(
                "Node '{}' ({}) stays on CPU instead of {}",
                node.name, node.op_type, provider_type
            );
            cpu_nodes.insert(index);
            for output in node.outputs.iter().filter(|o| o.exists()) {
                cpu_output_args.insert(output.name.clone());
                push_consumers(&mut queue, &output.name);
            }
        }
    }
    Ok(cpu_nodes)
}
