use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, warn};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::execution::context::{OpKernelContext, SessionOptions};
use crate::execution::frame::{feed_shape_signature, CustomAllocator, ExecutionFrame};
use crate::execution::session::SessionState;
use crate::execution::value::{Value, ValueIndex};
use crate::model::{Graph, NodeIndex};
use crate::providers::{CpuExecutionProvider, ExecutionProviders};

/// Nodes whose outputs the given values transitively depend on
fn nodes_on_path_to(state: &SessionState, fetch_idxs: &[ValueIndex]) -> Result<HashSet<NodeIndex>> {
    let graph = state.graph();
    let mut needed = HashSet::new();
    let mut seen_values = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for &index in fetch_idxs {
        let name = state
            .value_map()
            .name(index)
            .ok_or_else(|| Error::InvalidArgument(format!("invalid fetch index {}", index)))?;
        queue.push_back(name.to_string());
    }

    while let Some(name) = queue.pop_front() {
        if !seen_values.insert(name.clone()) {
            continue;
        }
        let producer = match graph.producer(&name) {
            Some(producer) => producer,
            None => continue,
        };
        if !needed.insert(producer) {
            continue;
        }
        if let Some(node) = graph.node(producer) {
            queue.extend(node.inputs.iter().filter(|a| a.exists()).map(|a| a.name.clone()));
            queue.extend(node.implicit_inputs());
        }
    }
    Ok(needed)
}

/// Runs a session's plan one node at a time on the calling thread
pub struct SequentialExecutor;

impl SequentialExecutor {
    /// Run the plan for one set of feeds.
    ///
    /// `fetches` may be empty, in which case it is filled with one value per fetch, or hold
    /// caller-provided values to write into. `fetch_allocators` is keyed by fetch position.
    pub fn execute(
        state: &SessionState,
        feed_idxs: &[ValueIndex],
        feeds: &[Value],
        fetch_idxs: &[ValueIndex],
        fetches: &mut Vec<Value>,
        fetch_allocators: &HashMap<usize, CustomAllocator>,
    ) -> Result<()> {
        let mut frame = ExecutionFrame::new(feed_idxs, feeds, fetch_idxs, fetches, fetch_allocators, state)?;
        let graph = state.graph();
        let plan = state.execution_plan();
        let node_index_info = state.node_index_info();

        let to_run = if state.options().only_execute_path_to_fetches {
            Some(nodes_on_path_to(state, fetch_idxs)?)
        } else {
            None
        };
        let mut skipped = 0usize;

        for (step, node_plan) in plan.execution_plan.iter().enumerate() {
            let node = graph.node(node_plan.node_index).ok_or_else(|| {
                Error::Fail(format!("Execution plan names missing node {}", node_plan.node_index))
            })?;

            if to_run.as_ref().map_or(true, |nodes| nodes.contains(&node.index)) {
                let input_slots = node.inputs.len() + node.implicit_inputs().len();
                let offset = node_index_info.node_offset(node.index);
                for slot in offset..offset + input_slots {
                    if let Some(fence) = frame.get_node_input_or_output_value(slot).and_then(Value::fence) {
                        fence.wait()?;
                    }
                }

                let kernel = state.kernel(node.index).ok_or_else(|| {
                    Error::KernelNotFound(format!("No kernel was created for node '{}'", node.name))
                })?;
                debug!("Running node '{}' ({}) on {}", node.name, node.op_type, node.execution_provider);
                let mut ctx = OpKernelContext::new(&mut frame, node);
                kernel.compute(&mut ctx).map_err(|e| {
                    Error::Fail(format!(
                        "Non-zero status code returned while running {} node. Name:'{}' Status Message: {}",
                        node.op_type, node.name, e
                    ))
                })?;

                let output_base = offset + input_slots;
                for slot in output_base..output_base + node.outputs.len() {
                    if let Some(fence) = frame.get_node_input_or_output_value(slot).and_then(Value::fence) {
                        fence.signal()?;
                    }
                }
            } else {
                debug!("Skipping node '{}': not on the path to the requested outputs", node.name);
                skipped += 1;
            }

            for &index in plan.freed_after(step) {
                frame.release_value(index)?;
            }
        }

        frame.get_outputs(fetches)?;

        // a partial run traces a partial pattern; only full runs feed the cache
        if frame.has_memory_pattern_planner() && skipped == 0 {
            if let Some(signature) = feed_shape_signature(feeds) {
                match frame.generate_patterns() {
                    Ok(group) => state.update_memory_pattern_group(signature, group)?,
                    Err(e) => warn!("Could not generate memory patterns: {}", e),
                }
            }
        }
        Ok(())
    }
}

/// Session facade: owns the session state and runs inference calls against it
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    state: Arc<SessionState>,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl ExecutionEngine {
    /// Create an engine that runs everything on the CPU provider
    pub fn new(graph: Graph, options: SessionOptions) -> Result<Self> {
        let mut providers = ExecutionProviders::new();
        providers.add(Arc::new(CpuExecutionProvider::new(options.memory_limit())))?;
        Self::with_providers(graph, providers, options)
    }

    /// Create an engine over `providers`, highest priority first
    pub fn with_providers(graph: Graph, providers: ExecutionProviders, options: SessionOptions) -> Result<Self> {
        let thread_pool = if options.thread_count > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.thread_count)
                .build()
                .map_err(|e| Error::Fail(format!("Failed to build thread pool: {}", e)))?;
            Some(Arc::new(pool))
        } else {
            None
        };
        let state = SessionState::create(graph, providers, options)?;
        Ok(Self {
            state: Arc::new(state),
            thread_pool,
        })
    }

    pub fn session_state(&self) -> &SessionState {
        &self.state
    }

    /// Run with named feeds and return the requested outputs by name
    pub fn run(&self, feeds: HashMap<String, Value>, output_names: &[&str]) -> Result<HashMap<String, Value>> {
        let fetches = self.run_with_allocators(feeds, output_names, Vec::new(), &HashMap::new())?;
        Ok(output_names
            .iter()
            .map(|name| name.to_string())
            .zip(fetches)
            .collect())
    }

    /// Run with caller-provided fetch values and per-fetch allocators; outputs come back in
    /// `output_names` order
    pub fn run_with_allocators(
        &self,
        feeds: HashMap<String, Value>,
        output_names: &[&str],
        mut fetches: Vec<Value>,
        fetch_allocators: &HashMap<usize, CustomAllocator>,
    ) -> Result<Vec<Value>> {
        let value_map = self.state.value_map();
        let mut indexed_feeds = feeds
            .into_iter()
            .map(|(name, value)| value_map.get_idx(&name).map(|index| (index, value)))
            .collect::<Result<Vec<_>>>()?;
        // feed order is part of the pattern cache key
        indexed_feeds.sort_by_key(|(index, _)| *index);
        let (feed_idxs, feed_values): (Vec<ValueIndex>, Vec<Value>) = indexed_feeds.into_iter().unzip();

        // intermediates are released by the plan before outputs are collected
        let graph = self.state.graph();
        if let Some(name) = output_names.iter().find(|name| !graph.is_graph_output(name)) {
            return Err(Error::InvalidArgument(format!("Invalid Output Name: {}", name)));
        }
        let fetch_idxs = output_names
            .iter()
            .map(|name| value_map.get_idx(name))
            .collect::<Result<Vec<_>>>()?;

        SequentialExecutor::execute(
            &self.state,
            &feed_idxs,
            &feed_values,
            &fetch_idxs,
            &mut fetches,
            fetch_allocators,
        )?;
        Ok(fetches)
    }

    /// Run several independent calls in parallel; each gets its own frame
    pub fn run_concurrent(
        &self,
        batches: Vec<HashMap<String, Value>>,
        output_names: &[&str],
    ) -> Result<Vec<HashMap<String, Value>>> {
        let work = || {
            batches
                .into_par_iter()
                .map(|feeds| self.run(feeds, output_names))
                .collect::<Result<Vec<_>>>()
        };
        match &self.thread_pool {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }
}
