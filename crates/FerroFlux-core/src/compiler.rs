//! Compiles a [`Schema`] against a [`BlockRegistry`] into a linear [`Plan`]:
//! instantiate nodes, resolve port IDs into per-step transfers, reject
//! cycles, and order everything topologically.
//!
//! Cycle detection and ordering both run on a [`petgraph::graph::DiGraph`]
//! (see DESIGN.md) rather than hand-rolled graph algorithms.

use std::collections::{BTreeMap, HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::Value;
use tracing::warn;

use crate::block::{BlockInstance, BlockTemplate};
use crate::errors::{CompileDiagnostic, EngineError};
use crate::registry::{option_value_from_json, BlockRegistry};
use crate::schema::{NodeSpec, Schema};

/// One value movement carried out after a step's block computes: take its
/// `from_port` output and write it to some downstream instance's
/// `to_port` input.
#[derive(Clone)]
pub struct Transfer {
    pub connection_id: String,
    pub from_port: String,
    pub to_index: usize,
    pub to_port: String,
}

/// One node in the compiled plan: the live instance plus the transfers to
/// run immediately after it computes.
pub struct Step {
    pub node_id: String,
    pub block_type: String,
    pub instance: Box<dyn BlockInstance>,
    pub transfers: Vec<Transfer>,
    /// Indices of steps that feed this one — used by the parallel executor
    /// to build in-degree counters without re-walking the schema.
    pub predecessors: Vec<usize>,
}

/// The compiled, directly-executable form of a schema: a topologically
/// ordered sequence of steps plus whatever non-fatal diagnostics surfaced
/// along the way.
pub struct Plan {
    pub steps: Vec<Step>,
    pub diagnostics: Vec<CompileDiagnostic>,
}

pub struct Compiler;

impl Compiler {
    /// Compiles `schema` against `registry`. Unknown block types and
    /// dangling connections are dropped with a [`CompileDiagnostic`] rather
    /// than failing the whole compile (§7); a true cycle is the only
    /// condition that returns `Err`.
    pub fn compile(schema: &Schema, registry: &BlockRegistry) -> Result<Plan, EngineError> {
        let mut diagnostics = Vec::new();

        // Instantiate nodes, dropping ones with an unregistered type.
        let mut node_index: HashMap<String, usize> = HashMap::new();
        let mut steps: Vec<Step> = Vec::new();
        // portID -> (step index, port name, side). Built while resolving
        // each node's `inputs`/`outputs` maps, then consulted when wiring
        // connections, which reference ports by ID rather than by name
        // (§3, §4.3 step 2).
        let mut port_to_node: HashMap<String, (usize, String, PortSide)> = HashMap::new();

        for node in &schema.nodes {
            let Some(template) = registry.get(&node.block_type) else {
                diagnostics.push(CompileDiagnostic::UnknownBlock {
                    node_id: node.id.clone(),
                    block_type: node.block_type.clone(),
                });
                warn!(node_id = %node.id, block_type = %node.block_type, "dropping node: unknown block type");
                continue;
            };
            let mut instance = template.spawn();
            instance.set_instance_id(node.id.clone());

            let idx = steps.len();
            for (name, value) in node_option_overrides(node, template) {
                if let Some(option_value) = option_value_from_json(&value) {
                    instance.set_option(&name, option_value);
                }
            }
            for (key, port_ref) in &node.inputs {
                // A key matching a declared option names an option
                // assignment, already applied above; anything else names
                // an input port (§4.3 step 2).
                if template.spec().option(key).is_some() {
                    continue;
                }
                port_to_node.insert(port_ref.id.clone(), (idx, key.clone(), PortSide::Input));
            }
            for (key, port_ref) in &node.outputs {
                port_to_node.insert(port_ref.id.clone(), (idx, key.clone(), PortSide::Output));
            }

            node_index.insert(node.id.clone(), idx);
            steps.push(Step {
                node_id: node.id.clone(),
                block_type: node.block_type.clone(),
                instance,
                transfers: Vec::new(),
                predecessors: Vec::new(),
            });
        }

        // Resolve connections by port ID into transfers, dropping ones
        // whose endpoints don't resolve or point the wrong direction (I1).
        // Multiple connections into the same port are all kept (§3).
        let mut predecessors_of: HashMap<usize, HashSet<usize>> = HashMap::new();
        for conn in &schema.connections {
            let resolved = port_to_node.get(&conn.from).zip(port_to_node.get(&conn.to));
            let Some((from, to)) = resolved else {
                diagnostics.push(CompileDiagnostic::DanglingConnection {
                    connection_id: conn.id.clone(),
                    from: conn.from.clone(),
                    to: conn.to.clone(),
                });
                continue;
            };
            let (from_idx, from_port, from_side) = from;
            let (to_idx, to_port, to_side) = to;
            if *from_side != PortSide::Output || *to_side != PortSide::Input {
                diagnostics.push(CompileDiagnostic::DanglingConnection {
                    connection_id: conn.id.clone(),
                    from: conn.from.clone(),
                    to: conn.to.clone(),
                });
                continue;
            }
            steps[*from_idx].transfers.push(Transfer {
                connection_id: conn.id.clone(),
                from_port: from_port.clone(),
                to_index: *to_idx,
                to_port: to_port.clone(),
            });
            predecessors_of.entry(*to_idx).or_default().insert(*from_idx);
        }
        for (idx, preds) in predecessors_of {
            steps[idx].predecessors = preds.into_iter().collect();
        }

        let order = topo_order(&steps)?;
        let steps = reorder(steps, &order);

        Ok(Plan { steps, diagnostics })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSide {
    Input,
    Output,
}

/// Splits a node's `inputs` map into its option overrides: entries whose
/// key matches a declared option on `template`, carrying their literal
/// value (§4.3 step 2). Shared with [`crate::manager`], which needs the
/// same overrides to reapply when respawning a pooled instance.
pub(crate) fn node_option_overrides(
    node: &NodeSpec,
    template: &BlockTemplate,
) -> BTreeMap<String, Value> {
    node.inputs
        .iter()
        .filter_map(|(key, port_ref)| {
            template.spec().option(key)?;
            Some((key.clone(), port_ref.value.clone().unwrap_or(Value::Null)))
        })
        .collect()
}

/// Builds a [`DiGraph`] over the plan's steps and orders them with
/// `petgraph::algo::toposort`, which also reports cycles. Ties (nodes
/// simultaneously ready) resolve to schema/step insertion order, since
/// `toposort` visits nodes in index order and we add them in step order.
fn topo_order(steps: &[Step]) -> Result<Vec<usize>, EngineError> {
    let mut graph = DiGraph::<usize, ()>::new();
    let node_indices: Vec<NodeIndex> = (0..steps.len()).map(|i| graph.add_node(i)).collect();
    for (idx, step) in steps.iter().enumerate() {
        for transfer in &step.transfers {
            graph.add_edge(node_indices[idx], node_indices[transfer.to_index], ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(|n| graph[n]).collect()),
        Err(cycle) => {
            let start = cycle.node_id();
            let names = cycle_names(steps, &graph, start);
            Err(EngineError::CycleError(names.join(" -> ")))
        }
    }
}

/// DFS from `start` (a node `toposort` reported as part of a cycle, not
/// necessarily the full cycle itself) to recover the actual loop of node
/// ids for the error message.
fn cycle_names(steps: &[Step], graph: &DiGraph<usize, ()>, start: NodeIndex) -> Vec<String> {
    fn dfs(
        node: NodeIndex,
        graph: &DiGraph<usize, ()>,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
        path: &mut Vec<NodeIndex>,
    ) -> Option<Vec<NodeIndex>> {
        visited.insert(node);
        on_stack.insert(node);
        path.push(node);
        for next in graph.neighbors(node) {
            if on_stack.contains(&next) {
                let start_pos = path.iter().position(|&n| n == next).unwrap();
                let mut cycle = path[start_pos..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            if !visited.contains(&next) {
                if let Some(cycle) = dfs(next, graph, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }
        on_stack.remove(&node);
        path.pop();
        None
    }

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();
    dfs(start, graph, &mut visited, &mut on_stack, &mut path)
        .unwrap_or_else(|| vec![start])
        .iter()
        .map(|&n| steps[graph[n]].node_id.clone())
        .collect()
}

fn reorder(mut steps: Vec<Step>, order: &[usize]) -> Vec<Step> {
    // Remap predecessor/transfer indices from old positions to new ones,
    // then physically reorder the step vector.
    let mut new_pos = vec![0usize; steps.len()];
    for (new_idx, &old_idx) in order.iter().enumerate() {
        new_pos[old_idx] = new_idx;
    }
    for step in &mut steps {
        for transfer in &mut step.transfers {
            transfer.to_index = new_pos[transfer.to_index];
        }
        for pred in &mut step.predecessors {
            *pred = new_pos[*pred];
        }
    }

    let mut slots: Vec<Option<Step>> = steps.into_iter().map(Some).collect();
    order.iter().map(|&old_idx| slots[old_idx].take().unwrap()).collect()
}
