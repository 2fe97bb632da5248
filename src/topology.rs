//! Topology analysis: turning the unit graph into an evaluation plan.
//!
//! Sequential-modular solving needs an order in which units can be
//! evaluated so that each unit's inlets are known before it runs. An
//! acyclic flowsheet has such an order directly. Recycle loops do not, so
//! each strongly connected component of two or more units (or a unit
//! feeding itself) becomes a [`RecycleGroup`]: a set of tear streams is
//! designated whose values will be estimated, which breaks the loop and
//! yields an inner order for the group's units.
//!
//! All tie-breaks are by ascending id, so the same graph always produces
//! the same plan.

use std::collections::BTreeMap;

use crate::graph::FlowsheetGraph;
use crate::{SolveError, StreamId, UnitId};

/// One entry of an [`EvaluationPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    /// A single unit whose inlets are fully determined by earlier steps.
    Unit(UnitId),
    /// A recycle group solved by tear-stream iteration.
    Recycle(RecycleGroup),
}

/// A strongly connected set of units forming one or more recycle loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecycleGroup {
    /// The group's units, ordered so that ignoring the tear streams each
    /// unit's in-group predecessors come before it.
    pub units: Vec<UnitId>,
    /// Streams whose values are estimated rather than taken from the
    /// producing unit. One per loop; nested loops get one each.
    pub tear_streams: Vec<StreamId>,
}

/// The full evaluation order for one flowsheet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationPlan {
    /// Steps in dependency order. Evaluating them front to back visits
    /// every unit exactly once.
    pub steps: Vec<PlanStep>,
}

impl EvaluationPlan {
    /// All tear streams across all recycle groups, in plan order.
    pub fn tear_streams(&self) -> Vec<StreamId> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                PlanStep::Recycle(group) => Some(group.tear_streams.iter().copied()),
                PlanStep::Unit(_) => None,
            })
            .flatten()
            .collect()
    }

    /// Whether the plan contains any recycle group.
    pub fn has_recycle(&self) -> bool {
        self.steps.iter().any(|s| matches!(s, PlanStep::Recycle(_)))
    }
}

/// Internal edge: a stream joining two units of the graph. Boundary
/// streams (feeds and products) never participate in cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edge {
    from: UnitId,
    to: UnitId,
    stream: StreamId,
}

/// Builds the evaluation plan for a flowsheet.
///
/// The unit graph is condensed into strongly connected components
/// (Tarjan), the condensation is topologically ordered (Kahn, ties broken
/// by smallest unit id), and each multi-unit component is converted into a
/// [`RecycleGroup`] by tearing streams until the remainder is acyclic.
///
/// Tear selection follows the minimum-flow heuristic: among the streams
/// still closing a loop, the one with the smallest current flow rate is
/// torn (smallest stream id on equal flows). Low-flow recycles perturb the
/// balance least, so estimating them converges fastest.
pub fn build_plan(graph: &FlowsheetGraph) -> Result<EvaluationPlan, SolveError> {
    let unit_ids: Vec<UnitId> = graph.units().map(|u| u.id).collect();
    let edges: Vec<Edge> = graph
        .streams()
        .filter_map(|s| match (s.from(), s.to()) {
            (Some(from), Some(to)) => Some(Edge { from, to, stream: s.id }),
            _ => None,
        })
        .collect();

    let components = strongly_connected_components(&unit_ids, &edges);

    // Map each unit to its component index for the condensation.
    let mut component_of: BTreeMap<UnitId, usize> = BTreeMap::new();
    for (index, component) in components.iter().enumerate() {
        for unit in component {
            component_of.insert(*unit, index);
        }
    }

    // Kahn's algorithm over the condensation. Candidate components with no
    // remaining predecessors are picked by their smallest unit id, which
    // fixes the order between independent branches.
    let mut indegree = vec![0usize; components.len()];
    let mut successors: Vec<Vec<usize>> = vec![Vec::new(); components.len()];
    for edge in &edges {
        let from = component_of[&edge.from];
        let to = component_of[&edge.to];
        if from != to {
            successors[from].push(to);
            indegree[to] += 1;
        }
    }

    let mut ready: Vec<usize> = (0..components.len()).filter(|i| indegree[*i] == 0).collect();
    let mut ordered = Vec::with_capacity(components.len());
    while !ready.is_empty() {
        let pick = ready
            .iter()
            .copied()
            .min_by_key(|i| components[*i][0])
            .unwrap_or(ready[0]);
        ready.retain(|i| *i != pick);
        ordered.push(pick);
        for &succ in &successors[pick] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 && !ready.contains(&succ) {
                ready.push(succ);
            }
        }
    }

    let mut steps = Vec::with_capacity(ordered.len());
    for index in ordered {
        let component = &components[index];
        let has_self_loop = edges
            .iter()
            .any(|e| e.from == e.to && e.from == component[0]);
        if component.len() == 1 && !has_self_loop {
            steps.push(PlanStep::Unit(component[0]));
        } else {
            steps.push(PlanStep::Recycle(tear_component(graph, component, &edges)?));
        }
    }

    Ok(EvaluationPlan { steps })
}

/// Converts one cyclic component into a recycle group by tearing streams
/// until the remaining in-component edges form a DAG.
fn tear_component(
    graph: &FlowsheetGraph,
    component: &[UnitId],
    edges: &[Edge],
) -> Result<RecycleGroup, SolveError> {
    let mut inner: Vec<Edge> = edges
        .iter()
        .filter(|e| component.contains(&e.from) && component.contains(&e.to))
        .copied()
        .collect();
    let mut tear_streams = Vec::new();

    loop {
        // Streams still inside a cycle of the remaining subgraph.
        let cyclic = strongly_connected_components(component, &inner);
        let in_cycle: Vec<Edge> = inner
            .iter()
            .filter(|e| {
                e.from == e.to
                    || cyclic.iter().any(|c| {
                        c.len() > 1 && c.contains(&e.from) && c.contains(&e.to)
                    })
            })
            .copied()
            .collect();
        if in_cycle.is_empty() {
            break;
        }

        let tear = in_cycle
            .iter()
            .min_by(|a, b| {
                let fa = stream_flow(graph, a.stream);
                let fb = stream_flow(graph, b.stream);
                fa.partial_cmp(&fb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.stream.cmp(&b.stream))
            })
            .copied()
            .ok_or_else(|| SolveError::UnresolvableCycle { units: component.to_vec() })?;
        tear_streams.push(tear.stream);
        inner.retain(|e| e.stream != tear.stream);
    }

    if tear_streams.is_empty() {
        // A multi-unit SCC without an in-cycle edge cannot occur; the
        // component was built from those very edges.
        return Err(SolveError::UnresolvableCycle { units: component.to_vec() });
    }

    // Inner order of the torn subgraph, same tie-break as the outer plan.
    let mut indegree: BTreeMap<UnitId, usize> = component.iter().map(|u| (*u, 0)).collect();
    for edge in &inner {
        *indegree.entry(edge.to).or_insert(0) += 1;
    }
    let mut remaining: Vec<UnitId> = component.to_vec();
    let mut units = Vec::with_capacity(component.len());
    while !remaining.is_empty() {
        let pick = remaining
            .iter()
            .copied()
            .filter(|u| indegree[u] == 0)
            .min()
            .ok_or_else(|| SolveError::UnresolvableCycle { units: component.to_vec() })?;
        remaining.retain(|u| *u != pick);
        units.push(pick);
        for edge in inner.iter().filter(|e| e.from == pick) {
            if let Some(count) = indegree.get_mut(&edge.to) {
                *count -= 1;
            }
        }
    }

    Ok(RecycleGroup { units, tear_streams })
}

fn stream_flow(graph: &FlowsheetGraph, id: StreamId) -> f64 {
    graph.stream(id).map(|s| s.state.flow_rate).unwrap_or(0.0)
}

/// Tarjan's algorithm. Components come back sorted by their smallest unit
/// id, each component's units in ascending order.
fn strongly_connected_components(units: &[UnitId], edges: &[Edge]) -> Vec<Vec<UnitId>> {
    struct State<'a> {
        adjacency: &'a BTreeMap<UnitId, Vec<UnitId>>,
        index: BTreeMap<UnitId, usize>,
        lowlink: BTreeMap<UnitId, usize>,
        on_stack: BTreeMap<UnitId, bool>,
        stack: Vec<UnitId>,
        next_index: usize,
        components: Vec<Vec<UnitId>>,
    }

    fn visit(node: UnitId, state: &mut State<'_>) {
        state.index.insert(node, state.next_index);
        state.lowlink.insert(node, state.next_index);
        state.next_index += 1;
        state.stack.push(node);
        state.on_stack.insert(node, true);

        let neighbors = state.adjacency.get(&node).cloned().unwrap_or_default();
        for neighbor in neighbors {
            if !state.index.contains_key(&neighbor) {
                visit(neighbor, state);
                let low = state.lowlink[&node].min(state.lowlink[&neighbor]);
                state.lowlink.insert(node, low);
            } else if state.on_stack.get(&neighbor).copied().unwrap_or(false) {
                let low = state.lowlink[&node].min(state.index[&neighbor]);
                state.lowlink.insert(node, low);
            }
        }

        if state.lowlink[&node] == state.index[&node] {
            let mut component = Vec::new();
            while let Some(top) = state.stack.pop() {
                state.on_stack.insert(top, false);
                component.push(top);
                if top == node {
                    break;
                }
            }
            component.sort();
            state.components.push(component);
        }
    }

    let mut adjacency: BTreeMap<UnitId, Vec<UnitId>> = BTreeMap::new();
    for edge in edges {
        adjacency.entry(edge.from).or_default().push(edge.to);
    }
    for neighbors in adjacency.values_mut() {
        neighbors.sort();
    }

    let mut state = State {
        adjacency: &adjacency,
        index: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        on_stack: BTreeMap::new(),
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };

    let mut sorted_units: Vec<UnitId> = units.to_vec();
    sorted_units.sort();
    for unit in sorted_units {
        if !state.index.contains_key(&unit) {
            visit(unit, &mut state);
        }
    }

    let mut components = state.components;
    components.sort_by_key(|c| c[0]);
    components
}
