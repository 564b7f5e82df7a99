//! A* search over the warehouse graph.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::node::Node;
use crate::types::AgentId;
use crate::warehouse::{HeuristicTable, Warehouse};

/// Which nodes the search may expand besides the start and the goal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchPolicy {
    /// Skip intermediate nodes locked by anyone other than this agent.
    pub requester: Option<AgentId>,
    /// Skip CENTER nodes as intermediate waypoints.
    pub avoid_center: bool,
}

impl SearchPolicy {
    /// Pure graph query: every node is expandable.
    pub fn graph_query() -> Self {
        Self::default()
    }

    /// Live movement planning for `agent`.
    pub fn for_agent(agent: AgentId) -> Self {
        Self {
            requester: Some(agent),
            avoid_center: true,
        }
    }

    fn allows(&self, node: &Node) -> bool {
        if self.avoid_center && node.is_center() {
            return false;
        }
        match self.requester {
            Some(agent) => !node.is_locked_by_other(agent),
            None => true,
        }
    }
}

/// Ordered route from start to goal, both inclusive.
#[derive(Clone, Debug, PartialEq)]
pub struct Path {
    nodes: Vec<Arc<Node>>,
    cost: f64,
}

impl Path {
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn names(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.name().to_string()).collect()
    }

    /// Sum of edge distances along the route.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn goal(&self) -> Option<&Arc<Node>> {
        self.nodes.last()
    }
}

struct OpenEntry {
    f: f64,
    seq: u64,
    node: Arc<Node>,
}

impl PartialEq for OpenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.f.total_cmp(&other.f) == Ordering::Equal && self.seq == other.seq
    }
}

impl Eq for OpenEntry {}

impl PartialOrd for OpenEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpenEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap on f, then insertion order.
        other
            .f
            .total_cmp(&self.f)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Lowest-cost route from `start` to `goal`, or `None` when the goal is unreachable.
///
/// `heuristics` is an opaque per-node lookup (missing entries count as 0). Start
/// and goal are always admitted; `policy` only filters intermediate nodes.
pub fn find_path(
    warehouse: &Warehouse,
    start: &Arc<Node>,
    goal: &Arc<Node>,
    heuristics: &HeuristicTable,
    policy: &SearchPolicy,
) -> Option<Path> {
    if start.name() == goal.name() {
        return Some(Path {
            nodes: vec![Arc::clone(start)],
            cost: 0.0,
        });
    }

    let h = |node: &Node| heuristics.get(node.name()).unwrap_or(0.0);

    let mut open = BinaryHeap::new();
    let mut g_score: HashMap<String, f64> = HashMap::new();
    let mut came_from: HashMap<String, Arc<Node>> = HashMap::new();
    let mut closed: HashSet<String> = HashSet::new();
    let mut seq = 0u64;

    g_score.insert(start.name().to_string(), 0.0);
    open.push(OpenEntry {
        f: h(start),
        seq,
        node: Arc::clone(start),
    });

    while let Some(OpenEntry { node: current, .. }) = open.pop() {
        if closed.contains(current.name()) {
            continue;
        }
        if current.name() == goal.name() {
            return Some(reconstruct(&came_from, current, g_score[goal.name()]));
        }
        closed.insert(current.name().to_string());
        let current_g = g_score[current.name()];

        for (neighbour_name, distance) in current.neighbours() {
            if closed.contains(neighbour_name) {
                continue;
            }
            let Some(neighbour) = warehouse.node(neighbour_name) else {
                continue;
            };
            if neighbour.name() != goal.name() && !policy.allows(neighbour) {
                continue;
            }
            let tentative = current_g + distance;
            let improves = g_score
                .get(neighbour_name)
                .is_none_or(|&known| tentative < known);
            if improves {
                g_score.insert(neighbour_name.clone(), tentative);
                came_from.insert(neighbour_name.clone(), Arc::clone(&current));
                seq += 1;
                open.push(OpenEntry {
                    f: tentative + h(neighbour),
                    seq,
                    node: Arc::clone(neighbour),
                });
            }
        }
    }

    None
}

fn reconstruct(came_from: &HashMap<String, Arc<Node>>, goal: Arc<Node>, cost: f64) -> Path {
    let mut nodes = vec![goal];
    while let Some(previous) = nodes.last().and_then(|n| came_from.get(n.name())) {
        nodes.push(Arc::clone(previous));
    }
    nodes.reverse();
    Path { nodes, cost }
}
