//! The warehouse graph: nodes, racks, shelves, heuristics, and map snapshots.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{NeighbourSpec, WarehouseConfig};
use crate::error::ConfigError;
use crate::node::Node;
use crate::types::{AgentId, AgentType, NodeKind};

/// Storage rack sitting on a CENTER node.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Rack {
    pub id: String,
    pub center: String,
    pub frozen: bool,
    pub capacity: f64,
    pub shelves: Vec<Shelf>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Shelf {
    pub id: String,
    pub rack_id: String,
    pub z_level: f64,
    pub current_weight: f64,
    pub locked: bool,
}

/// Per-node estimated cost to a goal, shaped for one agent type.
///
/// Not admissible in general: CENTER penalties and aisle bonuses skew the
/// landscape, so the pathfinder treats this as an opaque lookup.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeuristicTable {
    values: HashMap<String, f64>,
}

impl HeuristicTable {
    pub fn get(&self, node: &str) -> Option<f64> {
        self.values.get(node).copied()
    }

    pub fn insert(&mut self, node: impl Into<String>, value: f64) {
        self.values.insert(node.into(), value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, f64)> for HeuristicTable {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub kind: NodeKind,
    pub locked_by: Option<AgentId>,
    pub neighbours: BTreeMap<String, f64>,
}

/// Point-in-time view of the map for visualisation layers.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MapSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub racks: Vec<Rack>,
}

/// Owns every node and rack; built once and validated up front.
pub struct Warehouse {
    nodes: BTreeMap<String, Arc<Node>>,
    racks: BTreeMap<String, Rack>,
}

impl Warehouse {
    /// Validate `config` and build the graph. Any malformed entry aborts construction.
    pub fn from_config(config: &WarehouseConfig) -> Result<Self, ConfigError> {
        if config.nodes.is_empty() {
            return Err(ConfigError::EmptyWarehouse);
        }

        let mut kinds = BTreeMap::new();
        for (name, node) in &config.nodes {
            let kind = node
                .category
                .parse::<NodeKind>()
                .map_err(|category| ConfigError::UnknownCategory {
                    node: name.clone(),
                    category,
                })?;
            kinds.insert(name.as_str(), kind);
        }

        // (from, to) -> (distance, explicitly weighted)
        let mut declared: BTreeMap<(&str, &str), (f64, bool)> = BTreeMap::new();
        for (name, node) in &config.nodes {
            let listed: Vec<(&str, Option<f64>)> = match &node.neighbours {
                NeighbourSpec::Names(names) => names.iter().map(|n| (n.as_str(), None)).collect(),
                NeighbourSpec::Weighted(weights) => {
                    weights.iter().map(|(n, w)| (n.as_str(), Some(*w))).collect()
                }
            };
            for (neighbour, weight) in listed {
                if neighbour == name {
                    return Err(ConfigError::SelfLoop(name.clone()));
                }
                let Some(other) = config.nodes.get(neighbour) else {
                    return Err(ConfigError::UnknownNeighbour {
                        node: name.clone(),
                        neighbour: neighbour.to_string(),
                    });
                };
                let distance = weight
                    .unwrap_or_else(|| config.distance.between((node.x, node.y), (other.x, other.y)));
                if distance <= 0.0 || !distance.is_finite() {
                    return Err(ConfigError::NonPositiveDistance {
                        from: name.clone(),
                        to: neighbour.to_string(),
                        distance,
                    });
                }
                declared.insert((name.as_str(), neighbour), (distance, weight.is_some()));
            }
        }

        let mut adjacency: BTreeMap<&str, BTreeMap<String, f64>> =
            config.nodes.keys().map(|n| (n.as_str(), BTreeMap::new())).collect();
        for (&(from, to), &(forward, forward_explicit)) in &declared {
            let distance = match declared.get(&(to, from)) {
                Some(&(backward, backward_explicit)) => {
                    if forward_explicit && backward_explicit && (forward - backward).abs() > f64::EPSILON {
                        return Err(ConfigError::AsymmetricEdge {
                            a: from.to_string(),
                            b: to.to_string(),
                            forward,
                            backward,
                        });
                    }
                    if !forward_explicit && backward_explicit { backward } else { forward }
                }
                None => forward,
            };
            adjacency.entry(from).or_default().insert(to.to_string(), distance);
            adjacency.entry(to).or_default().insert(from.to_string(), distance);
        }

        let mut seen_coords: HashMap<(u64, u64), &str> = HashMap::new();
        let mut nodes = BTreeMap::new();
        for (name, node) in &config.nodes {
            if let Some(other) = seen_coords.insert((node.x.to_bits(), node.y.to_bits()), name) {
                warn!(node = %name, other = %other, x = node.x, y = node.y, "distinct nodes share coordinates");
            }
            let neighbours = adjacency.remove(name.as_str()).unwrap_or_default();
            nodes.insert(
                name.clone(),
                Arc::new(Node::new(name.clone(), node.x, node.y, kinds[name.as_str()], neighbours)),
            );
        }

        let mut racks = BTreeMap::new();
        for rack in &config.racks {
            let Some(center) = nodes.get(&rack.center) else {
                return Err(ConfigError::UnknownRackCenter {
                    rack: rack.id.clone(),
                    node: rack.center.clone(),
                });
            };
            if !center.is_center() {
                return Err(ConfigError::RackCenterNotCenter {
                    rack: rack.id.clone(),
                    node: rack.center.clone(),
                });
            }
            let shelves = rack
                .shelves
                .iter()
                .map(|shelf| Shelf {
                    id: shelf.id.clone(),
                    rack_id: rack.id.clone(),
                    z_level: shelf.z_level,
                    current_weight: shelf.current_weight,
                    locked: shelf.locked,
                })
                .collect();
            let built = Rack {
                id: rack.id.clone(),
                center: rack.center.clone(),
                frozen: rack.frozen,
                capacity: rack.capacity,
                shelves,
            };
            if racks.insert(rack.id.clone(), built).is_some() {
                return Err(ConfigError::DuplicateRack(rack.id.clone()));
            }
        }

        debug!(nodes = nodes.len(), racks = racks.len(), "warehouse graph built");
        Ok(Self { nodes, racks })
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.get(name)
    }

    /// First node (by name order) located at exactly `(x, y)`.
    pub fn node_at(&self, x: f64, y: f64) -> Option<&Arc<Node>> {
        self.nodes.values().find(|node| node.x() == x && node.y() == y)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn rack(&self, id: &str) -> Option<&Rack> {
        self.racks.get(id)
    }

    pub fn racks(&self) -> impl Iterator<Item = &Rack> {
        self.racks.values()
    }

    /// Heuristic table toward `goal` for `agent_type`, or `None` for an unknown goal.
    ///
    /// Base cost is the Manhattan distance to the goal. CENTER nodes get the
    /// agent type's penalty and ENTRY/EXIT nodes its aisle bonus.
    pub fn heuristics(&self, goal: &str, agent_type: AgentType) -> Option<HeuristicTable> {
        let goal = self.nodes.get(goal)?;
        let table = self
            .nodes
            .values()
            .map(|node| {
                let base = node.manhattan(goal);
                let adjusted = match node.kind() {
                    NodeKind::Center => base + agent_type.center_penalty(),
                    NodeKind::Entry | NodeKind::Exit => base - agent_type.aisle_bonus(),
                    NodeKind::Normal => base,
                };
                (node.name().to_string(), adjusted)
            })
            .collect();
        Some(table)
    }

    pub fn snapshot(&self) -> MapSnapshot {
        let nodes = self
            .nodes
            .values()
            .map(|node| NodeSnapshot {
                name: node.name().to_string(),
                x: node.x(),
                y: node.y(),
                kind: node.kind(),
                locked_by: node.lock_owner(),
                neighbours: node.neighbours().clone(),
            })
            .collect();
        MapSnapshot {
            nodes,
            racks: self.racks.values().cloned().collect(),
        }
    }
}
