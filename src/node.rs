//! Graph nodes and the per-node exclusive lock.
//!
//! The lock is a try-once primitive: `try_lock` never waits, so a caller that
//! loses the race gets `false` back immediately and decides what to do next.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use tracing::warn;

use crate::types::{AgentId, NodeKind};

/// A named, located point in the warehouse and the unit of exclusive occupancy.
pub struct Node {
    name: String,
    x: f64,
    y: f64,
    kind: NodeKind,
    /// Neighbour name -> positive traversal distance.
    neighbours: BTreeMap<String, f64>,
    owner: Mutex<Option<AgentId>>,
}

impl Node {
    pub(crate) fn new(
        name: impl Into<String>,
        x: f64,
        y: f64,
        kind: NodeKind,
        neighbours: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            name: name.into(),
            x,
            y,
            kind,
            neighbours,
            owner: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn y(&self) -> f64 {
        self.y
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_center(&self) -> bool {
        self.kind == NodeKind::Center
    }

    pub fn neighbours(&self) -> &BTreeMap<String, f64> {
        &self.neighbours
    }

    /// Distance to an adjacent node, if `other` is a neighbour.
    pub fn distance_to(&self, other: &str) -> Option<f64> {
        self.neighbours.get(other).copied()
    }

    pub fn manhattan(&self, other: &Node) -> f64 {
        (self.x - other.x).abs() + (self.y - other.y).abs()
    }

    /// Take the lock for `owner` iff nobody holds it.
    pub fn try_lock(&self, owner: AgentId) -> bool {
        let mut guard = self.owner.lock().expect("node lock mutex poisoned");
        if guard.is_some() {
            return false;
        }
        *guard = Some(owner);
        true
    }

    /// Release the lock iff it is held by exactly `owner`.
    pub fn unlock(&self, owner: AgentId) -> bool {
        let mut guard = self.owner.lock().expect("node lock mutex poisoned");
        match *guard {
            Some(current) if current == owner => {
                *guard = None;
                true
            }
            Some(current) => {
                warn!(node = %self.name, owner = current, caller = owner, "unlock by non-owner refused");
                false
            }
            None => {
                warn!(node = %self.name, caller = owner, "unlock on unlocked node refused");
                false
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner().is_some()
    }

    pub fn lock_owner(&self) -> Option<AgentId> {
        *self.owner.lock().expect("node lock mutex poisoned")
    }

    /// True when the node is locked by someone other than `agent`.
    pub fn is_locked_by_other(&self, agent: AgentId) -> bool {
        matches!(self.lock_owner(), Some(owner) if owner != agent)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Node {}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("kind", &self.kind)
            .field("owner", &self.lock_owner())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {})", self.name, self.x, self.y)
    }
}
