//! Error types for every failure class of the engine.
//!
//! Lock contention is absent: a refused lock is an ordinary
//! [`MoveOutcome::Blocked`](crate::agent::MoveOutcome) value, not an error.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::AgentId;

/// Malformed warehouse or deadlock-table input. Fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("node {node}: unknown category {category:?}")]
    UnknownCategory { node: String, category: String },

    #[error("node {node}: neighbour {neighbour} does not exist")]
    UnknownNeighbour { node: String, neighbour: String },

    #[error("edge {from} -> {to}: distance must be positive, got {distance}")]
    NonPositiveDistance { from: String, to: String, distance: f64 },

    #[error("edge {a} <-> {b}: conflicting distances {forward} and {backward}")]
    AsymmetricEdge {
        a: String,
        b: String,
        forward: f64,
        backward: f64,
    },

    #[error("node {0} lists itself as a neighbour")]
    SelfLoop(String),

    #[error("rack {rack}: centre node {node} does not exist")]
    UnknownRackCenter { rack: String, node: String },

    #[error("rack {rack}: centre node {node} is not a CENTER node")]
    RackCenterNotCenter { rack: String, node: String },

    #[error("duplicate rack id {0}")]
    DuplicateRack(String),

    #[error("unknown deadlock resolution action {0:?}")]
    UnknownAction(String),

    #[error("invalid parameters for {action}: {source}")]
    InvalidParameters {
        action: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid {parameter} for {action}: {value} (expected a finite number of seconds >= 0)")]
    ParameterOutOfRange {
        action: String,
        parameter: &'static str,
        value: f64,
    },

    #[error("unknown deadlock scenario {0:?}")]
    UnknownScenario(String),

    #[error("warehouse has no nodes")]
    EmptyWarehouse,
}

/// Rejected task construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task goal cannot be empty")]
    EmptyGoal,

    #[error("priority cannot be negative, got {0}")]
    NegativePriority(i64),

    #[error("priority must be 0 (normal) or 1 (high), got {0}")]
    UnknownPriority(i64),
}

/// Invariant violations raised by agent operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent {agent}: start node {node} is already locked")]
    StartNodeLocked { agent: AgentId, node: String },

    #[error("agent {agent}: already at node {node}")]
    AlreadyAt { agent: AgentId, node: String },

    #[error("agent {agent}: invalid backtrack step count {steps}")]
    InvalidSteps { agent: AgentId, steps: usize },

    #[error("agent {agent}: cannot backtrack {steps} steps with {history} nodes of history")]
    InsufficientHistory {
        agent: AgentId,
        steps: usize,
        history: usize,
    },

    #[error("agent {0}: goal cannot be empty")]
    EmptyGoal(AgentId),

    #[error("agent {0} is in the ERROR state")]
    Faulted(AgentId),

    #[error("agent {agent}: cannot {action} while {status}")]
    InvalidTransition {
        agent: AgentId,
        action: &'static str,
        status: &'static str,
    },

    #[error("agent {agent}: lost ownership of node {node}")]
    LockInvariant { agent: AgentId, node: String },
}

/// A log sink refused or failed to store a batch; the batch stays pending.
#[derive(Error, Debug)]
pub enum LogSinkError {
    #[error("log sink unavailable: {0}")]
    Unavailable(String),

    #[error("log sink I/O failed")]
    Io(#[from] std::io::Error),

    #[error("log entry serialisation failed")]
    Serialize(#[from] serde_json::Error),
}

/// Failure of a route request.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouteError {
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("node {0} is a rack centre and cannot be a route target")]
    CenterTarget(String),

    #[error("no path from {from} to {to}")]
    NoPath { from: String, to: String },

    #[error("route interrupted at {blocked_at} after {} step(s)", .travelled.len().saturating_sub(1))]
    Interrupted {
        /// Nodes actually visited, starting with the agent's start node.
        travelled: Vec<String>,
        blocked_at: String,
        holder: Option<AgentId>,
    },

    #[error(transparent)]
    Agent(#[from] AgentError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    #[error("agent {0} is already registered")]
    DuplicateAgent(AgentId),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("agent {0} has no task in flight")]
    NoTaskInFlight(AgentId),

    #[error("task queue is closed")]
    QueueClosed,

    #[error(transparent)]
    Agent(#[from] AgentError),
}
