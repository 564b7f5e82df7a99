//! Shared identifiers, enums, and the task model used across the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Unique identifier for an agent (picker or transporter).
pub type AgentId = u64;

/// Unique identifier for a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of a graph node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Entry,
    Exit,
    Normal,
    /// Rack position; never a waypoint target.
    Center,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Entry => "ENTRY",
            NodeKind::Exit => "EXIT",
            NodeKind::Normal => "NORMAL",
            NodeKind::Center => "CENTER",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "entry" => Ok(NodeKind::Entry),
            "exit" => Ok(NodeKind::Exit),
            "normal" => Ok(NodeKind::Normal),
            "center" => Ok(NodeKind::Center),
            _ => Err(s.to_string()),
        }
    }
}

/// Agent flavour; changes the heuristic landscape used for routing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentType {
    #[default]
    Picker,
    Transporter,
}

impl AgentType {
    /// Penalty added to CENTER nodes in the heuristic table.
    pub fn center_penalty(&self) -> f64 {
        match self {
            AgentType::Picker => 2.0,
            AgentType::Transporter => 3.0,
        }
    }

    /// Bonus subtracted from ENTRY/EXIT nodes in the heuristic table.
    pub fn aisle_bonus(&self) -> f64 {
        match self {
            AgentType::Picker => 1.0,
            AgentType::Transporter => 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    #[default]
    Idle,
    Moving,
    Working,
    Charging,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Moving => "MOVING",
            AgentStatus::Working => "WORKING",
            AgentStatus::Charging => "CHARGING",
            AgentStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job category of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskKind {
    Pick,
    Place,
    Move,
    Charge,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Pick => "PICK",
            TaskKind::Place => "PLACE",
            TaskKind::Move => "MOVE",
            TaskKind::Charge => "CHARGE",
        };
        f.write_str(name)
    }
}

/// Dispatch tier. Exactly two tiers exist.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Normal,
    High,
}

impl TryFrom<i64> for Priority {
    type Error = TaskError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Normal),
            1 => Ok(Priority::High),
            v if v < 0 => Err(TaskError::NegativePriority(v)),
            v => Err(TaskError::UnknownPriority(v)),
        }
    }
}

/// Unit of work handed to agents by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Where the work starts; may be empty when irrelevant.
    pub initial: String,
    /// Target location or task descriptor; never empty.
    pub goal: String,
    pub kind: TaskKind,
    pub priority: Priority,
}

impl Task {
    /// Construct a validated task with a fresh id.
    pub fn new(
        goal: impl Into<String>,
        kind: TaskKind,
        priority: i64,
        initial: impl Into<String>,
    ) -> Result<Self, TaskError> {
        let goal = goal.into();
        if goal.trim().is_empty() {
            return Err(TaskError::EmptyGoal);
        }
        Ok(Self {
            id: TaskId::new(),
            initial: initial.into(),
            goal,
            kind,
            priority: Priority::try_from(priority)?,
        })
    }

    pub fn is_high_priority(&self) -> bool {
        self.priority == Priority::High
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task(job={}, goal={}, priority={:?}, id={})",
            self.kind, self.goal, self.priority, self.id
        )
    }
}
