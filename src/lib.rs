//! Coordination engine for a fleet of warehouse agents.
//!
//! Agents move over a shared graph of nodes, each of which can be occupied by at
//! most one agent. Occupancy is a try-lock: a refused move is an ordinary
//! outcome, and stuck agents are untangled by a periodic, table-driven deadlock
//! pass run from [`Scheduler::detect_and_resolve`].

pub mod agent;
pub mod config;
pub mod deadlock;
pub mod error;
pub mod event_log;
pub mod logging;
pub mod node;
pub mod pathfinding;
pub mod scheduler;
pub mod task_queue;
pub mod tick;
pub mod types;
pub mod warehouse;

pub use agent::{Agent, MoveOutcome};
pub use config::{DeadlockTableConfig, EngineConfig, WarehouseConfig};
pub use deadlock::{DeadlockKind, ResolutionAction, ResolutionTable};
pub use error::{AgentError, ConfigError, LogSinkError, RouteError, SchedulerError, TaskError};
pub use event_log::{
    EventKind, EventLog, JsonLinesSink, LogEntry, LogFilter, LogSink, MemorySink,
};
pub use node::Node;
pub use pathfinding::{find_path, Path, SearchPolicy};
pub use scheduler::{Assignment, ResolutionReport, Scheduler};
pub use tick::TickClock;
pub use types::{AgentId, AgentStatus, AgentType, NodeKind, Priority, Task, TaskId, TaskKind};
pub use warehouse::Warehouse;
