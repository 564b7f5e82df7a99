//! Agent state machine.
//!
//! An agent always owns exactly one node lock: the lock of its current node.
//! Every movement takes the new lock before releasing the old one, so a failed
//! attempt leaves the agent exactly where it was.

use std::fmt;
use std::sync::Arc;

use crate::config::DEFAULT_LOW_BATTERY_THRESHOLD;
use crate::error::AgentError;
use crate::event_log::{EventKind, EventLog};
use crate::node::Node;
use crate::types::{AgentId, AgentStatus, AgentType, Task};

/// Result of a movement attempt that did not violate any invariant.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveOutcome {
    Moved,
    /// The target was locked; nothing changed.
    Blocked { holder: Option<AgentId> },
}

impl MoveOutcome {
    pub fn is_moved(&self) -> bool {
        matches!(self, MoveOutcome::Moved)
    }
}

pub struct Agent {
    id: AgentId,
    weight: f64,
    agent_type: AgentType,
    status: AgentStatus,
    goal: Option<String>,
    current: Arc<Node>,
    /// Visited nodes; never empty, last element is `current`.
    history: Vec<Arc<Node>>,
    battery: f64,
    low_battery_threshold: f64,
    /// Set by a refused move, cleared by any successful movement.
    blocked: bool,
    pending_target: Option<Arc<Node>>,
    log: Arc<EventLog>,
}

impl Agent {
    /// Bind a new agent to `start`. Fails if the start node is already locked.
    pub fn new(
        id: AgentId,
        start: Arc<Node>,
        agent_type: AgentType,
        weight: f64,
        log: Arc<EventLog>,
    ) -> Result<Self, AgentError> {
        if !start.try_lock(id) {
            return Err(AgentError::StartNodeLocked {
                agent: id,
                node: start.name().to_string(),
            });
        }
        log.log_event(
            EventKind::AgentCreation,
            format!("agent {id} ({agent_type:?}) created at {start}"),
            Some(id),
            None,
        );
        Ok(Self {
            id,
            weight,
            agent_type,
            status: AgentStatus::Idle,
            goal: None,
            history: vec![Arc::clone(&start)],
            current: start,
            battery: 100.0,
            low_battery_threshold: DEFAULT_LOW_BATTERY_THRESHOLD,
            blocked: false,
            pending_target: None,
            log,
        })
    }

    pub fn with_low_battery_threshold(mut self, threshold: f64) -> Self {
        self.low_battery_threshold = threshold;
        self
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    pub fn goal(&self) -> Option<&str> {
        self.goal.as_deref()
    }

    pub fn current_node(&self) -> &Arc<Node> {
        &self.current
    }

    pub fn history(&self) -> &[Arc<Node>] {
        &self.history
    }

    pub fn history_names(&self) -> Vec<String> {
        self.history.iter().map(|n| n.name().to_string()).collect()
    }

    pub fn last_node(&self) -> &Arc<Node> {
        &self.current
    }

    pub fn battery(&self) -> f64 {
        self.battery
    }

    /// True after a refused move with no progress since.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    /// Node the agent last failed to enter, while still blocked.
    pub fn pending_target(&self) -> Option<&Arc<Node>> {
        self.pending_target.as_ref()
    }

    fn ensure_operational(&self) -> Result<(), AgentError> {
        if self.status == AgentStatus::Error {
            return Err(AgentError::Faulted(self.id));
        }
        Ok(())
    }

    fn log(&self, kind: EventKind, message: String) {
        self.log.log_event(kind, message, Some(self.id), None);
    }

    fn set_status(&mut self, status: AgentStatus) {
        if self.status != status {
            let previous = self.status;
            self.status = status;
            self.log(EventKind::StatusChange, format!("{previous} -> {status}"));
        }
    }

    /// Enter the ERROR state after an unrecoverable fault.
    pub(crate) fn fault(&mut self, reason: &str) {
        self.log(EventKind::StatusChange, format!("fault: {reason}"));
        self.status = AgentStatus::Error;
    }

    /// Drop the pending move and the blocked mark without moving.
    pub(crate) fn abandon_pending(&mut self) {
        self.blocked = false;
        self.pending_target = None;
    }

    /// Swap the held lock from the current node to `target`, which is already locked by us.
    fn relocate(&mut self, target: &Arc<Node>) -> Result<(), AgentError> {
        if !self.current.unlock(self.id) {
            target.unlock(self.id);
            let node = self.current.name().to_string();
            self.fault(&format!("lost lock on {node}"));
            return Err(AgentError::LockInvariant { agent: self.id, node });
        }
        self.current = Arc::clone(target);
        self.blocked = false;
        self.pending_target = None;
        Ok(())
    }

    /// Try to step onto `target`. A locked target yields `Blocked` without mutation.
    pub fn move_to(&mut self, target: &Arc<Node>) -> Result<MoveOutcome, AgentError> {
        self.ensure_operational()?;
        if target.name() == self.current.name() {
            return Err(AgentError::AlreadyAt {
                agent: self.id,
                node: target.name().to_string(),
            });
        }
        if !target.try_lock(self.id) {
            let holder = target.lock_owner();
            self.blocked = true;
            self.pending_target = Some(Arc::clone(target));
            self.log(
                EventKind::MovementFailed,
                format!("failed to move to {target}: node locked by {holder:?}"),
            );
            return Ok(MoveOutcome::Blocked { holder });
        }
        self.relocate(target)?;
        self.history.push(Arc::clone(target));
        self.log(EventKind::Movement, format!("moved to {target}"));
        Ok(MoveOutcome::Moved)
    }

    /// Return to the node visited `steps` moves ago, dropping the last `steps` history entries.
    pub fn backtrack(&mut self, steps: usize) -> Result<MoveOutcome, AgentError> {
        self.ensure_operational()?;
        if steps == 0 {
            self.log(EventKind::BacktrackFailed, "invalid number of steps: 0".to_string());
            return Err(AgentError::InvalidSteps { agent: self.id, steps });
        }
        if self.history.len() <= steps {
            self.log(
                EventKind::BacktrackFailed,
                format!("not enough path history to backtrack {steps} steps"),
            );
            return Err(AgentError::InsufficientHistory {
                agent: self.id,
                steps,
                history: self.history.len(),
            });
        }

        let target = Arc::clone(&self.history[self.history.len() - steps - 1]);
        let keep = self.history.len() - steps;
        if target.name() != self.current.name() {
            if !target.try_lock(self.id) {
                let holder = target.lock_owner();
                self.log(
                    EventKind::BacktrackFailed,
                    format!("failed to backtrack to {target}: node locked by {holder:?}"),
                );
                return Ok(MoveOutcome::Blocked { holder });
            }
            self.relocate(&target)?;
        } else {
            // The path revisited this node; only the history shrinks.
            self.blocked = false;
            self.pending_target = None;
        }
        self.history.truncate(keep);
        self.log(EventKind::Backtrack, format!("backtracked {steps} steps to {target}"));
        Ok(MoveOutcome::Moved)
    }

    pub fn set_goal(&mut self, goal: &str) -> Result<(), AgentError> {
        self.ensure_operational()?;
        if goal.trim().is_empty() {
            return Err(AgentError::EmptyGoal(self.id));
        }
        if self.status == AgentStatus::Charging {
            return Err(AgentError::InvalidTransition {
                agent: self.id,
                action: "take a goal",
                status: self.status.as_str(),
            });
        }
        self.goal = Some(goal.to_string());
        self.log(EventKind::GoalChange, format!("goal set to {goal}"));
        self.set_status(AgentStatus::Moving);
        Ok(())
    }

    /// Mark arrival at the goal: MOVING -> WORKING.
    pub fn begin_work(&mut self) -> Result<(), AgentError> {
        self.ensure_operational()?;
        if self.status != AgentStatus::Moving {
            return Err(AgentError::InvalidTransition {
                agent: self.id,
                action: "begin work",
                status: self.status.as_str(),
            });
        }
        self.set_status(AgentStatus::Working);
        Ok(())
    }

    pub fn complete_task(&mut self, task: &Task) -> Result<(), AgentError> {
        self.ensure_operational()?;
        self.goal = None;
        self.blocked = false;
        self.pending_target = None;
        self.log.log_event(
            EventKind::TaskCompletion,
            format!("completed task {} to goal {}", task.kind, task.goal),
            Some(self.id),
            Some(task.id),
        );
        self.set_status(AgentStatus::Idle);
        Ok(())
    }

    /// Drop the goal without a task to complete: MOVING or WORKING -> IDLE.
    pub fn clear_goal(&mut self) -> Result<(), AgentError> {
        self.ensure_operational()?;
        if !matches!(self.status, AgentStatus::Moving | AgentStatus::Working) {
            return Err(AgentError::InvalidTransition {
                agent: self.id,
                action: "clear goal",
                status: self.status.as_str(),
            });
        }
        if let Some(goal) = self.goal.take() {
            self.log(EventKind::GoalChange, format!("goal {goal} cleared"));
        }
        self.blocked = false;
        self.pending_target = None;
        self.set_status(AgentStatus::Idle);
        Ok(())
    }

    pub fn begin_charging(&mut self) -> Result<(), AgentError> {
        self.ensure_operational()?;
        if self.status != AgentStatus::Idle {
            return Err(AgentError::InvalidTransition {
                agent: self.id,
                action: "start charging",
                status: self.status.as_str(),
            });
        }
        self.set_status(AgentStatus::Charging);
        Ok(())
    }

    pub fn finish_charging(&mut self) -> Result<(), AgentError> {
        if self.status != AgentStatus::Charging {
            return Err(AgentError::InvalidTransition {
                agent: self.id,
                action: "finish charging",
                status: self.status.as_str(),
            });
        }
        self.set_status(AgentStatus::Idle);
        Ok(())
    }

    /// Store a battery reading clamped to [0, 100]; warns below the low threshold.
    pub fn update_battery(&mut self, level: f64) {
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 100.0) };
        self.battery = level;
        if level < self.low_battery_threshold {
            self.log(EventKind::BatteryLow, format!("battery low ({level}%)"));
        }
    }

    /// Forget visited nodes, keeping only the current one.
    pub fn clear_path_history(&mut self) {
        self.history.clear();
        self.history.push(Arc::clone(&self.current));
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        if self.current.lock_owner() == Some(self.id) {
            self.current.unlock(self.id);
        }
        self.log(EventKind::AgentRemoved, format!("agent {} released {}", self.id, self.current));
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("type", &self.agent_type)
            .field("status", &self.status)
            .field("node", &self.current.name())
            .field("goal", &self.goal)
            .field("blocked", &self.blocked)
            .finish()
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Agent({}, {}, {})", self.id, self.status, self.current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{grid_name, WarehouseConfig};
    use crate::event_log::LogFilter;
    use crate::types::TaskKind;
    use crate::warehouse::Warehouse;

    fn setup() -> (Warehouse, Arc<EventLog>) {
        let warehouse = Warehouse::from_config(&WarehouseConfig::grid(4, 1)).expect("valid grid");
        (warehouse, Arc::new(EventLog::new()))
    }

    fn node(warehouse: &Warehouse, x: u32) -> Arc<Node> {
        Arc::clone(warehouse.node(&grid_name(x, 0)).expect("node exists"))
    }

    fn spawn(warehouse: &Warehouse, log: &Arc<EventLog>, id: AgentId, x: u32) -> Agent {
        Agent::new(id, node(warehouse, x), AgentType::Picker, 1.0, Arc::clone(log)).expect("start free")
    }

    #[test]
    fn creation_locks_start_and_rejects_occupied_start() {
        let (warehouse, log) = setup();
        let agent = spawn(&warehouse, &log, 1, 0);
        assert_eq!(agent.current_node().lock_owner(), Some(1));
        assert_eq!(agent.history().len(), 1);

        let err = Agent::new(2, node(&warehouse, 0), AgentType::Picker, 1.0, Arc::clone(&log))
            .expect_err("start is taken");
        assert!(matches!(err, AgentError::StartNodeLocked { agent: 2, .. }));
        assert_eq!(log.get_logs(&LogFilter::kind(EventKind::AgentCreation)).len(), 1);
    }

    #[test]
    fn move_transfers_lock_and_extends_history() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        let target = node(&warehouse, 1);
        assert_eq!(agent.move_to(&target), Ok(MoveOutcome::Moved));
        assert_eq!(target.lock_owner(), Some(1));
        assert!(!node(&warehouse, 0).is_locked());
        assert_eq!(agent.history_names(), vec![grid_name(0, 0), grid_name(1, 0)]);
        assert_eq!(log.get_logs(&LogFilter::kind(EventKind::Movement)).len(), 1);
    }

    #[test]
    fn refused_move_changes_nothing_and_marks_blocked() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        let _other = spawn(&warehouse, &log, 2, 1);
        let outcome = agent.move_to(&node(&warehouse, 1)).expect("no invariant broken");
        assert_eq!(outcome, MoveOutcome::Blocked { holder: Some(2) });
        assert_eq!(agent.current_node().name(), grid_name(0, 0));
        assert_eq!(agent.history().len(), 1);
        assert!(agent.is_blocked());
        assert_eq!(agent.pending_target().map(|n| n.name().to_string()), Some(grid_name(1, 0)));
        assert_eq!(log.get_logs(&LogFilter::kind(EventKind::MovementFailed)).len(), 1);
    }

    #[test]
    fn moving_onto_own_node_is_rejected() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        let here = node(&warehouse, 0);
        assert!(matches!(agent.move_to(&here), Err(AgentError::AlreadyAt { .. })));
        assert_eq!(here.lock_owner(), Some(1));
    }

    #[test]
    fn backtrack_bounds_are_enforced() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        assert!(agent.move_to(&node(&warehouse, 1)).expect("ok").is_moved());

        assert!(matches!(agent.backtrack(0), Err(AgentError::InvalidSteps { .. })));
        assert!(matches!(agent.backtrack(2), Err(AgentError::InsufficientHistory { .. })));
        assert_eq!(agent.history().len(), 2);
        assert_eq!(log.get_logs(&LogFilter::kind(EventKind::BacktrackFailed)).len(), 2);
    }

    #[test]
    fn backtrack_returns_to_earlier_node_and_truncates() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        for x in 1..=3 {
            assert!(agent.move_to(&node(&warehouse, x)).expect("ok").is_moved());
        }
        assert_eq!(agent.backtrack(2), Ok(MoveOutcome::Moved));
        assert_eq!(agent.current_node().name(), grid_name(1, 0));
        assert_eq!(agent.history_names(), vec![grid_name(0, 0), grid_name(1, 0)]);
        assert_eq!(node(&warehouse, 1).lock_owner(), Some(1));
        assert!(!node(&warehouse, 3).is_locked());
    }

    #[test]
    fn backtrack_onto_locked_node_is_blocked_without_mutation() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        assert!(agent.move_to(&node(&warehouse, 1)).expect("ok").is_moved());
        let _intruder = spawn(&warehouse, &log, 2, 0);
        assert_eq!(agent.backtrack(1), Ok(MoveOutcome::Blocked { holder: Some(2) }));
        assert_eq!(agent.current_node().name(), grid_name(1, 0));
        assert_eq!(agent.history().len(), 2);
    }

    #[test]
    fn goal_and_task_lifecycle() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        assert!(matches!(agent.set_goal(""), Err(AgentError::EmptyGoal(1))));
        agent.set_goal("n_3_0").expect("valid goal");
        assert_eq!(agent.status(), AgentStatus::Moving);
        agent.begin_work().expect("moving agent can work");
        assert_eq!(agent.status(), AgentStatus::Working);

        let task = Task::new("n_3_0", TaskKind::Pick, 0, "").expect("valid task");
        agent.complete_task(&task).expect("operational");
        assert!(agent.is_idle());
        assert_eq!(agent.goal(), None);
        let done = log.get_logs(&LogFilter::kind(EventKind::TaskCompletion));
        assert_eq!(done[0].task_id, Some(task.id));
        assert_eq!(done[0].agent_id, Some(1));
    }

    #[test]
    fn clearing_goal_returns_to_idle() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        assert!(matches!(agent.clear_goal(), Err(AgentError::InvalidTransition { .. })));
        agent.set_goal("n_2_0").expect("valid goal");
        agent.clear_goal().expect("moving agent");
        assert!(agent.is_idle());
        assert_eq!(agent.goal(), None);
    }

    #[test]
    fn charging_blocks_new_goals() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        agent.begin_charging().expect("idle agent can charge");
        assert!(matches!(agent.set_goal("n_1_0"), Err(AgentError::InvalidTransition { .. })));
        agent.finish_charging().expect("charging");
        assert!(agent.is_idle());
    }

    #[test]
    fn battery_is_clamped_and_low_level_is_reported() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        agent.update_battery(150.0);
        assert_eq!(agent.battery(), 100.0);
        agent.update_battery(-5.0);
        assert_eq!(agent.battery(), 0.0);
        agent.update_battery(50.0);
        assert_eq!(log.get_logs(&LogFilter::kind(EventKind::BatteryLow)).len(), 1);
    }

    #[test]
    fn clear_history_keeps_current_node() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        assert!(agent.move_to(&node(&warehouse, 1)).expect("ok").is_moved());
        agent.clear_path_history();
        assert_eq!(agent.history_names(), vec![grid_name(1, 0)]);
        assert_eq!(agent.last_node().name(), grid_name(1, 0));
    }

    #[test]
    fn lost_lock_faults_the_agent() {
        let (warehouse, log) = setup();
        let mut agent = spawn(&warehouse, &log, 1, 0);
        // Someone releases the agent's node behind its back.
        assert!(node(&warehouse, 0).unlock(1));

        let target = node(&warehouse, 1);
        assert_eq!(
            agent.move_to(&target),
            Err(AgentError::LockInvariant {
                agent: 1,
                node: grid_name(0, 0),
            })
        );
        assert!(!target.is_locked());
        assert_eq!(agent.status(), AgentStatus::Error);
        assert_eq!(agent.current_node().name(), grid_name(0, 0));

        assert_eq!(agent.move_to(&node(&warehouse, 2)), Err(AgentError::Faulted(1)));
        assert_eq!(agent.set_goal("n_3_0"), Err(AgentError::Faulted(1)));
        assert_eq!(agent.backtrack(1), Err(AgentError::Faulted(1)));
        assert!(!node(&warehouse, 2).is_locked());
    }

    #[test]
    fn dropping_agent_releases_its_node() {
        let (warehouse, log) = setup();
        let agent = spawn(&warehouse, &log, 1, 2);
        drop(agent);
        assert!(!node(&warehouse, 2).is_locked());
        assert_eq!(log.get_logs(&LogFilter::kind(EventKind::AgentRemoved)).len(), 1);
    }
}
