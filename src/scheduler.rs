//! Fleet coordinator: agent registry, task assignment, route execution, and the
//! periodic deadlock pass.
//!
//! Nothing here is global; a process builds as many schedulers as it has
//! warehouses. Lock order is the agent registry, then agents in ascending id,
//! then the in-flight table or resolver state. No lock is held while waiting on
//! a node: node locks are only ever tried.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::agent::{Agent, MoveOutcome};
use crate::config::EngineConfig;
use crate::deadlock::{self, DeadlockKind, ResolutionContext, ResolutionTable, Resolve, RetryState};
use crate::error::{RouteError, SchedulerError};
use crate::event_log::{EventKind, EventLog, LogEntry, LogFilter, LogSink, NullSink};
use crate::pathfinding::{find_path, Path, SearchPolicy};
use crate::task_queue::{QueuedTask, TaskQueue};
use crate::types::{AgentId, AgentStatus, AgentType, Task, TaskId};
use crate::warehouse::{MapSnapshot, Warehouse};

pub type AgentHandle = Arc<Mutex<Agent>>;

/// Result of an [`Scheduler::assign`] call that did not fail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Assignment {
    Assigned(Task),
    /// Both tiers were empty for this agent; it stays idle.
    NoTask,
    /// The agent is busy, charging or faulted and was not offered anything.
    NotIdle(AgentStatus),
}

/// Summary of one deadlock pass that found something to resolve.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolutionReport {
    pub kind: DeadlockKind,
    pub action: &'static str,
    /// False when the table's default row was used.
    pub matched_scenario: bool,
    pub agents: Vec<AgentId>,
    pub progressed: Vec<AgentId>,
    pub rerouted: Vec<(AgentId, Vec<String>)>,
    pub notes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub node: String,
    pub goal: Option<String>,
    pub battery: f64,
    pub blocked: bool,
    pub weight: f64,
}

/// Map plus agent positions, for external visualisation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FleetSnapshot {
    pub map: MapSnapshot,
    pub agents: Vec<AgentSnapshot>,
    pub queued_high: usize,
    pub queued_normal: usize,
}

pub struct Scheduler {
    warehouse: Arc<Warehouse>,
    log: Arc<EventLog>,
    config: EngineConfig,
    agents: Mutex<BTreeMap<AgentId, AgentHandle>>,
    queue: TaskQueue,
    in_flight: Mutex<HashMap<AgentId, Task>>,
    resolutions: ResolutionTable,
    retries: Mutex<HashMap<AgentId, RetryState>>,
}

impl Scheduler {
    pub fn new(warehouse: Arc<Warehouse>, resolutions: ResolutionTable) -> Self {
        Self::with_config(warehouse, resolutions, EngineConfig::default(), Arc::new(NullSink))
    }

    pub fn with_config(
        warehouse: Arc<Warehouse>,
        resolutions: ResolutionTable,
        config: EngineConfig,
        sink: Arc<dyn LogSink>,
    ) -> Self {
        let log = Arc::new(EventLog::with_sink(config.log_batch_size, sink));
        Self {
            warehouse,
            log,
            config,
            agents: Mutex::new(BTreeMap::new()),
            queue: TaskQueue::new(),
            in_flight: Mutex::new(HashMap::new()),
            resolutions,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn warehouse(&self) -> &Arc<Warehouse> {
        &self.warehouse
    }

    pub fn event_log(&self) -> &Arc<EventLog> {
        &self.log
    }

    fn registry(&self) -> MutexGuard<'_, BTreeMap<AgentId, AgentHandle>> {
        self.agents.lock().expect("agent registry mutex poisoned")
    }

    /// Create an agent on `start` and register it.
    pub fn spawn_agent(
        &self,
        id: AgentId,
        start: &str,
        agent_type: AgentType,
        weight: f64,
    ) -> Result<AgentHandle, SchedulerError> {
        let mut agents = self.registry();
        if agents.contains_key(&id) {
            return Err(SchedulerError::DuplicateAgent(id));
        }
        let node = self
            .warehouse
            .node(start)
            .ok_or_else(|| SchedulerError::UnknownNode(start.to_string()))?;
        let agent = Agent::new(id, Arc::clone(node), agent_type, weight, Arc::clone(&self.log))?
            .with_low_battery_threshold(self.config.low_battery_threshold);
        let handle = Arc::new(Mutex::new(agent));
        agents.insert(id, Arc::clone(&handle));
        info!(agent = id, node = start, ?agent_type, "agent registered");
        Ok(handle)
    }

    /// Forget an agent. Its node is released once the last handle is dropped.
    pub fn deregister(&self, id: AgentId) -> Result<(), SchedulerError> {
        let handle = self.registry().remove(&id).ok_or(SchedulerError::UnknownAgent(id))?;
        self.in_flight.lock().expect("in-flight mutex poisoned").remove(&id);
        self.retries.lock().expect("retry state mutex poisoned").remove(&id);
        drop(handle);
        Ok(())
    }

    pub fn agent(&self, id: AgentId) -> Option<AgentHandle> {
        self.registry().get(&id).cloned()
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.registry().keys().copied().collect()
    }

    fn push(&self, task: Task, agent: Option<AgentId>) -> Result<TaskId, SchedulerError> {
        if self.warehouse.node(&task.goal).is_none() {
            return Err(SchedulerError::UnknownNode(task.goal.clone()));
        }
        let id = task.id;
        let message = match agent {
            Some(agent) => format!("queued {task} for agent {agent}"),
            None => format!("queued {task}"),
        };
        self.queue
            .push(QueuedTask { task, agent })
            .map_err(|_| SchedulerError::QueueClosed)?;
        self.log.log_event(EventKind::TaskEnqueued, message, agent, Some(id));
        Ok(id)
    }

    /// Queue a task for any idle agent.
    pub fn enqueue(&self, task: Task) -> Result<TaskId, SchedulerError> {
        self.push(task, None)
    }

    /// Queue a task that only `agent` may take.
    pub fn order(&self, agent: AgentId, task: Task) -> Result<TaskId, SchedulerError> {
        if !self.registry().contains_key(&agent) {
            return Err(SchedulerError::UnknownAgent(agent));
        }
        self.push(task, Some(agent))
    }

    pub fn close_queue(&self) {
        self.queue.close();
    }

    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }

    /// Offer the next eligible task to an idle agent.
    pub fn assign(&self, agent_id: AgentId) -> Result<Assignment, SchedulerError> {
        let handle = self.agent(agent_id).ok_or(SchedulerError::UnknownAgent(agent_id))?;
        let mut agent = handle.lock().expect("agent mutex poisoned");
        if !agent.is_idle() {
            return Ok(Assignment::NotIdle(agent.status()));
        }
        let Some(entry) = self.queue.take_for(agent_id) else {
            self.log.log_event(
                EventKind::NoTaskAvailable,
                format!("no task available for agent {agent_id}"),
                Some(agent_id),
                None,
            );
            return Ok(Assignment::NoTask);
        };
        if let Err(err) = agent.set_goal(&entry.task.goal) {
            self.queue.requeue(entry);
            return Err(err.into());
        }
        let task = entry.task;
        self.log.log_event(
            EventKind::TaskAssigned,
            format!("assigned {task} to agent {agent_id}"),
            Some(agent_id),
            Some(task.id),
        );
        self.in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .insert(agent_id, task.clone());
        Ok(Assignment::Assigned(task))
    }

    pub fn task_in_flight(&self, agent_id: AgentId) -> Option<Task> {
        self.in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .get(&agent_id)
            .cloned()
    }

    /// Finish the agent's in-flight task and return it to IDLE.
    pub fn complete_task(&self, agent_id: AgentId) -> Result<Task, SchedulerError> {
        let handle = self.agent(agent_id).ok_or(SchedulerError::UnknownAgent(agent_id))?;
        let mut agent = handle.lock().expect("agent mutex poisoned");
        let task = self
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .remove(&agent_id)
            .ok_or(SchedulerError::NoTaskInFlight(agent_id))?;
        if let Err(err) = agent.complete_task(&task) {
            self.in_flight
                .lock()
                .expect("in-flight mutex poisoned")
                .insert(agent_id, task);
            return Err(err.into());
        }
        Ok(task)
    }

    /// Give up on the agent's in-flight task; the agent returns to IDLE where it stands.
    pub fn abandon_task(&self, agent_id: AgentId) -> Result<Task, SchedulerError> {
        let handle = self.agent(agent_id).ok_or(SchedulerError::UnknownAgent(agent_id))?;
        let mut agent = handle.lock().expect("agent mutex poisoned");
        let task = self
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .remove(&agent_id)
            .ok_or(SchedulerError::NoTaskInFlight(agent_id))?;
        if !agent.is_idle() {
            agent.clear_goal()?;
        }
        self.log.log_event(
            EventKind::RouteFailed,
            format!("abandoned {task} at {}", agent.current_node()),
            Some(agent_id),
            Some(task.id),
        );
        Ok(task)
    }

    /// Plan a route for `agent_id` to `target` and walk it, one locked step at a time.
    ///
    /// Returns the full route on arrival. The first refused step aborts the rest
    /// and reports the nodes actually travelled.
    pub fn request_route(&self, agent_id: AgentId, target: &str) -> Result<Path, RouteError> {
        let handle = self.agent(agent_id).ok_or(RouteError::UnknownAgent(agent_id))?;
        let goal = self
            .warehouse
            .node(target)
            .ok_or_else(|| RouteError::UnknownNode(target.to_string()))?;
        if goal.is_center() {
            return Err(RouteError::CenterTarget(target.to_string()));
        }

        let mut agent = handle.lock().expect("agent mutex poisoned");
        let heuristics = self
            .warehouse
            .heuristics(goal.name(), agent.agent_type())
            .ok_or_else(|| RouteError::UnknownNode(target.to_string()))?;
        let start = Arc::clone(agent.current_node());
        let Some(path) = find_path(
            &self.warehouse,
            &start,
            goal,
            &heuristics,
            &SearchPolicy::for_agent(agent_id),
        ) else {
            self.log.log_event(
                EventKind::RouteFailed,
                format!("no path from {start} to {target}"),
                Some(agent_id),
                None,
            );
            return Err(RouteError::NoPath {
                from: start.name().to_string(),
                to: target.to_string(),
            });
        };

        if agent.goal() != Some(target) || agent.status() != AgentStatus::Moving {
            agent.set_goal(target)?;
        }
        debug!(agent = agent_id, route = ?path.names(), cost = path.cost(), "walking route");

        let mut travelled = vec![start.name().to_string()];
        for step in path.nodes().iter().skip(1) {
            match agent.move_to(step)? {
                MoveOutcome::Moved => travelled.push(step.name().to_string()),
                MoveOutcome::Blocked { holder } => {
                    self.log.log_event(
                        EventKind::RouteFailed,
                        format!("route to {target} interrupted at {step} (held by {holder:?})"),
                        Some(agent_id),
                        None,
                    );
                    return Err(RouteError::Interrupted {
                        travelled,
                        blocked_at: step.name().to_string(),
                        holder,
                    });
                }
            }
        }

        let has_task = self
            .in_flight
            .lock()
            .expect("in-flight mutex poisoned")
            .contains_key(&agent_id);
        if has_task {
            agent.begin_work()?;
        } else {
            agent.clear_goal()?;
        }
        Ok(path)
    }

    /// One detection pass, resolved through the table. `None` when nothing is stuck.
    pub fn detect_and_resolve(&self) -> Option<ResolutionReport> {
        let handles: Vec<AgentHandle> = self.registry().values().cloned().collect();
        // Registry order is ascending id, so concurrent passes lock agents in the same order.
        let mut guards: Vec<MutexGuard<'_, Agent>> = handles
            .iter()
            .map(|handle| handle.lock().expect("agent mutex poisoned"))
            .collect();

        let detection = {
            let views: Vec<&Agent> = guards.iter().map(|guard| &**guard).collect();
            deadlock::detect(&views, &self.warehouse)
        };
        let mut retries = self.retries.lock().expect("retry state mutex poisoned");
        let Some(detection) = detection else {
            retries.clear();
            return None;
        };

        self.log.log_event(
            EventKind::DeadlockDetected,
            format!("{} involving agents {:?}", detection.kind, detection.agents),
            detection.agents.first().copied(),
            None,
        );
        let (scenario, matched_scenario) = self.resolutions.lookup(detection.kind);

        let outcome = {
            let mut involved: Vec<&mut Agent> = guards
                .iter_mut()
                .filter(|guard| detection.agents.contains(&guard.id()))
                .map(|guard| &mut **guard)
                .collect();
            let mut ctx = ResolutionContext {
                warehouse: &self.warehouse,
                retries: &mut *retries,
                now: Instant::now(),
            };
            scenario.action.resolve(&mut involved, &mut ctx)
        };
        retries.retain(|id, _| guards.iter().any(|guard| guard.id() == *id && guard.is_blocked()));

        let report = ResolutionReport {
            kind: detection.kind,
            action: scenario.action.name(),
            matched_scenario,
            agents: detection.agents,
            progressed: outcome.progressed,
            rerouted: outcome
                .rerouted
                .into_iter()
                .map(|(id, path)| (id, path.names()))
                .collect(),
            notes: outcome.notes,
        };
        self.log.log_event(
            EventKind::DeadlockResolution,
            format!(
                "{} via {}: progressed {:?}{}",
                report.kind,
                report.action,
                report.progressed,
                if report.notes.is_empty() {
                    String::new()
                } else {
                    format!(" ({})", report.notes.join("; "))
                }
            ),
            report.agents.first().copied(),
            None,
        );
        Some(report)
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        let handles: Vec<AgentHandle> = self.registry().values().cloned().collect();
        let agents = handles
            .iter()
            .map(|handle| {
                let agent = handle.lock().expect("agent mutex poisoned");
                AgentSnapshot {
                    id: agent.id(),
                    agent_type: agent.agent_type(),
                    status: agent.status(),
                    node: agent.current_node().name().to_string(),
                    goal: agent.goal().map(str::to_string),
                    battery: agent.battery(),
                    blocked: agent.is_blocked(),
                    weight: agent.weight(),
                }
            })
            .collect();
        let (queued_high, queued_normal) = self.queue.tier_lengths();
        FleetSnapshot {
            map: self.warehouse.snapshot(),
            agents,
            queued_high,
            queued_normal,
        }
    }

    pub fn get_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.log.get_logs(filter)
    }

    pub fn flush_logs(&self) {
        self.log.flush();
    }
}
