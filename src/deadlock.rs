//! Deadlock detection and table-driven resolution.
//!
//! Detection only classifies the situation. What to do about it is looked up in a
//! [`ResolutionTable`] whose rows are typed [`ResolutionAction`] variants, so
//! policies can be swapped by configuration without touching the detector.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::{Agent, MoveOutcome};
use crate::config::{DeadlockTableConfig, ScenarioConfig};
use crate::error::ConfigError;
use crate::node::Node;
use crate::pathfinding::{find_path, Path, SearchPolicy};
use crate::types::{AgentId, AgentStatus};
use crate::warehouse::Warehouse;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlockKind {
    /// Exactly one agent is blocked.
    AgentBlocked,
    /// More than one agent is blocked.
    AgentsBlocked,
    /// Nobody is blocked, but a moving agent cannot reach its goal.
    PathBlocked,
}

impl DeadlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadlockKind::AgentBlocked => "agent_blocked",
            DeadlockKind::AgentsBlocked => "agents_blocked",
            DeadlockKind::PathBlocked => "path_blocked",
        }
    }
}

impl fmt::Display for DeadlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadlockKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent_blocked" => Ok(DeadlockKind::AgentBlocked),
            "agents_blocked" => Ok(DeadlockKind::AgentsBlocked),
            "path_blocked" => Ok(DeadlockKind::PathBlocked),
            other => Err(ConfigError::UnknownScenario(other.to_string())),
        }
    }
}

/// A classified deadlock and the agents involved, in ascending id order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detection {
    pub kind: DeadlockKind,
    pub agents: Vec<AgentId>,
}

/// Scan `agents` for blocked ones; if none, look for moving agents whose goal is unreachable.
pub fn detect(agents: &[&Agent], warehouse: &Warehouse) -> Option<Detection> {
    let mut blocked: Vec<AgentId> = agents.iter().filter(|a| a.is_blocked()).map(|a| a.id()).collect();
    blocked.sort_unstable();
    match blocked.len() {
        0 => {}
        1 => {
            return Some(Detection {
                kind: DeadlockKind::AgentBlocked,
                agents: blocked,
            });
        }
        _ => {
            return Some(Detection {
                kind: DeadlockKind::AgentsBlocked,
                agents: blocked,
            });
        }
    }

    let mut stranded: Vec<AgentId> = agents
        .iter()
        .filter(|agent| agent.status() == AgentStatus::Moving && goal_unreachable(agent, warehouse))
        .map(|agent| agent.id())
        .collect();
    if stranded.is_empty() {
        return None;
    }
    stranded.sort_unstable();
    Some(Detection {
        kind: DeadlockKind::PathBlocked,
        agents: stranded,
    })
}

fn goal_unreachable(agent: &Agent, warehouse: &Warehouse) -> bool {
    let Some(goal) = agent.goal().and_then(|g| warehouse.node(g)) else {
        return false;
    };
    if goal.name() == agent.current_node().name() {
        return false;
    }
    let Some(table) = warehouse.heuristics(goal.name(), agent.agent_type()) else {
        return false;
    };
    find_path(
        warehouse,
        agent.current_node(),
        goal,
        &table,
        &SearchPolicy::for_agent(agent.id()),
    )
    .is_none()
}

/// Pathfinding algorithm accepted by `recalculate_path`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathAlgorithm {
    #[default]
    #[serde(rename = "A*", alias = "astar", alias = "a_star")]
    AStar,
}

/// How `break_circular_wait` picks the agent that yields.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPriority {
    #[default]
    LowestWeight,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoveAgentBack {
    pub steps: usize,
}

impl Default for MoveAgentBack {
    fn default() -> Self {
        Self { steps: 1 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchAgentPositions {
    pub max_agents: usize,
}

impl Default for SwitchAgentPositions {
    fn default() -> Self {
        Self { max_agents: 2 }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalculatePath {
    pub algorithm: PathAlgorithm,
    pub max_attempts: u32,
}

impl Default for RecalculatePath {
    fn default() -> Self {
        Self {
            algorithm: PathAlgorithm::AStar,
            max_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakCircularWait {
    pub priority: WaitPriority,
}

/// Advisory release-and-retry window, in seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseResources {
    pub timeout: f64,
    pub retry_interval: f64,
}

impl Default for ReleaseResources {
    fn default() -> Self {
        Self {
            timeout: 5.0,
            retry_interval: 1.0,
        }
    }
}

impl ReleaseResources {
    fn validate(&self) -> Result<(), ConfigError> {
        for (parameter, value) in [("timeout", self.timeout), ("retry_interval", self.retry_interval)] {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::ParameterOutOfRange {
                    action: "release_resources".to_string(),
                    parameter,
                    value,
                });
            }
        }
        Ok(())
    }
}

/// Per-agent bookkeeping for `release_resources` across passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryState {
    /// `None` when the timeout reaches past what the clock can represent.
    pub deadline: Option<Instant>,
    pub last_attempt: Option<Instant>,
}

/// Shared state handed to every action during one resolution pass.
pub struct ResolutionContext<'a> {
    pub warehouse: &'a Warehouse,
    pub retries: &'a mut HashMap<AgentId, RetryState>,
    pub now: Instant,
}

/// What an action achieved.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionOutcome {
    /// Agents that moved or were unblocked.
    pub progressed: Vec<AgentId>,
    pub rerouted: Vec<(AgentId, Path)>,
    pub notes: Vec<String>,
}

/// Capability shared by every resolution action.
pub trait Resolve {
    /// Act on `agents` (ascending id order, all involved in the detection).
    fn resolve(&self, agents: &mut [&mut Agent], ctx: &mut ResolutionContext<'_>) -> ActionOutcome;
}

impl Resolve for MoveAgentBack {
    fn resolve(&self, agents: &mut [&mut Agent], _ctx: &mut ResolutionContext<'_>) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();
        let Some(agent) = agents.first_mut() else {
            return outcome;
        };
        if matches!(agent.backtrack(self.steps), Ok(MoveOutcome::Moved)) {
            outcome.progressed.push(agent.id());
            outcome.notes.push(format!("agent {} backtracked {} steps", agent.id(), self.steps));
            return outcome;
        }

        let mut stepped = 0;
        for _ in 0..self.steps {
            if !matches!(agent.backtrack(1), Ok(MoveOutcome::Moved)) {
                break;
            }
            stepped += 1;
        }
        if stepped > 0 {
            outcome.progressed.push(agent.id());
        }
        outcome.notes.push(format!(
            "agent {} could not backtrack {} steps at once; stepped back {stepped}",
            agent.id(),
            self.steps
        ));
        outcome
    }
}

impl Resolve for SwitchAgentPositions {
    fn resolve(&self, agents: &mut [&mut Agent], _ctx: &mut ResolutionContext<'_>) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();
        let take = agents.len().min(self.max_agents);
        let [first, second, ..] = &mut agents[..take] else {
            outcome.notes.push("switch needs two agents".to_string());
            return outcome;
        };
        let first_node = first.current_node().clone();
        let second_node = second.current_node().clone();

        for (agent, target) in [(&mut **first, &second_node), (&mut **second, &first_node)] {
            match agent.move_to(target) {
                Ok(MoveOutcome::Moved) => outcome.progressed.push(agent.id()),
                Ok(MoveOutcome::Blocked { holder }) => outcome
                    .notes
                    .push(format!("agent {} could not enter {target}: held by {holder:?}", agent.id())),
                Err(err) => outcome.notes.push(err.to_string()),
            }
        }
        outcome
    }
}

impl Resolve for RecalculatePath {
    fn resolve(&self, agents: &mut [&mut Agent], ctx: &mut ResolutionContext<'_>) -> ActionOutcome {
        let mut outcome = ActionOutcome::default();
        for agent in agents.iter_mut() {
            let Some(goal) = agent.goal().and_then(|g| ctx.warehouse.node(g)).cloned() else {
                outcome.notes.push(format!("agent {} has no routable goal", agent.id()));
                continue;
            };
            let Some(table) = ctx.warehouse.heuristics(goal.name(), agent.agent_type()) else {
                continue;
            };
            let policy = SearchPolicy::for_agent(agent.id());
            let found = (0..self.max_attempts.max(1))
                .find_map(|_| find_path(ctx.warehouse, agent.current_node(), &goal, &table, &policy));
            match found {
                Some(path) => {
                    agent.abandon_pending();
                    outcome.progressed.push(agent.id());
                    outcome.rerouted.push((agent.id(), path));
                }
                None => outcome.notes.push(format!(
                    "no route for agent {} to {} after {} attempt(s) ({:?})",
                    agent.id(),
                    goal.name(),
                    self.max_attempts.max(1),
                    self.algorithm
                )),
            }
        }
        outcome
    }
}

impl Resolve for BreakCircularWait {
    fn resolve(&self, agents: &mut [&mut Agent], ctx: &mut ResolutionContext<'_>) -> ActionOutcome {
        let WaitPriority::LowestWeight = self.priority;
        let mut order: Vec<usize> = (0..agents.len()).collect();
        order.sort_by(|&a, &b| {
            agents[a]
                .weight()
                .total_cmp(&agents[b].weight())
                .then(agents[a].id().cmp(&agents[b].id()))
        });
        let mut outcome = ActionOutcome::default();

        for &index in &order {
            let agent = &mut *agents[index];
            if matches!(agent.backtrack(1), Ok(MoveOutcome::Moved)) {
                outcome.progressed.push(agent.id());
                outcome.notes.push(format!("agent {} yields by stepping back", agent.id()));
                return outcome;
            }
        }

        // Nobody has history to retreat into; the lightest agent side-steps instead.
        let Some(&index) = order.first() else {
            return outcome;
        };
        let agent = &mut *agents[index];
        if let Some(refuge) = free_neighbour(agent, ctx.warehouse) {
            if matches!(agent.move_to(&refuge), Ok(MoveOutcome::Moved)) {
                outcome.progressed.push(agent.id());
                outcome
                    .notes
                    .push(format!("agent {} yields by side-stepping to {refuge}", agent.id()));
                return outcome;
            }
        }
        let ids: Vec<AgentId> = order.iter().map(|&i| agents[i].id()).collect();
        outcome.notes.push(format!("no agent among {ids:?} could yield"));
        outcome
    }
}

/// First unlocked, non-CENTER neighbour of the agent's node, in name order.
fn free_neighbour(agent: &Agent, warehouse: &Warehouse) -> Option<Arc<Node>> {
    agent
        .current_node()
        .neighbours()
        .keys()
        .filter_map(|name| warehouse.node(name))
        .find(|node| !node.is_center() && !node.is_locked())
        .cloned()
}

impl Resolve for ReleaseResources {
    fn resolve(&self, agents: &mut [&mut Agent], ctx: &mut ResolutionContext<'_>) -> ActionOutcome {
        let timeout = Duration::try_from_secs_f64(self.timeout).unwrap_or(Duration::ZERO);
        let interval = Duration::try_from_secs_f64(self.retry_interval).unwrap_or(Duration::ZERO);
        let now = ctx.now;
        let mut outcome = ActionOutcome::default();

        for agent in agents.iter_mut() {
            let id = agent.id();
            let state = ctx.retries.entry(id).or_insert(RetryState {
                deadline: now.checked_add(timeout),
                last_attempt: None,
            });
            if state.deadline.is_some_and(|deadline| now >= deadline) {
                ctx.retries.remove(&id);
                agent.abandon_pending();
                outcome.progressed.push(id);
                outcome.notes.push(format!("agent {id} gave up its pending move after {timeout:?}"));
                continue;
            }
            let due = state.last_attempt.is_none_or(|last| now.duration_since(last) >= interval);
            if !due {
                continue;
            }
            state.last_attempt = Some(now);
            let Some(target) = agent.pending_target().cloned() else {
                ctx.retries.remove(&id);
                continue;
            };
            if matches!(agent.move_to(&target), Ok(MoveOutcome::Moved)) {
                ctx.retries.remove(&id);
                outcome.progressed.push(id);
                outcome.notes.push(format!("agent {id} reached {target} on retry"));
            }
        }
        outcome
    }
}

/// A resolution table row, already resolved to its typed action.
#[derive(Clone, Debug, PartialEq)]
pub enum ResolutionAction {
    MoveAgentBack(MoveAgentBack),
    SwitchAgentPositions(SwitchAgentPositions),
    RecalculatePath(RecalculatePath),
    BreakCircularWait(BreakCircularWait),
    ReleaseResources(ReleaseResources),
}

impl ResolutionAction {
    pub fn from_config(scenario: &ScenarioConfig) -> Result<Self, ConfigError> {
        let action = scenario.action.as_str();
        let params = &scenario.parameters;
        Ok(match action {
            "move_agent_back" => ResolutionAction::MoveAgentBack(parameters(action, params)?),
            "switch_agent_positions" => ResolutionAction::SwitchAgentPositions(parameters(action, params)?),
            "recalculate_path" => ResolutionAction::RecalculatePath(parameters(action, params)?),
            "break_circular_wait" => ResolutionAction::BreakCircularWait(parameters(action, params)?),
            "release_resources" => {
                let release: ReleaseResources = parameters(action, params)?;
                release.validate()?;
                ResolutionAction::ReleaseResources(release)
            }
            other => return Err(ConfigError::UnknownAction(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ResolutionAction::MoveAgentBack(_) => "move_agent_back",
            ResolutionAction::SwitchAgentPositions(_) => "switch_agent_positions",
            ResolutionAction::RecalculatePath(_) => "recalculate_path",
            ResolutionAction::BreakCircularWait(_) => "break_circular_wait",
            ResolutionAction::ReleaseResources(_) => "release_resources",
        }
    }

    fn as_resolver(&self) -> &dyn Resolve {
        match self {
            ResolutionAction::MoveAgentBack(action) => action,
            ResolutionAction::SwitchAgentPositions(action) => action,
            ResolutionAction::RecalculatePath(action) => action,
            ResolutionAction::BreakCircularWait(action) => action,
            ResolutionAction::ReleaseResources(action) => action,
        }
    }
}

impl Resolve for ResolutionAction {
    fn resolve(&self, agents: &mut [&mut Agent], ctx: &mut ResolutionContext<'_>) -> ActionOutcome {
        debug!(action = self.name(), agents = agents.len(), "applying deadlock resolution");
        self.as_resolver().resolve(agents, ctx)
    }
}

fn parameters<T: DeserializeOwned + Default>(action: &str, value: &serde_json::Value) -> Result<T, ConfigError> {
    if value.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(value.clone()).map_err(|source| ConfigError::InvalidParameters {
        action: action.to_string(),
        source,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct Scenario {
    pub description: Option<String>,
    pub action: ResolutionAction,
}

impl Scenario {
    fn from_config(config: &ScenarioConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            description: config.description.clone(),
            action: ResolutionAction::from_config(config)?,
        })
    }
}

/// Scenario -> action mapping with a fallback row.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolutionTable {
    scenarios: HashMap<DeadlockKind, Scenario>,
    default: Scenario,
}

impl ResolutionTable {
    pub fn from_config(config: &DeadlockTableConfig) -> Result<Self, ConfigError> {
        let mut scenarios = HashMap::new();
        for (name, scenario) in &config.deadlock_scenarios {
            scenarios.insert(name.parse::<DeadlockKind>()?, Scenario::from_config(scenario)?);
        }
        Ok(Self {
            scenarios,
            default: Scenario::from_config(&config.default_resolution)?,
        })
    }

    /// Table with a single action for every scenario.
    pub fn uniform(action: ResolutionAction) -> Self {
        Self {
            scenarios: HashMap::new(),
            default: Scenario {
                description: None,
                action,
            },
        }
    }

    pub fn with_scenario(mut self, kind: DeadlockKind, action: ResolutionAction) -> Self {
        self.scenarios.insert(
            kind,
            Scenario {
                description: None,
                action,
            },
        );
        self
    }

    /// Row for `kind`, or the default row. The flag tells whether a specific row matched.
    pub fn lookup(&self, kind: DeadlockKind) -> (&Scenario, bool) {
        match self.scenarios.get(&kind) {
            Some(scenario) => (scenario, true),
            None => (&self.default, false),
        }
    }
}

impl Default for ResolutionTable {
    fn default() -> Self {
        Self::uniform(ResolutionAction::MoveAgentBack(MoveAgentBack::default()))
            .with_scenario(
                DeadlockKind::AgentBlocked,
                ResolutionAction::MoveAgentBack(MoveAgentBack::default()),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{grid_name, WarehouseConfig};
    use crate::event_log::EventLog;
    use crate::types::AgentType;

    fn corridor() -> (Warehouse, Arc<EventLog>) {
        let warehouse = Warehouse::from_config(&WarehouseConfig::grid(4, 1)).expect("valid grid");
        (warehouse, Arc::new(EventLog::new()))
    }

    fn agent_at(warehouse: &Warehouse, log: &Arc<EventLog>, id: AgentId, x: u32, weight: f64) -> Agent {
        let node = Arc::clone(warehouse.node(&grid_name(x, 0)).expect("exists"));
        Agent::new(id, node, AgentType::Picker, weight, Arc::clone(log)).expect("free start")
    }

    fn step(agent: &mut Agent, warehouse: &Warehouse, x: u32) -> MoveOutcome {
        let node = Arc::clone(warehouse.node(&grid_name(x, 0)).expect("exists"));
        agent.move_to(&node).expect("no invariant broken")
    }

    /// Agents 1 and 2 face each other in the middle of the corridor, each wanting the other's node.
    fn face_off(warehouse: &Warehouse, log: &Arc<EventLog>) -> (Agent, Agent) {
        let mut left = agent_at(warehouse, log, 1, 0, 5.0);
        let mut right = agent_at(warehouse, log, 2, 3, 2.0);
        assert!(step(&mut left, warehouse, 1).is_moved());
        assert!(step(&mut right, warehouse, 2).is_moved());
        assert!(!step(&mut left, warehouse, 2).is_moved());
        assert!(!step(&mut right, warehouse, 1).is_moved());
        (left, right)
    }

    #[test]
    fn detects_single_and_multiple_blocked_agents() {
        let (warehouse, log) = corridor();
        let (mut left, right) = face_off(&warehouse, &log);
        let detection = detect(&[&left, &right], &warehouse).expect("both blocked");
        assert_eq!(detection.kind, DeadlockKind::AgentsBlocked);
        assert_eq!(detection.agents, vec![1, 2]);

        assert!(left.backtrack(1).expect("ok").is_moved());
        let detection = detect(&[&left, &right], &warehouse).expect("right still blocked");
        assert_eq!(detection.kind, DeadlockKind::AgentBlocked);
        assert_eq!(detection.agents, vec![2]);
    }

    #[test]
    fn nothing_detected_without_blocked_or_stranded_agents() {
        let (warehouse, log) = corridor();
        let agent = agent_at(&warehouse, &log, 1, 0, 1.0);
        assert!(detect(&[&agent], &warehouse).is_none());
    }

    #[test]
    fn detects_path_blocked_when_goal_is_walled_off() {
        let (warehouse, log) = corridor();
        let mut walker = agent_at(&warehouse, &log, 1, 0, 1.0);
        let _wall = agent_at(&warehouse, &log, 2, 1, 1.0);
        walker.set_goal(&grid_name(3, 0)).expect("valid goal");
        let detection = detect(&[&walker], &warehouse).expect("goal unreachable");
        assert_eq!(detection.kind, DeadlockKind::PathBlocked);
        assert_eq!(detection.agents, vec![1]);
    }

    #[test]
    fn break_circular_wait_moves_lowest_weight_agent() {
        let (warehouse, log) = corridor();
        let (mut left, mut right) = face_off(&warehouse, &log);
        let mut retries = HashMap::new();
        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: Instant::now(),
        };
        let outcome = BreakCircularWait::default().resolve(&mut [&mut left, &mut right], &mut ctx);
        assert_eq!(outcome.progressed, vec![2]);
        assert_eq!(right.current_node().name(), grid_name(3, 0));
        assert_eq!(left.current_node().name(), grid_name(1, 0));
        assert!(!right.is_blocked());
    }

    #[test]
    fn break_circular_wait_side_steps_when_nobody_can_back_up() {
        let (warehouse, log) = corridor();
        let mut left = agent_at(&warehouse, &log, 1, 1, 5.0);
        let mut right = agent_at(&warehouse, &log, 2, 2, 2.0);
        assert!(!step(&mut left, &warehouse, 2).is_moved());
        assert!(!step(&mut right, &warehouse, 1).is_moved());
        assert_eq!(left.history().len(), 1);
        assert_eq!(right.history().len(), 1);

        let mut retries = HashMap::new();
        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: Instant::now(),
        };
        let outcome = BreakCircularWait::default().resolve(&mut [&mut left, &mut right], &mut ctx);
        assert_eq!(outcome.progressed, vec![2]);
        assert_eq!(right.current_node().name(), grid_name(3, 0));
        assert_eq!(left.current_node().name(), grid_name(1, 0));
        assert!(!right.is_blocked());
    }

    #[test]
    fn break_circular_wait_tries_heavier_agent_when_lightest_is_stuck() {
        let (warehouse, log) = corridor();
        let mut left = agent_at(&warehouse, &log, 1, 0, 5.0);
        assert!(step(&mut left, &warehouse, 1).is_moved());
        let mut right = agent_at(&warehouse, &log, 2, 2, 2.0);
        // Wall off the lighter agent's only free neighbour.
        let _wall = agent_at(&warehouse, &log, 3, 3, 9.0);
        assert!(!step(&mut left, &warehouse, 2).is_moved());
        assert!(!step(&mut right, &warehouse, 1).is_moved());

        let mut retries = HashMap::new();
        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: Instant::now(),
        };
        let outcome = BreakCircularWait::default().resolve(&mut [&mut left, &mut right], &mut ctx);
        assert_eq!(outcome.progressed, vec![1]);
        assert_eq!(left.current_node().name(), grid_name(0, 0));
        assert_eq!(right.current_node().name(), grid_name(2, 0));
    }

    #[test]
    fn move_agent_back_falls_back_to_single_steps() {
        let (warehouse, log) = corridor();
        let mut agent = agent_at(&warehouse, &log, 1, 0, 1.0);
        assert!(step(&mut agent, &warehouse, 1).is_moved());
        let mut retries = HashMap::new();
        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: Instant::now(),
        };
        let outcome = MoveAgentBack { steps: 3 }.resolve(&mut [&mut agent], &mut ctx);
        assert_eq!(outcome.progressed, vec![1]);
        assert_eq!(agent.current_node().name(), grid_name(0, 0));
        assert_eq!(agent.history().len(), 1);
    }

    #[test]
    fn switch_positions_is_subject_to_contention() {
        let (warehouse, log) = corridor();
        let (mut left, mut right) = face_off(&warehouse, &log);
        let mut retries = HashMap::new();
        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: Instant::now(),
        };
        let outcome = SwitchAgentPositions::default().resolve(&mut [&mut left, &mut right], &mut ctx);
        assert!(outcome.progressed.is_empty());
        assert_eq!(outcome.notes.len(), 2);
        assert_eq!(left.current_node().name(), grid_name(1, 0));
        assert_eq!(right.current_node().name(), grid_name(2, 0));
    }

    #[test]
    fn recalculate_path_reroutes_blocked_agent() {
        let config = WarehouseConfig::grid(3, 2);
        let warehouse = Warehouse::from_config(&config).expect("valid grid");
        let log = Arc::new(EventLog::new());
        let start = Arc::clone(warehouse.node(&grid_name(0, 0)).expect("exists"));
        let mut agent = Agent::new(1, start, AgentType::Picker, 1.0, Arc::clone(&log)).expect("free");
        let blocker_node = Arc::clone(warehouse.node(&grid_name(1, 0)).expect("exists"));
        let _blocker = Agent::new(2, Arc::clone(&blocker_node), AgentType::Picker, 1.0, Arc::clone(&log))
            .expect("free");
        agent.set_goal(&grid_name(2, 0)).expect("valid goal");
        assert!(!agent.move_to(&blocker_node).expect("ok").is_moved());

        let mut retries = HashMap::new();
        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: Instant::now(),
        };
        let outcome = RecalculatePath::default().resolve(&mut [&mut agent], &mut ctx);
        let (id, path) = &outcome.rerouted[0];
        assert_eq!(*id, 1);
        assert_eq!(path.len(), 5);
        assert!(!path.names().contains(&grid_name(1, 0)));
        assert!(!agent.is_blocked());
    }

    #[test]
    fn release_resources_retries_then_gives_up() {
        let (warehouse, log) = corridor();
        let (mut left, mut right) = face_off(&warehouse, &log);
        let mut retries = HashMap::new();
        let start = Instant::now();
        let action = ReleaseResources {
            timeout: 10.0,
            retry_interval: 1.0,
        };

        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: start,
        };
        let outcome = action.resolve(&mut [&mut left, &mut right], &mut ctx);
        assert!(outcome.progressed.is_empty());
        assert_eq!(retries.len(), 2);

        let mut ctx = ResolutionContext {
            warehouse: &warehouse,
            retries: &mut retries,
            now: start + Duration::from_secs(11),
        };
        let outcome = action.resolve(&mut [&mut left, &mut right], &mut ctx);
        assert_eq!(outcome.progressed, vec![1, 2]);
        assert!(retries.is_empty());
        assert!(!left.is_blocked() && !right.is_blocked());
        assert_eq!(left.current_node().name(), grid_name(1, 0));
    }

    #[test]
    fn release_resources_timeout_beyond_clock_range_never_expires() {
        let (warehouse, log) = corridor();
        let (mut left, mut right) = face_off(&warehouse, &log);
        let mut retries = HashMap::new();
        let start = Instant::now();
        let action = ReleaseResources {
            timeout: 1e19,
            retry_interval: 1.0,
        };

        for offset in [0, 1_000] {
            let mut ctx = ResolutionContext {
                warehouse: &warehouse,
                retries: &mut retries,
                now: start + Duration::from_secs(offset),
            };
            let outcome = action.resolve(&mut [&mut left, &mut right], &mut ctx);
            assert!(outcome.progressed.is_empty());
        }
        assert_eq!(retries.len(), 2);
        assert!(retries.values().all(|state| state.deadline.is_none()));
        assert!(left.is_blocked() && right.is_blocked());
    }

    #[test]
    fn table_rejects_out_of_range_release_parameters() {
        for parameters in [r#"{"timeout": -1}"#, r#"{"retry_interval": -0.5}"#, r#"{"timeout": 1e20}"#] {
            let config = DeadlockTableConfig::from_json(&format!(
                r#"{{"default_resolution": {{"action": "release_resources", "parameters": {parameters}}}}}"#
            ))
            .expect("valid JSON");
            assert!(matches!(
                ResolutionTable::from_config(&config),
                Err(ConfigError::ParameterOutOfRange { .. })
            ));
        }
    }

    #[test]
    fn table_loads_typed_actions_and_falls_back_to_default() {
        let config = DeadlockTableConfig::from_json(
            r#"{
                "deadlock_scenarios": {
                    "agents_blocked": {
                        "description": "circular wait",
                        "action": "break_circular_wait",
                        "parameters": {"priority": "lowest_weight"}
                    },
                    "path_blocked": {"action": "recalculate_path", "parameters": {"algorithm": "A*", "max_attempts": 5}}
                },
                "default_resolution": {"action": "release_resources", "parameters": {"timeout": 2}}
            }"#,
        )
        .expect("valid JSON");
        let table = ResolutionTable::from_config(&config).expect("valid table");

        let (row, specific) = table.lookup(DeadlockKind::AgentsBlocked);
        assert!(specific);
        assert_eq!(row.description.as_deref(), Some("circular wait"));
        assert_eq!(row.action.name(), "break_circular_wait");

        let (row, _) = table.lookup(DeadlockKind::PathBlocked);
        assert_eq!(
            row.action,
            ResolutionAction::RecalculatePath(RecalculatePath {
                algorithm: PathAlgorithm::AStar,
                max_attempts: 5
            })
        );

        let (row, specific) = table.lookup(DeadlockKind::AgentBlocked);
        assert!(!specific);
        assert_eq!(
            row.action,
            ResolutionAction::ReleaseResources(ReleaseResources {
                timeout: 2.0,
                retry_interval: 1.0
            })
        );
    }

    #[test]
    fn table_rejects_unknown_actions_scenarios_and_algorithms() {
        let bad_action = DeadlockTableConfig::from_json(
            r#"{"default_resolution": {"action": "teleport", "parameters": {}}}"#,
        )
        .expect("valid JSON");
        assert!(matches!(
            ResolutionTable::from_config(&bad_action),
            Err(ConfigError::UnknownAction(_))
        ));

        let bad_scenario = DeadlockTableConfig::from_json(
            r#"{"deadlock_scenarios": {"gridlock": {"action": "move_agent_back"}},
                "default_resolution": {"action": "move_agent_back"}}"#,
        )
        .expect("valid JSON");
        assert!(matches!(
            ResolutionTable::from_config(&bad_scenario),
            Err(ConfigError::UnknownScenario(_))
        ));

        let bad_algorithm = DeadlockTableConfig::from_json(
            r#"{"default_resolution": {"action": "recalculate_path", "parameters": {"algorithm": "dijkstra"}}}"#,
        )
        .expect("valid JSON");
        assert!(matches!(
            ResolutionTable::from_config(&bad_algorithm),
            Err(ConfigError::InvalidParameters { .. })
        ));
    }
}
