//! Threaded demo and benchmark drivers for the fleet engine.
//!
//! Every agent runs on its own thread: take a task, walk to it, work, walk back
//! to its dock. A coordinator thread owns the tick clock and runs the deadlock
//! pass once per tick.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use warehouse_fleet::config::DEFAULT_LOW_BATTERY_THRESHOLD;
use warehouse_fleet::{
    AgentId, AgentType, Assignment, EngineConfig, MemorySink, NodeKind, ResolutionTable, RouteError,
    Scheduler, Task, TaskId, TaskKind, TickClock, Warehouse,
};

// Route attempts before an agent gives up on a target.
const ROUTE_ATTEMPTS: usize = 40;
const BATTERY_PER_TASK: f64 = 30.0;
const CHARGE_TIME_MS: u64 = 20;

/// Best-effort CPU user/system time snapshot (seconds) on Unix platforms.
#[cfg(unix)]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    use libc::{RUSAGE_SELF, getrusage, rusage};
    // SAFETY: rusage is plain old data; getrusage fills it in.
    let mut usage: rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { getrusage(RUSAGE_SELF, &mut usage) };
    if rc != 0 {
        return None;
    }
    let user = usage.ru_utime.tv_sec as f64 + (usage.ru_utime.tv_usec as f64 / 1_000_000.0);
    let sys = usage.ru_stime.tv_sec as f64 + (usage.ru_stime.tv_usec as f64 / 1_000_000.0);
    Some((user, sys))
}

/// Stub on non-Unix platforms.
#[cfg(not(unix))]
fn cpu_times_seconds() -> Option<(f64, f64)> {
    None
}

/// Knobs shared by the demo and the benchmark.
#[derive(Clone, Debug)]
pub struct FleetParams {
    pub agents: usize,
    pub tasks_per_agent: usize,
    pub work: Duration,
    pub ticks_per_second: u32,
    pub validate: bool,
}

#[derive(Default)]
struct FleetCounters {
    deadlock_passes: AtomicUsize,
    agents_progressed: AtomicUsize,
    route_retries: AtomicU64,
    abandoned: AtomicUsize,
    lock_violation: AtomicBool,
    duplicate_tasks: AtomicBool,
}

/// Aggregated metrics from a single fleet run.
struct FleetRun {
    agents: usize,
    tasks_per_agent: usize,
    nodes: usize,
    total_tasks: usize,
    per_agent_done: Vec<usize>,
    abandoned: usize,
    leftover: usize,
    elapsed_ms: f64,
    throughput: f64,
    route_retries: u64,
    deadlock_passes: usize,
    agents_progressed: usize,
    lagged_ticks: u64,
    cpu_user_s: Option<f64>,
    cpu_sys_s: Option<f64>,
    lock_violation: bool,
    duplicate_tasks: bool,
    events: usize,
    batches_flushed: usize,
}

/// Every registered agent still owns the lock of the node it stands on.
fn lock_invariant_holds(scheduler: &Scheduler) -> bool {
    scheduler.agent_ids().into_iter().all(|id| {
        let Some(handle) = scheduler.agent(id) else {
            return true;
        };
        let agent = handle.lock().expect("agent mutex poisoned");
        agent.current_node().lock_owner() == Some(id)
    })
}

/// Walk `agent` to `target`, replanning after each refused step.
fn walk(scheduler: &Scheduler, agent: AgentId, target: &str, pause: Duration, counters: &FleetCounters) -> bool {
    for _ in 0..ROUTE_ATTEMPTS {
        match scheduler.request_route(agent, target) {
            Ok(path) => {
                debug!(agent, target, steps = path.len().saturating_sub(1), "arrived");
                return true;
            }
            Err(RouteError::Interrupted { .. } | RouteError::NoPath { .. }) => {
                counters.route_retries.fetch_add(1, Ordering::Relaxed);
                thread::sleep(pause);
            }
            Err(err) => {
                warn!(agent, target, error = %err, "route rejected");
                return false;
            }
        }
    }
    false
}

/// Drain the battery for one finished task and recharge when it runs low.
fn spend_battery(scheduler: &Scheduler, id: AgentId) -> Result<()> {
    let handle = scheduler.agent(id).context("agent vanished")?;
    let low = {
        let mut agent = handle.lock().expect("agent mutex poisoned");
        let level = agent.battery() - BATTERY_PER_TASK;
        agent.update_battery(level);
        if agent.battery() < DEFAULT_LOW_BATTERY_THRESHOLD {
            agent.begin_charging()?;
            true
        } else {
            false
        }
    };
    if low {
        thread::sleep(Duration::from_millis(CHARGE_TIME_MS));
        let mut agent = handle.lock().expect("agent mutex poisoned");
        agent.update_battery(100.0);
        agent.finish_charging()?;
    }
    Ok(())
}

fn drive_agent(
    scheduler: &Scheduler,
    id: AgentId,
    dock: &str,
    params: &FleetParams,
    counters: &FleetCounters,
    seen: Option<&Mutex<HashSet<TaskId>>>,
) -> Result<usize> {
    let pause = Duration::from_secs(1) / params.ticks_per_second.max(1);
    let mut done = 0;
    loop {
        let task = match scheduler.assign(id)? {
            Assignment::Assigned(task) => task,
            Assignment::NoTask => break,
            Assignment::NotIdle(status) => bail!("agent {id} unexpectedly {status}"),
        };
        if let Some(seen) = seen {
            if !seen.lock().expect("seen mutex poisoned").insert(task.id) {
                counters.duplicate_tasks.store(true, Ordering::SeqCst);
            }
        }

        if !walk(scheduler, id, &task.goal, pause, counters) {
            scheduler.abandon_task(id)?;
            counters.abandoned.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        if !params.work.is_zero() {
            thread::sleep(params.work);
        }
        scheduler.complete_task(id)?;
        done += 1;
        spend_battery(scheduler, id)?;

        if !walk(scheduler, id, dock, pause, counters) {
            let handle = scheduler.agent(id).context("agent vanished")?;
            let mut agent = handle.lock().expect("agent mutex poisoned");
            if !agent.is_idle() {
                agent.clear_goal()?;
            }
        }
        if let Some(handle) = scheduler.agent(id) {
            handle.lock().expect("agent mutex poisoned").clear_path_history();
        }
    }
    Ok(done)
}

/// Nodes that may host a dock or a task goal, in name order.
fn open_nodes(warehouse: &Warehouse) -> Vec<String> {
    warehouse
        .nodes()
        .filter(|node| node.kind() != NodeKind::Center && !node.neighbours().is_empty())
        .map(|node| node.name().to_string())
        .collect()
}

fn run_fleet(warehouse: Arc<Warehouse>, table: ResolutionTable, params: &FleetParams) -> Result<FleetRun> {
    let open = open_nodes(&warehouse);
    if params.agents == 0 || params.tasks_per_agent == 0 {
        bail!("agents and tasks per agent must be > 0");
    }
    if open.len() <= params.agents {
        bail!(
            "map has {} usable nodes; need more than one per agent ({})",
            open.len(),
            params.agents
        );
    }

    let sink = Arc::new(MemorySink::new());
    let scheduler = Arc::new(Scheduler::with_config(
        Arc::clone(&warehouse),
        table,
        EngineConfig::default(),
        sink.clone(),
    ));

    let (docks, goals) = open.split_at(params.agents);
    for (index, dock) in docks.iter().enumerate() {
        let id = index as AgentId + 1;
        let agent_type = if index % 2 == 0 {
            AgentType::Picker
        } else {
            AgentType::Transporter
        };
        scheduler.spawn_agent(id, dock, agent_type, 1.0 + index as f64)?;
    }

    let kinds = [TaskKind::Pick, TaskKind::Place, TaskKind::Move];
    let total_tasks = params.agents * params.tasks_per_agent;
    for index in 0..total_tasks {
        let goal = &goals[index % goals.len()];
        let priority = i64::from(index % 3 == 0);
        let task = Task::new(goal.as_str(), kinds[index % kinds.len()], priority, "")?;
        if index % 4 == 3 {
            scheduler.order((index % params.agents) as AgentId + 1, task)?;
        } else {
            scheduler.enqueue(task)?;
        }
    }
    scheduler.close_queue();
    info!(agents = params.agents, tasks = total_tasks, "fleet loaded");

    let counters = Arc::new(FleetCounters::default());
    let seen = params.validate.then(|| Arc::new(Mutex::new(HashSet::new())));
    let stop_flag = Arc::new(AtomicBool::new(false));

    let coordinator = {
        let scheduler = Arc::clone(&scheduler);
        let counters = Arc::clone(&counters);
        let stop_flag = Arc::clone(&stop_flag);
        let ticks_per_second = params.ticks_per_second;
        thread::Builder::new()
            .name("coordinator".to_string())
            .spawn(move || {
                let mut clock = TickClock::new(ticks_per_second);
                let mut lagged = 0;
                while !stop_flag.load(Ordering::SeqCst) {
                    clock.wait_for_next_tick();
                    if let Some(report) = scheduler.detect_and_resolve() {
                        counters.deadlock_passes.fetch_add(1, Ordering::SeqCst);
                        counters
                            .agents_progressed
                            .fetch_add(report.progressed.len(), Ordering::SeqCst);
                        info!(kind = %report.kind, action = report.action, agents = ?report.agents, "deadlock resolved");
                    }
                    if !lock_invariant_holds(&scheduler) {
                        counters.lock_violation.store(true, Ordering::SeqCst);
                    }
                    // Anything beyond the tick we just waited for was lost to a slow pass.
                    lagged += clock.sync_ticks();
                }
                lagged
            })
            .context("failed to spawn coordinator thread")?
    };

    let cpu_start = cpu_times_seconds();
    let start = Instant::now();
    let mut handles = Vec::new();
    for (index, dock) in docks.iter().enumerate() {
        let id = index as AgentId + 1;
        let scheduler = Arc::clone(&scheduler);
        let counters = Arc::clone(&counters);
        let seen = seen.as_ref().map(Arc::clone);
        let dock = dock.clone();
        let params = params.clone();
        let handle = thread::Builder::new()
            .name(format!("agent-{id}"))
            .spawn(move || drive_agent(&scheduler, id, &dock, &params, &counters, seen.as_deref()))
            .context("failed to spawn agent thread")?;
        handles.push(handle);
    }

    let mut per_agent_done = Vec::with_capacity(handles.len());
    for handle in handles {
        let done = handle
            .join()
            .map_err(|_| anyhow::anyhow!("agent thread panicked"))??;
        per_agent_done.push(done);
    }
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    stop_flag.store(true, Ordering::SeqCst);
    let lagged_ticks = coordinator
        .join()
        .map_err(|_| anyhow::anyhow!("coordinator thread panicked"))?;

    if !lock_invariant_holds(&scheduler) {
        counters.lock_violation.store(true, Ordering::SeqCst);
    }
    scheduler.flush_logs();

    let completed: usize = per_agent_done.iter().sum();
    let throughput = if elapsed_ms > 0.0 {
        completed as f64 / (elapsed_ms / 1000.0)
    } else {
        0.0
    };
    let (cpu_user_s, cpu_sys_s) = match (cpu_start, cpu_times_seconds()) {
        (Some((user_start, sys_start)), Some((user_end, sys_end))) => {
            (Some(user_end - user_start), Some(sys_end - sys_start))
        }
        _ => (None, None),
    };

    Ok(FleetRun {
        agents: params.agents,
        tasks_per_agent: params.tasks_per_agent,
        nodes: warehouse.len(),
        total_tasks,
        per_agent_done,
        abandoned: counters.abandoned.load(Ordering::SeqCst),
        leftover: scheduler.queued_tasks(),
        elapsed_ms,
        throughput,
        route_retries: counters.route_retries.load(Ordering::SeqCst),
        deadlock_passes: counters.deadlock_passes.load(Ordering::SeqCst),
        agents_progressed: counters.agents_progressed.load(Ordering::SeqCst),
        lagged_ticks,
        cpu_user_s,
        cpu_sys_s,
        lock_violation: counters.lock_violation.load(Ordering::SeqCst),
        duplicate_tasks: counters.duplicate_tasks.load(Ordering::SeqCst),
        events: scheduler.event_log().len(),
        batches_flushed: sink.batches().len(),
    })
}

/// Run the default demo: a small fleet sharing one map.
pub fn run_demo(warehouse: Arc<Warehouse>, table: ResolutionTable) -> Result<()> {
    let params = FleetParams {
        agents: 3,
        tasks_per_agent: 3,
        work: Duration::from_millis(40),
        ticks_per_second: 50,
        validate: true,
    };
    let run = run_fleet(warehouse, table, &params)?;

    println!("DEMO SUMMARY");
    println!("agents={} tasks_total={} nodes={}", run.agents, run.total_tasks, run.nodes);
    println!("tasks_per_agent_done={:?}", run.per_agent_done);
    println!("tasks_abandoned={}", run.abandoned);
    println!("route_retries={}", run.route_retries);
    println!(
        "deadlock_passes={} agents_progressed={}",
        run.deadlock_passes, run.agents_progressed
    );
    println!("events_logged={} batches_flushed={}", run.events, run.batches_flushed);
    println!("duplicate_tasks={}", run.duplicate_tasks);
    println!("lock_violation={}", run.lock_violation);
    Ok(())
}

/// Run a single benchmark and print one CSV row.
pub fn run_benchmark(warehouse: Arc<Warehouse>, table: ResolutionTable, params: &FleetParams) -> Result<()> {
    let run = run_fleet(warehouse, table, params)?;

    println!(
        "agents,tasks_per_agent,nodes,total_tasks,completed,abandoned,elapsed_ms,throughput_tasks_per_s,route_retries,deadlock_passes,lagged_ticks,cpu_user_s,cpu_sys_s,lock_violation,duplicate_tasks"
    );
    let cpu_user = run
        .cpu_user_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    let cpu_sys = run
        .cpu_sys_s
        .map(|v| format!("{v:.4}"))
        .unwrap_or_else(|| "NA".to_string());
    println!(
        "{},{},{},{},{},{},{:.2},{:.2},{},{},{},{},{},{},{}",
        run.agents,
        run.tasks_per_agent,
        run.nodes,
        run.total_tasks,
        run.per_agent_done.iter().sum::<usize>(),
        run.abandoned,
        run.elapsed_ms,
        run.throughput,
        run.route_retries,
        run.deadlock_passes,
        run.lagged_ticks,
        cpu_user,
        cpu_sys,
        run.lock_violation,
        run.duplicate_tasks
    );
    if run.leftover > 0 {
        eprintln!("# warning,leftover_tasks,{}", run.leftover);
    }
    if params.validate {
        if run.lock_violation {
            eprintln!("# violation,lock_ownership");
        }
        if run.duplicate_tasks {
            eprintln!("# violation,duplicate_tasks");
        }
    }
    Ok(())
}
