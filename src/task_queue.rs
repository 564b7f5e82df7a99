//! Thread-safe two-tier FIFO task queue.
//!
//! High-priority entries are always offered before normal ones. An entry may be
//! reserved for a specific agent; other agents skip over it without disturbing
//! the order of the remaining entries.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{AgentId, Task};

/// A queued task, optionally reserved for one agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedTask {
    pub task: Task,
    pub agent: Option<AgentId>,
}

impl QueuedTask {
    fn offered_to(&self, agent: AgentId) -> bool {
        self.agent.is_none_or(|reserved| reserved == agent)
    }
}

struct TaskQueueState {
    priority: VecDeque<QueuedTask>,
    regular: VecDeque<QueuedTask>,
    closed: bool,
}

pub struct TaskQueue {
    inner: Mutex<TaskQueueState>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TaskQueueState {
                priority: VecDeque::new(),
                regular: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Append to the tier matching the task's priority; returns the entry back if closed.
    pub fn push(&self, entry: QueuedTask) -> Result<(), QueuedTask> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        if guard.closed {
            return Err(entry);
        }
        if entry.task.is_high_priority() {
            guard.priority.push_back(entry);
        } else {
            guard.regular.push_back(entry);
        }
        Ok(())
    }

    /// Remove the first entry offered to `agent`, high tier first.
    pub fn take_for(&self, agent: AgentId) -> Option<QueuedTask> {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        let state = &mut *guard;
        for tier in [&mut state.priority, &mut state.regular] {
            if let Some(index) = tier.iter().position(|entry| entry.offered_to(agent)) {
                return tier.remove(index);
            }
        }
        None
    }

    /// Return a taken entry to the head of its tier. Accepted even after `close`.
    pub fn requeue(&self, entry: QueuedTask) {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        if entry.task.is_high_priority() {
            guard.priority.push_front(entry);
        } else {
            guard.regular.push_front(entry);
        }
    }

    /// Stop accepting new entries. Queued entries remain available.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("task queue mutex poisoned").closed
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock().expect("task queue mutex poisoned");
        guard.priority.len() + guard.regular.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (high, normal) tier lengths.
    pub fn tier_lengths(&self) -> (usize, usize) {
        let guard = self.inner.lock().expect("task queue mutex poisoned");
        (guard.priority.len(), guard.regular.len())
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
