//! Append-only structured event log with batched hand-off to an external sink.

use std::fmt;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DEFAULT_LOG_BATCH_SIZE;
use crate::error::LogSinkError;
use crate::types::{AgentId, TaskId};

/// Type tag of a log entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    AgentCreation,
    AgentRemoved,
    Movement,
    MovementFailed,
    Backtrack,
    BacktrackFailed,
    GoalChange,
    TaskCompletion,
    BatteryLow,
    StatusChange,
    TaskEnqueued,
    TaskAssigned,
    NoTaskAvailable,
    RouteFailed,
    DeadlockDetected,
    DeadlockResolution,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AgentCreation => "agent_creation",
            EventKind::AgentRemoved => "agent_removed",
            EventKind::Movement => "movement",
            EventKind::MovementFailed => "movement_failed",
            EventKind::Backtrack => "backtrack",
            EventKind::BacktrackFailed => "backtrack_failed",
            EventKind::GoalChange => "goal_change",
            EventKind::TaskCompletion => "task_completion",
            EventKind::BatteryLow => "battery_low",
            EventKind::StatusChange => "status_change",
            EventKind::TaskEnqueued => "task_enqueued",
            EventKind::TaskAssigned => "task_assigned",
            EventKind::NoTaskAvailable => "no_task_available",
            EventKind::RouteFailed => "route_failed",
            EventKind::DeadlockDetected => "deadlock_detected",
            EventKind::DeadlockResolution => "deadlock_resolution",
        }
    }

    fn is_warning(&self) -> bool {
        matches!(
            self,
            EventKind::MovementFailed
                | EventKind::BacktrackFailed
                | EventKind::BatteryLow
                | EventKind::RouteFailed
                | EventKind::DeadlockDetected
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub message: String,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
}

/// Exact-match filters for [`EventLog::get_logs`]; `None` matches anything.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LogFilter {
    pub kind: Option<EventKind>,
    pub agent_id: Option<AgentId>,
    pub task_id: Option<TaskId>,
}

impl LogFilter {
    pub fn kind(kind: EventKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::default()
        }
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        self.kind.is_none_or(|kind| entry.kind == kind)
            && self.agent_id.is_none_or(|id| entry.agent_id == Some(id))
            && self.task_id.is_none_or(|id| entry.task_id == Some(id))
    }
}

/// Durable destination for flushed batches. Entries within a batch arrive in log order.
pub trait LogSink: Send + Sync {
    fn append_batch(&self, batch: &[LogEntry]) -> Result<(), LogSinkError>;
}

/// Sink that discards every batch.
pub struct NullSink;

impl LogSink for NullSink {
    fn append_batch(&self, _batch: &[LogEntry]) -> Result<(), LogSinkError> {
        Ok(())
    }
}

/// Sink that keeps flushed batches in memory, mainly for inspection in tests.
#[derive(Default)]
pub struct MemorySink {
    batches: Mutex<Vec<Vec<LogEntry>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<LogEntry>> {
        self.batches.lock().expect("memory sink mutex poisoned").clone()
    }
}

impl LogSink for MemorySink {
    fn append_batch(&self, batch: &[LogEntry]) -> Result<(), LogSinkError> {
        self.batches
            .lock()
            .expect("memory sink mutex poisoned")
            .push(batch.to_vec());
        Ok(())
    }
}

/// Writes one JSON object per entry, one entry per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().expect("json sink mutex poisoned")
    }
}

impl<W: Write + Send> LogSink for JsonLinesSink<W> {
    fn append_batch(&self, batch: &[LogEntry]) -> Result<(), LogSinkError> {
        let mut writer = self.writer.lock().expect("json sink mutex poisoned");
        for entry in batch {
            serde_json::to_writer(&mut *writer, entry)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
        Ok(())
    }
}

struct EventLogState {
    entries: Vec<LogEntry>,
    /// Entries before this index have been handed to the sink.
    flushed: usize,
}

/// Shared, thread-safe event log. Entries are never mutated or removed.
///
/// The sink is called outside the entry lock; `flushing` serialises sink calls
/// so batches arrive in log order.
pub struct EventLog {
    state: Mutex<EventLogState>,
    flushing: Mutex<()>,
    batch_size: usize,
    sink: Arc<dyn LogSink>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_sink(DEFAULT_LOG_BATCH_SIZE, Arc::new(NullSink))
    }

    pub fn with_sink(batch_size: usize, sink: Arc<dyn LogSink>) -> Self {
        Self {
            state: Mutex::new(EventLogState {
                entries: Vec::new(),
                flushed: 0,
            }),
            flushing: Mutex::new(()),
            batch_size: batch_size.max(1),
            sink,
        }
    }

    /// Append an entry and flush a batch once enough entries are pending.
    ///
    /// If another caller is already flushing, the entry waits for the next flush.
    pub fn log_event(
        &self,
        kind: EventKind,
        message: impl Into<String>,
        agent_id: Option<AgentId>,
        task_id: Option<TaskId>,
    ) {
        let entry = LogEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            message: message.into(),
            agent_id,
            task_id,
        };
        if kind.is_warning() {
            warn!(event = %kind, agent = ?agent_id, task = ?task_id, "{}", entry.message);
        } else {
            debug!(event = %kind, agent = ?agent_id, task = ?task_id, "{}", entry.message);
        }

        let due = {
            let mut guard = self.state.lock().expect("event log mutex poisoned");
            guard.entries.push(entry);
            guard.entries.len() - guard.flushed >= self.batch_size
        };
        if due {
            if let Ok(flushing) = self.flushing.try_lock() {
                self.flush_pending();
                drop(flushing);
            }
        }
    }

    /// Hand every pending entry to the sink now, waiting for any flush in progress.
    pub fn flush(&self) {
        let _flushing = self.flushing.lock().expect("log flush mutex poisoned");
        self.flush_pending();
    }

    /// Caller must hold `flushing`.
    fn flush_pending(&self) {
        let (batch, end) = {
            let guard = self.state.lock().expect("event log mutex poisoned");
            (guard.entries[guard.flushed..].to_vec(), guard.entries.len())
        };
        if batch.is_empty() {
            return;
        }
        match self.sink.append_batch(&batch) {
            Ok(()) => self.state.lock().expect("event log mutex poisoned").flushed = end,
            // Pending entries stay queued for the next flush.
            Err(err) => warn!(pending = batch.len(), error = %err, "log flush failed"),
        }
    }

    pub fn get_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let guard = self.state.lock().expect("event log mutex poisoned");
        guard
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("event log mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        let guard = self.state.lock().expect("event log mutex poisoned");
        guard.entries.len() - guard.flushed
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    struct FailingSink;

    impl LogSink for FailingSink {
        fn append_batch(&self, _batch: &[LogEntry]) -> Result<(), LogSinkError> {
            Err(LogSinkError::Unavailable("store offline".to_string()))
        }
    }

    #[test]
    fn filters_by_kind_agent_and_task() {
        let log = EventLog::new();
        let task = TaskId::new();
        log.log_event(EventKind::Movement, "moved", Some(1), None);
        log.log_event(EventKind::Movement, "moved", Some(2), None);
        log.log_event(EventKind::TaskCompletion, "done", Some(1), Some(task));

        assert_eq!(log.get_logs(&LogFilter::kind(EventKind::Movement)).len(), 2);
        assert_eq!(log.get_logs(&LogFilter::agent(1)).len(), 2);
        let by_task = LogFilter {
            task_id: Some(task),
            ..LogFilter::default()
        };
        let hits = log.get_logs(&by_task);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].kind, EventKind::TaskCompletion);
        assert_eq!(log.get_logs(&LogFilter::default()).len(), 3);
    }

    #[test]
    fn flushes_ordered_batches_at_threshold() {
        let sink = Arc::new(MemorySink::new());
        let log = EventLog::with_sink(3, sink.clone());
        for step in 0..7 {
            log.log_event(EventKind::Movement, format!("step {step}"), Some(1), None);
        }
        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[1][0].message, "step 3");
        assert_eq!(log.pending(), 1);
        // Flushed entries stay visible to queries.
        assert_eq!(log.len(), 7);

        log.flush();
        assert_eq!(sink.batches().len(), 3);
        assert_eq!(log.pending(), 0);
    }

    #[test]
    fn failed_flush_keeps_entries_pending() {
        let log = EventLog::with_sink(2, Arc::new(FailingSink));
        log.log_event(EventKind::Movement, "a", None, None);
        log.log_event(EventKind::Movement, "b", None, None);
        assert_eq!(log.pending(), 2);
        assert_eq!(log.len(), 2);
    }

    /// Parks inside `append_batch` until the test lets it go.
    struct GatedSink {
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
        inner: MemorySink,
    }

    impl LogSink for GatedSink {
        fn append_batch(&self, batch: &[LogEntry]) -> Result<(), LogSinkError> {
            self.entered
                .lock()
                .expect("entered mutex poisoned")
                .send(())
                .map_err(|err| LogSinkError::Unavailable(err.to_string()))?;
            self.release
                .lock()
                .expect("release mutex poisoned")
                .recv()
                .map_err(|err| LogSinkError::Unavailable(err.to_string()))?;
            self.inner.append_batch(batch)
        }
    }

    #[test]
    fn slow_sink_does_not_block_writers() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let sink = Arc::new(GatedSink {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
            inner: MemorySink::new(),
        });
        let log = Arc::new(EventLog::with_sink(1, sink.clone()));

        let flusher = {
            let log = Arc::clone(&log);
            thread::spawn(move || log.log_event(EventKind::Movement, "first", Some(1), None))
        };
        entered_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("first batch reached the sink");

        // The sink is parked; these must still return promptly.
        log.log_event(EventKind::Movement, "second", Some(2), None);
        log.log_event(EventKind::Movement, "third", Some(2), None);
        assert_eq!(log.len(), 3);
        assert_eq!(log.get_logs(&LogFilter::agent(2)).len(), 2);

        release_tx.send(()).expect("sink listening");
        flusher.join().expect("flusher panicked");
        release_tx.send(()).expect("sink listening");
        log.flush();

        let batches = sink.inner.batches();
        let messages: Vec<Vec<&str>> = batches
            .iter()
            .map(|batch| batch.iter().map(|entry| entry.message.as_str()).collect())
            .collect();
        assert_eq!(messages, vec![vec!["first"], vec!["second", "third"]]);
        assert_eq!(log.pending(), 0);
    }

    #[test]
    fn json_lines_sink_writes_one_entry_per_line() {
        let sink = Arc::new(JsonLinesSink::new(Vec::new()));
        let log = EventLog::with_sink(2, sink.clone());
        log.log_event(EventKind::AgentCreation, "agent 1 created", Some(1), None);
        log.log_event(EventKind::Movement, "moved to n_1_0", Some(1), None);
        drop(log);

        let sink = Arc::into_inner(sink).expect("log dropped its handle");
        let text = String::from_utf8(sink.into_inner()).expect("utf-8 output");
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid JSON line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "agent_creation");
        assert_eq!(lines[1]["message"], "moved to n_1_0");
    }

    #[test]
    fn concurrent_appends_are_all_recorded() {
        let log = Arc::new(EventLog::new());
        let writers = 4;
        let barrier = Arc::new(Barrier::new(writers));
        let mut handles = Vec::new();
        for agent in 0..writers as u64 {
            let log = Arc::clone(&log);
            let barrier = Arc::clone(&barrier);
            handles.push(thread::spawn(move || {
                barrier.wait();
                for _ in 0..25 {
                    log.log_event(EventKind::Movement, "tick", Some(agent), None);
                }
            }));
        }
        for handle in handles {
            handle.join().expect("writer panicked");
        }
        assert_eq!(log.len(), 100);
        assert_eq!(log.get_logs(&LogFilter::agent(3)).len(), 25);
    }

    #[test]
    fn entries_serialize_with_type_tag() {
        let log = EventLog::new();
        log.log_event(EventKind::BatteryLow, "battery 10%", Some(4), None);
        let entry = &log.get_logs(&LogFilter::default())[0];
        let json = serde_json::to_value(entry).expect("serializable");
        assert_eq!(json["type"], "battery_low");
        assert_eq!(json["agent_id"], 4);
    }
}
