//! Task metrics and performance snapshots.
//!
//! [`MetricsStore`] holds live task metrics, a bounded history of completed
//! ones, and a bounded ring of [`PerformanceSnapshot`]s. It does no locking of
//! its own; the monitor keeps it behind a single mutex.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;

/// Identifier of a supervised task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// A fresh random (UUID v4) id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a supervised task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl TaskState {
    /// Whether no further transition is allowed from this state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::Timeout | Self::Cancelled
        )
    }

    /// Whether this terminal state counts as a failed run for error rates.
    ///
    /// Cancellation is neither a success nor a failure.
    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }

    fn counts_toward_rate(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Timeout)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One supervised task's bookkeeping record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetric {
    pub task_id: TaskId,
    pub state: TaskState,
    /// Registration time while Pending, then the moment the task began running.
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TaskMetric {
    fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Wall-clock run time, once the task has ended.
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

/// A point-in-time sample of system and scheduler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// Assigned by the store; strictly increasing.
    pub sequence: u64,
    /// Never earlier than the previous snapshot's timestamp.
    pub captured_at: DateTime<Utc>,
    pub memory_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub scheduler_latency: Option<Duration>,
    pub active_tasks: usize,
    pub completed_in_window: u64,
    pub failed_in_window: u64,
    /// `failed_in_window / completed_in_window`, or 0.0 with no completions.
    pub error_rate: f64,
}

impl PerformanceSnapshot {
    /// A snapshot stamped now, with the given figures and empty window counters.
    pub fn new(
        memory_percent: Option<f64>,
        cpu_percent: Option<f64>,
        scheduler_latency: Option<Duration>,
        active_tasks: usize,
    ) -> Self {
        Self {
            sequence: 0,
            captured_at: Utc::now(),
            memory_percent,
            cpu_percent,
            scheduler_latency,
            active_tasks,
            completed_in_window: 0,
            failed_in_window: 0,
            error_rate: 0.0,
        }
    }

    /// Set the window counters and derive the error rate from them.
    pub fn with_window(mut self, completed: u64, failed: u64) -> Self {
        self.completed_in_window = completed;
        self.failed_in_window = failed;
        self.error_rate = if completed == 0 {
            0.0
        } else {
            failed as f64 / completed as f64
        };
        self
    }
}

/// Failure rate and mean duration over recent completed tasks.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowStats {
    /// `None` when no task in the window completed or failed.
    pub failure_rate: Option<f64>,
    pub avg_duration: Option<Duration>,
    pub considered: usize,
}

/// Storage for task metrics and performance snapshots.
#[derive(Debug)]
pub struct MetricsStore {
    active: HashMap<TaskId, TaskMetric>,
    history: Vec<TaskMetric>,
    history_limit: usize,
    snapshots: VecDeque<PerformanceSnapshot>,
    snapshot_capacity: usize,
    next_sequence: u64,
    window_completed: u64,
    window_failed: u64,
}

impl MetricsStore {
    pub fn new(history_limit: usize, snapshot_capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            history: Vec::new(),
            history_limit: history_limit.max(1),
            snapshots: VecDeque::with_capacity(snapshot_capacity.min(1024)),
            snapshot_capacity: snapshot_capacity.max(1),
            next_sequence: 0,
            window_completed: 0,
            window_failed: 0,
        }
    }

    /// Register a task as Pending. Returns `false` if the id is already live.
    pub fn register(&mut self, task_id: &TaskId) -> bool {
        if self.active.contains_key(task_id) {
            debug!(task_id = %task_id, "task already registered");
            return false;
        }
        self.active
            .insert(task_id.clone(), TaskMetric::new(task_id.clone(), TaskState::Pending));
        true
    }

    /// Move a task to Running, creating its metric if it was never registered.
    pub fn mark_running(&mut self, task_id: &TaskId) {
        let metric = self
            .active
            .entry(task_id.clone())
            .or_insert_with(|| TaskMetric::new(task_id.clone(), TaskState::Pending));
        if metric.state == TaskState::Pending {
            metric.state = TaskState::Running;
            metric.started_at = Utc::now();
        }
    }

    /// Move a live task to its terminal state and into history.
    ///
    /// Returns `false` (and changes nothing) if the task is unknown or already
    /// terminal, or if `state` is not terminal.
    pub fn complete(&mut self, task_id: &TaskId, state: TaskState, error: Option<String>) -> bool {
        if !state.is_terminal() {
            debug!(task_id = %task_id, %state, "ignoring non-terminal completion");
            return false;
        }
        let Some(mut metric) = self.active.remove(task_id) else {
            debug!(task_id = %task_id, %state, "completion for unknown or finished task ignored");
            return false;
        };

        metric.state = state;
        metric.ended_at = Some(Utc::now().max(metric.started_at));
        metric.error = error;

        if state.counts_toward_rate() {
            self.window_completed += 1;
            if state.is_failed() {
                self.window_failed += 1;
            }
        }

        self.push_history(metric);
        true
    }

    fn push_history(&mut self, metric: TaskMetric) {
        self.history.push(metric);
        self.trim_history();
    }

    fn trim_history(&mut self) {
        if self.history.len() <= self.history_limit {
            return;
        }
        let drop_count = self.history.len().saturating_sub(self.history_limit);
        self.history.drain(0..drop_count);
    }

    /// Current state of a task, live or in history.
    pub fn task_state(&self, task_id: &TaskId) -> Option<TaskState> {
        self.active.get(task_id).map(|m| m.state).or_else(|| {
            self.history
                .iter()
                .rev()
                .find(|m| &m.task_id == task_id)
                .map(|m| m.state)
        })
    }

    /// Number of tasks in the Running state.
    pub fn running_count(&self) -> usize {
        self.active
            .values()
            .filter(|m| m.state == TaskState::Running)
            .count()
    }

    /// Number of live (pending or running) tasks.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Running tasks whose age at `now` exceeds `max`.
    pub fn long_running(&self, max: Duration, now: DateTime<Utc>) -> usize {
        self.active
            .values()
            .filter(|m| m.state == TaskState::Running)
            .filter(|m| {
                (now - m.started_at)
                    .to_std()
                    .is_ok_and(|age| age > max)
            })
            .count()
    }

    /// Statistics over the last `window` completed tasks (cancellations excluded).
    pub fn window_stats(&self, window: usize) -> WindowStats {
        let recent: Vec<&TaskMetric> = self
            .history
            .iter()
            .rev()
            .filter(|m| m.state.counts_toward_rate())
            .take(window)
            .collect();
        if recent.is_empty() {
            return WindowStats::default();
        }

        let failed = recent.iter().filter(|m| m.state.is_failed()).count();
        let durations: Vec<Duration> = recent.iter().filter_map(|m| m.duration()).collect();
        let avg_duration = if durations.is_empty() {
            None
        } else {
            let total: Duration = durations.iter().sum();
            u32::try_from(durations.len()).ok().map(|n| total / n)
        };

        WindowStats {
            failure_rate: Some(failed as f64 / recent.len() as f64),
            avg_duration,
            considered: recent.len(),
        }
    }

    /// Take and reset the completed/failed counters since the last snapshot.
    pub fn take_window(&mut self) -> (u64, u64) {
        let counts = (self.window_completed, self.window_failed);
        self.window_completed = 0;
        self.window_failed = 0;
        counts
    }

    /// Store a snapshot, assigning its sequence number and clamping its
    /// timestamp so both never go backwards. Returns the stored value.
    pub fn push_snapshot(&mut self, mut snapshot: PerformanceSnapshot) -> PerformanceSnapshot {
        snapshot.sequence = self.next_sequence;
        self.next_sequence += 1;
        if let Some(previous) = self.snapshots.back()
            && snapshot.captured_at < previous.captured_at
        {
            snapshot.captured_at = previous.captured_at;
        }

        if self.snapshots.len() >= self.snapshot_capacity {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(snapshot.clone());
        snapshot
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn latest_snapshot(&self) -> Option<PerformanceSnapshot> {
        self.snapshots.back().cloned()
    }

    /// Up to `n` most recent snapshots, oldest first.
    pub fn recent_snapshots(&self, n: usize) -> Vec<PerformanceSnapshot> {
        let skip = self.snapshots.len().saturating_sub(n);
        self.snapshots.iter().skip(skip).cloned().collect()
    }

    /// Up to `n` most recent completed task metrics, oldest first.
    pub fn recent_task_metrics(&self, n: usize) -> Vec<TaskMetric> {
        let skip = self.history.len().saturating_sub(n);
        self.history[skip..].to_vec()
    }

    /// Drop completed metrics that ended before `now - age`. Returns how many went.
    pub fn prune_completed_older_than(&mut self, age: Duration, now: DateTime<Utc>) -> usize {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return 0;
        };
        let cutoff = now - age;
        let before = self.history.len();
        self.history
            .retain(|m| m.ended_at.is_none_or(|ended| ended >= cutoff));
        before - self.history.len()
    }
}
