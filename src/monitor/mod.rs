//! Performance and health monitoring.
//!
//! [`PerformanceMonitor`] owns the task metric store and the snapshot ring,
//! samples system state on a dedicated `taskguard-monitor` thread, and turns
//! everything it knows (plus the shared circuit breaker) into a
//! [`HealthStatus`].
//!
//! All bookkeeping goes through one short-lived mutex. Recording never fails
//! the caller; a poisoned lock is recovered.
//!
//! # Usage
//!
//! ```rust,ignore
//! let monitor = PerformanceMonitor::new(config, breakers).with_scheduler(handle);
//! monitor.start_performance_monitoring()?;
//! let status = monitor.get_health_status();
//! ```

pub mod health;
pub mod system;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, select};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use taskguard_breaker::CircuitBreaker;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::Result;
use crate::metrics::{MetricsStore, PerformanceSnapshot, TaskId, TaskMetric, TaskState};

pub use health::{HealthInputs, HealthStatus, HealthVerdict, evaluate};
pub use system::{HostProbe, SystemProbe, SystemReading};

/// Completed metrics older than this are dropped by the sampling loop.
pub const COMPLETED_METRIC_RETENTION: Duration = Duration::from_secs(3600);

const THREAD_NAME: &str = "taskguard-monitor";

struct Shared {
    config: Arc<GuardConfig>,
    breakers: Arc<CircuitBreaker>,
    store: Mutex<MetricsStore>,
    started_at: Instant,
}

impl Shared {
    fn store(&self) -> MutexGuard<'_, MetricsStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything one sample needs; cloned into the sampling thread.
#[derive(Clone)]
struct Sampler {
    shared: Arc<Shared>,
    probe: Arc<dyn SystemProbe>,
    scheduler: Option<Handle>,
}

impl Sampler {
    fn sample(&self) -> PerformanceSnapshot {
        let config = &self.shared.config;
        let reading = if config.enable_memory_monitoring {
            self.probe.read()
        } else {
            SystemReading::default()
        };
        let latency = self
            .scheduler
            .as_ref()
            .and_then(|handle| probe_scheduler_latency(handle, config.metrics_interval()));

        let stored = {
            let mut store = self.shared.store();
            let (completed, failed) = store.take_window();
            let snapshot = PerformanceSnapshot::new(
                reading.memory_percent,
                reading.cpu_percent,
                latency,
                store.running_count(),
            )
            .with_window(completed, failed);
            store.push_snapshot(snapshot)
        };

        if let Some(memory_percent) = stored.memory_percent
            && memory_percent > config.memory_warning_threshold
        {
            warn!(
                memory_percent,
                threshold = config.memory_warning_threshold,
                "memory usage above warning threshold"
            );
        }
        if let Some(latency) = stored.scheduler_latency {
            let latency_ms = latency.as_micros() as f64 / 1000.0;
            if latency_ms > config.latency_warning_ms {
                warn!(
                    latency_ms,
                    threshold_ms = config.latency_warning_ms,
                    "scheduler latency above warning threshold"
                );
            }
        }
        debug!(
            sequence = stored.sequence,
            active_tasks = stored.active_tasks,
            error_rate = stored.error_rate,
            "performance snapshot recorded"
        );
        stored
    }
}

/// Time how long a no-op takes to get scheduled, giving up after `limit`.
fn probe_scheduler_latency(handle: &Handle, limit: Duration) -> Option<Duration> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let submitted = Instant::now();
    handle.spawn(async move {
        let _ = tx.send(submitted.elapsed());
    });
    rx.recv_timeout(limit)
        .inspect_err(|e| debug!("scheduler latency probe gave up: {e}"))
        .ok()
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

fn run_sampling(sampler: Sampler, interval: Duration, stop_rx: Receiver<()>) {
    info!(interval_ms = interval.as_millis() as u64, "performance monitoring started");
    sampler.sample();

    let ticker = crossbeam_channel::tick(interval);
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(ticker) -> _ => {
                sampler.sample();
                let pruned = sampler
                    .shared
                    .store()
                    .prune_completed_older_than(COMPLETED_METRIC_RETENTION, Utc::now());
                if pruned > 0 {
                    debug!(pruned, "old task metrics pruned");
                }
            }
        }
    }
    info!("performance monitoring stopped");
}

/// Task metric bookkeeping, periodic sampling and health scoring.
pub struct PerformanceMonitor {
    sampler: Sampler,
    worker: Mutex<Option<Worker>>,
}

impl PerformanceMonitor {
    /// Create a monitor reading system figures through [`HostProbe`].
    pub fn new(config: Arc<GuardConfig>, breakers: Arc<CircuitBreaker>) -> Self {
        let store = MetricsStore::new(config.task_history_limit, config.snapshot_capacity);
        Self {
            sampler: Sampler {
                shared: Arc::new(Shared {
                    config,
                    breakers,
                    store: Mutex::new(store),
                    started_at: Instant::now(),
                }),
                probe: Arc::new(HostProbe::new()),
                scheduler: None,
            },
            worker: Mutex::new(None),
        }
    }

    /// Replace the system probe.
    pub fn with_probe(mut self, probe: impl SystemProbe + 'static) -> Self {
        self.sampler.probe = Arc::new(probe);
        self
    }

    /// Measure scheduler latency on every sample by timing a no-op on `handle`.
    ///
    /// The probe blocks the sampling thread for up to one interval, so do not
    /// call [`sample_now`](Self::sample_now) from a thread driving a
    /// `current_thread` runtime.
    pub fn with_scheduler(mut self, handle: Handle) -> Self {
        self.sampler.scheduler = Some(handle);
        self
    }

    pub fn config(&self) -> &Arc<GuardConfig> {
        &self.sampler.shared.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreaker> {
        &self.sampler.shared.breakers
    }

    fn store(&self) -> MutexGuard<'_, MetricsStore> {
        self.sampler.shared.store()
    }

    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start periodic sampling. Returns `false` if it was already running.
    ///
    /// One sample is taken immediately, then one per `metrics_interval`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Io`](crate::TaskError::Io) if the thread cannot be spawned.
    pub fn start_performance_monitoring(&self) -> Result<bool> {
        let mut worker = self.worker();
        if worker.is_some() {
            debug!("performance monitoring already running");
            return Ok(false);
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let sampler = self.sampler.clone();
        let interval = self.config().metrics_interval();
        let handle = std::thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || run_sampling(sampler, interval, stop_rx))?;

        *worker = Some(Worker { stop_tx, handle });
        Ok(true)
    }

    /// Stop periodic sampling and wait for the sampling thread to exit.
    ///
    /// No sample is taken after this returns. Returns `false` if it was not running.
    pub fn stop_performance_monitoring(&self) -> bool {
        let Some(Worker { stop_tx, handle }) = self.worker().take() else {
            return false;
        };
        drop(stop_tx);
        if handle.join().is_err() {
            warn!("performance monitoring thread panicked");
        }
        true
    }

    pub fn is_monitoring(&self) -> bool {
        self.worker().is_some()
    }

    /// Take one snapshot synchronously.
    pub fn sample_now(&self) -> PerformanceSnapshot {
        self.sampler.sample()
    }

    /// Push an externally built snapshot into the ring.
    ///
    /// Its sequence number is reassigned and its timestamp clamped so the ring
    /// stays monotonic.
    pub fn record_snapshot(&self, snapshot: PerformanceSnapshot) -> PerformanceSnapshot {
        self.store().push_snapshot(snapshot)
    }

    /// Register a task as Pending.
    pub fn record_task_submitted(&self, task_id: &TaskId) {
        if self.store().register(task_id) {
            debug!(task_id = %task_id, "task submitted");
        }
    }

    /// Mark a task Running, registering it first if needed.
    pub fn record_task_start(&self, task_id: &TaskId) {
        self.store().mark_running(task_id);
        debug!(task_id = %task_id, "task started");
    }

    /// Record a Success or Failure outcome.
    pub fn record_task_completion(&self, task_id: &TaskId, success: bool, error: Option<String>) -> bool {
        let state = if success {
            TaskState::Success
        } else {
            TaskState::Failure
        };
        self.record_task_outcome(task_id, state, error)
    }

    /// Record any terminal outcome. Returns `false` if the task had already
    /// reached a terminal state (the call is then ignored).
    pub fn record_task_outcome(&self, task_id: &TaskId, state: TaskState, error: Option<String>) -> bool {
        let recorded = self.store().complete(task_id, state, error);
        if recorded {
            debug!(task_id = %task_id, %state, "task finished");
        }
        recorded
    }

    /// Current state of a task, live or in history.
    pub fn task_state(&self, task_id: &TaskId) -> Option<TaskState> {
        self.store().task_state(task_id)
    }

    /// Number of tasks currently Running.
    pub fn get_task_count(&self) -> usize {
        self.store().running_count()
    }

    /// Classify current health. Never fails.
    pub fn get_health_status(&self) -> HealthStatus {
        let config = self.config();
        let mut inputs = {
            let store = self.store();
            let latest = store.latest_snapshot();
            let stats = store.window_stats(config.health_window);
            HealthInputs {
                memory_percent: latest.as_ref().and_then(|s| s.memory_percent),
                cpu_percent: latest.as_ref().and_then(|s| s.cpu_percent),
                scheduler_latency: latest.as_ref().and_then(|s| s.scheduler_latency),
                active_tasks: store.running_count(),
                error_rate: stats.failure_rate,
                avg_task_duration: stats.avg_duration,
                open_breakers: Vec::new(),
                long_running_tasks: store
                    .long_running(config.max_task_execution_time(), Utc::now()),
                snapshots_recorded: store.snapshot_count(),
                uptime: Duration::ZERO,
                monitoring: false,
            }
        };
        inputs.open_breakers = self.breakers().open_keys();
        inputs.uptime = self.sampler.shared.started_at.elapsed();
        inputs.monitoring = self.is_monitoring();
        evaluate(inputs, config)
    }

    /// Up to `n` most recent snapshots, oldest first.
    pub fn recent_snapshots(&self, n: usize) -> Vec<PerformanceSnapshot> {
        self.store().recent_snapshots(n)
    }

    pub fn latest_snapshot(&self) -> Option<PerformanceSnapshot> {
        self.store().latest_snapshot()
    }

    /// Up to `n` most recent completed task metrics, oldest first.
    pub fn recent_task_metrics(&self, n: usize) -> Vec<TaskMetric> {
        self.store().recent_task_metrics(n)
    }

    /// Drop completed metrics older than `age`. Returns how many were dropped.
    pub fn prune_completed_older_than(&self, age: Duration) -> usize {
        self.store().prune_completed_older_than(age, Utc::now())
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.stop_performance_monitoring();
    }
}

impl std::fmt::Debug for PerformanceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceMonitor")
            .field("monitoring", &self.is_monitoring())
            .field("latency_probe", &self.sampler.scheduler.is_some())
            .finish_non_exhaustive()
    }
}
