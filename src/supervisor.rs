//! Supervised execution of background tasks on the scheduler.
//!
//! [`TaskSupervisor`] submits futures to the tokio runtime it was given and
//! wraps them in a run policy:
//!
//! | Call | Policy |
//! |------|--------|
//! | [`run`](TaskSupervisor::run) | submit and await |
//! | [`run_with_timeout`](TaskSupervisor::run_with_timeout) | abort at a deadline |
//! | [`run_with_retry`](TaskSupervisor::run_with_retry) | fresh attempt per failure, exponential backoff, optional circuit breaker |
//! | [`run_with_progress`](TaskSupervisor::run_with_progress) | progress values marshalled to the owner thread |
//! | [`spawn`](TaskSupervisor::spawn) / [`spawn_with_callback`](TaskSupervisor::spawn_with_callback) | fire-and-forget |
//!
//! Every supervised call registers one task metric with the monitor and moves
//! it to exactly one terminal state. At most `max_concurrent_tasks` calls may
//! be in flight; beyond that calls fail fast with
//! [`TaskError::ResourceExhausted`].

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rand::Rng;
use taskguard_breaker::{BreakerOpen, BreakerPermit, CircuitBreaker, CircuitState};
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, warn};

use crate::config::GuardConfig;
use crate::error::{BoxError, Result, TaskError};
use crate::marshal::Marshaller;
use crate::metrics::{TaskId, TaskState};
use crate::monitor::PerformanceMonitor;
use crate::progress::ProgressReporter;

/// Per-call overrides for [`TaskSupervisor::run_with_retry`].
///
/// Unset fields fall back to the supervisor's configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    /// Circuit breaker key. Defaults to the type name of the factory, which
    /// identifies the call site.
    pub breaker_key: Option<String>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    pub fn breaker_key(mut self, key: impl Into<String>) -> Self {
        self.breaker_key = Some(key.into());
        self
    }
}

/// Delay before retry number `retry` (0-based): `min(base * 2^retry, cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, retry: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(retry)).min(cap)
}

/// Add up to `jitter * delay` of random extra delay.
fn with_jitter(delay: Duration, jitter: f64, rng: &mut impl Rng) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rng.gen_range(0.0..=jitter.min(1.0));
    delay.saturating_add(delay.mul_f64(factor))
}

/// Why a single submission did not produce a value.
enum RunError {
    Failed(BoxError),
    TimedOut(Duration),
    Cancelled,
}

/// One admitted supervised call: its id, cancellation token, metric and
/// concurrency slot.
///
/// Dropping an unsettled admission (the caller stopped awaiting) cancels its
/// token, so queued progress is suppressed, and records the task as Cancelled.
struct Admission {
    task_id: TaskId,
    cancel: CancellationToken,
    monitor: Arc<PerformanceMonitor>,
    settled: bool,
    _slot: OwnedSemaphorePermit,
}

impl Admission {
    fn settle(&mut self, state: TaskState, error: Option<String>) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.monitor.record_task_outcome(&self.task_id, state, error);
    }

    /// A retry call whose key opened between attempts ends as Failure with
    /// the last attempt's cause.
    fn reject_mid_retry(&mut self, open: BreakerOpen, last_error: Option<BoxError>, attempt: u32) -> TaskError {
        warn!(task_id = %self.task_id, key = %open.key, attempt, "circuit opened during retries");
        let cause = last_error.map_or_else(|| open.to_string(), |e| e.to_string());
        self.settle(TaskState::Failure, Some(cause));
        TaskError::CircuitOpen(open)
    }

    /// Record the terminal state of a single-submission call and map its error.
    fn conclude<T>(&mut self, result: std::result::Result<T, RunError>) -> Result<T> {
        let task_id = self.task_id.clone();
        match result {
            Ok(value) => {
                self.settle(TaskState::Success, None);
                Ok(value)
            }
            Err(RunError::Failed(source)) => {
                warn!(task_id = %task_id, error = %source, "task failed");
                self.settle(TaskState::Failure, Some(source.to_string()));
                Err(TaskError::Execution {
                    task_id,
                    attempts: 1,
                    source,
                })
            }
            Err(RunError::TimedOut(timeout)) => {
                warn!(task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "task timed out");
                self.settle(
                    TaskState::Timeout,
                    Some(format!("timed out after {timeout:?}")),
                );
                Err(TaskError::Timeout { task_id, timeout })
            }
            Err(RunError::Cancelled) => {
                debug!(task_id = %task_id, "task cancelled");
                self.settle(TaskState::Cancelled, None);
                Err(TaskError::Cancelled { task_id })
            }
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            debug!(task_id = %self.task_id, "supervised call dropped before completion");
            self.cancel.cancel();
            self.settle(TaskState::Cancelled, None);
        }
    }
}

/// Handle to a task started with [`TaskSupervisor::spawn`].
///
/// Dropping the handle detaches the task; its outcome is still recorded.
#[derive(Debug)]
pub struct TaskHandle<T> {
    task_id: TaskId,
    cancel: CancellationToken,
    join: JoinHandle<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    /// Request cancellation. The task records Cancelled and [`join`](Self::join)
    /// returns [`TaskError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task's result.
    pub async fn join(self) -> Result<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TaskError::Cancelled {
                task_id: self.task_id,
            }),
            Err(e) => Err(TaskError::execution(&self.task_id, 1, e)),
        }
    }
}

struct Inner {
    config: Arc<GuardConfig>,
    monitor: Arc<PerformanceMonitor>,
    breakers: Arc<CircuitBreaker>,
    marshaller: Marshaller,
    scheduler: Handle,
    slots: Arc<Semaphore>,
    shutdown: Mutex<CancellationToken>,
}

/// Runs futures on the scheduler under timeout, retry and progress policies.
///
/// Cheap to clone; clones share the same admission limit and cancellation scope.
#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<Inner>,
}

impl TaskSupervisor {
    /// Supervisor submitting to `scheduler`, recording into `monitor` and
    /// sharing the monitor's circuit breaker.
    pub fn new(
        config: Arc<GuardConfig>,
        monitor: Arc<PerformanceMonitor>,
        marshaller: Marshaller,
        scheduler: Handle,
    ) -> Self {
        let breakers = Arc::clone(monitor.breakers());
        let slots = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Self {
            inner: Arc::new(Inner {
                config,
                monitor,
                breakers,
                marshaller,
                scheduler,
                slots,
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn config(&self) -> &Arc<GuardConfig> {
        &self.inner.config
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.inner.monitor
    }

    pub fn breakers(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breakers
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.inner.marshaller
    }

    /// Supervised calls currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner
            .config
            .max_concurrent_tasks
            .saturating_sub(self.inner.slots.available_permits())
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn admit(&self, task_id: Option<TaskId>) -> Result<Admission> {
        let slot = Arc::clone(&self.inner.slots)
            .try_acquire_owned()
            .map_err(|_| {
                TaskError::ResourceExhausted(format!(
                    "{} supervised tasks already in flight",
                    self.inner.config.max_concurrent_tasks
                ))
            })?;
        let task_id = task_id.unwrap_or_else(TaskId::generate);
        self.inner.monitor.record_task_submitted(&task_id);
        Ok(Admission {
            task_id,
            cancel: self.shutdown_token().child_token(),
            monitor: Arc::clone(&self.inner.monitor),
            settled: false,
            _slot: slot,
        })
    }

    /// Submit `fut` to the scheduler and wait for it, a deadline, or cancellation.
    ///
    /// Leaving early aborts the scheduler task, so a late result is discarded.
    async fn drive<Fut, T, E>(
        &self,
        admission: &Admission,
        fut: Fut,
        deadline: Option<Duration>,
    ) -> std::result::Result<T, RunError>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut task = AbortOnDropHandle::new(self.inner.scheduler.spawn(fut));
        self.inner.monitor.record_task_start(&admission.task_id);

        let expiry = async {
            match deadline {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = admission.cancel.cancelled() => {
                task.abort();
                Err(RunError::Cancelled)
            }
            joined = &mut task => match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(RunError::Failed(e.into())),
                Err(e) if e.is_cancelled() => Err(RunError::Cancelled),
                Err(e) => Err(RunError::Failed(Box::new(e))),
            },
            () = expiry => {
                task.abort();
                Err(RunError::TimedOut(deadline.unwrap_or_default()))
            }
        }
    }

    /// Start `fut` without waiting. The outcome is recorded whether or not
    /// anyone joins the returned handle.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ResourceExhausted`] at the concurrency limit.
    pub fn spawn<Fut, T, E>(&self, fut: Fut) -> Result<TaskHandle<T>>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.spawn_inner(None, fut)
    }

    /// Like [`spawn`](Self::spawn) with a caller-chosen task id.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ResourceExhausted`] at the concurrency limit.
    pub fn spawn_with_id<Fut, T, E>(&self, task_id: TaskId, fut: Fut) -> Result<TaskHandle<T>>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        self.spawn_inner(Some(task_id), fut)
    }

    fn spawn_inner<Fut, T, E>(&self, task_id: Option<TaskId>, fut: Fut) -> Result<TaskHandle<T>>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut admission = self.admit(task_id)?;
        let task_id = admission.task_id.clone();
        let cancel = admission.cancel.clone();
        let this = self.clone();
        let join = self.inner.scheduler.spawn(async move {
            let result = this.drive(&admission, fut, None).await;
            admission.conclude(result)
        });
        debug!(task_id = %task_id, "task spawned");
        Ok(TaskHandle {
            task_id,
            cancel,
            join,
        })
    }

    /// Start `fut` and hand its final result to `on_done` on the owner thread.
    ///
    /// Nothing is delivered if the task is cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ResourceExhausted`] at the concurrency limit.
    pub fn spawn_with_callback<Fut, T, E, D>(&self, fut: Fut, on_done: D) -> Result<TaskHandle<()>>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
        D: FnOnce(Result<T>) + Send + 'static,
    {
        let mut admission = self.admit(None)?;
        let task_id = admission.task_id.clone();
        let cancel = admission.cancel.clone();
        let this = self.clone();
        let join = self.inner.scheduler.spawn(async move {
            let result = this.drive(&admission, fut, None).await;
            let result = admission.conclude(result);
            if matches!(result, Err(TaskError::Cancelled { .. })) {
                return result.map(|_| ());
            }
            let cancel = admission.cancel.clone();
            let task_id = admission.task_id.clone();
            drop(admission);
            this.inner.marshaller.invoke(move || {
                if cancel.is_cancelled() {
                    debug!(task_id = %task_id, "result callback suppressed after cancellation");
                    return;
                }
                on_done(result);
            })
        });
        Ok(TaskHandle {
            task_id,
            cancel,
            join,
        })
    }

    /// Submit `fut` and await its result.
    ///
    /// # Errors
    ///
    /// [`TaskError::Execution`] (attempts = 1) if the task fails or panics,
    /// [`TaskError::Cancelled`], or [`TaskError::ResourceExhausted`].
    pub async fn run<Fut, T, E>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let mut admission = self.admit(None)?;
        let result = self.drive(&admission, fut, None).await;
        admission.conclude(result)
    }

    /// Submit `fut` and abort it if it is still running after `timeout`
    /// (or the configured `task_timeout` when `None`).
    ///
    /// # Errors
    ///
    /// [`TaskError::Timeout`] at the deadline, otherwise as [`run`](Self::run).
    pub async fn run_with_timeout<Fut, T, E>(&self, fut: Fut, timeout: Option<Duration>) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let deadline = timeout.unwrap_or_else(|| self.inner.config.task_timeout());
        let mut admission = self.admit(None)?;
        let result = self.drive(&admission, fut, Some(deadline)).await;
        admission.conclude(result)
    }

    fn breaker_permit(&self, key: &str) -> std::result::Result<Option<BreakerPermit>, BreakerOpen> {
        if !self.inner.config.enable_circuit_breaker {
            return Ok(None);
        }
        self.inner.breakers.try_acquire(key).map(Some)
    }

    /// The rejection `key` would get right now if its circuit is Open and
    /// still inside its recovery time.
    fn open_circuit(&self, key: &str) -> Option<BreakerOpen> {
        if !self.inner.config.enable_circuit_breaker
            || self.inner.breakers.state(key) != CircuitState::Open
        {
            return None;
        }
        self.inner.breakers.try_acquire(key).err()
    }

    /// Run a fresh future from `factory` until one succeeds or
    /// `max_retries + 1` attempts have failed.
    ///
    /// With the circuit breaker enabled every attempt first takes a permit
    /// for the call's key; a refused permit ends the call immediately with
    /// [`TaskError::CircuitOpen`] without invoking `factory`. A key that an
    /// earlier attempt opened is noticed before the backoff sleep. An attempt
    /// running past `circuit_breaker_timeout` is abandoned and counted as a
    /// failure.
    ///
    /// # Errors
    ///
    /// [`TaskError::Execution`] carrying the last cause once attempts are
    /// exhausted, [`TaskError::CircuitOpen`], [`TaskError::Cancelled`], or
    /// [`TaskError::ResourceExhausted`].
    pub async fn run_with_retry<F, Fut, T, E>(&self, mut factory: F, options: RetryOptions) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let config = Arc::clone(&self.inner.config);
        let max_retries = options.max_retries.unwrap_or(config.max_retries);
        let base_delay = options.retry_delay.unwrap_or_else(|| config.retry_delay());
        let key = options
            .breaker_key
            .unwrap_or_else(|| std::any::type_name::<F>().to_owned());
        let attempt_bound = config
            .enable_circuit_breaker
            .then(|| config.breaker_config().call_timeout)
            .flatten();

        let mut permit = self.breaker_permit(&key).inspect_err(|open| {
            warn!(key = %key, retry_after_ms = open.retry_after.as_millis() as u64, "call rejected by open circuit");
        })?;
        let mut admission = self.admit(None)?;
        let task_id = admission.task_id.clone();
        let mut last_error: Option<BoxError> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                if let Some(open) = self.open_circuit(&key) {
                    return Err(admission.reject_mid_retry(open, last_error, attempt));
                }

                let delay = with_jitter(
                    backoff_delay(base_delay, config.max_retry_delay(), attempt - 1),
                    config.retry_jitter,
                    &mut rand::thread_rng(),
                );
                debug!(task_id = %task_id, attempt, delay_ms = delay.as_millis() as u64, "backing off before retry");
                tokio::select! {
                    biased;
                    _ = admission.cancel.cancelled() => {
                        admission.settle(TaskState::Cancelled, None);
                        return Err(TaskError::Cancelled { task_id });
                    }
                    () = tokio::time::sleep(delay) => {}
                }

                permit = match self.breaker_permit(&key) {
                    Ok(permit) => permit,
                    Err(open) => return Err(admission.reject_mid_retry(open, last_error, attempt)),
                };
            }

            debug!(task_id = %task_id, attempt, max_retries, "starting attempt");
            match self.drive(&admission, factory(), attempt_bound).await {
                Ok(value) => {
                    if let Some(permit) = permit.take() {
                        permit.succeed();
                    }
                    if attempt > 0 {
                        info!(task_id = %task_id, attempt, "task succeeded after retry");
                    }
                    admission.settle(TaskState::Success, None);
                    return Ok(value);
                }
                Err(RunError::Cancelled) => {
                    drop(permit.take());
                    admission.settle(TaskState::Cancelled, None);
                    return Err(TaskError::Cancelled { task_id });
                }
                Err(RunError::Failed(e)) => {
                    if let Some(permit) = permit.take() {
                        permit.fail();
                    }
                    warn!(task_id = %task_id, attempt, error = %e, "attempt failed");
                    last_error = Some(e);
                }
                Err(RunError::TimedOut(timeout)) => {
                    if let Some(permit) = permit.take() {
                        permit.fail();
                    }
                    warn!(task_id = %task_id, attempt, timeout_ms = timeout.as_millis() as u64, "attempt exceeded breaker timeout");
                    last_error = Some(Box::new(TaskError::Timeout {
                        task_id: task_id.clone(),
                        timeout,
                    }));
                }
            }
        }

        let source = last_error.unwrap_or_else(|| "no attempt was made".into());
        warn!(task_id = %task_id, attempts = max_retries + 1, error = %source, "retries exhausted");
        admission.settle(TaskState::Failure, Some(source.to_string()));
        Err(TaskError::Execution {
            task_id,
            attempts: max_retries.saturating_add(1),
            source,
        })
    }

    /// Run the future built by `task_fn`, which reports progress through the
    /// reporter it is given. `on_progress` only ever runs on the owner thread.
    ///
    /// On success a final `1.0` is delivered if it was not the last value.
    /// On failure or cancellation the reporter is closed and values still
    /// queued for the owner thread are dropped.
    ///
    /// # Errors
    ///
    /// As [`run`](Self::run).
    pub async fn run_with_progress<F, Fut, T, E, P>(&self, task_fn: F, on_progress: P) -> Result<T>
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError> + Send + 'static,
        P: Fn(f64) + Send + Sync + 'static,
    {
        let mut admission = self.admit(None)?;
        let reporter = ProgressReporter::new(
            admission.task_id.clone(),
            self.inner.marshaller.clone(),
            Arc::new(on_progress),
            admission.cancel.child_token(),
        );
        let result = self.drive(&admission, task_fn(reporter.clone()), None).await;
        match &result {
            Ok(_) => {
                reporter.finish();
            }
            Err(_) => reporter.close(),
        }
        admission.conclude(result)
    }

    /// Drive a stream of progress values to completion, reporting each one.
    ///
    /// # Errors
    ///
    /// The first error the stream yields, as [`TaskError::Execution`];
    /// otherwise as [`run`](Self::run).
    pub async fn run_progress_stream<S, E, P>(&self, stream: S, on_progress: P) -> Result<()>
    where
        S: Stream<Item = std::result::Result<f64, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
        P: Fn(f64) + Send + Sync + 'static,
    {
        self.run_with_progress(
            move |reporter| async move {
                let mut stream = Box::pin(stream);
                while let Some(item) = stream.next().await {
                    reporter.report(item?);
                }
                Ok::<(), E>(())
            },
            on_progress,
        )
        .await
    }

    /// Cancel every supervised call currently in flight. Each records
    /// Cancelled and its caller receives [`TaskError::Cancelled`].
    ///
    /// Calls started afterwards are unaffected. Returns how many were in flight.
    pub fn cancel_all(&self) -> usize {
        let in_flight = self.in_flight();
        let previous = {
            let mut shutdown = self
                .inner
                .shutdown
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *shutdown, CancellationToken::new())
        };
        previous.cancel();
        info!(in_flight, "cancelled all supervised tasks");
        in_flight
    }
}

impl std::fmt::Debug for TaskSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSupervisor")
            .field("in_flight", &self.in_flight())
            .field("max_concurrent_tasks", &self.inner.config.max_concurrent_tasks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn make_supervisor(config: GuardConfig) -> (TaskSupervisor, crate::marshal::OwnerLoop) {
        let config = Arc::new(config);
        let breakers = Arc::new(CircuitBreaker::new(config.breaker_config()));
        let monitor = Arc::new(PerformanceMonitor::new(Arc::clone(&config), breakers));
        let (marshaller, owner) = Marshaller::channel();
        (
            TaskSupervisor::new(config, monitor, marshaller, Handle::current()),
            owner,
        )
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, cap, 3), cap);
        assert_eq!(backoff_delay(base, cap, 40), cap);
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = with_jitter(delay, 0.5, &mut rng);
            assert!(jittered >= delay);
            assert!(jittered <= Duration::from_millis(150));
        }
        assert_eq!(with_jitter(delay, 0.0, &mut rng), delay);
    }

    #[test]
    fn retry_options_builder() {
        let options = RetryOptions::new()
            .max_retries(2)
            .retry_delay(Duration::from_secs(1))
            .breaker_key("sync");
        assert_eq!(options.max_retries, Some(2));
        assert_eq!(options.retry_delay, Some(Duration::from_secs(1)));
        assert_eq!(options.breaker_key.as_deref(), Some("sync"));
    }

    #[tokio::test]
    async fn run_returns_value_and_records_success() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let value = supervisor.run(async { Ok::<_, std::io::Error>(5) }).await.unwrap();
        assert_eq!(value, 5);

        let metrics = supervisor.monitor().recent_task_metrics(1);
        assert_eq!(metrics[0].state, TaskState::Success);
        assert_eq!(supervisor.in_flight(), 0);
    }

    #[tokio::test]
    async fn run_failure_maps_to_execution() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let err = supervisor
            .run(async { Err::<(), _>("broken pipe") })
            .await
            .unwrap_err();
        match err {
            TaskError::Execution { attempts, source, .. } => {
                assert_eq!(attempts, 1);
                assert_eq!(source.to_string(), "broken pipe");
            }
            other => panic!("unexpected: {other}"),
        }
        let metrics = supervisor.monitor().recent_task_metrics(1);
        assert_eq!(metrics[0].state, TaskState::Failure);
        assert_eq!(metrics[0].error.as_deref(), Some("broken pipe"));
    }

    #[tokio::test]
    async fn run_panic_maps_to_execution() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let err = supervisor
            .run(async {
                if true {
                    panic!("kaboom");
                }
                Ok::<(), std::io::Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Execution { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_uses_config_default() {
        let (supervisor, _owner) = make_supervisor(GuardConfig {
            task_timeout_secs: 2.0,
            ..Default::default()
        });
        let err = supervisor
            .run_with_timeout(
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, std::io::Error>(())
                },
                None,
            )
            .await
            .unwrap_err();
        match err {
            TaskError::Timeout { timeout, .. } => assert_eq!(timeout, Duration::from_secs(2)),
            other => panic!("unexpected: {other}"),
        }
        let metrics = supervisor.monitor().recent_task_metrics(1);
        assert_eq!(metrics[0].state, TaskState::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_counts_attempts_and_keeps_last_cause() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = supervisor
            .run_with_retry(
                move || {
                    let n = c.fetch_add(1, Ordering::SeqCst);
                    async move { Err::<(), _>(format!("failure {n}")) }
                },
                RetryOptions::new().max_retries(2),
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            TaskError::Execution { attempts, source, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "failure 2");
            }
            other => panic!("unexpected: {other}"),
        }
        assert_eq!(supervisor.monitor().recent_task_metrics(10).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backoff_sleeps_exponentially() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let start = tokio::time::Instant::now();
        let _ = supervisor
            .run_with_retry(
                || async { Err::<(), _>("nope") },
                RetryOptions::new()
                    .max_retries(3)
                    .retry_delay(Duration::from_millis(100)),
            )
            .await;
        // 100 + 200 + 400
        assert!(start.elapsed() >= Duration::from_millis(700));
        assert!(start.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opened_by_an_attempt_ends_retries_without_backoff() {
        let (supervisor, _owner) = make_supervisor(GuardConfig {
            enable_circuit_breaker: true,
            circuit_breaker_threshold: 2,
            ..Default::default()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let start = tokio::time::Instant::now();

        let err = supervisor
            .run_with_retry(
                move || {
                    c.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>("unreachable host") }
                },
                RetryOptions::new()
                    .max_retries(5)
                    .retry_delay(Duration::from_secs(1))
                    .breaker_key("host"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, TaskError::CircuitOpen(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // Only the backoff between the two attempts.
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));

        let metrics = supervisor.monitor().recent_task_metrics(1);
        assert_eq!(metrics[0].state, TaskState::Failure);
        assert_eq!(metrics[0].error.as_deref(), Some("unreachable host"));
    }

    #[tokio::test]
    async fn admission_limit_rejects_fast() {
        let (supervisor, _owner) = make_supervisor(GuardConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        });
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let held = supervisor
            .spawn(async move {
                let _ = release_rx.await;
                Ok::<_, std::io::Error>(())
            })
            .unwrap();

        let err = supervisor.run(async { Ok::<_, std::io::Error>(()) }).await.unwrap_err();
        assert!(matches!(err, TaskError::ResourceExhausted(_)));

        release_tx.send(()).unwrap();
        held.join().await.unwrap();
        supervisor.run(async { Ok::<_, std::io::Error>(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn handle_cancel_records_cancelled() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let handle = supervisor
            .spawn(async {
                std::future::pending::<()>().await;
                Ok::<_, std::io::Error>(())
            })
            .unwrap();
        let id = handle.id().clone();
        handle.cancel();
        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled { .. }));
        assert_eq!(supervisor.monitor().task_state(&id), Some(TaskState::Cancelled));
    }

    #[tokio::test]
    async fn dropped_progress_call_closes_its_reporter() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let call = supervisor.run_with_progress(
            |reporter| async move {
                let _ = tx.send(reporter.clone());
                std::future::pending::<()>().await;
                Ok::<_, std::io::Error>(())
            },
            |_| {},
        );
        let reporter = tokio::select! {
            _ = call => panic!("pending task finished"),
            reporter = rx => reporter.unwrap(),
        };

        assert!(reporter.is_closed());
        assert!(!reporter.report(0.5));
        let metrics = supervisor.monitor().recent_task_metrics(1);
        assert_eq!(metrics[0].state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn dropped_caller_records_cancelled() {
        let (supervisor, _owner) = make_supervisor(GuardConfig::default());
        let call = supervisor.run(async {
            std::future::pending::<()>().await;
            Ok::<_, std::io::Error>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;

        let metrics = supervisor.monitor().recent_task_metrics(1);
        assert_eq!(metrics[0].state, TaskState::Cancelled);
        assert_eq!(supervisor.in_flight(), 0);
    }
}
