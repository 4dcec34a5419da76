//! Per-key circuit breaker guarding calls into a dependency.
//!
//! Tracks consecutive failures per guarded key and rejects calls for a key
//! that keeps failing. After the recovery time, a tripped key enters a
//! half-open state where exactly one trial call decides whether to close the
//! circuit again or re-trip it.
//!
//! # State Machine
//!
//! ```text
//! ┌────────┐  N failures   ┌────────┐  recovery   ┌──────────┐
//! │ Closed ├──────────────►│  Open  ├────────────►│ HalfOpen │
//! └───▲────┘               └───▲────┘             └────┬─────┘
//!     │                        │  trial failure        │
//!     │                        └───────────────────────┤
//!     │  trial success                                 │
//!     └────────────────────────────────────────────────┘
//! ```
//!
//! Each key owns its own lock. The key map is only locked for lookup and
//! insertion, so transitions on one key never block calls on another.

use crate::error::{BreakerOpen, CallError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit state for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Key is healthy: all calls pass through.
    Closed,
    /// Key failed too often: calls are rejected until the recovery time elapses.
    Open,
    /// Recovery time elapsed: one trial call is allowed through.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Health tracking data for a single key.
#[derive(Debug, Clone)]
pub struct KeyHealth {
    /// Stored circuit state. See [`CircuitBreaker::state`] for the effective one.
    pub state: CircuitState,
    /// Number of consecutive failures since the last success.
    pub consecutive_failures: u32,
    /// When the last failure occurred (if any).
    pub last_failure_at: Option<Instant>,
    /// When the key last entered [`CircuitState::Open`].
    pub opened_at: Option<Instant>,
    /// Whether the single half-open trial call is currently running.
    pub trial_in_flight: bool,
}

impl Default for KeyHealth {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

impl KeyHealth {
    fn effective_state(&self, recovery_time: Duration, now: Instant) -> CircuitState {
        match self.state {
            CircuitState::Open if self.recovery_elapsed(recovery_time, now) => {
                CircuitState::HalfOpen
            }
            state => state,
        }
    }

    fn recovery_elapsed(&self, recovery_time: Duration, now: Instant) -> bool {
        self.opened_at
            .is_none_or(|t| now.saturating_duration_since(t) >= recovery_time)
    }

    /// `authoritative` is true for the half-open trial and for direct
    /// records; a stale permit admitted while Closed is not.
    fn apply_success(&mut self, key: &str, authoritative: bool) {
        if !authoritative && self.state != CircuitState::Closed {
            debug!(key, state = %self.state, "ignoring late success from a call admitted before the circuit opened");
            return;
        }
        if self.state != CircuitState::Closed {
            info!(key, previous = %self.state, "circuit closed");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        self.opened_at = None;
    }

    fn apply_failure(&mut self, key: &str, failure_threshold: u32, authoritative: bool) {
        let now = Instant::now();
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure_at = Some(now);

        match self.state {
            CircuitState::HalfOpen if authoritative => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                self.trial_in_flight = false;
                warn!(
                    key,
                    failures = self.consecutive_failures,
                    "circuit re-opened after failed trial call"
                );
            }
            CircuitState::Closed if self.consecutive_failures >= failure_threshold => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
                warn!(
                    key,
                    failures = self.consecutive_failures,
                    threshold = failure_threshold,
                    "circuit opened"
                );
            }
            // A late failure from a call admitted before the key opened does
            // not restart the recovery timer or end a running trial.
            CircuitState::Closed | CircuitState::Open | CircuitState::HalfOpen => {}
        }
    }
}

/// Configuration for circuit breaker behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Number of consecutive failures before tripping a key to Open.
    pub failure_threshold: u32,
    /// Time a key stays Open before one trial call is admitted.
    pub recovery_time: Duration,
    /// Upper bound on how long a guarded call may run before it counts as a
    /// failure. `None` disables the bound.
    pub call_timeout: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(300),
            call_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// Admission ticket for one guarded call.
///
/// Resolve it with [`succeed`](Self::succeed) or [`fail`](Self::fail).
/// Dropping an unresolved permit frees the half-open trial slot without
/// touching the failure count, which is what a cancelled call should do.
#[derive(Debug)]
pub struct BreakerPermit {
    key: String,
    slot: Arc<Mutex<KeyHealth>>,
    failure_threshold: u32,
    trial: bool,
    resolved: bool,
}

impl BreakerPermit {
    /// The key this permit was issued for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether this permit is the single half-open trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call. A trial success, or any success while
    /// Closed, returns the key to Closed with zero failures; a late success
    /// from a call admitted before the key opened is ignored.
    pub fn succeed(mut self) {
        lock(&self.slot).apply_success(&self.key, self.trial);
        self.resolved = true;
    }

    /// Record a failed call.
    pub fn fail(mut self) {
        lock(&self.slot).apply_failure(&self.key, self.failure_threshold, self.trial);
        self.resolved = true;
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            debug!(key = %self.key, "half-open trial abandoned, releasing slot");
            lock(&self.slot).trial_in_flight = false;
        }
    }
}

/// Per-key circuit breaker that tracks health and controls call flow.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    keys: RwLock<HashMap<String, Arc<Mutex<KeyHealth>>>>,
}

fn lock(slot: &Mutex<KeyHealth>) -> MutexGuard<'_, KeyHealth> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// The configuration this breaker was built with.
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn existing(&self, key: &str) -> Option<Arc<Mutex<KeyHealth>>> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(Arc::clone)
    }

    fn slot(&self, key: &str) -> Arc<Mutex<KeyHealth>> {
        if let Some(slot) = self.existing(key) {
            return slot;
        }
        let mut keys = self.keys.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(keys.entry(key.to_owned()).or_default())
    }

    /// Ask to run one call under `key`.
    ///
    /// - [`CircuitState::Closed`]: always admitted
    /// - [`CircuitState::Open`]: rejected until the recovery time has elapsed,
    ///   then admitted as the half-open trial
    /// - [`CircuitState::HalfOpen`]: admitted only if no trial is in flight
    ///
    /// Rejections never change any counter.
    pub fn try_acquire(&self, key: &str) -> Result<BreakerPermit, BreakerOpen> {
        let slot = self.slot(key);
        let trial = {
            let mut health = lock(&slot);
            let now = Instant::now();
            match health.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    if !health.recovery_elapsed(self.config.recovery_time, now) {
                        let open_for = health
                            .opened_at
                            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
                        return Err(BreakerOpen {
                            key: key.to_owned(),
                            consecutive_failures: health.consecutive_failures,
                            retry_after: self.config.recovery_time.saturating_sub(open_for),
                        });
                    }
                    info!(key, "circuit half-open, admitting trial call");
                    health.state = CircuitState::HalfOpen;
                    health.trial_in_flight = true;
                    true
                }
                CircuitState::HalfOpen => {
                    if health.trial_in_flight {
                        return Err(BreakerOpen {
                            key: key.to_owned(),
                            consecutive_failures: health.consecutive_failures,
                            retry_after: Duration::ZERO,
                        });
                    }
                    health.trial_in_flight = true;
                    true
                }
            }
        };

        Ok(BreakerPermit {
            key: key.to_owned(),
            slot,
            failure_threshold: self.config.failure_threshold,
            trial,
            resolved: false,
        })
    }

    /// Record a successful call for `key` without going through a permit.
    pub fn record_success(&self, key: &str) {
        lock(&self.slot(key)).apply_success(key, true);
    }

    /// Record a failed call for `key` without going through a permit.
    pub fn record_failure(&self, key: &str) {
        lock(&self.slot(key)).apply_failure(key, self.config.failure_threshold, true);
    }

    /// Effective circuit state for `key`.
    ///
    /// An Open key whose recovery time has elapsed reports
    /// [`CircuitState::HalfOpen`] even before the next call arrives.
    pub fn state(&self, key: &str) -> CircuitState {
        let now = Instant::now();
        self.existing(key).map_or(CircuitState::Closed, |slot| {
            lock(&slot).effective_state(self.config.recovery_time, now)
        })
    }

    /// Consecutive failures currently recorded for `key`.
    pub fn consecutive_failures(&self, key: &str) -> u32 {
        self.existing(key)
            .map_or(0, |slot| lock(&slot).consecutive_failures)
    }

    /// Snapshot of the stored health for `key`, if the key has been seen.
    pub fn key_health(&self, key: &str) -> Option<KeyHealth> {
        self.existing(key).map(|slot| lock(&slot).clone())
    }

    /// Keys whose effective state is [`CircuitState::Open`], sorted.
    pub fn open_keys(&self) -> Vec<String> {
        self.health_report()
            .into_iter()
            .filter(|(_, state, _)| *state == CircuitState::Open)
            .map(|(key, _, _)| key)
            .collect()
    }

    /// `(key, effective state, consecutive failures)` for every tracked key,
    /// sorted by key.
    pub fn health_report(&self) -> Vec<(String, CircuitState, u32)> {
        let now = Instant::now();
        let slots: Vec<(String, Arc<Mutex<KeyHealth>>)> = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect();

        let mut report: Vec<_> = slots
            .into_iter()
            .map(|(key, slot)| {
                let health = lock(&slot);
                let state = health.effective_state(self.config.recovery_time, now);
                (key, state, health.consecutive_failures)
            })
            .collect();
        report.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Forget every key (all back to Closed with zero failures).
    pub fn reset(&self) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Run `f` under the breaker for `key`.
    ///
    /// `f` is not invoked when the key rejects the call. When a call timeout
    /// is configured, a call running past it is abandoned and counted as a
    /// failure.
    pub async fn call<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire(key)?;

        let outcome = match self.config.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, f()).await {
                Ok(result) => result.map_err(CallError::Inner),
                Err(_) => Err(CallError::TimedOut(limit)),
            },
            None => f().await.map_err(CallError::Inner),
        };

        match &outcome {
            Ok(_) => permit.succeed(),
            Err(_) => permit.fail(),
        }
        outcome
    }
}
