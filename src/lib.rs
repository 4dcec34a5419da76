//! taskguard: supervision for background tasks in desktop applications.
//!
//! Background work runs on a tokio runtime (the scheduler) while UI state
//! lives on a single owner thread. This crate sits between the two and adds:
//! - **Run policies**: timeouts, retries with exponential backoff, progress
//!   reporting, fire-and-forget with result callbacks
//! - **Circuit breaking**: per-key breaker shared by every retrying call
//! - **Health monitoring**: task metrics, periodic system sampling and a
//!   healthy / warning / critical verdict
//! - **Owner-thread marshalling**: callbacks always run on the owner thread
//!
//! # Architecture
//!
//! [`TaskGuard`] wires one instance of each component together. Nothing is
//! global; construct as many independent guards as needed.
//!
//! ```no_run
//! # fn main() -> taskguard::Result<()> {
//! let runtime = tokio::runtime::Runtime::new()?;
//! let (guard, owner) = taskguard::TaskGuard::new(
//!     taskguard::GuardConfig::default(),
//!     runtime.handle().clone(),
//! )?;
//! let handle = guard.supervisor().spawn_with_callback(
//!     async { Ok::<_, std::io::Error>(42) },
//!     |result| println!("done on the owner thread: {result:?}"),
//! )?;
//! owner.run_until(|| handle.is_finished(), std::time::Duration::from_millis(10));
//! owner.pump();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

pub mod config;
pub mod error;
pub mod marshal;
pub mod metrics;
pub mod monitor;
pub mod progress;
pub mod supervisor;

pub use config::GuardConfig;
pub use error::{BoxError, Result, TaskError, TaskErrorKind};
pub use marshal::{ChannelDispatch, Marshaller, OwnerDispatch, OwnerLoop};
pub use metrics::{PerformanceSnapshot, TaskId, TaskMetric, TaskState};
pub use monitor::{HealthStatus, HealthVerdict, PerformanceMonitor, HostProbe, SystemProbe, SystemReading};
pub use progress::{ProgressCallback, ProgressReporter};
pub use supervisor::{RetryOptions, TaskHandle, TaskSupervisor};
pub use taskguard_breaker::{BreakerConfig, BreakerOpen, CircuitBreaker, CircuitState};

/// One fully wired supervision layer: configuration, circuit breaker,
/// performance monitor, marshaller and task supervisor.
#[derive(Debug)]
pub struct TaskGuard {
    config: Arc<GuardConfig>,
    monitor: Arc<PerformanceMonitor>,
    marshaller: Marshaller,
    supervisor: TaskSupervisor,
}

impl TaskGuard {
    /// Build a guard with a channel-backed marshaller. The calling thread
    /// becomes the owner thread and must drive the returned [`OwnerLoop`].
    ///
    /// Starts performance monitoring when `enable_performance_monitoring` is set.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Config`] for an invalid configuration, or
    /// [`TaskError::Io`] if the monitoring thread cannot be started.
    pub fn new(config: GuardConfig, scheduler: Handle) -> Result<(Self, OwnerLoop)> {
        let (marshaller, owner) = Marshaller::channel();
        let guard = Self::with_marshaller(config, scheduler, marshaller)?;
        Ok((guard, owner))
    }

    /// Build a guard around an existing marshaller (for example one backed
    /// by a GUI toolkit's own dispatch).
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_marshaller(config: GuardConfig, scheduler: Handle, marshaller: Marshaller) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let breakers = Arc::new(CircuitBreaker::new(config.breaker_config()));
        let monitor = Arc::new(
            PerformanceMonitor::new(Arc::clone(&config), breakers).with_scheduler(scheduler.clone()),
        );
        let supervisor = TaskSupervisor::new(
            Arc::clone(&config),
            Arc::clone(&monitor),
            marshaller.clone(),
            scheduler,
        );

        if config.enable_performance_monitoring {
            monitor.start_performance_monitoring()?;
        }
        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            circuit_breaker = config.enable_circuit_breaker,
            monitoring = config.enable_performance_monitoring,
            "task guard ready"
        );

        Ok(Self {
            config,
            monitor,
            marshaller,
            supervisor,
        })
    }

    pub fn config(&self) -> &Arc<GuardConfig> {
        &self.config
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn breakers(&self) -> &Arc<CircuitBreaker> {
        self.monitor.breakers()
    }

    pub fn marshaller(&self) -> &Marshaller {
        &self.marshaller
    }

    /// Current health verdict and figures.
    pub fn health(&self) -> HealthStatus {
        self.monitor.get_health_status()
    }

    /// Cancel every in-flight task and stop sampling.
    pub fn shutdown(&self) {
        let cancelled = self.supervisor.cancel_all();
        self.monitor.stop_performance_monitoring();
        info!(cancelled, "task guard shut down");
    }
}
