//! System resource probing.
//!
//! [`HostProbe`] reads host memory and CPU usage through `sysinfo`. CPU usage
//! is a delta between refreshes, so the first reading after construction has
//! no CPU figure. Unknown figures are `None`, never zero.

use std::sync::{Mutex, PoisonError};

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, System};
use tracing::debug;

/// One reading of system resource usage, in percent (0..=100).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SystemReading {
    pub memory_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
}

/// Source of system resource readings for the performance monitor.
pub trait SystemProbe: Send + Sync {
    /// Take one reading. Must not block for long and must not panic.
    fn read(&self) -> SystemReading;
}

struct HostState {
    system: System,
    cpu_primed: bool,
}

/// Probe backed by the host's own counters.
pub struct HostProbe {
    state: Mutex<HostState>,
}

impl HostProbe {
    pub fn new() -> Self {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            debug!("system resource usage unavailable on this platform");
        }
        Self {
            state: Mutex::new(HostState {
                system: System::new(),
                cpu_primed: false,
            }),
        }
    }
}

impl Default for HostProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let primed = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cpu_primed;
        f.debug_struct("HostProbe").field("cpu_primed", &primed).finish()
    }
}

impl SystemProbe for HostProbe {
    fn read(&self) -> SystemReading {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let HostState { system, cpu_primed } = &mut *state;

        system.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
        system.refresh_cpu_specifics(CpuRefreshKind::new().with_cpu_usage());

        let memory_percent = used_percent(system.total_memory(), system.used_memory());
        let cpu_percent = if *cpu_primed {
            average_percent(system.cpus().iter().map(|c| c.cpu_usage()))
        } else {
            *cpu_primed = true;
            None
        };
        SystemReading {
            memory_percent,
            cpu_percent,
        }
    }
}

/// `used / total` in percent; `None` when the total is unknown.
fn used_percent(total: u64, used: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((used.min(total) as f64 / total as f64 * 100.0).clamp(0.0, 100.0))
}

/// Mean of per-core usage figures; `None` when no core was reported.
fn average_percent(per_core: impl Iterator<Item = f32>) -> Option<f64> {
    let (sum, count) = per_core.fold((0.0_f64, 0_usize), |(sum, n), v| (sum + f64::from(v), n + 1));
    if count == 0 {
        return None;
    }
    let mean = sum / count as f64;
    mean.is_finite().then(|| mean.clamp(0.0, 100.0))
}
