//! Progress reporting from supervised tasks to the owner thread.
//!
//! A task receives a [`ProgressReporter`] and calls [`report`](ProgressReporter::report)
//! with values in `[0.0, 1.0]`. Every accepted value is delivered to the
//! progress callback through the [`Marshaller`], so the callback only ever runs
//! on the owner thread.
//!
//! Delivered values never decrease. Once the reporter is closed (task failed
//! or was cancelled) nothing more is delivered, including values that were
//! already queued for the owner thread.

use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::marshal::Marshaller;
use crate::metrics::TaskId;

/// Callback receiving progress values on the owner thread.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

struct ReporterInner {
    task_id: TaskId,
    marshaller: Marshaller,
    callback: ProgressCallback,
    closed: CancellationToken,
    /// Highest value accepted at report time.
    reported: Mutex<Option<f64>>,
    /// Highest value actually handed to the callback.
    delivered: Mutex<Option<f64>>,
}

/// Handle a task uses to report its progress. Cheap to clone.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<ReporterInner>,
}

impl ProgressReporter {
    /// Reporter for `task_id` delivering to `callback` through `marshaller`.
    ///
    /// Cancelling `closed` (or calling [`close`](Self::close)) stops delivery.
    pub fn new(
        task_id: TaskId,
        marshaller: Marshaller,
        callback: ProgressCallback,
        closed: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(ReporterInner {
                task_id,
                marshaller,
                callback,
                closed,
                reported: Mutex::new(None),
                delivered: Mutex::new(None),
            }),
        }
    }

    pub fn task_id(&self) -> &TaskId {
        &self.inner.task_id
    }

    /// Report progress. `value` is clamped into `[0.0, 1.0]`.
    ///
    /// Returns `false` when the value was dropped: the reporter is closed,
    /// the value is NaN, it is lower than the last accepted value, or the
    /// owner loop is gone.
    pub fn report(&self, value: f64) -> bool {
        if self.is_closed() || value.is_nan() {
            return false;
        }
        let value = value.clamp(0.0, 1.0);

        {
            let mut reported = self
                .inner
                .reported
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if reported.is_some_and(|last| value < last) {
                debug!(task_id = %self.inner.task_id, value, "dropping regressive progress value");
                return false;
            }
            *reported = Some(value);
        }

        let inner = Arc::clone(&self.inner);
        let posted = self.inner.marshaller.invoke(move || inner.deliver(value));
        if let Err(e) = posted {
            debug!(task_id = %self.inner.task_id, "progress not delivered: {e}");
            return false;
        }
        true
    }

    /// Deliver a final `1.0` unless that was already the last accepted value.
    pub fn finish(&self) -> bool {
        if self.last_reported() == Some(1.0) {
            return false;
        }
        self.report(1.0)
    }

    /// Stop all further delivery, including values already queued.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Highest value accepted so far.
    pub fn last_reported(&self) -> Option<f64> {
        *self
            .inner
            .reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Highest value handed to the callback so far.
    pub fn last_delivered(&self) -> Option<f64> {
        *self
            .inner
            .delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl ReporterInner {
    /// Runs on the owner thread.
    fn deliver(&self, value: f64) {
        if self.closed.is_cancelled() {
            return;
        }
        {
            let mut delivered = self.delivered.lock().unwrap_or_else(PoisonError::into_inner);
            if delivered.is_some_and(|last| value < last) {
                return;
            }
            *delivered = Some(value);
        }
        (self.callback)(value);
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("task_id", &self.inner.task_id)
            .field("closed", &self.is_closed())
            .field("last_reported", &self.last_reported())
            .finish()
    }
}
