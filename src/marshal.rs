//! Delivery of callables to the owner (GUI) thread.
//!
//! The owner thread holds UI state that must only be touched there.
//! [`Marshaller`] runs a callable inline when already on that thread and
//! otherwise hands it to an [`OwnerDispatch`], which queues it for the owner.
//!
//! The default dispatch is a crossbeam channel drained by an [`OwnerLoop`]
//! living on the owner thread. A toolkit with its own event-loop posting
//! primitive can plug that in through [`Marshaller::with_dispatch`] instead.
//!
//! Jobs posted from one thread run in the order they were posted. Nothing is
//! promised about the interleaving of jobs from different threads.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tracing::warn;

use crate::error::{Result, TaskError};

/// A unit of work for the owner thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Posts jobs to an owner thread's event loop.
pub trait OwnerDispatch: Send + Sync {
    /// Queue `job` to run on the owner thread. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Dispatch`] if the owner loop is gone.
    fn post(&self, job: Job) -> Result<()>;

    /// Whether the calling thread is the owner thread.
    fn is_owner_thread(&self) -> bool;
}

fn loop_closed() -> TaskError {
    TaskError::Dispatch("owner loop has been dropped".into())
}

/// Channel-backed dispatch paired with an [`OwnerLoop`].
#[derive(Debug, Clone)]
pub struct ChannelDispatch {
    tx: Sender<Job>,
    owner: ThreadId,
}

impl OwnerDispatch for ChannelDispatch {
    fn post(&self, job: Job) -> Result<()> {
        self.tx.send(job).map_err(|_| loop_closed())
    }

    fn is_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }
}

/// Receiving end of a [`ChannelDispatch`], pinned to the owner thread.
///
/// Not `Send`: it cannot leave the thread that created it. The owner's event
/// loop calls [`pump`](Self::pump) (or one of the waiting variants) to run
/// queued jobs. Dropping it closes the queue; jobs still queued are discarded.
pub struct OwnerLoop {
    rx: Receiver<Job>,
    _not_send: PhantomData<*const ()>,
}

impl OwnerLoop {
    fn run(job: Job) {
        if std::panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("owner-thread job panicked");
        }
    }

    /// Run every job queued right now. Jobs queued while pumping wait for the
    /// next call. Returns how many ran.
    pub fn pump(&self) -> usize {
        let queued = self.rx.len();
        let mut ran = 0;
        for _ in 0..queued {
            let Ok(job) = self.rx.try_recv() else {
                break;
            };
            Self::run(job);
            ran += 1;
        }
        ran
    }

    /// Block up to `timeout` for a job, then pump. Returns how many ran.
    pub fn wait_and_pump(&self, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                Self::run(job);
                1 + self.pump()
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        }
    }

    /// Keep pumping until `done` returns true, waking at least every `poll`.
    ///
    /// Returns `false` if every [`Marshaller`] was dropped and the queue is
    /// empty before `done` held, since nothing could change after that.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, poll: Duration) -> bool {
        loop {
            self.pump();
            if done() {
                return true;
            }
            match self.rx.recv_timeout(poll) {
                Ok(job) => Self::run(job),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }

    /// Jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl std::fmt::Debug for OwnerLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerLoop")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Runs callables on the owner thread.
#[derive(Clone)]
pub struct Marshaller {
    dispatch: Arc<dyn OwnerDispatch>,
}

impl Marshaller {
    /// Channel-backed marshaller. The calling thread becomes the owner thread
    /// and must drive the returned [`OwnerLoop`].
    pub fn channel() -> (Self, OwnerLoop) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let dispatch = ChannelDispatch {
            tx,
            owner: std::thread::current().id(),
        };
        (
            Self {
                dispatch: Arc::new(dispatch),
            },
            OwnerLoop {
                rx,
                _not_send: PhantomData,
            },
        )
    }

    /// Marshaller over a toolkit-provided dispatch.
    pub fn with_dispatch(dispatch: Arc<dyn OwnerDispatch>) -> Self {
        Self { dispatch }
    }

    pub fn is_owner_thread(&self) -> bool {
        self.dispatch.is_owner_thread()
    }

    /// Run `f` on the owner thread: inline if already there, otherwise queued
    /// without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Dispatch`] if the owner loop is gone.
    pub fn invoke<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_owner_thread() {
            f();
            return Ok(());
        }
        self.dispatch.post(Box::new(f))
    }

    /// Run `f` on the owner thread and block until it returns its result.
    ///
    /// Do not call this from a scheduler thread; use
    /// [`invoke_async`](Self::invoke_async) there.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Dispatch`] if the owner loop is gone or drops the
    /// job without running it.
    pub fn invoke_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_owner_thread() {
            return Ok(f());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.dispatch.post(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        rx.recv().map_err(|_| loop_closed())
    }

    /// Run `f` on the owner thread and await its result without blocking
    /// the calling scheduler thread.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Dispatch`] if the owner loop is gone or drops the
    /// job without running it.
    pub async fn invoke_async<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_owner_thread() {
            return Ok(f());
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.dispatch.post(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        rx.await.map_err(|_| loop_closed())
    }
}

impl std::fmt::Debug for Marshaller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Marshaller")
            .field("on_owner_thread", &self.is_owner_thread())
            .finish_non_exhaustive()
    }
}
