//! Bounded task execution shared by everything running against one disk.
//!
//! A [`WorkerPool`] limits how many tasks run at once. A [`TaskGroup`] tracks
//! the tasks of one operation and reports whether all of them succeeded. A
//! [`Completion`] runs a callback once a set of tasks has finished, in
//! whichever task finishes last.
//!
//! Tasks must never wait for other tasks of the same pool, otherwise a full
//! pool deadlocks. Work that depends on other tasks goes into a completion
//! callback instead.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};
use tracing::error;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);

        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Default)]
struct GroupState {
    pending: AtomicUsize,
    failed: AtomicBool,
    idle: Notify,
}

/// Marks the task as finished even if it panics.
struct TaskGuard {
    state: Arc<GroupState>,
    success: bool,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if !self.success {
            self.state.failed.store(true, Ordering::SeqCst);
        }
        if self.state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// Set of tasks whose results are reduced with logical AND.
///
/// A failing task does not cancel its siblings: everything spawned runs to
/// the end, and [`TaskGroup::sync`] reports the aggregate.
#[derive(Clone)]
pub struct TaskGroup {
    pool: WorkerPool,
    state: Arc<GroupState>,
}

impl TaskGroup {
    pub fn new(pool: &WorkerPool) -> Self {
        Self {
            pool: pool.clone(),
            state: Arc::new(GroupState::default()),
        }
    }

    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = bool> + Send + 'static,
    {
        self.state.pending.fetch_add(1, Ordering::AcqRel);

        let guard = TaskGuard {
            state: self.state.clone(),
            success: false,
        };
        let semaphore = self.pool.semaphore.clone();

        tokio::spawn(async move {
            // Own the whole guard, not just its field
            let mut guard = guard;
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!("Worker pool was closed, dropping task");
                    return;
                }
            };

            guard.success = task.await;
        });
    }

    /// Waits until every spawned task (including tasks spawned while waiting)
    /// has finished. Returns false if any of them failed.
    pub async fn sync(&self) -> bool {
        loop {
            let idle = self.state.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.state.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            idle.await;
        }

        !self.state.failed.load(Ordering::SeqCst)
    }
}

type DoneFn = Box<dyn FnOnce(bool) -> BoxFuture<'static, bool> + Send>;

/// Countdown with a callback run by whoever drops the count to zero.
///
/// The creator holds the first share. Every [`Completion::retain`] must be
/// matched by one [`Completion::release`]. A child completion holds a share
/// of its parent until its own callback has run.
pub struct Completion {
    pending: AtomicUsize,
    failed: AtomicBool,
    on_done: Mutex<Option<DoneFn>>,
    parent: Option<Arc<Completion>>,
}

impl Completion {
    /// The callback receives false if any share was released with a failure.
    pub fn new<F, Fut>(parent: Option<&Arc<Completion>>, on_done: F) -> Arc<Self>
    where
        F: FnOnce(bool) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let on_done: DoneFn = Box::new(move |ok| Box::pin(on_done(ok)));

        Arc::new(Self {
            pending: AtomicUsize::new(1),
            failed: AtomicBool::new(false),
            on_done: Mutex::new(Some(on_done)),
            parent: parent.map(|p| p.retain()),
        })
    }

    /// Completion with nothing to do, used as the root of a recursion.
    pub fn noop() -> Arc<Self> {
        Self::new(None, |ok| async move { ok })
    }

    pub fn retain(self: &Arc<Self>) -> Arc<Self> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.clone()
    }

    /// Gives back one share. Returns the callback results (this one and any
    /// ancestors completed along the way), or true if nothing completed.
    pub fn release(self: Arc<Self>, success: bool) -> BoxFuture<'static, bool> {
        Box::pin(async move {
            if !success {
                self.failed.store(true, Ordering::SeqCst);
            }
            if self.pending.fetch_sub(1, Ordering::AcqRel) != 1 {
                return true;
            }

            let on_done = match self.on_done.lock() {
                Ok(mut slot) => slot.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            let ok = !self.failed.load(Ordering::SeqCst);
            let mut result = match on_done {
                Some(on_done) => on_done(ok).await,
                None => true,
            };

            if let Some(parent) = self.parent.clone() {
                result &= parent.release(true).await;
            }

            result
        })
    }
}
