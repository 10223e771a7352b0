use std::fmt;
use std::future::Future;
use std::num::NonZeroUsize;
use std::panic;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, trace};

use crate::Error;
use crate::Result;
use crate::config::PoolConfig;

#[derive(Debug)]
struct PoolInner {
    name: String,
    capacity: NonZeroUsize,
    /// One permit per execution slot.
    slots: Arc<Semaphore>,
    runtime: Handle,
}

/// WorkPool is a fixed-capacity set of execution slots on a tokio runtime. Every spawned task
/// holds one slot until its [TaskHandle] either observes its completion or cancels it.
///
/// Cloning is cheap, clones share the same slots. The pool is never owned by the work running on
/// it, callers borrow it for as long as they need.
#[derive(Debug, Clone)]
pub struct WorkPool {
    inner: Arc<PoolInner>,
}

impl WorkPool {
    /// Creates a pool on the current tokio runtime with the given capacity and default settings.
    pub fn new(capacity: NonZeroUsize) -> Result<Self> {
        Self::from_config(&PoolConfig {
            capacity,
            ..Default::default()
        })
    }

    /// Creates a pool on the current tokio runtime. Fails if called outside a runtime.
    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Runtime(format!("work pool needs a tokio runtime: {e}")))?;
        Ok(Self::with_handle(config, runtime))
    }

    /// Creates a pool that spawns its tasks on the given runtime.
    pub fn with_handle(config: &PoolConfig, runtime: Handle) -> Self {
        debug!(pool = %config.name, capacity = config.capacity.get(), "work pool created");
        Self {
            inner: Arc::new(PoolInner {
                name: config.name.clone(),
                capacity: config.capacity,
                slots: Arc::new(Semaphore::new(config.capacity.get())),
                runtime,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Maximum number of tasks that can run at once.
    pub fn capacity(&self) -> usize {
        self.inner.capacity.get()
    }

    /// Number of slots not held by any task right now.
    pub fn free_slots(&self) -> usize {
        self.inner.slots.available_permits()
    }

    /// Waits for a free slot and spawns `work` on it.
    pub async fn spawn<F>(&self, work: F) -> Result<TaskHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::PoolClosed)?;
        Ok(self.spawn_with_permit(permit, work))
    }

    /// Spawns `work` if a slot is free right now, [Error::NoFreeSlot] otherwise.
    pub fn try_spawn<F>(&self, work: F) -> Result<TaskHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let permit = Arc::clone(&self.inner.slots)
            .try_acquire_owned()
            .map_err(|e| match e {
                TryAcquireError::Closed => Error::PoolClosed,
                TryAcquireError::NoPermits => Error::NoFreeSlot,
            })?;
        Ok(self.spawn_with_permit(permit, work))
    }

    /// Cancels the task behind `handle` and gives its slot back. Never fails, cancelling a task
    /// that already finished only releases the slot.
    pub fn cancel<T>(&self, mut handle: TaskHandle<T>) {
        trace!(pool = %self.inner.name, "cancelling task");
        handle.cancel();
    }

    /// Stops handing out slots. Tasks already running keep theirs, waiting spawns fail with
    /// [Error::PoolClosed].
    pub fn close(&self) {
        debug!(pool = %self.inner.name, "work pool closed");
        self.inner.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.slots.is_closed()
    }

    pub(crate) fn slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.inner.slots)
    }

    /// Spawns `work` on a slot that was already acquired by the caller.
    pub(crate) fn spawn_with_permit<F>(
        &self,
        permit: OwnedSemaphorePermit,
        work: F,
    ) -> TaskHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        TaskHandle {
            join: self.inner.runtime.spawn(work),
            permit: Some(permit),
            cancelled: false,
        }
    }
}

/// TaskHandle owns a task spawned on a [WorkPool] together with the slot it runs in.
///
/// The slot is released when the handle observes the task's completion, when the task is
/// cancelled, or when the handle is dropped. Dropping a handle cancels the task.
pub struct TaskHandle<T> {
    join: JoinHandle<T>,
    permit: Option<OwnedSemaphorePermit>,
    cancelled: bool,
}

impl<T> TaskHandle<T> {
    /// Aborts the task and releases its slot right away. Calling it again does nothing.
    ///
    /// The task stops at its next suspension point, which interrupts sleeps and other pending
    /// waits. Whatever it would have produced is discarded.
    pub fn cancel(&mut self) {
        if !self.cancelled {
            self.cancelled = true;
            self.join.abort();
        }
        self.permit.take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// True once the task stopped running, either by completing or by being cancelled.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// True while the handle still holds the task's pool slot.
    pub fn holds_slot(&self) -> bool {
        self.permit.is_some()
    }

    /// Polls the underlying join handle, releasing the slot once the task is done.
    pub(crate) fn poll_join(
        &mut self,
        cx: &mut Context<'_>,
    ) -> Poll<std::result::Result<T, JoinError>> {
        let output = ready!(Pin::new(&mut self.join).poll(cx));
        self.permit.take();
        Poll::Ready(output)
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    /// Resolves to the task's output. A panic inside the task is resumed here.
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.poll_join(cx)) {
            Ok(output) => Poll::Ready(Ok(output)),
            Err(e) if e.is_panic() => panic::resume_unwind(e.into_panic()),
            Err(e) if e.is_cancelled() => Poll::Ready(Err(Error::Cancelled)),
            Err(e) => Poll::Ready(Err(Error::Task(e.to_string()))),
        }
    }
}

/// Aborts the task when the handle goes away.
impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("holds_slot", &self.permit.is_some())
            .field("cancelled", &self.cancelled)
            .finish()
    }
}
