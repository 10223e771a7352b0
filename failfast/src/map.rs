//! Fail-fast, bounded-concurrency parallel map.
//!
//! [fail_fast_map] runs one task per input item on a [WorkPool] and hands the outputs back as a
//! [Stream] in input order. At most `pool.capacity()` input positions are "open" at a time, that
//! is spawned or completed but not yet delivered, so out-of-order completions sit in a ring buffer
//! of exactly that size.
//!
//! The first task that fails ends the stream:
//! ```text
//!   Running ──(Err from any task)──> Cancelling ──(aborted tasks stopped)──> yield Err ──> Done
//!      │                                                                                   ▲
//!      ├──(all items delivered)────────────────────────────────────────────> yield None ──┤
//!      └──(stream dropped)───> every task aborted, every slot released ────────────────────┘
//! ```
//! Slots are released synchronously on every one of these paths, so once the consumer sees the
//! error, the end of the stream, or has dropped it, [WorkPool::free_slots] is back to what it was
//! before the call.

use std::fmt;
use std::future::Future;
use std::iter::Peekable;
use std::panic;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::stream::{FusedStream, FuturesUnordered, Stream, StreamExt};
use pin_project::pin_project;
use tokio::task::JoinError;
use tokio_util::sync::PollSemaphore;
use tracing::{debug, trace, warn};

use crate::{Error, TaskHandle, WorkPool};

/// Runs `f` on every item of `items` using the slots of `pool` and returns the outputs in input
/// order.
///
/// `f` is called from the consumer's poll, one item at a time and in input order, only once a
/// slot is free for the future it returns. That future runs as a separate task.
///
/// The first `Err` returned by any task is yielded right away, without waiting for tasks at
/// earlier positions, and it is yielded exactly as `f` produced it. Before that happens every
/// other task is aborted and every slot this call took is given back. After an error the stream
/// only yields `None`. Dropping the stream early cancels whatever is still running.
///
/// Failures of the pool itself (closed while items remain, or a task torn down by its runtime)
/// reach the consumer through `E: From<Error>`.
///
/// ```rust
/// use std::num::NonZeroUsize;
///
/// use failfast::{WorkPool, fail_fast_map};
/// use futures::TryStreamExt;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), failfast::Error> {
/// let pool = WorkPool::new(NonZeroUsize::new(3).unwrap())?;
/// let squares: Vec<u64> = fail_fast_map(
///     &pool,
///     |x: u64| async move { Ok::<_, failfast::Error>(x * x) },
///     1..=5,
/// )
/// .try_collect()
/// .await?;
/// assert_eq!(squares, [1, 4, 9, 16, 25]);
/// assert_eq!(pool.free_slots(), 3);
/// # Ok(())
/// # }
/// ```
pub fn fail_fast_map<I, F, Fut, T, E>(
    pool: &WorkPool,
    f: F,
    items: I,
) -> FailFastMap<I::IntoIter, F, T, E>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<Error> + Send + 'static,
{
    FailFastMap {
        pool: pool.clone(),
        items: Some(items.into_iter().peekable()),
        f,
        window: Window::new(pool),
        phase: Phase::Running,
    }
}

/// Method form of [fail_fast_map] for anything that can be iterated.
pub trait FailFastMapExt: IntoIterator + Sized {
    fn fail_fast_map<F, Fut, T, E>(
        self,
        pool: &WorkPool,
        f: F,
    ) -> FailFastMap<Self::IntoIter, F, T, E>
    where
        F: FnMut(Self::Item) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<Error> + Send + 'static,
    {
        fail_fast_map(pool, f, self)
    }
}

impl<I: IntoIterator> FailFastMapExt for I {}

/// Stream returned by [fail_fast_map].
#[pin_project]
#[must_use = "streams do nothing unless polled"]
pub struct FailFastMap<I: Iterator, F, T, E> {
    pool: WorkPool,
    /// `None` once the input ran dry or the stream stopped pulling from it. The next item is
    /// looked at before a slot is requested for it.
    items: Option<Peekable<I>>,
    f: F,
    window: Window<T, E>,
    phase: Phase<E>,
}

enum Phase<E> {
    Running,
    /// A task failed, the rest were aborted and we wait until they have actually stopped.
    Cancelling(Option<E>),
    Done,
}

/// A running task and the input position it belongs to.
struct Positioned<R> {
    position: usize,
    handle: TaskHandle<R>,
}

impl<R> Future for Positioned<R> {
    type Output = (usize, Result<R, JoinError>);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let position = self.position;
        let output = ready!(self.handle.poll_join(cx));
        Poll::Ready((position, output))
    }
}

/// Everything one call holds on the pool: the slot it is waiting for, the running tasks, and the
/// completed outputs that cannot be delivered yet.
struct Window<T, E> {
    /// Dropped on release, which also returns permits handed to a wait still in progress.
    slots: Option<PollSemaphore>,
    running: FuturesUnordered<Positioned<Result<T, E>>>,
    /// Ring buffer indexed by `position % capacity`.
    completed: Box<[Option<T>]>,
    next_spawn: usize,
    next_yield: usize,
}

impl<T, E> Window<T, E> {
    fn new(pool: &WorkPool) -> Self {
        Self {
            slots: Some(PollSemaphore::new(pool.slots())),
            running: FuturesUnordered::new(),
            completed: (0..pool.capacity()).map(|_| None).collect(),
            next_spawn: 0,
            next_yield: 0,
        }
    }

    fn has_room(&self) -> bool {
        self.next_spawn - self.next_yield < self.completed.len()
    }

    fn store(&mut self, position: usize, value: T) {
        let index = position % self.completed.len();
        if let Some(slot) = self.completed.get_mut(index) {
            *slot = Some(value);
        }
    }

    /// Takes the output for the next position to deliver, if it already completed.
    fn take_next(&mut self) -> Option<T> {
        let index = self.next_yield % self.completed.len();
        let value = self.completed.get_mut(index)?.take()?;
        self.next_yield += 1;
        Some(value)
    }

    /// Cancels every running task, gives all slots back and forgets buffered outputs. The
    /// cancelled tasks stay in `running` so their shutdown can still be awaited. Returns how many
    /// tasks were cancelled by this call.
    fn release(&mut self) -> usize {
        self.slots = None;

        let mut cancelled = 0;
        for task in self.running.iter_mut() {
            if !task.handle.is_cancelled() {
                task.handle.cancel();
                cancelled += 1;
            }
        }

        for slot in self.completed.iter_mut() {
            *slot = None;
        }

        debug_assert!(self.running.iter().all(|task| !task.handle.holds_slot()));
        cancelled
    }
}

impl<T, E> Drop for Window<T, E> {
    fn drop(&mut self) {
        let cancelled = self.release();
        if cancelled > 0 {
            debug!(
                cancelled,
                delivered = self.next_yield,
                "map stream dropped early, cancelled running tasks"
            );
        }
    }
}

/// Stops pulling items, cancels the whole window and parks `error` until the cancelled tasks
/// have stopped.
fn start_cancelling<I, T, E>(
    items: &mut Option<I>,
    window: &mut Window<T, E>,
    phase: &mut Phase<E>,
    error: E,
) -> usize {
    *items = None;
    let cancelled = window.release();
    *phase = Phase::Cancelling(Some(error));
    cancelled
}

impl<I, F, Fut, T, E> Stream for FailFastMap<I, F, T, E>
where
    I: Iterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<Error> + Send + 'static,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        loop {
            match &mut *this.phase {
                Phase::Done => return Poll::Ready(None),
                Phase::Cancelling(error) => {
                    // aborted tasks complete their join handles once they are gone, anything they
                    // produced in the meantime is dropped here.
                    while ready!(this.window.running.poll_next_unpin(cx)).is_some() {}
                    let error = error.take();
                    *this.phase = Phase::Done;
                    match error {
                        Some(error) => return Poll::Ready(Some(Err(error))),
                        None => continue,
                    }
                }
                Phase::Running => {}
            }

            if let Some(value) = this.window.take_next() {
                return Poll::Ready(Some(Ok(value)));
            }

            // spawn in input order while the window has room and the pool has slots. A slot is
            // only requested once there is an item for it.
            let mut pool_closed = false;
            while this.window.has_room() {
                let Some(items) = this.items.as_mut() else {
                    break;
                };
                if items.peek().is_none() {
                    *this.items = None;
                    break;
                }
                let Some(slots) = this.window.slots.as_mut() else {
                    break;
                };
                let permit = match slots.poll_acquire(cx) {
                    Poll::Ready(Some(permit)) => permit,
                    Poll::Ready(None) => {
                        pool_closed = true;
                        break;
                    }
                    Poll::Pending => break,
                };

                let Some(item) = items.next() else {
                    *this.items = None;
                    break;
                };

                let position = this.window.next_spawn;
                this.window.next_spawn += 1;
                let handle = this.pool.spawn_with_permit(permit, (this.f)(item));
                trace!(pool = this.pool.name(), position, "spawned map task");
                this.window.running.push(Positioned { position, handle });
            }

            if pool_closed {
                let cancelled = start_cancelling(
                    this.items,
                    this.window,
                    this.phase,
                    E::from(Error::PoolClosed),
                );
                warn!(
                    pool = this.pool.name(),
                    cancelled, "work pool closed while items remain, cancelling map tasks"
                );
                continue;
            }

            match this.window.running.poll_next_unpin(cx) {
                Poll::Ready(Some((position, Ok(Ok(value))))) => {
                    trace!(pool = this.pool.name(), position, "map task completed");
                    this.window.store(position, value);
                }
                Poll::Ready(Some((position, Ok(Err(error))))) => {
                    let cancelled = start_cancelling(this.items, this.window, this.phase, error);
                    warn!(
                        pool = this.pool.name(),
                        position, cancelled, "map task failed, cancelling in-flight tasks"
                    );
                }
                Poll::Ready(Some((position, Err(join_error)))) => {
                    if join_error.is_panic() {
                        *this.items = None;
                        this.window.release();
                        *this.phase = Phase::Done;
                        panic::resume_unwind(join_error.into_panic());
                    }

                    let error = if join_error.is_cancelled() {
                        Error::Cancelled
                    } else {
                        Error::Task(join_error.to_string())
                    };
                    let cancelled =
                        start_cancelling(this.items, this.window, this.phase, E::from(error));
                    warn!(
                        pool = this.pool.name(),
                        position, cancelled, "map task was torn down by the runtime"
                    );
                }
                Poll::Ready(None) => {
                    if this.items.is_some() {
                        // waiting on a slot held by somebody else.
                        return Poll::Pending;
                    }
                    this.window.release();
                    *this.phase = Phase::Done;
                    debug!(
                        pool = this.pool.name(),
                        delivered = this.window.next_yield,
                        "map stream exhausted"
                    );
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<I, F, Fut, T, E> FusedStream for FailFastMap<I, F, T, E>
where
    I: Iterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: From<Error> + Send + 'static,
{
    fn is_terminated(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }
}

impl<I: Iterator, F, T, E> fmt::Debug for FailFastMap<I, F, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self.phase {
            Phase::Running => "running",
            Phase::Cancelling(_) => "cancelling",
            Phase::Done => "done",
        };
        f.debug_struct("FailFastMap")
            .field("pool", &self.pool.name())
            .field("phase", &phase)
            .field("spawned", &self.window.next_spawn)
            .field("delivered", &self.window.next_yield)
            .field("running", &self.window.running.len())
            .finish()
    }
}
