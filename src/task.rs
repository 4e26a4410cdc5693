//! Tasks: the unit of fork/join work.
//!
//! A task is constructed detached, becomes executable when [`RecursiveTask::fork`]ed
//! (pushed to the forking worker's local deque) or externally submitted
//! (enqueued on the pool's submission channel), and transitions exactly once to a
//! terminal outcome: `Normal`, `Exceptional`, or `Cancelled`. Completion is represented as
//! the sum type [`Outcome`] rather than by throwing across the join boundary; a panicking
//! `compute` is caught with `catch_unwind` at the task's execution boundary and recorded
//! as `Exceptional`.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{ForkJoinError, Result};
use crate::sync::{cooperative_park, remaining, ParkNode, TreiberStack};
use crate::worker::WorkerContext;

/// Status bits for [`RawTask::status`]. The sign bit makes any terminal status negative;
/// a non-negative status means still running or waiting.
const COMPLETED: i32 = 1 << 31;
const CANCELLED: i32 = 1 << 30;
const EXCEPTIONAL: i32 = 1 << 29;
/// Set once some thread has pushed itself onto the waiter stack, so `complete` knows
/// there is work to release without always touching the (usually empty) stack.
const HAS_WAITERS: i32 = 1 << 28;

fn is_terminal(status: i32) -> bool {
    status < 0
}

/// The outcome of a completed task.
#[derive(Debug)]
pub enum Outcome<T> {
    Normal(T),
    Exceptional(ForkJoinError),
    Cancelled,
}

/// Object-safe capability set every task exposes to the deque, the worker loop, and the
/// pool's compensation protocol: execute, read status, and cancel, common to both
/// result-bearing and result-less task variants.
pub(crate) trait RawTask: Send + Sync {
    /// Run `compute` (catching panics) and transition to a terminal state. Called by the
    /// worker that popped or stole this task; never called twice (the pool guarantees a
    /// task reaches at most one worker's execution).
    fn execute(self: Arc<Self>, ctx: &WorkerContext);

    /// Acquire-load the packed status word.
    fn status(&self) -> i32;

    fn is_done(&self) -> bool {
        is_terminal(self.status())
    }

    fn is_cancelled(&self) -> bool {
        self.status() & CANCELLED != 0
    }

    /// Attempt to transition to `CANCELLED`. Returns `true` iff this call won the race.
    fn cancel(&self) -> bool;

    /// Block the calling thread (or cooperate with `ctx` if the caller is a worker) until
    /// this task is terminal, optionally bounded by `deadline`. Returns `true` if the
    /// task reached a terminal state before the deadline.
    fn await_done(&self, ctx: Option<&WorkerContext>, deadline: Option<Instant>) -> bool;
}

struct TaskInner<T> {
    status: AtomicI32,
    compute: Mutex<Option<Box<dyn FnOnce(&WorkerContext) -> T + Send>>>,
    outcome: Mutex<Option<Outcome<T>>>,
    waiters: TreiberStack<Arc<ParkNode>>,
}

impl<T: Send + 'static> TaskInner<T> {
    fn new<F>(compute: F) -> Self
    where
        F: FnOnce(&WorkerContext) -> T + Send + 'static,
    {
        TaskInner {
            status: AtomicI32::new(0),
            compute: Mutex::new(Some(Box::new(compute))),
            outcome: Mutex::new(None),
            waiters: TreiberStack::new(),
        }
    }

    /// Transition to a terminal outcome, unless a concurrent `cancel()` already won: a
    /// running `compute` isn't forcibly stopped, so it can still finish normally after the
    /// task was marked cancelled, and that late result must not clobber the cancellation.
    fn complete(&self, outcome: Outcome<T>) {
        let bit = match &outcome {
            Outcome::Normal(_) => COMPLETED,
            Outcome::Exceptional(_) => COMPLETED | EXCEPTIONAL,
            Outcome::Cancelled => COMPLETED | CANCELLED,
        };
        loop {
            let cur = self.status.load(Ordering::Acquire);
            if is_terminal(cur) {
                return;
            }
            let next = cur | bit;
            if self
                .status
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *self.outcome.lock() = Some(outcome);
                if cur & HAS_WAITERS != 0 {
                    for node in self.waiters.drain() {
                        node.unpark();
                    }
                }
                return;
            }
        }
    }

    fn take_outcome(&self) -> Outcome<T> {
        self.outcome
            .lock()
            .take()
            .expect("outcome missing on a terminal task")
    }
}

impl<T: Send + 'static> RawTask for TaskInner<T> {
    fn execute(self: Arc<Self>, ctx: &WorkerContext) {
        if self.status() & COMPLETED != 0 {
            return; // cancelled before it ran
        }
        let compute = self.compute.lock().take();
        let Some(compute) = compute else { return };
        let result = panic::catch_unwind(AssertUnwindSafe(|| compute(ctx)));
        match result {
            Ok(value) => self.complete(Outcome::Normal(value)),
            Err(payload) => self.complete(Outcome::Exceptional(ForkJoinError::TaskPanicked(
                panic_message(payload),
            ))),
        }
    }

    fn status(&self) -> i32 {
        self.status.load(Ordering::Acquire)
    }

    fn cancel(&self) -> bool {
        loop {
            let cur = self.status.load(Ordering::Acquire);
            if is_terminal(cur) {
                return false;
            }
            let next = cur | COMPLETED | CANCELLED;
            if self
                .status
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                *self.outcome.lock() = Some(Outcome::Cancelled);
                if cur & HAS_WAITERS != 0 {
                    for node in self.waiters.drain() {
                        node.unpark();
                    }
                }
                return true;
            }
        }
    }

    fn await_done(&self, ctx: Option<&WorkerContext>, deadline: Option<Instant>) -> bool {
        // Spin briefly before registering a wait node; tasks forked nearby usually
        // finish fast and the registration itself is the expensive path.
        for _ in 0..64 {
            if self.is_done() {
                return true;
            }
            std::hint::spin_loop();
        }
        loop {
            if self.is_done() {
                return true;
            }
            if let Some(pool) = ctx.map(|c| c.pool()) {
                // Help-join: run something from our own deque instead of parking.
                if pool.help_join_step(ctx.unwrap(), &|| self.is_done()) {
                    continue;
                }
            }
            if self.is_done() {
                return true;
            }
            let node = Arc::new(ParkNode::for_current_thread());
            self.status.fetch_or(HAS_WAITERS, Ordering::AcqRel);
            self.waiters.push(Arc::clone(&node));
            if self.is_done() {
                node.cancel();
                return true;
            }
            let done = cooperative_park(ctx, deadline, &|| self.is_done());
            node.cancel();
            if done {
                return true;
            }
            if deadline.is_some() && remaining(deadline.unwrap()).is_none() {
                return self.is_done();
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked with a non-string payload".to_string()
    }
}

/// A fork/join task returning `T`. One `Arc<TaskInner<T>>` is shared between the handle
/// the caller holds and the type-erased `Arc<dyn RawTask>` living in a deque.
pub struct RecursiveTask<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for RecursiveTask<T> {
    fn clone(&self) -> Self {
        RecursiveTask {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> RecursiveTask<T> {
    /// Construct a detached task. It becomes executable only once `fork`ed or submitted.
    pub fn new<F>(compute: F) -> Self
    where
        F: FnOnce(&WorkerContext) -> T + Send + 'static,
    {
        RecursiveTask {
            inner: Arc::new(TaskInner::new(compute)),
        }
    }

    pub(crate) fn raw(&self) -> Arc<dyn RawTask> {
        Arc::clone(&self.inner) as Arc<dyn RawTask>
    }

    /// Push this task onto the calling worker's local deque. Panics if called outside a
    /// worker thread.
    pub fn fork(&self) {
        let ctx = WorkerContext::current().expect("RecursiveTask::fork called outside a worker");
        ctx.push_local(self.raw());
    }

    /// Block until complete (helping if called from a worker), then return the result,
    /// panicking if the task completed exceptionally or was cancelled. This is the Rust
    /// analogue of Java's unchecked `join()` rethrow.
    pub fn join(&self) -> T {
        match self.try_join() {
            Ok(v) => v,
            Err(e) => panic!("{e}"),
        }
    }

    /// Non-panicking variant of [`RecursiveTask::join`].
    pub fn try_join(&self) -> Result<T> {
        self.get_timeout(None)
    }

    /// `fork` then `join` without an intervening return to the caller.
    pub fn invoke(&self) -> T {
        self.fork();
        self.join()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Attempt cancellation. `may_interrupt` is accepted for API parity but has no
    /// separate effect here: a running compute is never forcibly preempted, only
    /// prevented from starting if it hasn't yet.
    pub fn cancel(&self, _may_interrupt: bool) -> bool {
        self.inner.cancel()
    }

    /// Block with no timeout.
    pub fn get(&self) -> Result<T> {
        self.get_timeout(None)
    }

    /// Block up to `timeout`, returning `Err(TimedOut)` if it elapses first.
    pub fn get_timeout(&self, timeout: Option<std::time::Duration>) -> Result<T> {
        let deadline = timeout.map(|d| Instant::now() + d);
        let ctx = WorkerContext::current();
        if self.inner.is_done() || self.inner.await_done(ctx.as_ref(), deadline) {
            return match self.inner.take_outcome() {
                Outcome::Normal(v) => Ok(v),
                Outcome::Exceptional(e) => Err(e),
                Outcome::Cancelled => Err(ForkJoinError::Cancelled),
            };
        }
        Err(ForkJoinError::TimedOut)
    }
}

/// A fork/join task with no result.
pub struct RecursiveAction {
    inner: RecursiveTask<()>,
}

impl Clone for RecursiveAction {
    fn clone(&self) -> Self {
        RecursiveAction {
            inner: self.inner.clone(),
        }
    }
}

impl RecursiveAction {
    pub fn new<F>(compute: F) -> Self
    where
        F: FnOnce(&WorkerContext) + Send + 'static,
    {
        RecursiveAction {
            inner: RecursiveTask::new(move |ctx| compute(ctx)),
        }
    }

    pub(crate) fn raw(&self) -> Arc<dyn RawTask> {
        self.inner.raw()
    }

    pub fn fork(&self) {
        self.inner.fork()
    }

    pub fn join(&self) {
        self.inner.join()
    }

    pub fn invoke(&self) {
        self.inner.invoke()
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn cancel(&self, may_interrupt: bool) -> bool {
        self.inner.cancel(may_interrupt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn detached_task_is_not_done() {
        let t = RecursiveTask::new(|_| 42);
        assert!(!t.is_done());
    }

    #[test]
    fn cancel_before_run_prevents_execution() {
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let t = RecursiveTask::new(move |_| {
            ran2.store(true, Ordering::SeqCst);
            1
        });
        assert!(t.cancel(true));
        assert!(t.is_cancelled());
        assert!(matches!(t.try_join(), Err(ForkJoinError::Cancelled)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn double_cancel_only_wins_once() {
        let t: RecursiveTask<i32> = RecursiveTask::new(|_| 1);
        assert!(t.cancel(true));
        assert!(!t.cancel(true));
    }

    #[test]
    fn panicking_compute_is_captured_as_exceptional() {
        let pool = Pool::new(2).unwrap();
        let t = RecursiveTask::new(|_| -> i32 { panic!("boom") });
        let result = pool.invoke(&t);
        assert!(matches!(result, Err(ForkJoinError::TaskPanicked(_))));
        pool.shutdown();
    }

    #[test]
    fn invoke_runs_and_returns_result() {
        let pool = Pool::new(4).unwrap();
        let t = RecursiveTask::new(|_| 2 + 2);
        assert_eq!(pool.invoke(&t).unwrap(), 4);
        pool.shutdown();
    }
}
