//! Workers: the per-thread owner of a [`Deque`] and the scan/steal/park loop that drives
//! it.
//!
//! Each worker owns its deque outright for pushes and pops; only steals touch another
//! worker's deque, through its locked `base` end. Parking with a deadline (the event wait
//! between dispatch misses, and compensation blocking) goes through
//! [`crate::sync::cooperative_park`] rather than each call site managing its own timeout.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::Thread;

use crate::deque::Deque;
use crate::pool::PoolInner;
use crate::task::RawTask;

thread_local! {
    static CURRENT: RefCell<Option<WorkerContext>> = const { RefCell::new(None) };
}

/// Per-worker state living behind the pool's worker registry: the local deque, the OS
/// thread handle (for cross-thread unpark), and the bookkeeping `preStep` needs.
pub(crate) struct WorkerHandle {
    pub index: usize,
    pub deque: Deque,
    pub active: AtomicBool,
    /// Set while parked on the spare stack (`helpMaintainParallelism`'s resume target).
    pub suspended: AtomicBool,
    pub last_event_count: AtomicU64,
    pub steal_count: AtomicU64,
    os_thread: parking_lot::Mutex<Option<Thread>>,
}

impl WorkerHandle {
    pub fn new(index: usize) -> Self {
        WorkerHandle {
            index,
            deque: Deque::new(),
            active: AtomicBool::new(true),
            suspended: AtomicBool::new(false),
            last_event_count: AtomicU64::new(0),
            steal_count: AtomicU64::new(0),
            os_thread: parking_lot::Mutex::new(None),
        }
    }

    /// Record the current thread as this handle's OS thread. Called once, from inside the
    /// worker's own thread body, before it's published into the pool's registry.
    pub fn bind_current_thread(&self) {
        *self.os_thread.lock() = Some(std::thread::current());
    }

    pub fn unpark(&self) {
        if let Some(t) = self.os_thread.lock().as_ref() {
            t.unpark();
        }
    }
}

/// A worker's capability handle, exposed to tasks via [`WorkerContext::current`]. Cloning
/// is an `Arc` bump; every clone refers to the same worker.
#[derive(Clone)]
pub struct WorkerContext {
    pool: Arc<PoolInner>,
    handle: Arc<WorkerHandle>,
}

impl WorkerContext {
    /// The context of the calling thread, if it is a pool worker.
    pub fn current() -> Option<WorkerContext> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Push a freshly forked task onto this worker's local deque and nudge the pool in
    /// case other workers are parked waiting for work. Falls back to the pool's
    /// submission channel on the rare case the local deque is already at its capacity
    /// cap, rather than losing the task.
    pub(crate) fn push_local(&self, task: Arc<dyn RawTask>) {
        if let Some(task) = self.handle.deque.push_top(task) {
            self.pool.submit(task);
        }
        self.pool.signal_work();
    }

    pub(crate) fn pool(&self) -> &Arc<PoolInner> {
        &self.pool
    }

    pub(crate) fn deque(&self) -> &Deque {
        &self.handle.deque
    }

    pub(crate) fn index(&self) -> usize {
        self.handle.index
    }

    pub(crate) fn steal_counter(&self) -> &AtomicU64 {
        &self.handle.steal_count
    }
}

fn install_current(ctx: WorkerContext) {
    CURRENT.with(|c| *c.borrow_mut() = Some(ctx));
}

fn clear_current() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// The body run on every worker thread. Installs the thread-local context, runs the
/// scan/steal loop until the pool reaches `Terminating` with an empty local deque, and
/// reports a panicking loop (as opposed to a panicking *task*, which `RawTask::execute`
/// already caught) to the pool's uncaught-exception hook.
pub(crate) fn run(pool: Arc<PoolInner>, handle: Arc<WorkerHandle>) {
    handle.bind_current_thread();
    let ctx = WorkerContext {
        pool: Arc::clone(&pool),
        handle: Arc::clone(&handle),
    };
    install_current(ctx.clone());
    pool.on_worker_start(&handle);

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        main_loop(&pool, &handle, &ctx);
    }));

    clear_current();
    if let Err(payload) = outcome {
        pool.handle_worker_panic(&handle, payload);
    }
    pool.on_worker_termination(&handle);
}

fn main_loop(pool: &Arc<PoolInner>, handle: &WorkerHandle, ctx: &WorkerContext) {
    let mut misses: u32 = 0;
    loop {
        // Once the pool has stopped accepting submissions, a worker that finds its own
        // deque empty has no more locally-owed work; it exits rather than parking
        // forever, even if other workers are still busy or mid-steal.
        if pool.is_shutdown_or_worse() && handle.deque.is_empty() {
            break;
        }

        let task = next_task(pool, handle);
        match task {
            Some(task) => {
                misses = 0;
                if !handle.active.swap(true, Ordering::AcqRel) {
                    pool.note_active(handle.index, true);
                }
                task.execute(ctx);
            }
            None => {
                misses += 1;
                pool.pre_step(ctx, handle, &mut misses);
                if pool.is_terminated() {
                    break;
                }
            }
        }
    }
}

/// Task dispatch order: local deque first (owner LIFO, or FIFO in `locally_fifo` mode),
/// then the pool's submission channel, then a randomized steal scan.
fn next_task(pool: &Arc<PoolInner>, handle: &WorkerHandle) -> Option<Arc<dyn RawTask>> {
    let local = if pool.locally_fifo() {
        handle.deque.poll_top()
    } else {
        handle.deque.pop_top()
    };
    local
        .or_else(|| pool.poll_submission())
        .or_else(|| pool.steal_one(handle.index, &handle.steal_count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;

    #[test]
    fn current_is_none_outside_a_worker() {
        assert!(WorkerContext::current().is_none());
    }

    #[test]
    fn current_is_some_inside_a_task() {
        let pool = Pool::new(2).unwrap();
        let t = crate::task::RecursiveTask::new(|ctx| WorkerContext::current().is_some() && ctx.index() < 2);
        assert!(pool.invoke(&t).unwrap());
        pool.shutdown();
    }
}
