//! The pool controller: worker registry, lifecycle state machine, submission channel, and
//! the compensation/help-join protocols workers and tasks call into.
//!
//! The worker registry is a resizable `RwLock<Vec<Option<Arc<WorkerHandle>>>>`, since the
//! pool grows and shrinks its worker count at runtime. `runState`/`workerCounts` are
//! packed into single atomic words (small bitfields rather than several independent
//! atomics) so a `preStep` decision reads one consistent snapshot.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::blocker::ManagedBlocker;
use crate::error::{ForkJoinError, Result};
use crate::phaser::Phaser;
use crate::sync::TreiberStack;
use crate::task::{RawTask, RecursiveTask};
use crate::worker::{self, WorkerContext, WorkerHandle};

/// Hard ceiling on live workers, bounding the worker registry and the packed 16-bit
/// counter fields in `workerCounts`.
const MAX_WORKERS: usize = 1 << 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RunLevel {
    Running = 0,
    Shutdown = 1,
    Terminating = 2,
    Terminated = 3,
}

fn run_level_from(v: u32) -> RunLevel {
    match (v >> 16) & 0b11 {
        0 => RunLevel::Running,
        1 => RunLevel::Shutdown,
        2 => RunLevel::Terminating,
        _ => RunLevel::Terminated,
    }
}

fn pack_run_state(active: u16, level: RunLevel) -> u32 {
    active as u32 | ((level as u32) << 16)
}

fn unpack_active(v: u32) -> u16 {
    (v & 0xFFFF) as u16
}

fn pack_counts(running: u16, total: u16) -> u32 {
    running as u32 | ((total as u32) << 16)
}

fn unpack_running(v: u32) -> u16 {
    (v & 0xFFFF) as u16
}

fn unpack_total(v: u32) -> u16 {
    (v >> 16) as u16
}

struct EventWaiter {
    awaited: u64,
    node: Arc<crate::sync::ParkNode>,
}

/// Configuration for building a [`Pool`].
pub struct PoolBuilder {
    parallelism: usize,
    locally_fifo: bool,
    thread_name_prefix: String,
    stack_size: Option<usize>,
    uncaught_exception_hook: Option<Arc<dyn Fn(usize, &str) + Send + Sync>>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        PoolBuilder {
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            locally_fifo: false,
            thread_name_prefix: "forkjoin-worker".to_string(),
            stack_size: None,
            uncaught_exception_hook: None,
        }
    }
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    /// Run the pool in "async" mode: workers poll their own deque FIFO instead of LIFO.
    /// Suited to independent event-style tasks rather than divide-and-conquer recursion.
    pub fn locally_fifo(mut self, yes: bool) -> Self {
        self.locally_fifo = yes;
        self
    }

    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    pub fn uncaught_exception_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, &str) + Send + Sync + 'static,
    {
        self.uncaught_exception_hook = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Pool> {
        if self.parallelism == 0 || self.parallelism > MAX_WORKERS {
            return Err(ForkJoinError::InvalidParallelism(self.parallelism));
        }
        Ok(Pool::from_builder(self))
    }
}

/// A fork/join worker pool: owns a registry of worker threads, a submission channel for
/// external (non-worker) callers, and the parallelism-compensation machinery that keeps
/// the running-thread count near the configured target while workers block.
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    self_weak: Weak<PoolInner>,
    parallelism: usize,
    locally_fifo: bool,
    thread_name_prefix: String,
    stack_size: Option<usize>,
    uncaught_exception_hook: Option<Arc<dyn Fn(usize, &str) + Send + Sync>>,

    workers: RwLock<Vec<Option<Arc<WorkerHandle>>>>,
    /// Touched by every worker on essentially every loop iteration (active-flag flips,
    /// steal/spawn bookkeeping); cache-line padded to keep that traffic from bouncing the
    /// line backing `run_state` between cores, the same reasoning crate's deque-heavy
    /// dependents pad their hot counters for.
    worker_counts: CachePadded<AtomicU32>,
    run_state: CachePadded<AtomicU32>,

    event_count: CachePadded<AtomicU64>,
    event_waiters: TreiberStack<EventWaiter>,
    spare_stack: TreiberStack<usize>,

    submit_tx: Mutex<mpsc::Sender<Arc<dyn RawTask>>>,
    submit_rx: Mutex<mpsc::Receiver<Arc<dyn RawTask>>>,
    queued_submissions: AtomicU64,

    steal_count: CachePadded<AtomicU64>,
    termination: Phaser,
}

impl Pool {
    pub fn new(parallelism: usize) -> Result<Pool> {
        PoolBuilder::new().parallelism(parallelism).build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    fn from_builder(b: PoolBuilder) -> Pool {
        let (tx, rx) = mpsc::channel();
        let termination = Phaser::new();
        termination.register();
        let parallelism = b.parallelism;
        let inner = Arc::new_cyclic(|weak| PoolInner {
            self_weak: weak.clone(),
            parallelism,
            locally_fifo: b.locally_fifo,
            thread_name_prefix: b.thread_name_prefix,
            stack_size: b.stack_size,
            uncaught_exception_hook: b.uncaught_exception_hook,
            workers: RwLock::new(Vec::with_capacity(parallelism)),
            worker_counts: CachePadded::new(AtomicU32::new(pack_counts(0, 0))),
            run_state: CachePadded::new(AtomicU32::new(pack_run_state(0, RunLevel::Running))),
            event_count: CachePadded::new(AtomicU64::new(0)),
            event_waiters: TreiberStack::new(),
            spare_stack: TreiberStack::new(),
            submit_tx: Mutex::new(tx),
            submit_rx: Mutex::new(rx),
            queued_submissions: AtomicU64::new(0),
            steal_count: CachePadded::new(AtomicU64::new(0)),
            termination,
        });
        for _ in 0..parallelism {
            inner.spawn_worker();
        }
        Pool { inner }
    }

    /// Fork `task` from outside any worker and block until it completes.
    pub fn invoke<T: Send + 'static>(&self, task: &RecursiveTask<T>) -> Result<T> {
        self.execute_raw(task.raw())?;
        task.try_join()
    }

    /// Enqueue `task` on the submission channel without waiting for it.
    pub fn execute<T: Send + 'static>(&self, task: &RecursiveTask<T>) -> Result<()> {
        self.execute_raw(task.raw())
    }

    fn execute_raw(&self, task: Arc<dyn RawTask>) -> Result<()> {
        if self.inner.run_level() >= RunLevel::Shutdown {
            return Err(ForkJoinError::RejectedSubmission);
        }
        self.inner.submit(task);
        Ok(())
    }

    /// Run `blocker` with parallelism compensation, whether or not the caller is a worker.
    pub fn managed_block(&self, blocker: &mut dyn ManagedBlocker) -> Result<()> {
        let ctx = WorkerContext::current();
        self.inner.await_blocker(ctx.as_ref(), blocker)
    }

    /// Stop accepting new submissions; existing and already-forked work still runs.
    pub fn shutdown(&self) {
        self.inner.advance_run_level(RunLevel::Shutdown);
        self.inner.signal_work();
    }

    /// Stop accepting new submissions and cancel everything still queued.
    pub fn shutdown_now(&self) {
        self.inner.advance_run_level(RunLevel::Terminating);
        while let Ok(task) = self.inner.submit_rx.lock().try_recv() {
            task.cancel();
        }
        self.inner.wake_all_parked();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.run_level() >= RunLevel::Shutdown
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.run_level() == RunLevel::Terminating
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.is_terminated()
    }

    /// Block up to `timeout` for every worker to exit after a `shutdown`/`shutdown_now`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        if self.inner.is_terminated() {
            return true;
        }
        let phase = self.inner.termination.register();
        if self.inner.is_terminated() {
            self.inner.termination.arrive_and_deregister();
            return true;
        }
        let deadline = Instant::now() + timeout;
        let _ = self
            .inner
            .termination
            .await_advance_interruptibly(phase, Some(deadline));
        self.inner.is_terminated()
    }

    pub fn get_parallelism(&self) -> usize {
        self.inner.parallelism
    }

    pub fn get_pool_size(&self) -> usize {
        unpack_total(self.inner.worker_counts.load(Ordering::Acquire)) as usize
    }

    pub fn get_running_thread_count(&self) -> usize {
        unpack_running(self.inner.worker_counts.load(Ordering::Acquire)) as usize
    }

    pub fn get_active_thread_count(&self) -> usize {
        unpack_active(self.inner.run_state.load(Ordering::Acquire)) as usize
    }

    pub fn is_quiescent(&self) -> bool {
        self.get_active_thread_count() == 0 && self.get_queued_task_count() == 0
    }

    pub fn get_steal_count(&self) -> u64 {
        self.inner.steal_count.load(Ordering::Relaxed)
    }

    pub fn get_queued_task_count(&self) -> usize {
        self.inner
            .workers
            .read()
            .iter()
            .flatten()
            .map(|w| w.deque.len())
            .sum()
    }

    pub fn get_queued_submission_count(&self) -> u64 {
        self.inner.queued_submissions.load(Ordering::Relaxed)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Only the last handle tears the pool down; clones of `Arc<PoolInner>` held by
        // still-running worker threads keep it alive until they notice termination.
        if Arc::strong_count(&self.inner) == 1 && !self.inner.is_terminated() {
            self.shutdown_now();
        }
    }
}

impl PoolInner {
    pub(crate) fn locally_fifo(&self) -> bool {
        self.locally_fifo
    }

    pub(crate) fn run_level(&self) -> RunLevel {
        run_level_from(self.run_state.load(Ordering::Acquire))
    }

    pub(crate) fn is_terminating_or_worse(&self) -> bool {
        self.run_level() >= RunLevel::Terminating
    }

    pub(crate) fn is_shutdown_or_worse(&self) -> bool {
        self.run_level() >= RunLevel::Shutdown
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.run_level() == RunLevel::Terminated
    }

    fn advance_run_level(&self, target: RunLevel) {
        loop {
            let cur = self.run_state.load(Ordering::Acquire);
            let level = run_level_from(cur);
            if level >= target {
                return;
            }
            let next = pack_run_state(unpack_active(cur), target);
            if self
                .run_state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    pub(crate) fn note_active(&self, _worker: usize, active: bool) {
        let delta: i32 = if active { 1 } else { -1 };
        loop {
            let cur = self.run_state.load(Ordering::Acquire);
            let level = run_level_from(cur);
            let cur_active = unpack_active(cur) as i32;
            let next_active = (cur_active + delta).max(0) as u16;
            let next = pack_run_state(next_active, level);
            if self
                .run_state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn inc_running(&self) {
        self.worker_counts.fetch_add(1, Ordering::AcqRel);
    }

    fn dec_running(&self) {
        loop {
            let cur = self.worker_counts.load(Ordering::Acquire);
            let running = unpack_running(cur);
            if running == 0 {
                return;
            }
            let next = pack_counts(running - 1, unpack_total(cur));
            if self
                .worker_counts
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Claim a worker registry slot and bump `total` for it, before the worker thread
    /// itself exists. Returns `None` once `MAX_WORKERS` is reached.
    fn reserve_slot(&self) -> Option<usize> {
        let mut workers = self.workers.write();
        let slot = match workers.iter().position(|w| w.is_none()) {
            Some(i) => i,
            None => {
                if workers.len() >= MAX_WORKERS {
                    return None;
                }
                let old_len = workers.len();
                let new_len = (old_len * 2).max(self.parallelism + 1).min(MAX_WORKERS);
                workers.resize_with(new_len, || None);
                old_len
            }
        };
        drop(workers);
        loop {
            let cur = self.worker_counts.load(Ordering::Acquire);
            let next = pack_counts(unpack_running(cur), unpack_total(cur) + 1);
            if self
                .worker_counts
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        Some(slot)
    }

    fn release_slot(&self, idx: usize) {
        self.workers.write()[idx] = None;
        loop {
            let cur = self.worker_counts.load(Ordering::Acquire);
            let total = unpack_total(cur);
            if total == 0 {
                return;
            }
            let next = pack_counts(unpack_running(cur), total - 1);
            if self
                .worker_counts
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    fn install_worker(&self, idx: usize, handle: Arc<WorkerHandle>) {
        self.workers.write()[idx] = Some(handle);
        self.inc_running();
    }

    /// Spawn a new worker thread, giving it its own strong reference to the pool.
    fn spawn_worker(&self) {
        let Some(idx) = self.reserve_slot() else {
            log::warn!("forkjoin: worker registry exhausted at {MAX_WORKERS} slots");
            return;
        };
        let pool = self.self_arc();
        let mut builder =
            std::thread::Builder::new().name(format!("{}-{}", self.thread_name_prefix, idx));
        if let Some(sz) = self.stack_size {
            builder = builder.stack_size(sz);
        }
        let spawned = builder.spawn(move || {
            let handle = Arc::new(WorkerHandle::new(idx));
            pool.install_worker(idx, Arc::clone(&handle));
            worker::run(pool, handle);
        });
        if let Err(e) = spawned {
            self.release_slot(idx);
            log::error!("forkjoin: failed to spawn worker thread: {e}");
        }
    }

    pub(crate) fn on_worker_start(&self, _handle: &WorkerHandle) {}

    pub(crate) fn on_worker_termination(&self, handle: &WorkerHandle) {
        if handle.active.swap(false, Ordering::AcqRel) {
            self.note_active(handle.index, false);
        }
        self.dec_running();
        self.release_slot(handle.index);
        if self.is_shutdown_or_worse() && unpack_total(self.worker_counts.load(Ordering::Acquire)) == 0 {
            self.advance_run_level(RunLevel::Terminated);
            self.termination.force_termination();
        }
    }

    pub(crate) fn handle_worker_panic(&self, handle: &WorkerHandle, payload: Box<dyn std::any::Any + Send>) {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker loop panicked with a non-string payload".to_string()
        };
        log::error!("forkjoin: worker {} terminated on panic: {}", handle.index, msg);
        if let Some(hook) = &self.uncaught_exception_hook {
            hook(handle.index, &msg);
        }
    }

    pub(crate) fn poll_submission(&self) -> Option<Arc<dyn RawTask>> {
        let task = self.submit_rx.lock().try_recv().ok()?;
        self.queued_submissions.fetch_sub(1, Ordering::Relaxed);
        Some(task)
    }

    /// Hand `task` to the submission channel directly, bypassing any worker's local
    /// deque. Used for external `execute`/`invoke` calls and as the overflow path when a
    /// worker's own deque is at its capacity cap.
    pub(crate) fn submit(&self, task: Arc<dyn RawTask>) {
        if self.submit_tx.lock().send(task).is_err() {
            return; // receiver only drops with the pool itself; nothing left to run it
        }
        self.queued_submissions.fetch_add(1, Ordering::Relaxed);
        self.signal_work();
    }

    /// Randomized steal scan starting at a random victim, visiting each other worker at
    /// most once.
    pub(crate) fn steal_one(&self, exclude: usize, local_steal_count: &AtomicU64) -> Option<Arc<dyn RawTask>> {
        let workers = self.workers.read();
        let n = workers.len();
        if n <= 1 {
            return None;
        }
        let start = fastrand::usize(0..n);
        for step in 0..n {
            let idx = (start + step) % n;
            if idx == exclude {
                continue;
            }
            if let Some(h) = workers[idx].as_ref() {
                if let Some(task) = h.deque.poll_base() {
                    self.steal_count.fetch_add(1, Ordering::Relaxed);
                    local_steal_count.fetch_add(1, Ordering::Relaxed);
                    return Some(task);
                }
            }
        }
        None
    }

    /// Bump the event counter and release every currently parked event-waiter whose
    /// awaited count is now stale.
    pub(crate) fn signal_work(&self) {
        let new_count = self.event_count.fetch_add(1, Ordering::AcqRel) + 1;
        for waiter in self.event_waiters.drain() {
            if waiter.awaited != new_count {
                waiter.node.unpark();
            } else {
                self.event_waiters.push(waiter);
            }
        }
    }

    fn wake_all_parked(&self) {
        self.signal_work();
        while let Some(idx) = self.spare_stack.pop() {
            if let Some(h) = self.workers.read().get(idx).and_then(|w| w.as_ref()) {
                h.suspended.store(false, Ordering::Release);
                h.unpark();
            }
        }
    }

    /// Park until the event count advances past what this worker last observed, or
    /// immediately return if an event has already landed since last time. Used by
    /// `preStep` when the worker has accumulated enough consecutive misses.
    fn event_sync(&self, handle: &WorkerHandle) {
        let observed = self.event_count.load(Ordering::Acquire);
        if handle.last_event_count.swap(observed, Ordering::AcqRel) != observed {
            return;
        }
        let node = Arc::new(crate::sync::ParkNode::for_current_thread());
        self.event_waiters.push(EventWaiter {
            awaited: observed,
            node: Arc::clone(&node),
        });
        if self.event_count.load(Ordering::Acquire) != observed {
            node.cancel();
            return;
        }
        std::thread::park_timeout(Duration::from_millis(50));
        node.cancel();
    }

    fn suspend_as_spare(&self, handle: &WorkerHandle) {
        handle.suspended.store(true, Ordering::Release);
        self.dec_running();
        self.spare_stack.push(handle.index);
        while handle.suspended.load(Ordering::Acquire) {
            if self.is_shutdown_or_worse() {
                handle.suspended.store(false, Ordering::Release);
                break;
            }
            std::thread::park_timeout(Duration::from_millis(50));
        }
        self.inc_running();
    }

    fn try_resume_spare(&self) -> bool {
        while let Some(idx) = self.spare_stack.pop() {
            let workers = self.workers.read();
            if let Some(h) = workers.get(idx).and_then(|w| w.as_ref()) {
                if h.suspended.swap(false, Ordering::AcqRel) {
                    h.unpark();
                    return true;
                }
            }
        }
        false
    }

    /// Spawn or resume a worker if running count is below target and the pool isn't
    /// winding down.
    pub(crate) fn help_maintain_parallelism(&self) {
        if !self.event_waiters.is_empty() {
            self.signal_work();
            return;
        }
        let running = unpack_running(self.worker_counts.load(Ordering::Acquire)) as usize;
        if running >= self.parallelism {
            return;
        }
        if self.try_resume_spare() {
            return;
        }
        if self.is_terminating_or_worse() {
            return;
        }
        // Total worker count is allowed to exceed the parallelism target here: these are
        // compensation threads covering for others blocked in `await_blocker`. `preStep`
        // shrinks `running` back toward target by suspending the excess as spares once
        // the blockers release; it doesn't tear down the extra OS threads, since they're
        // cheaper to keep parked than to respawn the next time something blocks.
        let total = unpack_total(self.worker_counts.load(Ordering::Acquire)) as usize;
        if total < MAX_WORKERS {
            self.spawn_worker();
        }
    }

    /// A fresh strong reference to the pool owning this `PoolInner`, for handing to a
    /// newly spawned worker thread. Upgradeable for the pool's whole lifetime since the
    /// `Weak` was captured from inside `Arc::new_cyclic` at construction.
    fn self_arc(&self) -> Arc<PoolInner> {
        self.self_weak
            .upgrade()
            .expect("PoolInner outlived its own Arc")
    }

    /// Run one dispatch-miss iteration: deactivate if misses accumulated or running is
    /// above target, then block on the event sync, retire as a spare, or help maintain
    /// parallelism.
    pub(crate) fn pre_step(&self, _ctx: &WorkerContext, handle: &WorkerHandle, misses: &mut u32) {
        let running = unpack_running(self.worker_counts.load(Ordering::Acquire)) as usize;
        if handle.active.load(Ordering::Acquire) && (*misses > 0 || running > self.parallelism) {
            handle.active.store(false, Ordering::Release);
            self.note_active(handle.index, false);
        }
        if *misses >= 2 {
            self.event_sync(handle);
            *misses = 0;
            return;
        }
        let running = unpack_running(self.worker_counts.load(Ordering::Acquire)) as usize;
        if running > self.parallelism {
            self.suspend_as_spare(handle);
        } else {
            self.help_maintain_parallelism();
        }
    }

    /// One unit of help-join progress: run a locally available task (own deque first,
    /// then one steal attempt) instead of parking. Returns `false` (nothing to do) once
    /// `is_done` already holds.
    pub(crate) fn help_join_step(&self, ctx: &WorkerContext, is_done: &dyn Fn() -> bool) -> bool {
        if is_done() {
            return false;
        }
        if let Some(task) = ctx.deque().pop_top() {
            task.execute(ctx);
            return true;
        }
        if let Some(task) = self.steal_one(ctx.index(), ctx.steal_counter()) {
            task.execute(ctx);
            return true;
        }
        false
    }

    /// Run `blocker` under parallelism compensation: decrement `running` *before* the
    /// actual block so the count reflects reality, then (if called from a worker)
    /// immediately call `help_maintain_parallelism` so a spare is resumed or a
    /// compensating thread spawned to cover for us while we're out. The dispatch-miss
    /// loop reclaims the excess once `running` climbs back above target.
    pub(crate) fn await_blocker(
        &self,
        ctx: Option<&WorkerContext>,
        blocker: &mut dyn ManagedBlocker,
    ) -> Result<()> {
        if blocker.is_releasable() {
            return Ok(());
        }
        self.dec_running();
        if ctx.is_some() {
            self.help_maintain_parallelism();
        }
        let result = blocker.block();
        self.inc_running();
        result?;
        while !blocker.is_releasable() {
            blocker.block()?;
        }
        Ok(())
    }
}
