//! The per-worker double-ended task queue.
//!
//! A growable circular buffer of task slots, capacity a power of two, growing up to an
//! implementation cap. Each slot is a small lock (`parking_lot::Mutex<Option<Arc<dyn
//! RawTask>>>`) guarded by the lock-free `base`/`top` index race: lock-free owner,
//! locked steal. This sidesteps hazard-pointer-style reclamation: a stolen task's `Arc`
//! is simply cloned out of its `Mutex` slot by whichever side's CAS wins.
//!
//! Growth is coordinated with thieves by taking the structural `RwLock`'s write side;
//! thieves just block briefly on the read lock instead of spinning.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};

use crate::task::RawTask;

const INITIAL_CAPACITY: usize = 32;
const MAX_CAPACITY: usize = 1 << 20;

type Slot = Mutex<Option<Arc<dyn RawTask>>>;

/// A single worker's local deque: LIFO from the owner's `top` end, FIFO from any
/// thief's `base` end (or FIFO from both ends in async/`locally_fifo` mode, via
/// [`Deque::poll_top`]).
pub(crate) struct Deque {
    slots: RwLock<Vec<Slot>>,
    // Padded to separate cache lines: `base` is written by thieves, `top` by the owner,
    // and without padding they'd share a line and bounce between cores on every op.
    base: CachePadded<AtomicI64>,
    top: CachePadded<AtomicI64>,
}

impl Deque {
    pub fn new() -> Self {
        Deque {
            slots: RwLock::new((0..INITIAL_CAPACITY).map(|_| Mutex::new(None)).collect()),
            base: CachePadded::new(AtomicI64::new(0)),
            top: CachePadded::new(AtomicI64::new(0)),
        }
    }

    /// Owner-only. Push `task` at `top`, growing the buffer first if it's full. Returns
    /// the task back to the caller if the deque is already at `MAX_CAPACITY` and can't
    /// grow any further, rather than spinning on a grow that will never succeed.
    pub fn push_top(&self, task: Arc<dyn RawTask>) -> Option<Arc<dyn RawTask>> {
        let mut task = Some(task);
        loop {
            let slots = self.slots.read();
            let cap = slots.len() as i64;
            let t = self.top.load(Ordering::Relaxed);
            let b = self.base.load(Ordering::Acquire);
            if t - b >= cap {
                drop(slots);
                if !self.grow() {
                    log::warn!("deque at capacity cap, rejecting push");
                    return task;
                }
                continue;
            }
            let idx = (t as usize) % slots.len();
            *slots[idx].lock() = task.take();
            self.top.store(t + 1, Ordering::Release);
            return None;
        }
    }

    /// Owner-only. Reclaim the most recently pushed task, or `None` if a thief won the
    /// race for the last remaining slot.
    ///
    /// Reads the slot (as a clone of the `Arc`) before resolving who owns it, and only
    /// the side that wins the `base` CAS nulls the slot and keeps the value. Taking the
    /// slot first and restoring it on a lost race would let two consumers briefly hold
    /// the same task, or drop it if the loser's restore never gets observed by the other
    /// side.
    pub fn pop_top(&self) -> Option<Arc<dyn RawTask>> {
        let slots = self.slots.read();
        let t = self.top.load(Ordering::Relaxed);
        let new_t = t - 1;
        self.top.store(new_t, Ordering::Relaxed);
        let b = self.base.load(Ordering::Acquire);
        let size = new_t - b;
        if size < 0 {
            // Already empty; undo the speculative decrement.
            self.top.store(t, Ordering::Relaxed);
            return None;
        }
        let idx = (new_t as usize) % slots.len();
        let task = slots[idx].lock().clone();
        if size > 0 {
            // At least one task remains after this pop; no thief can be racing for this
            // slot since they only ever operate at `base`, which is strictly below it.
            *slots[idx].lock() = None;
            return task;
        }
        // Exactly one element left: race a thief for it via the base CAS.
        let won = self
            .base
            .compare_exchange(b, b + 1, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.top.store(b + 1, Ordering::Relaxed);
        if won {
            *slots[idx].lock() = None;
            task
        } else {
            None
        }
    }

    /// Any thread. Steal the oldest task from `base`, advancing `base` on success.
    ///
    /// Same read-then-CAS ordering as [`Deque::pop_top`]: the slot is read as a clone
    /// first, and only the thread that wins the `base` CAS nulls the slot and returns
    /// the value. A losing thief simply drops its clone and retries.
    pub fn poll_base(&self) -> Option<Arc<dyn RawTask>> {
        let slots = self.slots.read();
        loop {
            let b = self.base.load(Ordering::Acquire);
            let t = self.top.load(Ordering::Acquire);
            if b >= t {
                return None; // empty
            }
            let idx = (b as usize) % slots.len();
            let task = slots[idx].lock().clone();
            if self
                .base
                .compare_exchange(b, b + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                if task.is_some() {
                    *slots[idx].lock() = None;
                    return task;
                }
                // The slot was empty because a grow was mid-flight when we read it;
                // base has moved past it regardless, so keep looking.
                continue;
            }
            // Lost the race; someone else already advanced base past this slot.
        }
    }

    /// Owner-only FIFO poll, used instead of `pop_top` when the pool runs in
    /// `locally_fifo` (async) mode.
    pub fn poll_top(&self) -> Option<Arc<dyn RawTask>> {
        self.poll_base()
    }

    pub fn len(&self) -> usize {
        let t = self.top.load(Ordering::Acquire);
        let b = self.base.load(Ordering::Acquire);
        (t - b).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Double the buffer, re-homing every live slot from `base..top`. Returns `false`
    /// without growing if the implementation cap has already been reached.
    fn grow(&self) -> bool {
        let mut slots = self.slots.write();
        let old_cap = slots.len();
        if old_cap >= MAX_CAPACITY {
            return false;
        }
        let new_cap = (old_cap * 2).min(MAX_CAPACITY);
        let b = self.base.load(Ordering::Acquire);
        let t = self.top.load(Ordering::Acquire);
        let mut new_slots: Vec<Slot> = (0..new_cap).map(|_| Mutex::new(None)).collect();
        let mut i = b;
        while i < t {
            let old_idx = (i as usize) % old_cap;
            let new_idx = (i as usize) % new_cap;
            let task = slots[old_idx].lock().take();
            *new_slots[new_idx].lock() = task;
            i += 1;
        }
        *slots = new_slots;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerContext;
    use std::sync::atomic::AtomicI32;

    /// A minimal `RawTask` for exercising the deque without a real pool.
    struct Marker(i64, AtomicI32);

    impl RawTask for Marker {
        fn execute(self: Arc<Self>, _ctx: &WorkerContext) {}
        fn status(&self) -> i32 {
            self.1.load(Ordering::SeqCst)
        }
        fn cancel(&self) -> bool {
            false
        }
        fn await_done(&self, _ctx: Option<&WorkerContext>, _deadline: Option<std::time::Instant>) -> bool {
            true
        }
    }

    fn marker(id: i64) -> Arc<dyn RawTask> {
        Arc::new(Marker(id, AtomicI32::new(0)))
    }

    #[test]
    fn owner_pops_lifo() {
        let dq = Deque::new();
        let a = marker(1);
        let b = marker(2);
        let c = marker(3);
        dq.push_top(Arc::clone(&a));
        dq.push_top(Arc::clone(&b));
        dq.push_top(Arc::clone(&c));
        assert!(Arc::ptr_eq(&dq.pop_top().unwrap(), &c));
        assert!(Arc::ptr_eq(&dq.pop_top().unwrap(), &b));
        assert!(Arc::ptr_eq(&dq.pop_top().unwrap(), &a));
        assert!(dq.pop_top().is_none());
    }

    #[test]
    fn thief_steals_fifo() {
        let dq = Deque::new();
        let a = marker(1);
        let b = marker(2);
        let c = marker(3);
        dq.push_top(Arc::clone(&a));
        dq.push_top(Arc::clone(&b));
        dq.push_top(Arc::clone(&c));
        assert!(Arc::ptr_eq(&dq.poll_base().unwrap(), &a));
        // Owner still pops LIFO from the remaining two.
        assert!(Arc::ptr_eq(&dq.pop_top().unwrap(), &c));
        assert!(Arc::ptr_eq(&dq.pop_top().unwrap(), &b));
    }

    #[test]
    fn single_element_race_yields_exactly_one_winner() {
        use std::sync::Barrier;
        use std::thread;

        for _ in 0..200 {
            let dq = Arc::new(Deque::new());
            dq.push_top(marker(1));
            let barrier = Arc::new(Barrier::new(2));

            let dq2 = Arc::clone(&dq);
            let barrier2 = Arc::clone(&barrier);
            let stealer = thread::spawn(move || {
                barrier2.wait();
                dq2.poll_base()
            });

            barrier.wait();
            let owner_got = dq.pop_top();
            let thief_got = stealer.join().unwrap();

            let owner_won = owner_got.is_some();
            let thief_won = thief_got.is_some();
            assert!(owner_won ^ thief_won, "exactly one side must win the race");
        }
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dq = Deque::new();
        for i in 0..(INITIAL_CAPACITY as i64 * 3) {
            dq.push_top(marker(i));
        }
        assert_eq!(dq.len(), INITIAL_CAPACITY * 3);
        let mut drained = 0;
        while dq.pop_top().is_some() {
            drained += 1;
        }
        assert_eq!(drained, INITIAL_CAPACITY * 3);
    }

    #[test]
    fn concurrent_push_pop_and_steal_conserves_every_task() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let dq = Arc::new(Deque::new());
        const N: usize = 5000;
        for i in 0..N {
            dq.push_top(marker(i as i64));
        }

        let popped = Arc::new(AtomicUsize::new(0));
        let stolen = Arc::new(AtomicUsize::new(0));

        let owner = {
            let dq = Arc::clone(&dq);
            let popped = Arc::clone(&popped);
            thread::spawn(move || {
                while dq.pop_top().is_some() {
                    popped.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let mut thieves = vec![];
        for _ in 0..4 {
            let dq = Arc::clone(&dq);
            let stolen = Arc::clone(&stolen);
            thieves.push(thread::spawn(move || {
                let mut misses = 0;
                while misses < 1000 {
                    match dq.poll_base() {
                        Some(_) => {
                            stolen.fetch_add(1, Ordering::Relaxed);
                            misses = 0;
                        }
                        None => misses += 1,
                    }
                }
            }));
        }

        owner.join().unwrap();
        for t in thieves {
            t.join().unwrap();
        }

        assert_eq!(
            popped.load(Ordering::Relaxed) + stolen.load(Ordering::Relaxed),
            N
        );
    }
}
