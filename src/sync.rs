//! Lock-free building blocks shared by the pool, tasks, and phaser.
//!
//! The pool's event-waiter stack, spare-worker stack, each task's waiter list, and the
//! phaser's even/odd wait queues are all the same shape: a Treiber stack of small wait
//! nodes, pushed by a parker and drained by whoever causes the awaited condition to
//! become true. [`TreiberStack`] is that one primitive, reused four times instead of
//! four bespoke linked lists.
//!
//! Every timed wait here recomputes its remaining budget from a monotonic `Instant` on
//! each wakeup rather than trusting the duration it last parked for, so spurious wakeups
//! cannot shorten the wait.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread::Thread;
use std::time::{Duration, Instant};

use crate::blocker::ManagedBlocker;
use crate::worker::WorkerContext;

/// A lock-free LIFO stack built from individually heap-allocated nodes, manipulated with
/// CAS on the head pointer. Used wherever the spec calls for a "Treiber stack of wait
/// nodes".
pub(crate) struct TreiberStack<T> {
    head: AtomicPtr<Node<T>>,
}

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

impl<T> TreiberStack<T> {
    pub const fn new() -> Self {
        TreiberStack {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Push a value onto the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: `node` was just allocated by this thread and not yet published.
            unsafe { (*node).next = head };
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Pop one value, if any.
    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            // SAFETY: `head` was published by a `push` and only ever freed by the
            // thread that wins the CAS below, which happens at most once per node.
            let next = unsafe { (*head).next };
            if self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let boxed = unsafe { Box::from_raw(head) };
                return Some(boxed.value);
            }
        }
    }

    /// Atomically take the whole stack and return its contents, most-recently-pushed
    /// first. Used to release every waiter at once on a terminal transition.
    pub fn drain(&self) -> Vec<T> {
        let mut head = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut out = Vec::new();
        while !head.is_null() {
            // SAFETY: exclusive ownership was just obtained via the swap above.
            let boxed = unsafe { Box::from_raw(head) };
            head = boxed.next;
            out.push(boxed.value);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for TreiberStack<T> {
    fn drop(&mut self) {
        // Reuse drain's node-walking to free anything left on the stack.
        self.drain();
    }
}

// Safety: the stack only ever moves `T` between threads through the CAS-protected
// linked list, same as any other lock-free stack of owned nodes.
unsafe impl<T: Send> Send for TreiberStack<T> {}
unsafe impl<T: Send> Sync for TreiberStack<T> {}

/// A single parked-thread wait node, used by the task waiter stack and by the phaser's
/// even/odd queues. `thread` is nulled to cancel the wait without removing the node from
/// whatever stack holds it (unparking a nulled node is simply skipped by the releaser).
pub(crate) struct ParkNode {
    thread: parking_lot::Mutex<Option<Thread>>,
}

impl ParkNode {
    pub fn for_current_thread() -> Self {
        ParkNode {
            thread: parking_lot::Mutex::new(Some(std::thread::current())),
        }
    }

    /// Wake the parked thread, if it hasn't cancelled itself.
    pub fn unpark(&self) {
        if let Some(t) = self.thread.lock().take() {
            t.unpark();
        }
    }

    /// Cancel this node: a later `unpark` becomes a no-op.
    pub fn cancel(&self) {
        *self.thread.lock() = None;
    }
}

/// Recompute the remaining budget of a deadline-based wait on every wakeup, using a
/// monotonic clock so repeated spurious wakeups never drift the effective timeout. Returns
/// `None` once the deadline has passed.
pub(crate) fn remaining(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline - now)
    }
}

/// Adapts a plain park/timeout loop to the [`ManagedBlocker`] protocol, so every blocking
/// wait in the crate (task join, phaser advance) goes through the same compensation path
/// as a user's own `ManagedBlocker`, instead of each call site reimplementing it.
struct FnBlocker<'a> {
    is_done: &'a dyn Fn() -> bool,
    timed_park: &'a dyn Fn() -> bool,
}

impl ManagedBlocker for FnBlocker<'_> {
    fn block(&mut self) -> crate::error::Result<()> {
        (self.timed_park)();
        Ok(())
    }

    fn is_releasable(&mut self) -> bool {
        (self.is_done)()
    }
}

/// Park the current thread until `is_done` holds or `deadline` passes. When called from a
/// worker thread (`ctx.is_some()`), parks through [`crate::pool::PoolInner::await_blocker`]
/// so the pool can compensate for the blocked thread by waking or spawning another worker.
/// Returns `true` if `is_done` held by the time this returns.
pub(crate) fn cooperative_park(
    ctx: Option<&WorkerContext>,
    deadline: Option<Instant>,
    is_done: &dyn Fn() -> bool,
) -> bool {
    let timed_park = || -> bool {
        match deadline {
            Some(dl) => match remaining(dl) {
                Some(d) => {
                    std::thread::park_timeout(d);
                    true
                }
                None => false,
            },
            None => {
                std::thread::park();
                true
            }
        }
    };
    match ctx {
        Some(ctx) => {
            let mut blocker = FnBlocker {
                is_done,
                timed_park: &timed_park,
            };
            let _ = ctx.pool().await_blocker(Some(ctx), &mut blocker);
        }
        None => {
            timed_park();
        }
    }
    is_done()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_is_lifo() {
        let stack = TreiberStack::new();
        stack.push(1);
        stack.push(2);
        stack.push(3);
        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn drain_empties_in_lifo_order() {
        let stack = TreiberStack::new();
        for i in 0..5 {
            stack.push(i);
        }
        let drained = stack.drain();
        assert_eq!(drained, vec![4, 3, 2, 1, 0]);
        assert!(stack.is_empty());
    }

    #[test]
    fn concurrent_push_pop_preserves_all_elements() {
        let stack = Arc::new(TreiberStack::new());
        let mut handles = vec![];
        for t in 0..8 {
            let stack = Arc::clone(&stack);
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    stack.push(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut drained = stack.drain();
        drained.sort_unstable();
        let expected: Vec<i64> = (0..8000).collect();
        assert_eq!(drained, expected);
    }

    #[test]
    fn park_node_cancel_suppresses_unpark() {
        let node = ParkNode::for_current_thread();
        node.cancel();
        // Would deadlock/hang if it actually unparked nothing while we expect a park,
        // but here we only assert that unpark after cancel doesn't panic and is a no-op.
        node.unpark();
    }

    #[test]
    fn remaining_counts_down_to_none() {
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(remaining(deadline).is_some());
        thread::sleep(Duration::from_millis(40));
        assert_eq!(remaining(deadline), None);
    }
}
