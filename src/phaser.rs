//! Phaser: a reusable, hierarchical phase barrier.
//!
//! State (unarrived count, registered parties, phase, terminated flag) is packed into one
//! atomic word, the same style as `pool.rs`'s `workerCounts`/`runState`, so a reader sees a
//! consistent snapshot instead of racing several independent counters. Parking goes through
//! the shared [`TreiberStack`]/`ParkNode` primitives in `sync.rs`. A non-root phaser's own
//! state can briefly lag its parent's; [`Phaser::reconcile_state`] is what a caller's next
//! read pulls it back into agreement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{ForkJoinError, Result};
use crate::sync::{cooperative_park, remaining, ParkNode, TreiberStack};
use crate::worker::WorkerContext;

const TERMINATED_BIT: u64 = 1 << 63;
const PHASE_SHIFT: u32 = 32;
const PHASE_MASK: u64 = 0x7FFF_FFFF;
const PARTIES_SHIFT: u32 = 16;
const PARTIES_MASK: u64 = 0xFFFF;
const UNARRIVED_MASK: u64 = 0xFFFF;
const MAX_PARTIES: u32 = 0xFFFF;

fn pack(unarrived: u32, parties: u32, phase: i64, terminated: bool) -> u64 {
    let mut v = (unarrived as u64) & UNARRIVED_MASK;
    v |= ((parties as u64) & PARTIES_MASK) << PARTIES_SHIFT;
    v |= ((phase as u64) & PHASE_MASK) << PHASE_SHIFT;
    if terminated {
        v |= TERMINATED_BIT;
    }
    v
}

fn unarrived_of(v: u64) -> u32 {
    (v & UNARRIVED_MASK) as u32
}

fn parties_of(v: u64) -> u32 {
    ((v >> PARTIES_SHIFT) & PARTIES_MASK) as u32
}

fn phase_of(v: u64) -> i64 {
    ((v >> PHASE_SHIFT) & PHASE_MASK) as i64
}

fn terminated_of(v: u64) -> bool {
    v & TERMINATED_BIT != 0
}

struct PhaserInner {
    state: AtomicU64,
    parent: Option<Phaser>,
    is_root: bool,
    even_q: TreiberStack<Arc<ParkNode>>,
    odd_q: TreiberStack<Arc<ParkNode>>,
    on_advance: Mutex<Option<Box<dyn FnMut(i64, i32) -> bool + Send>>>,
    /// Short critical section held across a registration's read-modify-write so a
    /// concurrent `arrive` reaching zero can't advance the phase out from under it.
    reg_lock: Mutex<()>,
}

/// A reusable phase barrier. Cheap to clone: every clone is a handle to the same
/// underlying phaser (`Arc`-backed), not an independent copy of its state.
pub struct Phaser(Arc<PhaserInner>);

impl Clone for Phaser {
    fn clone(&self) -> Self {
        Phaser(Arc::clone(&self.0))
    }
}

impl Default for Phaser {
    fn default() -> Self {
        Self::new()
    }
}

impl Phaser {
    /// A root phaser with zero initially registered parties.
    pub fn new() -> Self {
        Self::new_with(None, 0)
    }

    /// A root phaser with `parties` initially registered.
    pub fn with_parties(parties: i32) -> Self {
        Self::new_with(None, parties)
    }

    /// A child phaser, tiered under `parent`. The child registers one party with its
    /// parent as soon as it has any parties of its own (on construction here, or on the
    /// first `register` if constructed with zero).
    pub fn with_parent(parent: Phaser) -> Self {
        Self::new_with(Some(parent), 0)
    }

    pub fn with_parent_and_parties(parent: Phaser, parties: i32) -> Self {
        Self::new_with(Some(parent), parties)
    }

    fn new_with(parent: Option<Phaser>, parties: i32) -> Self {
        let is_root = parent.is_none();
        let parties = parties.max(0) as u32;
        if let Some(p) = &parent {
            if parties > 0 {
                p.register();
            }
        }
        Phaser(Arc::new(PhaserInner {
            state: AtomicU64::new(pack(parties, parties, 0, false)),
            parent,
            is_root,
            even_q: TreiberStack::new(),
            odd_q: TreiberStack::new(),
            on_advance: Mutex::new(None),
            reg_lock: Mutex::new(()),
        }))
    }

    /// Install a hook run on the root phaser (by the arrival that completes a phase)
    /// deciding whether the phaser should terminate instead of advancing. Only meaningful
    /// on the root; non-root phasers just reconcile whatever the root decided.
    pub fn on_advance<F>(&self, f: F)
    where
        F: FnMut(i64, i32) -> bool + Send + 'static,
    {
        *self.0.on_advance.lock() = Some(Box::new(f));
    }

    fn root(&self) -> Phaser {
        match &self.0.parent {
            Some(p) if !self.0.is_root => p.root(),
            _ => self.clone(),
        }
    }

    pub fn register(&self) -> i64 {
        self.bulk_register(1)
    }

    pub fn bulk_register(&self, n: i32) -> i64 {
        if n == 0 {
            return self.phase();
        }
        assert!(n > 0, "bulk_register requires a positive party count");
        let _guard = self.0.reg_lock.lock();
        loop {
            let cur = self.0.state.load(Ordering::Acquire);
            if terminated_of(cur) {
                return -1;
            }
            let parties = parties_of(cur);
            let unarrived = unarrived_of(cur);
            if parties as u64 + n as u64 > MAX_PARTIES as u64 {
                panic!("phaser party count overflow");
            }
            if !self.0.is_root && unarrived == 0 && parties > 0 {
                // A non-root phase is mid-advance (propagated to the parent, waiting on
                // reconciliation); wait for it to land before registering into the next
                // phase instead of racing the parent's advance.
                let phase = phase_of(cur);
                drop(_guard);
                self.await_advance(phase);
                return self.bulk_register(n);
            }
            let was_empty = parties == 0;
            let next = pack(unarrived + n as u32, parties + n as u32, phase_of(cur), false);
            if self
                .0
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if was_empty {
                    if let Some(parent) = &self.0.parent {
                        parent.register();
                    }
                }
                return phase_of(cur);
            }
        }
    }

    pub fn arrive(&self) -> i64 {
        self.do_arrive(false)
    }

    pub fn arrive_and_deregister(&self) -> i64 {
        self.do_arrive(true)
    }

    fn do_arrive(&self, deregister: bool) -> i64 {
        loop {
            let cur = self.0.state.load(Ordering::Acquire);
            if terminated_of(cur) {
                return -1;
            }
            let parties = parties_of(cur);
            let unarrived = unarrived_of(cur);
            if unarrived == 0 {
                panic!("arrive() called with no unarrived parties");
            }
            let new_unarrived = unarrived - 1;
            let new_parties = if deregister { parties - 1 } else { parties };
            let next = pack(new_unarrived, new_parties, phase_of(cur), false);
            if self
                .0
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let phase = phase_of(cur);
                if new_unarrived == 0 {
                    self.finish_arrival(phase, new_parties, deregister && new_parties == 0);
                }
                return phase;
            }
        }
    }

    fn finish_arrival(&self, phase: i64, parties_now: u32, child_now_empty: bool) {
        if self.0.is_root {
            self.advance_root(phase, parties_now);
            return;
        }
        if let Some(parent) = &self.0.parent {
            if child_now_empty {
                parent.arrive_and_deregister();
            } else {
                parent.arrive();
            }
        }
        self.reconcile_state();
    }

    fn advance_root(&self, phase: i64, parties: u32) {
        let hook_wants_terminate = match self.0.on_advance.lock().as_mut() {
            Some(f) => f(phase, parties as i32),
            None => false,
        };
        // A phaser with no remaining registered parties terminates unconditionally, same
        // as every other arrive/register path checks `terminated_of` before proceeding.
        let terminate = hook_wants_terminate || parties == 0;
        loop {
            let cur = self.0.state.load(Ordering::Acquire);
            if phase_of(cur) != phase {
                break; // already advanced by a racing reconcile somehow; nothing to do
            }
            let next_phase = if terminate { phase } else { next_phase(phase) };
            let next = pack(parties, parties, next_phase, terminate);
            if self
                .0
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        self.release_queue(phase);
    }

    /// Pull this phaser's cached phase up to date with its root (walking the tree if
    /// several tiers lag at once), releasing any local waiters that were parked on the
    /// phase that just ended.
    fn reconcile_state(&self) {
        if self.0.is_root {
            return;
        }
        let root = self.root();
        loop {
            let cur = self.0.state.load(Ordering::Acquire);
            let root_state = root.0.state.load(Ordering::Acquire);
            let root_phase = phase_of(root_state);
            let root_terminated = terminated_of(root_state);
            let my_phase = phase_of(cur);
            if my_phase == root_phase && !root_terminated {
                break;
            }
            if unarrived_of(cur) != 0 {
                break; // not every local party has arrived for this phase yet
            }
            let parties = parties_of(cur);
            let next = pack(parties, parties, root_phase, root_terminated);
            if self
                .0
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.release_queue(my_phase);
                break;
            }
        }
        if let Some(parent) = &self.0.parent {
            parent.reconcile_state();
        }
    }

    fn release_queue(&self, ended_phase: i64) {
        let q = if ended_phase % 2 == 0 {
            &self.0.even_q
        } else {
            &self.0.odd_q
        };
        for node in q.drain() {
            node.unpark();
        }
    }

    pub fn arrive_and_await_advance(&self) -> i64 {
        let phase = self.arrive();
        if phase < 0 {
            return phase;
        }
        self.await_advance(phase)
    }

    /// Block until `phase` ends (or the phaser terminates), with no deadline.
    pub fn await_advance(&self, phase: i64) -> i64 {
        match self.await_advance_interruptibly(phase, None) {
            Ok(p) => p,
            Err(_) => -1,
        }
    }

    /// Block until `phase` ends, up to `deadline`, returning `TimedOut` if it elapses
    /// first.
    pub fn await_advance_interruptibly(&self, phase: i64, deadline: Option<Instant>) -> Result<i64> {
        if phase < 0 {
            return Ok(phase);
        }
        loop {
            self.reconcile_state();
            let cur = self.0.state.load(Ordering::Acquire);
            if terminated_of(cur) {
                return Ok(-1);
            }
            if phase_of(cur) != phase {
                return Ok(phase_of(cur));
            }
            if parties_of(cur) == 0 {
                // Nothing registered means nothing can ever arrive to advance this
                // phase; waiting for it would block forever.
                return Ok(phase_of(cur));
            }
            let node = Arc::new(ParkNode::for_current_thread());
            let q = if phase % 2 == 0 { &self.0.even_q } else { &self.0.odd_q };
            q.push(Arc::clone(&node));
            let cur = self.0.state.load(Ordering::Acquire);
            if phase_of(cur) != phase || terminated_of(cur) {
                node.cancel();
                continue;
            }
            let ctx = WorkerContext::current();
            let still_waiting = || -> bool {
                let cur = self.0.state.load(Ordering::Acquire);
                phase_of(cur) != phase || terminated_of(cur)
            };
            let done = cooperative_park(ctx.as_ref(), deadline, &still_waiting);
            node.cancel();
            if done {
                continue; // loop back around to reconcile/read the now-current phase
            }
            if let Some(dl) = deadline {
                if remaining(dl).is_none() {
                    return Err(ForkJoinError::TimedOut);
                }
            }
        }
    }

    /// Immediately terminate this phaser (and implicitly, from any waiter's perspective,
    /// its whole tree, since children observe `terminated` on their next reconcile) and
    /// release every parked waiter.
    pub fn force_termination(&self) {
        loop {
            let cur = self.0.state.load(Ordering::Acquire);
            if terminated_of(cur) {
                break;
            }
            let next = cur | TERMINATED_BIT;
            if self
                .0
                .state
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        for node in self.0.even_q.drain() {
            node.unpark();
        }
        for node in self.0.odd_q.drain() {
            node.unpark();
        }
        if let Some(parent) = &self.0.parent {
            parent.force_termination();
        }
    }

    pub fn is_terminated(&self) -> bool {
        terminated_of(self.0.state.load(Ordering::Acquire))
    }

    pub fn phase(&self) -> i64 {
        phase_of(self.0.state.load(Ordering::Acquire))
    }

    pub fn get_registered_parties(&self) -> i32 {
        parties_of(self.0.state.load(Ordering::Acquire)) as i32
    }

    pub fn get_arrived_parties(&self) -> i32 {
        let v = self.0.state.load(Ordering::Acquire);
        (parties_of(v) - unarrived_of(v)) as i32
    }

    pub fn get_unarrived_parties(&self) -> i32 {
        unarrived_of(self.0.state.load(Ordering::Acquire)) as i32
    }

    pub fn get_parent(&self) -> Option<Phaser> {
        self.0.parent.clone()
    }

    pub fn get_root(&self) -> Phaser {
        self.root()
    }
}

fn next_phase(phase: i64) -> i64 {
    (phase + 1) & (PHASE_MASK as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_party_advances_every_arrival() {
        let p = Phaser::with_parties(1);
        assert_eq!(p.phase(), 0);
        assert_eq!(p.arrive_and_await_advance(), 1);
        assert_eq!(p.arrive_and_await_advance(), 2);
    }

    #[test]
    fn cyclic_barrier_with_four_parties_advances_three_times() {
        let advances = Arc::new(AtomicUsize::new(0));
        let p = Phaser::with_parties(4);
        let advances2 = Arc::clone(&advances);
        p.on_advance(move |_phase, _parties| {
            advances2.fetch_add(1, Ordering::SeqCst);
            false
        });
        let mut handles = vec![];
        for _ in 0..4 {
            let p = p.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..3 {
                    p.arrive_and_await_advance();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(p.phase(), 3);
        assert_eq!(advances.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn deregistering_every_party_terminates() {
        let p = Phaser::with_parties(3);
        assert_eq!(p.arrive_and_deregister(), 0);
        assert_eq!(p.arrive_and_deregister(), 0);
        assert_eq!(p.arrive_and_deregister(), 0);
        assert!(p.is_terminated());
        assert!(p.get_registered_parties() == 0);
    }

    #[test]
    fn await_advance_times_out_without_enough_arrivals() {
        let p = Phaser::with_parties(2);
        let phase = p.arrive();
        let result = p.await_advance_interruptibly(phase, Some(Instant::now() + Duration::from_millis(30)));
        assert!(matches!(result, Err(ForkJoinError::TimedOut)));
    }

    #[test]
    fn child_phaser_propagates_to_parent_on_advance() {
        let root = Phaser::new();
        let child = Phaser::with_parent_and_parties(root.clone(), 2);
        assert_eq!(root.get_registered_parties(), 1);
        let h1 = {
            let child = child.clone();
            thread::spawn(move || child.arrive_and_await_advance())
        };
        let h2 = {
            let child = child.clone();
            thread::spawn(move || child.arrive_and_await_advance())
        };
        assert_eq!(h1.join().unwrap(), 1);
        assert_eq!(h2.join().unwrap(), 1);
        assert_eq!(child.phase(), 1);
    }

    #[test]
    fn force_termination_releases_waiters() {
        let p = Phaser::with_parties(2);
        let p2 = p.clone();
        let waiter = thread::spawn(move || p2.await_advance(0));
        thread::sleep(Duration::from_millis(20));
        p.force_termination();
        assert_eq!(waiter.join().unwrap(), -1);
        assert!(p.is_terminated());
    }
}
