//! Property tests for the runtime's core invariants: no lost/double task results, Deque
//! conservation under concurrent push/pop/steal, and Phaser bookkeeping invariants.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use forkjoin::{Phaser, Pool, RecursiveTask};

proptest! {
    // Each case here spins up a real thread pool; the default 256 cases would mean
    // hundreds of pools and OS threads for one `cargo test` run, so cut that down.
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Every forked-then-joined task yields exactly its own result, once, regardless of
    /// how many leaves a balanced fork/join tree has.
    #[test]
    fn fork_join_tree_loses_no_results(leaf_count in 1usize..200) {
        let pool = Pool::new(4).unwrap();
        let executed = Arc::new(AtomicUsize::new(0));

        fn build(lo: usize, hi: usize, executed: Arc<AtomicUsize>) -> RecursiveTask<usize> {
            let executed2 = Arc::clone(&executed);
            RecursiveTask::new(move |_ctx| {
                if hi - lo <= 1 {
                    executed2.fetch_add(1, Ordering::SeqCst);
                    return lo;
                }
                let mid = lo + (hi - lo) / 2;
                let left = build(lo, mid, Arc::clone(&executed2));
                let right = build(mid, hi, executed2);
                left.fork();
                let r = right.invoke();
                let l = left.join();
                l + r
            })
        }

        let t = build(0, leaf_count, Arc::clone(&executed));
        let expected: usize = (0..leaf_count).sum();
        let result = pool.invoke(&t).unwrap();
        prop_assert_eq!(result, expected);
        prop_assert_eq!(executed.load(Ordering::SeqCst), leaf_count);
        pool.shutdown();
        prop_assert!(pool.await_termination(std::time::Duration::from_secs(5)));
    }

    /// Concurrent owner pop / thief steal conserves every pushed element exactly once,
    /// whatever the push count and thief fan-out.
    #[test]
    fn deque_conserves_every_task_under_contention(
        n in 1usize..4000,
        thieves in 1usize..6,
    ) {
        use std::sync::atomic::AtomicI32;

        // Exercise the deque indirectly through a pool: push n independent no-op tasks
        // via `execute`, then confirm each one runs exactly once.
        let pool = Pool::new(1 + thieves).unwrap();
        let ran = Arc::new(AtomicI32::new(0));
        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            let ran2 = Arc::clone(&ran);
            let t = RecursiveTask::new(move |_ctx| {
                ran2.fetch_add(1, Ordering::SeqCst);
            });
            pool.execute(&t).unwrap();
            handles.push(t);
        }
        for t in &handles {
            t.join();
        }
        prop_assert_eq!(ran.load(Ordering::SeqCst), n as i32);
        pool.shutdown();
        prop_assert!(pool.await_termination(std::time::Duration::from_secs(5)));
    }

    /// At every quiescent observation point, `arrived + unarrived == parties`, and
    /// `0 <= arrived <= parties <= 65535`.
    #[test]
    fn phaser_arrived_plus_unarrived_equals_parties(parties in 1i32..64, rounds in 1usize..5) {
        let p = Phaser::with_parties(parties);
        for _ in 0..rounds {
            let handles: Vec<_> = (0..parties)
                .map(|_| {
                    let p = p.clone();
                    thread::spawn(move || {
                        p.arrive_and_await_advance();
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            let arrived = p.get_arrived_parties();
            let unarrived = p.get_unarrived_parties();
            let registered = p.get_registered_parties();
            prop_assert_eq!(arrived + unarrived, registered);
            prop_assert!(registered >= 0 && registered <= 65535);
            prop_assert!(arrived >= 0 && arrived <= registered);
        }
    }

    /// `phase = arrive(); awaitAdvance(phase)` returns strictly greater than `phase`
    /// whenever every other registered party also arrives.
    #[test]
    fn phaser_await_advance_strictly_increases_phase(parties in 1i32..16) {
        let p = Phaser::with_parties(parties);
        let before = p.phase();
        let handles: Vec<_> = (0..parties)
            .map(|_| {
                let p = p.clone();
                thread::spawn(move || p.arrive_and_await_advance())
            })
            .collect();
        for h in handles {
            let returned = h.join().unwrap();
            prop_assert!(returned > before);
        }
        prop_assert_eq!(p.phase(), before + 1);
    }
}

#[test]
fn shutdown_is_idempotent() {
    let pool = Pool::new(2).unwrap();
    pool.shutdown();
    pool.shutdown();
    assert!(pool.await_termination(std::time::Duration::from_secs(5)));
}

#[test]
fn cancel_on_a_completed_task_returns_false_and_does_not_alter_outcome() {
    let pool = Pool::new(2).unwrap();
    let t: RecursiveTask<i32> = RecursiveTask::new(|_| 7);
    let result = pool.invoke(&t).unwrap();
    assert_eq!(result, 7);
    assert!(!t.cancel(true));
    assert_eq!(t.try_join().unwrap(), 7);
    pool.shutdown();
}

#[test]
fn phaser_registered_with_zero_parties_await_advance_returns_without_blocking() {
    let p = Phaser::new();
    assert_eq!(p.await_advance(0), 0);
}

#[test]
fn managed_blocker_already_releasable_never_blocks() {
    use forkjoin::ManagedBlocker;
    struct AlwaysReady(std::sync::Arc<AtomicUsize>);
    impl ManagedBlocker for AlwaysReady {
        fn block(&mut self) -> forkjoin::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_releasable(&mut self) -> bool {
            true
        }
    }
    let pool = Pool::new(1).unwrap();
    let blocks = Arc::new(AtomicUsize::new(0));
    let mut b = AlwaysReady(Arc::clone(&blocks));
    pool.managed_block(&mut b).unwrap();
    assert_eq!(blocks.load(Ordering::SeqCst), 0);
    pool.shutdown();
}
</content>
