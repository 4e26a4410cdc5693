//! A fork/join work-stealing execution runtime, plus a reusable hierarchical phase
//! barrier, modeled on `java.util.concurrent`'s `ForkJoinPool`/`Phaser`.
//!
//! - [`Pool`] is the worker pool: a fixed-target number of worker threads, each with its
//!   own work-stealing [`deque`], that runs [`RecursiveTask`]/[`RecursiveAction`] work
//!   submitted via [`Pool::execute`]/[`Pool::invoke`] or forked from inside a running task.
//! - [`Phaser`] is a reusable, hierarchical phase barrier for coordinating a group of
//!   parties (which may themselves be tasks) through repeated synchronization points.
//! - [`ManagedBlocker`] lets code running inside the pool perform blocking I/O or wait on
//!   external conditions without starving the pool of parallelism: the pool temporarily
//!   compensates by spinning up or resuming another worker while the caller blocks.

mod blocker;
mod deque;
mod error;
mod phaser;
mod pool;
mod sync;
mod task;
mod worker;

pub use blocker::{ManagedBlocker, SleepBlocker};
pub use error::{ForkJoinError, Result};
pub use phaser::Phaser;
pub use pool::{Pool, PoolBuilder};
pub use task::{Outcome, RecursiveAction, RecursiveTask};
pub use worker::WorkerContext;
