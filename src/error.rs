//! Error types for the fork/join runtime.
//!
//! A flat enum with a manual `Display` match, no derive macro. The runtime has no
//! checked-exception equivalent, so a panicking `compute` is caught at the task boundary
//! and reported as [`ForkJoinError::TaskPanicked`].

use std::fmt;

/// Errors surfaced by the pool, tasks, and phaser.
#[derive(Debug, Clone)]
pub enum ForkJoinError {
    /// `submit`/`execute` called after the pool entered `SHUTDOWN` or later.
    RejectedSubmission,
    /// The task's `compute` panicked; the payload is downcast to a message where possible.
    TaskPanicked(String),
    /// `get`/`join` observed a cancelled task.
    Cancelled,
    /// A blocking wait was interrupted before completion.
    Interrupted,
    /// A timed wait expired before the awaited condition held.
    TimedOut,
    /// A Phaser invariant was violated (parties overflow, deregistering with none
    /// registered, registering more than 65535 parties).
    InvariantViolation(&'static str),
    /// `Pool::new`/`PoolBuilder::build` received `parallelism == 0` or a value exceeding
    /// `MAX_WORKERS`.
    InvalidParallelism(usize),
}

impl fmt::Display for ForkJoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForkJoinError::RejectedSubmission => write!(f, "task rejected: pool is shut down"),
            ForkJoinError::TaskPanicked(msg) => write!(f, "task panicked: {msg}"),
            ForkJoinError::Cancelled => write!(f, "task was cancelled"),
            ForkJoinError::Interrupted => write!(f, "wait was interrupted"),
            ForkJoinError::TimedOut => write!(f, "wait timed out"),
            ForkJoinError::InvariantViolation(what) => write!(f, "invariant violated: {what}"),
            ForkJoinError::InvalidParallelism(n) => {
                write!(f, "invalid parallelism: {n}")
            }
        }
    }
}

impl std::error::Error for ForkJoinError {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ForkJoinError>;
