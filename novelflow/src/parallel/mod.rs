//! Bounded-concurrency execution outside the engine.
//!
//! The engine runs one resource at a time under a lock. This module covers
//! the fan-out cases: many chapters at once ([`BatchGenerator`]) or several
//! seeded candidates of one stage ([`BranchGenerator`]). Neither takes the
//! engine's resource lock.

mod batch;
mod branch;
mod executor;
mod semaphore;

pub use batch::BatchGenerator;
pub use branch::{Branch, BranchGenerator, BranchResult};
pub use executor::{ParallelExecutor, ParallelResult, ParallelTask, TaskReport, TaskStatus};
pub use semaphore::{Permit, Semaphore};
