//! Checkpointing, recovery and the canonical execution record.

mod execution;
mod manager;
mod recovery;

pub use execution::ExecutionPersistence;
pub use manager::CheckpointManager;
pub use recovery::RecoveryManager;
