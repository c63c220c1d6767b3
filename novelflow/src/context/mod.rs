//! Context carried through a pipeline run.
//!
//! This module provides:
//! - The typed, versioned [`PipelineContext`] shared between stages
//! - [`ContextUpdate`], the only way stages contribute to it
//! - The per-invocation [`StageContext`] and its [`ProgressReporter`]

mod pipeline;
mod stage;

pub use pipeline::{ContextUpdate, PipelineContext, ReviewScores};
pub use stage::{ProgressReporter, StageContext, StageTarget};
