//! Core domain model types for novelflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Pipeline, stage and category enums
//! - Stage results with token/cost metrics
//! - The closed pipeline event type

mod event;
mod result;
mod status;

pub use event::{PipelineEvent, PipelineEventKind};
pub use result::{StageMetrics, StageResult, TokenUsage};
pub use status::{PipelineStatus, StageCategory, StageStatus};
