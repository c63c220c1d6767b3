//! # Novelflow
//!
//! Orchestration engine for multi-stage novel generation pipelines.
//!
//! A pipeline is an ordered list of stages (outline, draft, review, ...)
//! run against one novel or chapter. Novelflow provides:
//!
//! - **Sequential execution** with per-stage retry, timeouts and cancellation
//! - **Checkpoints and recovery**: failed or paused runs resume after the last completed stage
//! - **Resource locks** so only one run per pipeline type and chapter is active
//! - **Self-healing** for rate limits, context overflow and transient failures
//! - **Parallel helpers** for batches of chapters and seeded branch candidates
//! - **Observability**: lifecycle events, per-execution metrics, cost and health checks
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use novelflow::prelude::*;
//!
//! let registry = Arc::new(PipelineRegistry::new());
//! registry.register(
//!     Pipeline::new("chapter", "Chapter generation")
//!         .stage(OutlineStage::new())
//!         .stage(DraftStage::new())
//!         .stage(ReviewStage::new()),
//! )?;
//!
//! let engine = PipelineEngine::new(registry, EngineStores::in_memory(), EngineConfig::default());
//! let target = StageTarget::novel("novel-1").with_chapter("chapter-3");
//! let result = engine.execute("chapter", ExecuteOptions::new(target)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod cancellation;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod core;
pub mod engine;
pub mod errors;
pub mod events;
pub mod healing;
pub mod lock;
pub mod observability;
pub mod parallel;
pub mod persistence;
pub mod pipeline;
pub mod stages;
pub mod state;
pub mod telemetry;
pub mod testing;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        EngineConfig, HealingConfig, ParallelConfig, PipelineConfig, StageRetryPolicy,
    };
    pub use crate::context::{ContextUpdate, PipelineContext, StageContext, StageTarget};
    pub use crate::core::{
        PipelineEvent, PipelineEventKind, PipelineStatus, StageResult, StageStatus,
    };
    pub use crate::engine::{EngineStores, ExecuteOptions, ExecutionResult, PipelineEngine};
    pub use crate::errors::{NovelflowError, StageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::healing::{HealthMonitor, SelfHealingManager};
    pub use crate::observability::ObservabilityDashboard;
    pub use crate::parallel::{BatchGenerator, BranchGenerator, ParallelExecutor};
    pub use crate::pipeline::{Pipeline, PipelineRegistry};
    pub use crate::stages::{ErrorHandling, FnStage, Stage};
    pub use crate::utils::{generate_id, Timestamp};
    pub use std::sync::Arc;
}
