//! Pipeline definitions, the registry, and the per-stage retry wrapper.

mod definition;
mod registry;
pub mod retry;

pub use definition::Pipeline;
pub use registry::PipelineRegistry;
pub use retry::{is_retryable_error, run_stage_with_retry, StageOutcome};
