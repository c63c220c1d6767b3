//! Execution state and its transition rules.

mod machine;
mod pipeline_state;

pub use machine::{
    pipeline_transition, stage_transition, PipelineStateMachine, PipelineTransition,
    StageTransition,
};
pub use pipeline_state::{PipelineState, StageExecution};
