//! Test helpers for pipeline authors.
//!
//! This module provides:
//! - Scripted and canned mock stages
//! - A call log shared between recording stages
//! - [`TestHarness`], an engine wired to in-memory stores

mod harness;
mod mocks;

pub use crate::events::CollectingEventSink;
pub use harness::TestHarness;
pub use mocks::{
    CallLog, FailingStage, RecordedCall, RecordingStage, Script, ScriptedStage, SlowStage,
    SuccessStage,
};
