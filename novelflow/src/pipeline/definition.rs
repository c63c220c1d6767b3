//! Pipeline definition.

use crate::config::PipelineConfig;
use crate::stages::Stage;
use std::sync::Arc;

/// A named, ordered list of stages with default configuration.
///
/// Immutable once registered.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pipeline_type: String,
    name: String,
    stages: Vec<Arc<dyn Stage>>,
    config: Option<PipelineConfig>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    pub fn new(pipeline_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            pipeline_type: pipeline_type.into(),
            name: name.into(),
            stages: Vec::new(),
            config: None,
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Appends a shared stage.
    #[must_use]
    pub fn shared_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets the configuration, replacing the engine defaults for this pipeline.
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Registry key.
    pub fn pipeline_type(&self) -> &str {
        &self.pipeline_type
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Configuration set on the definition, if any.
    pub fn config(&self) -> Option<&PipelineConfig> {
        self.config.as_ref()
    }

    /// Position of a stage by id.
    pub fn stage_index(&self, stage_id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id() == stage_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SuccessStage;

    #[test]
    fn test_stage_order_is_kept() {
        let pipeline = Pipeline::new("novel", "Novel setup")
            .stage(SuccessStage::new("setup"))
            .stage(SuccessStage::new("outline"))
            .stage(SuccessStage::new("finalize"));

        assert_eq!(pipeline.len(), 3);
        assert_eq!(pipeline.stage_index("outline"), Some(1));
        assert_eq!(pipeline.stage_index("missing"), None);
        assert_eq!(pipeline.stages()[2].id(), "finalize");
    }
}
