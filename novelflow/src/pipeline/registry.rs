//! Pipeline registry.

use super::Pipeline;
use crate::errors::NovelflowError;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Write-once-per-type mapping from pipeline type to definition.
///
/// Constructed at startup and handed to the engine.
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl PipelineRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pipeline. A type can only be registered once.
    pub fn register(&self, pipeline: Pipeline) -> Result<(), NovelflowError> {
        let mut pipelines = self.pipelines.write();
        let pipeline_type = pipeline.pipeline_type().to_string();
        if pipelines.contains_key(&pipeline_type) {
            return Err(NovelflowError::DuplicatePipeline(pipeline_type));
        }
        info!(pipeline_type = %pipeline_type, stages = pipeline.len(), "Registered pipeline");
        pipelines.insert(pipeline_type, Arc::new(pipeline));
        Ok(())
    }

    /// Registers a pipeline, builder style.
    pub fn with_pipeline(self, pipeline: Pipeline) -> Result<Self, NovelflowError> {
        self.register(pipeline)?;
        Ok(self)
    }

    /// Looks up a pipeline.
    pub fn get(&self, pipeline_type: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.read().get(pipeline_type).cloned()
    }

    /// Looks up a pipeline, failing if unknown.
    pub fn resolve(&self, pipeline_type: &str) -> Result<Arc<Pipeline>, NovelflowError> {
        self.get(pipeline_type)
            .ok_or_else(|| NovelflowError::UnknownPipeline(pipeline_type.to_string()))
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.pipelines.read().keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SuccessStage;

    #[test]
    fn test_register_once() {
        let registry = PipelineRegistry::new();
        registry
            .register(Pipeline::new("chapter", "Chapter").stage(SuccessStage::new("draft")))
            .unwrap();

        let err = registry.register(Pipeline::new("chapter", "Again")).unwrap_err();
        assert!(matches!(err, NovelflowError::DuplicatePipeline(t) if t == "chapter"));
        assert_eq!(registry.get("chapter").map(|p| p.name().to_string()), Some("Chapter".into()));
    }

    #[test]
    fn test_resolve_unknown() {
        let registry = PipelineRegistry::new()
            .with_pipeline(Pipeline::new("novel", "Novel"))
            .unwrap();

        assert!(registry.resolve("novel").is_ok());
        assert!(matches!(
            registry.resolve("poem"),
            Err(NovelflowError::UnknownPipeline(_))
        ));
        assert_eq!(registry.types(), vec!["novel".to_string()]);
    }
}
