//! Tracing setup and span helpers.

use tracing::Span;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber.
///
/// `RUST_LOG` wins when set; otherwise `level` is used as the filter.
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

/// Span covering one execution.
pub fn execution_span(execution_id: &str, pipeline_type: &str) -> Span {
    tracing::info_span!(
        "pipeline",
        execution_id = %execution_id,
        pipeline_type = %pipeline_type,
    )
}

/// Span covering one stage invocation.
pub fn stage_span(execution_id: &str, stage_id: &str, stage_index: usize) -> Span {
    tracing::info_span!(
        "stage",
        execution_id = %execution_id,
        stage_id = %stage_id,
        stage_index = stage_index,
    )
}
