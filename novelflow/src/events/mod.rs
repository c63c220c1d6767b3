//! Event sink system for observability.
//!
//! The engine invokes [`EventSink::on_event`] synchronously for every
//! lifecycle event. Sinks must not panic; [`emit_safely`] isolates the
//! engine from those that do.

mod sink;

pub use sink::{
    ChannelEventSink, CollectingEventSink, EventSink, FanoutEventSink, LoggingEventSink,
    NoOpEventSink,
};

use crate::core::PipelineEvent;
use tracing::warn;

/// Delivers an event to a sink, swallowing any panic raised by the handler.
pub fn emit_safely(sink: &dyn EventSink, event: &PipelineEvent) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        sink.on_event(event);
    })) {
        warn!(
            event_type = event.name(),
            execution_id = %event.execution_id,
            "Event handler panicked: {:?}", e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineEventKind;

    #[derive(Debug)]
    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn on_event(&self, _event: &PipelineEvent) {
            panic!("broken subscriber");
        }
    }

    #[test]
    fn test_emit_safely_swallows_panics() {
        let event = PipelineEvent::new("e", "p", PipelineEventKind::PipelinePaused);
        emit_safely(&PanickingSink, &event);
    }
}
