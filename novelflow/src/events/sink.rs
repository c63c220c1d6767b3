//! Event sink trait and implementations.

use crate::core::PipelineEvent;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, Level};

/// Trait for event sinks that receive pipeline events.
pub trait EventSink: Send + Sync {
    /// Handles one event. Must not block and must not panic.
    fn on_event(&self, event: &PipelineEvent);
}

/// A no-op event sink that discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

impl EventSink for NoOpEventSink {
    fn on_event(&self, _event: &PipelineEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl EventSink for LoggingEventSink {
    fn on_event(&self, event: &PipelineEvent) {
        if self.level == Level::DEBUG {
            debug!(
                event_type = event.name(),
                execution_id = %event.execution_id,
                pipeline_type = %event.pipeline_type,
                payload = ?event.kind,
                "Event: {}", event.name()
            );
        } else {
            info!(
                event_type = event.name(),
                execution_id = %event.execution_id,
                pipeline_type = %event.pipeline_type,
                payload = ?event.kind,
                "Event: {}", event.name()
            );
        }
    }
}

/// A collecting event sink for testing and inspection.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events with the given wire name (e.g. `"stage:retry"`).
    #[must_use]
    pub fn events_named(&self, name: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.name() == name)
            .cloned()
            .collect()
    }

    /// Returns the wire names of all events in order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.events.read().iter().map(PipelineEvent::name).collect()
    }
}

impl EventSink for CollectingEventSink {
    fn on_event(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

/// Dispatches each event to several sinks, isolating failures between them.
#[derive(Default, Clone)]
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    /// Creates an empty fan-out sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a downstream sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Returns the number of downstream sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns true if there are no downstream sinks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutEventSink {
    fn on_event(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            super::emit_safely(sink.as_ref(), event);
        }
    }
}

impl std::fmt::Debug for FanoutEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Forwards events into an unbounded tokio channel.
///
/// Events are buffered in the channel until the receiver polls them, which is
/// how the streaming execution API hands events to a late consumer.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<PipelineEvent>,
}

impl ChannelEventSink {
    /// Creates a sink and the receiving half of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn on_event(&self, event: &PipelineEvent) {
        // A dropped receiver only means nobody is listening anymore.
        let _ = self.tx.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PipelineEventKind;

    fn event(kind: PipelineEventKind) -> PipelineEvent {
        PipelineEvent::new("exec-1", "chapter", kind)
    }

    #[test]
    fn test_noop_and_logging_sinks() {
        let e = event(PipelineEventKind::PipelinePaused);
        NoOpEventSink.on_event(&e);
        LoggingEventSink::default().on_event(&e);
        LoggingEventSink::debug().on_event(&e);
    }

    #[test]
    fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.on_event(&event(PipelineEventKind::PipelinePaused));
        sink.on_event(&event(PipelineEventKind::PipelineCompleted { duration_ms: 1 }));
        sink.on_event(&event(PipelineEventKind::PipelinePaused));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_named("pipeline:paused").len(), 2);
        assert_eq!(
            sink.names(),
            vec!["pipeline:paused", "pipeline:completed", "pipeline:paused"]
        );

        sink.clear();
        assert!(sink.is_empty());
    }

    #[derive(Debug)]
    struct PanickingSink;

    impl EventSink for PanickingSink {
        fn on_event(&self, _event: &PipelineEvent) {
            panic!("subscriber bug");
        }
    }

    #[test]
    fn test_fanout_isolates_failing_sink() {
        let collecting = Arc::new(CollectingEventSink::new());
        let fanout = FanoutEventSink::new()
            .with_sink(Arc::new(PanickingSink))
            .with_sink(collecting.clone());

        assert_eq!(fanout.len(), 2);
        fanout.on_event(&event(PipelineEventKind::PipelinePaused));
        assert_eq!(collecting.len(), 1);
    }

    #[tokio::test]
    async fn test_channel_sink_buffers_until_polled() {
        let (sink, mut rx) = ChannelEventSink::new();
        sink.on_event(&event(PipelineEventKind::PipelinePaused));
        sink.on_event(&event(PipelineEventKind::PipelineCompleted { duration_ms: 3 }));

        assert_eq!(rx.recv().await.unwrap().name(), "pipeline:paused");
        assert_eq!(rx.recv().await.unwrap().name(), "pipeline:completed");
    }
}
