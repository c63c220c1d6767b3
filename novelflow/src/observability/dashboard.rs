//! Event-driven metrics dashboard with a buffered background writer.

use super::{aggregate, run_health_check, AggregateMetrics, CostTable, ExecutionMetrics, HealthReport};
use crate::config::{DashboardConfig, HealthThresholds};
use crate::core::PipelineEvent;
use crate::errors::NovelflowError;
use crate::events::EventSink;
use crate::persistence::MetricsStore;
use crate::utils::{now_utc, Timestamp};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

enum WriterJob {
    Event(PipelineEvent),
    Metrics(ExecutionMetrics),
    Flush(oneshot::Sender<()>),
    Drain(oneshot::Sender<()>),
}

struct Inner {
    config: DashboardConfig,
    store: Arc<dyn MetricsStore>,
    costs: CostTable,
    active: DashMap<String, ExecutionMetrics>,
    recent: Mutex<VecDeque<PipelineEvent>>,
    tx: mpsc::Sender<WriterJob>,
}

/// Folds engine events into per-execution metrics and persists them.
///
/// Register it as an [`EventSink`]. `on_event` never blocks: durable writes
/// go through a bounded queue served by a background task, and a full queue
/// drops the write with a warning rather than stalling the pipeline.
#[derive(Clone)]
pub struct ObservabilityDashboard {
    inner: Arc<Inner>,
}

impl ObservabilityDashboard {
    /// Creates a dashboard with the default cost table.
    ///
    /// Spawns the writer task, so it must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn MetricsStore>, config: DashboardConfig) -> Self {
        Self::with_costs(store, config, CostTable::new())
    }

    /// Creates a dashboard with a custom cost table.
    pub fn with_costs(store: Arc<dyn MetricsStore>, config: DashboardConfig, costs: CostTable) -> Self {
        let (tx, rx) = mpsc::channel(config.writer_buffer.max(1));
        let inner = Arc::new(Inner {
            config,
            store,
            costs,
            active: DashMap::new(),
            recent: Mutex::new(VecDeque::new()),
            tx,
        });

        tokio::spawn(run_writer(rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    /// Metrics of an execution still in flight.
    pub fn execution_metrics(&self, execution_id: &str) -> Option<ExecutionMetrics> {
        self.inner.active.get(execution_id).map(|m| m.clone())
    }

    /// Number of in-flight accumulators.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// The last `n` events, oldest first.
    pub fn recent_events(&self, n: usize) -> Vec<PipelineEvent> {
        let recent = self.inner.recent.lock();
        recent.iter().skip(recent.len().saturating_sub(n)).cloned().collect()
    }

    /// Waits until every write queued so far has been handled.
    pub async fn drain(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.tx.send(WriterJob::Drain(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Persists every in-flight accumulator and evicts stale ones.
    ///
    /// Runs on the writer task after every write queued so far, so a
    /// terminal snapshot is never overwritten by an older in-flight one.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.inner.tx.send(WriterJob::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Aggregates stored metrics of executions started within `window`.
    pub async fn aggregate(
        &self,
        pipeline_type: Option<&str>,
        window: Duration,
    ) -> Result<AggregateMetrics, NovelflowError> {
        let metrics = self.load_window(pipeline_type, window).await?;
        Ok(aggregate(&metrics))
    }

    /// Runs the composite health check over stored metrics within `window`.
    pub async fn health_check(
        &self,
        pipeline_type: Option<&str>,
        window: Duration,
        thresholds: &HealthThresholds,
    ) -> Result<HealthReport, NovelflowError> {
        let metrics = self.load_window(pipeline_type, window).await?;
        Ok(run_health_check(&metrics, thresholds))
    }

    async fn load_window(
        &self,
        pipeline_type: Option<&str>,
        window: Duration,
    ) -> Result<Vec<ExecutionMetrics>, NovelflowError> {
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now_utc().checked_sub_signed(w))
            .unwrap_or(Timestamp::MIN_UTC);
        Ok(self.inner.store.list_metrics_since(since, pipeline_type).await?)
    }

    fn enqueue(&self, job: WriterJob) {
        if let Err(err) = self.inner.tx.try_send(job) {
            let what = match err.into_inner() {
                WriterJob::Event(e) => e.name(),
                WriterJob::Metrics(_) => "metrics",
                WriterJob::Flush(_) => "flush",
                WriterJob::Drain(_) => "drain",
            };
            warn!(job = what, "Dashboard writer queue unavailable, dropping write");
        }
    }
}

impl Inner {
    async fn flush_pending(&self) {
        let snapshot: Vec<ExecutionMetrics> = self.active.iter().map(|m| m.clone()).collect();
        if snapshot.is_empty() {
            return;
        }

        let stale_after = chrono::Duration::milliseconds(
            i64::try_from(self.config.stale_after_ms).unwrap_or(i64::MAX),
        );
        let now = now_utc();

        for mut metrics in snapshot {
            metrics.finalize_cost(&self.costs);
            if let Err(err) = self.store.save_metrics(&metrics).await {
                warn!(execution_id = %metrics.execution_id, error = %err, "Failed to flush metrics");
                continue;
            }
            if now - metrics.last_event_at > stale_after {
                debug!(execution_id = %metrics.execution_id, "Evicting stale metrics");
                self.active.remove(&metrics.execution_id);
            }
        }
    }
}

async fn run_writer(mut rx: mpsc::Receiver<WriterJob>, inner: Weak<Inner>) {
    let (interval_ms, store) = match inner.upgrade() {
        Some(i) => (i.config.flush_interval_ms.max(1), Arc::clone(&i.store)),
        None => return,
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(WriterJob::Event(event)) => {
                    if let Err(err) = store.append_event(&event).await {
                        warn!(event_type = event.name(), error = %err, "Failed to log event");
                    }
                }
                Some(WriterJob::Metrics(metrics)) => {
                    if let Err(err) = store.save_metrics(&metrics).await {
                        warn!(execution_id = %metrics.execution_id, error = %err, "Failed to save metrics");
                    }
                }
                Some(WriterJob::Flush(done)) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.flush_pending().await;
                    }
                    let _ = done.send(());
                }
                Some(WriterJob::Drain(done)) => {
                    let _ = done.send(());
                }
                None => break,
            },
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.flush_pending().await;
            }
        }
    }
    debug!("Dashboard writer stopped");
}

impl EventSink for ObservabilityDashboard {
    fn on_event(&self, event: &PipelineEvent) {
        {
            let mut recent = self.inner.recent.lock();
            recent.push_back(event.clone());
            while recent.len() > self.inner.config.recent_events {
                recent.pop_front();
            }
        }

        self.enqueue(WriterJob::Event(event.clone()));

        self.inner
            .active
            .entry(event.execution_id.clone())
            .or_insert_with(|| ExecutionMetrics::from_event(event))
            .apply(event);

        if event.is_terminal() {
            if let Some((_, mut metrics)) = self.inner.active.remove(&event.execution_id) {
                metrics.finalize_cost(&self.inner.costs);
                self.enqueue(WriterJob::Metrics(metrics));
            }
        }
    }
}

impl std::fmt::Debug for ObservabilityDashboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityDashboard")
            .field("active", &self.inner.active.len())
            .field("config", &self.inner.config)
            .finish()
    }
}
