//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Per-tick generate, encode, and publish step."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};
use wattmeter_metrics::{PublishOutcome, PublisherMetrics};
use wattmeter_msg::{ConnectionManager, LifecycleError, PayloadEncoder};
use wattmeter_rt::{LoopTimingReporter, Tick, TickHandler};
use wattmeter_sim::SimulationEngine;

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Publish outcomes since startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub published: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct PipelineStatsHandle(Arc<Counters>);

impl PipelineStatsHandle {
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            published: self.0.published.load(Ordering::Relaxed),
            skipped: self.0.skipped.load(Ordering::Relaxed),
            failed: self.0.failed.load(Ordering::Relaxed),
        }
    }
}

/// Tick handler that turns every tick into one reading on the broker.
///
/// Failures never leave this type: each is logged, counted, and the next
/// tick starts fresh.
pub struct PublishPipeline {
    engine: SimulationEngine,
    encoder: PayloadEncoder,
    connection: Arc<ConnectionManager>,
    timing: Arc<LoopTimingReporter>,
    metrics: Option<PublisherMetrics>,
    counters: Arc<Counters>,
    echo: bool,
    last_seq: Option<u64>,
}

impl PublishPipeline {
    pub fn new(
        engine: SimulationEngine,
        encoder: PayloadEncoder,
        connection: Arc<ConnectionManager>,
        timing: Arc<LoopTimingReporter>,
    ) -> Self {
        Self {
            engine,
            encoder,
            connection,
            timing,
            metrics: None,
            counters: Arc::new(Counters::default()),
            echo: false,
            last_seq: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<PublisherMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Log each successful publish at `info` instead of `debug`.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Counter view that stays valid after the pipeline moves into the
    /// tick source.
    pub fn stats_handle(&self) -> PipelineStatsHandle {
        PipelineStatsHandle(self.counters.clone())
    }

    fn observe(&mut self, tick: &Tick) {
        self.timing.record(tick);
        let gap = self
            .last_seq
            .map(|last| tick.seq.saturating_sub(last).saturating_sub(1))
            .unwrap_or(0);
        self.last_seq = Some(tick.seq);
        if let Some(metrics) = &self.metrics {
            metrics.record_tick(tick.lateness());
            if gap > 0 {
                metrics.record_coalesced(gap);
            }
        }
    }

    fn record(&self, outcome: PublishOutcome) {
        let counter = match outcome {
            PublishOutcome::Published => &self.counters.published,
            PublishOutcome::Skipped => &self.counters.skipped,
            PublishOutcome::Failed => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(outcome);
        }
    }
}

#[async_trait]
impl TickHandler for PublishPipeline {
    async fn on_tick(&mut self, tick: Tick) {
        self.observe(&tick);
        let (hour, sample) = self.engine.next_sample();
        let text = match self.encoder.encode(&sample) {
            Ok(text) => text,
            Err(err) => {
                warn!(tick = tick.seq, hour, error = %err, "reading could not be encoded");
                self.record(PublishOutcome::Failed);
                return;
            }
        };

        match self.connection.publish(Bytes::from(text.clone())).await {
            Ok(()) => {
                self.record(PublishOutcome::Published);
                if self.echo {
                    info!(tick = tick.seq, hour, topic = %self.connection.topic(), payload = %text, "published");
                } else {
                    debug!(tick = tick.seq, hour, topic = %self.connection.topic(), payload = %text, "published");
                }
            }
            Err(LifecycleError::NotConnected(state)) => {
                self.record(PublishOutcome::Skipped);
                warn!(tick = tick.seq, state = %state, "publish skipped; connection not ready");
            }
            Err(err) => {
                self.record(PublishOutcome::Failed);
                warn!(tick = tick.seq, topic = %self.connection.topic(), error = %err, "publish failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use wattmeter_common::SimulationConfig;
    use wattmeter_msg::{DeliveryGuarantee, InMemoryLink, LinkFaults};

    use super::*;

    fn pipeline(link: &InMemoryLink) -> (PublishPipeline, Arc<ConnectionManager>) {
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(link.clone()),
            "sensor/test",
            DeliveryGuarantee::AtLeastOnce,
        ));
        let config = SimulationConfig {
            seed: Some(7),
            ..SimulationConfig::default()
        };
        let pipeline = PublishPipeline::new(
            SimulationEngine::from_config(&config),
            PayloadEncoder::default(),
            connection.clone(),
            Arc::new(LoopTimingReporter::new(Duration::from_millis(100))),
        );
        (pipeline, connection)
    }

    fn tick(seq: u64) -> Tick {
        let now = Instant::now();
        Tick {
            seq,
            deadline: now,
            fired: now,
        }
    }

    #[tokio::test]
    async fn skips_until_connected() {
        let link = InMemoryLink::new();
        let (mut pipeline, connection) = pipeline(&link);
        let stats = pipeline.stats_handle();

        pipeline.on_tick(tick(1)).await;
        assert_eq!(stats.snapshot().skipped, 1);

        connection.connect().await.expect("connect");
        pipeline.on_tick(tick(2)).await;
        assert_eq!(stats.snapshot().published, 1);
        assert_eq!(link.published().len(), 1);
    }

    #[tokio::test]
    async fn send_failures_are_counted_not_raised() {
        let link = InMemoryLink::with_faults(LinkFaults {
            fail_sends: true,
            ..LinkFaults::default()
        });
        let (mut pipeline, connection) = pipeline(&link);
        connection.connect().await.expect("connect");
        let stats = pipeline.stats_handle();

        pipeline.on_tick(tick(1)).await;
        pipeline.on_tick(tick(2)).await;
        assert_eq!(
            stats.snapshot(),
            PipelineStats {
                published: 0,
                skipped: 0,
                failed: 2
            }
        );
    }

    #[tokio::test]
    async fn sequence_gaps_feed_coalesced_metric() {
        let link = InMemoryLink::new();
        let (pipeline, connection) = pipeline(&link);
        let metrics =
            PublisherMetrics::new(wattmeter_metrics::new_registry()).expect("metrics");
        let mut pipeline = pipeline.with_metrics(Some(metrics.clone()));
        connection.connect().await.expect("connect");

        pipeline.on_tick(tick(1)).await;
        pipeline.on_tick(tick(4)).await;
        assert_eq!(metrics.ticks(), 2);
        assert_eq!(metrics.coalesced(), 2);
        assert_eq!(metrics.publishes(PublishOutcome::Published), 2);
    }
}
