//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Publisher startup, steady state, and bounded teardown."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{error, info, warn};
use wattmeter_common::{AppConfig, BrokerConfig, TransportKind};
use wattmeter_metrics::{new_registry, MetricsServer, PublisherMetrics};
use wattmeter_msg::lifecycle::ConnectionState;
use wattmeter_msg::{
    BrokerLink, ConnectionManager, InMemoryLink, LifecycleError, MqttLink, MqttSettings,
    PayloadEncoder, TeardownOutcome,
};
use wattmeter_rt::{
    JitterSummary, LoopTimingReporter, ShutdownCoordinator, TickError, TickSchedule, TickSource,
    TickStatsSnapshot,
};
use wattmeter_sim::SimulationEngine;

use crate::pipeline::{PipelineStats, PipelineStatsHandle, PublishPipeline};

/// Startup phase that failed. Every variant is fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid configuration: {0:#}")]
    Config(anyhow::Error),
    #[error("metrics endpoint failed to start: {0:#}")]
    Metrics(anyhow::Error),
    #[error("broker connection failed: {0}")]
    Connect(#[source] LifecycleError),
    #[error("tick source could not be armed: {0}")]
    Timer(#[source] TickError),
    #[error("signal handlers could not be registered: {0}")]
    Signals(#[source] std::io::Error),
}

/// Pick the broker link for the configured transport.
pub fn link_for(config: &BrokerConfig) -> Arc<dyn BrokerLink> {
    match config.transport {
        TransportKind::Mqtt => Arc::new(MqttLink::new(MqttSettings::from_config(config))),
        TransportKind::InMemory => Arc::new(InMemoryLink::dry_run()),
    }
}

pub struct PublisherRuntime {
    config: AppConfig,
    link: Arc<dyn BrokerLink>,
}

impl PublisherRuntime {
    pub fn new(config: AppConfig, link: Arc<dyn BrokerLink>) -> Self {
        Self { config, link }
    }

    /// Connect, then arm the tick source. Nothing is armed unless the broker
    /// acknowledged the session.
    pub async fn start(self) -> Result<RuntimeHandle, StartupError> {
        let config = self.config;
        config.validate().map_err(StartupError::Config)?;
        let encoder = PayloadEncoder::new(config.publish.precision)
            .map_err(|err| StartupError::Config(err.into()))?;

        let (metrics, metrics_server) = if config.metrics.enabled {
            let registry = new_registry();
            let metrics = PublisherMetrics::new(registry.clone()).map_err(StartupError::Metrics)?;
            metrics.set_build_info(env!("CARGO_PKG_VERSION"));
            let server = MetricsServer::bind(config.metrics.listen, registry)
                .await
                .map_err(StartupError::Metrics)?;
            (Some(metrics), Some(server))
        } else {
            (None, None)
        };

        let connection = Arc::new(ConnectionManager::new(
            self.link,
            config.topic(),
            config.broker.qos.into(),
        ));
        let connected = connection.connect().await;
        publish_state(&metrics, connection.state());
        if let Err(err) = connected {
            stop_metrics(metrics_server).await;
            return Err(StartupError::Connect(err));
        }

        let schedule = TickSchedule::from_config(&config.schedule);
        let timing = Arc::new(LoopTimingReporter::new(schedule.period));
        let pipeline = PublishPipeline::new(
            SimulationEngine::from_config(&config.simulation),
            encoder,
            connection.clone(),
            timing.clone(),
        )
        .with_metrics(metrics.clone())
        .with_echo(config.publish.echo);
        let stats = pipeline.stats_handle();

        let ticks = match TickSource::start(schedule, pipeline) {
            Ok(ticks) => ticks,
            Err(err) => {
                if let Err(teardown_err) = connection.teardown().await {
                    warn!(error = %teardown_err, "teardown after timer failure reported an error");
                }
                publish_state(&metrics, connection.state());
                stop_metrics(metrics_server).await;
                return Err(StartupError::Timer(err));
            }
        };

        info!(
            topic = %connection.topic(),
            link = connection.link_name(),
            profile = ?config.simulation.profile,
            period_ms = schedule.period.as_millis() as u64,
            "publisher running"
        );

        Ok(RuntimeHandle {
            ticks,
            connection,
            timing,
            stats,
            metrics,
            metrics_server,
            grace_period: config.shutdown.grace_period_ms,
        })
    }

    /// Start, wait for a shutdown request, then tear down.
    pub async fn run(self, shutdown: ShutdownCoordinator) -> Result<ShutdownReport, StartupError> {
        let handle = self.start().await?;
        shutdown.wait().await;
        info!(reason = ?shutdown.reason(), "shutdown requested");
        Ok(handle.shutdown().await)
    }
}

fn publish_state(metrics: &Option<PublisherMetrics>, state: ConnectionState) {
    if let Some(metrics) = metrics {
        metrics.set_connection_state(state.ordinal());
    }
}

async fn stop_metrics(server: Option<MetricsServer>) {
    if let Some(server) = server {
        if let Err(err) = server.shutdown().await {
            warn!(error = %err, "metrics endpoint did not stop cleanly");
        }
    }
}

/// What happened during teardown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub ticks: TickStatsSnapshot,
    /// An in-flight publish overran its share of the grace period and was
    /// cancelled before completing.
    pub ticks_cancelled: bool,
    pub pipeline: PipelineStats,
    /// `None` if teardown failed or timed out.
    pub teardown: Option<TeardownOutcome>,
    pub lateness: Option<JitterSummary>,
    /// Some step had to be cut short to stay within the grace period.
    pub timed_out: bool,
    pub elapsed: Duration,
}

/// Running publisher.
#[derive(Debug)]
pub struct RuntimeHandle {
    ticks: TickSource,
    connection: Arc<ConnectionManager>,
    timing: Arc<LoopTimingReporter>,
    stats: PipelineStatsHandle,
    metrics: Option<PublisherMetrics>,
    metrics_server: Option<MetricsServer>,
    grace_period: Duration,
}

impl RuntimeHandle {
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats.snapshot()
    }

    pub fn tick_stats(&self) -> TickStatsSnapshot {
        self.ticks.stats()
    }

    pub fn metrics(&self) -> Option<&PublisherMetrics> {
        self.metrics.as_ref()
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_server.as_ref().map(MetricsServer::addr)
    }

    /// Stop ticks, then disconnect, all within the grace period. The tick
    /// source gets at most half of it, so the broker teardown is always
    /// attempted even when a publish hangs. Running out of time is logged;
    /// the report says what completed.
    pub async fn shutdown(self) -> ShutdownReport {
        let started = Instant::now();
        let RuntimeHandle {
            ticks,
            connection,
            timing,
            stats,
            metrics,
            metrics_server,
            grace_period,
        } = self;

        let stopped = ticks.stop_within(grace_period / 2).await;
        let remaining = grace_period.saturating_sub(started.elapsed());
        let (teardown, teardown_timed_out) =
            match tokio::time::timeout(remaining, connection.teardown()).await {
                Ok(Ok(outcome)) => (Some(outcome), false),
                Ok(Err(err)) => {
                    error!(error = %err, "broker teardown failed");
                    (None, false)
                }
                Err(_) => (None, true),
            };
        let timed_out = stopped.cancelled || teardown_timed_out;
        if timed_out {
            warn!(
                grace_ms = grace_period.as_millis() as u64,
                ticks_cancelled = stopped.cancelled,
                teardown_timed_out,
                "teardown exceeded the grace period; exiting anyway"
            );
        }
        publish_state(&metrics, connection.state());
        stop_metrics(metrics_server).await;

        let report = ShutdownReport {
            ticks: stopped.stats,
            ticks_cancelled: stopped.cancelled,
            pipeline: stats.snapshot(),
            teardown,
            lateness: timing.lateness().summary(),
            timed_out,
            elapsed: started.elapsed(),
        };
        info!(
            published = report.pipeline.published,
            skipped = report.pipeline.skipped,
            failed = report.pipeline.failed,
            coalesced = report.ticks.coalesced,
            max_lateness_us = report.lateness.map(|l| l.max().as_micros() as u64),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "publisher stopped"
        );
        report
    }
}
