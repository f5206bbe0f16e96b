//! ---
//! wm_section: "03-observability"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Publisher metrics and the /metrics scrape endpoint."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Time allowed for in-flight scrapes to finish once shutdown is signalled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Prometheus scrape endpoint serving one registry at `/metrics`.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Bind `addr` and start serving. Port `0` picks a free port; [`addr`]
    /// reports the one actually bound.
    ///
    /// [`addr`]: MetricsServer::addr
    pub async fn bind(addr: SocketAddr, registry: SharedRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind metrics listener {addr}"))?;
        let bound = listener
            .local_addr()
            .context("failed to read metrics listener address")?;
        let app = Router::new()
            .route("/metrics", get(scrape))
            .with_state(registry);

        let (shutdown, stop) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.await;
                })
                .await
                .context("metrics server encountered an error")
        });
        info!(address = %bound, "metrics endpoint listening");
        Ok(Self {
            addr: bound,
            shutdown,
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting scrapes. A scrape still running after one second is
    /// cut off.
    pub async fn shutdown(self) -> Result<()> {
        let MetricsServer {
            addr,
            shutdown,
            mut task,
        } = self;
        let _ = shutdown.send(());
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(joined) => {
                debug!(address = %addr, "metrics endpoint stopped");
                joined.context("metrics server task panicked")?
            }
            Err(_) => {
                warn!(address = %addr, "metrics endpoint did not drain; aborting");
                task.abort();
                Ok(())
            }
        }
    }
}

async fn scrape(State(registry): State<SharedRegistry>) -> Response {
    match TextEncoder::new().encode_to_string(&registry.gather()) {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error").into_response()
        }
    }
}

/// Outcome label for `wattmeter_publishes_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Connection was not ready; nothing was sent.
    Skipped,
    Failed,
}

impl PublishOutcome {
    pub fn as_label(self) -> &'static str {
        match self {
            PublishOutcome::Published => "published",
            PublishOutcome::Skipped => "skipped",
            PublishOutcome::Failed => "failed",
        }
    }
}

/// Counters and gauges recorded by the publisher.
#[derive(Clone, Debug)]
pub struct PublisherMetrics {
    registry: SharedRegistry,
    ticks_total: IntCounter,
    ticks_coalesced_total: IntCounter,
    publishes_total: IntCounterVec,
    tick_lateness_seconds: Histogram,
    connection_state: IntGauge,
    build_info: IntGaugeVec,
}

impl PublisherMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let ticks_total = IntCounter::with_opts(Opts::new(
            "wattmeter_ticks_total",
            "Ticks delivered to the publish pipeline",
        ))?;
        registry.register(Box::new(ticks_total.clone()))?;

        let ticks_coalesced_total = IntCounter::with_opts(Opts::new(
            "wattmeter_ticks_coalesced_total",
            "Deadlines dropped because the previous publish was still running",
        ))?;
        registry.register(Box::new(ticks_coalesced_total.clone()))?;

        let publishes_total = IntCounterVec::new(
            Opts::new(
                "wattmeter_publishes_total",
                "Publish attempts by outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(publishes_total.clone()))?;

        let buckets = prometheus::exponential_buckets(0.0001, 2.0, 16)
            .context("failed to construct lateness buckets")?;
        let tick_lateness_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "wattmeter_tick_lateness_seconds",
                "Delay between a tick's scheduled deadline and its delivery",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(tick_lateness_seconds.clone()))?;

        let connection_state = IntGauge::with_opts(Opts::new(
            "wattmeter_connection_state",
            "Broker connection state (0 uninitialized .. 4 closed)",
        ))?;
        registry.register(Box::new(connection_state.clone()))?;

        let build_info = IntGaugeVec::new(
            Opts::new("wattmeter_build_info", "Build metadata for the publisher"),
            &["version"],
        )?;
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            registry,
            ticks_total,
            ticks_coalesced_total,
            publishes_total,
            tick_lateness_seconds,
            connection_state,
            build_info,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_tick(&self, lateness: Duration) {
        self.ticks_total.inc();
        self.tick_lateness_seconds.observe(lateness.as_secs_f64());
    }

    pub fn record_coalesced(&self, count: u64) {
        self.ticks_coalesced_total.inc_by(count);
    }

    pub fn record_publish(&self, outcome: PublishOutcome) {
        self.publishes_total
            .with_label_values(&[outcome.as_label()])
            .inc();
    }

    pub fn set_connection_state(&self, ordinal: i64) {
        self.connection_state.set(ordinal);
    }

    pub fn set_build_info(&self, version: &str) {
        self.build_info.with_label_values(&[version]).set(1);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks_total.get()
    }

    pub fn coalesced(&self) -> u64 {
        self.ticks_coalesced_total.get()
    }

    pub fn publishes(&self, outcome: PublishOutcome) -> u64 {
        self.publishes_total
            .with_label_values(&[outcome.as_label()])
            .get()
    }

    pub fn connection_state(&self) -> i64 {
        self.connection_state.get()
    }
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;

    #[test]
    fn publisher_metrics_record_outcomes() {
        let metrics = PublisherMetrics::new(new_registry()).expect("metrics");
        metrics.record_tick(Duration::from_millis(3));
        metrics.record_coalesced(2);
        metrics.record_publish(PublishOutcome::Published);
        metrics.record_publish(PublishOutcome::Skipped);
        metrics.record_publish(PublishOutcome::Published);
        metrics.set_connection_state(2);

        assert_eq!(metrics.ticks(), 1);
        assert_eq!(metrics.coalesced(), 2);
        assert_eq!(metrics.publishes(PublishOutcome::Published), 2);
        assert_eq!(metrics.publishes(PublishOutcome::Failed), 0);
        assert_eq!(metrics.connection_state(), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = new_registry();
        PublisherMetrics::new(registry.clone()).expect("first");
        assert!(PublisherMetrics::new(registry).is_err());
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    #[tokio::test]
    async fn scrape_endpoint_serves_text_format() {
        let metrics = PublisherMetrics::new(new_registry()).expect("metrics");
        metrics.record_tick(Duration::from_millis(1));
        metrics.record_publish(PublishOutcome::Failed);
        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), metrics.registry())
            .await
            .expect("server");
        assert_ne!(server.addr().port(), 0);

        let response = http_get(server.addr(), "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response
            .to_ascii_lowercase()
            .contains("content-type: text/plain; version=0.0.4"));
        assert!(response.contains("wattmeter_ticks_total 1"));
        assert!(response.contains("wattmeter_publishes_total{outcome=\"failed\"} 1"));

        assert!(http_get(server.addr(), "/").await.starts_with("HTTP/1.1 404"));
        server.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn shutdown_releases_the_port() {
        let server = MetricsServer::bind("127.0.0.1:0".parse().unwrap(), new_registry())
            .await
            .expect("server");
        let addr = server.addr();
        server.shutdown().await.expect("shutdown");
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
