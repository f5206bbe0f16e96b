//! ---
//! wm_section: "02-messaging"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "MQTT broker link backed by rumqttc."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use wattmeter_common::config::MIN_KEEP_ALIVE;
use wattmeter_common::{BrokerConfig, ReconnectConfig};

use crate::{AckTracker, BrokerLink, DeliveryGuarantee, LinkError};

/// Upper bound on flushing DISCONNECT during close.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Connection parameters for [`MqttLink`].
#[derive(Debug, Clone)]
pub struct MqttSettings {
    /// Broker hostname or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Optional username.
    pub username: Option<String>,
    /// Optional password; requires a username.
    pub password: Option<String>,
    /// Keep-alive interval negotiated with the broker.
    pub keep_alive: Duration,
    /// Time allowed for the broker to acknowledge the session.
    pub connect_timeout: Duration,
    /// Capacity of the client request queue.
    pub request_capacity: usize,
    /// Reconnect policy after an unsolicited connection loss.
    pub reconnect: ReconnectConfig,
    /// Time allowed to flush DISCONNECT on close.
    pub drain_timeout: Duration,
}

impl MqttSettings {
    /// Derive settings from the broker section of the configuration.
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: config.keep_alive_secs,
            connect_timeout: config.connect_timeout_secs,
            request_capacity: config.request_capacity,
            reconnect: config.reconnect.clone(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        // Config validation rejects shorter values; hand-built settings are
        // held to the same floor.
        options.set_keep_alive(self.keep_alive.max(MIN_KEEP_ALIVE));
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(
                username.clone(),
                self.password.clone().unwrap_or_default(),
            );
        }
        options
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at the configured maximum.
pub fn reconnect_delay(policy: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    policy
        .base_delay_ms
        .checked_mul(1u32 << exponent)
        .unwrap_or(policy.max_delay_ms)
        .min(policy.max_delay_ms)
}

struct Session {
    client: AsyncClient,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Broker link speaking MQTT 3.1.1 over TCP.
///
/// `open` drives the event loop until CONNACK, then hands it to a
/// background network task that keeps polling (keep-alives, PUBACKs,
/// reconnects) until `close`.
pub struct MqttLink {
    settings: MqttSettings,
    session: Mutex<Option<Session>>,
    up: Arc<AtomicBool>,
    acks: Arc<AckTracker>,
}

impl MqttLink {
    /// Create an unopened link.
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
            up: Arc::new(AtomicBool::new(false)),
            acks: Arc::new(AckTracker::new()),
        }
    }

    /// Settings this link was built with.
    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    /// Acknowledgment bookkeeping for at-least-once publishes.
    pub fn acks(&self) -> &AckTracker {
        &self.acks
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), LinkError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(LinkError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(LinkError::Refused(format!("{code:?}")));
            }
            Err(err) => return Err(LinkError::Unreachable(err.to_string())),
        }
    }
}

struct NetworkTask {
    eventloop: EventLoop,
    stop_rx: oneshot::Receiver<()>,
    up: Arc<AtomicBool>,
    acks: Arc<AckTracker>,
    reconnect: ReconnectConfig,
    drain_timeout: Duration,
}

impl NetworkTask {
    async fn run(mut self) {
        let mut stopping = false;
        let mut drain_deadline = Instant::now();
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut self.stop_rx, if !stopping => {
                    if !self.up.load(Ordering::Acquire) {
                        break;
                    }
                    stopping = true;
                    drain_deadline = Instant::now() + self.drain_timeout;
                }
                _ = tokio::time::sleep_until(drain_deadline), if stopping => {
                    warn!(timeout_ms = self.drain_timeout.as_millis() as u64, "DISCONNECT not flushed before drain timeout");
                    break;
                }
                event = self.eventloop.poll() => match event {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("DISCONNECT flushed");
                        break;
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => self.acks.record_sent(pkid),
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        if let Some(round_trip) = self.acks.acknowledge(ack.pkid) {
                            debug!(pkid = ack.pkid, round_trip_ms = round_trip.as_millis() as u64, "publish acknowledged");
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            failures = 0;
                            if !self.up.swap(true, Ordering::AcqRel) {
                                info!("broker link restored");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if stopping {
                            debug!(error = %err, "connection closed while draining");
                            break;
                        }
                        if self.up.swap(false, Ordering::AcqRel) {
                            warn!(error = %err, "broker link lost");
                        }
                        if !self.reconnect.enabled {
                            // Parked: publishes keep failing with LinkDown.
                            let _ = (&mut self.stop_rx).await;
                            break;
                        }
                        failures = failures.saturating_add(1);
                        let delay = reconnect_delay(&self.reconnect, failures);
                        warn!(attempt = failures, delay_ms = delay.as_millis() as u64, error = %err, "reconnecting to broker");
                        tokio::select! {
                            _ = &mut self.stop_rx => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
        self.up.store(false, Ordering::Release);
        let pending = self.acks.pending();
        if pending > 0 {
            warn!(pending, "publishes left unacknowledged at close");
        }
        debug!("mqtt network task exited");
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn open(&self) -> Result<(), LinkError> {
        if self.session.lock().is_some() {
            return Err(LinkError::AlreadyOpen);
        }
        let settings = &self.settings;
        let (client, mut eventloop) =
            AsyncClient::new(settings.options(), settings.request_capacity);
        debug!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "awaiting CONNACK");
        tokio::time::timeout(settings.connect_timeout, await_connack(&mut eventloop))
            .await
            .map_err(|_| LinkError::Timeout(settings.connect_timeout))??;

        self.up.store(true, Ordering::Release);
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(
            NetworkTask {
                eventloop,
                stop_rx,
                up: self.up.clone(),
                acks: self.acks.clone(),
                reconnect: settings.reconnect.clone(),
                drain_timeout: settings.drain_timeout,
            }
            .run(),
        );
        *self.session.lock() = Some(Session {
            client,
            stop_tx,
            task,
        });
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        guarantee: DeliveryGuarantee,
        payload: Bytes,
    ) -> Result<(), LinkError> {
        let client = self
            .session
            .lock()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(LinkError::NotOpen)?;
        if !self.is_up() {
            return Err(LinkError::Down);
        }
        client
            .try_publish(topic, guarantee.to_mqtt(), false, payload.to_vec())
            .map_err(|err| LinkError::Rejected(err.to_string()))
    }

    async fn close(&self) -> Result<(), LinkError> {
        let session = self.session.lock().take();
        let Some(session) = session else {
            return Err(LinkError::NotOpen);
        };
        let Session {
            client,
            stop_tx,
            mut task,
        } = session;
        if let Err(err) = client.try_disconnect() {
            debug!(error = %err, "DISCONNECT could not be queued");
        }
        let _ = stop_tx.send(());
        let budget = self.settings.drain_timeout + Duration::from_millis(500);
        match tokio::time::timeout(budget, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "mqtt network task join failure"),
            Err(_) => {
                warn!("mqtt network task overstayed its drain timeout; aborting");
                task.abort();
            }
        }
        self.up.store(false, Ordering::Release);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}
