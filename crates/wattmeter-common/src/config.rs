//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Configuration model, file loading, and command line overrides."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

pub const DEFAULT_WATTAGE_TOPIC: &str = "sensor/wattage_meter_rt_c_component";
pub const DEFAULT_ENVIRONMENT_TOPIC: &str = "sensor/solar_panel_rpi";

fn default_host() -> String {
    "localhost".to_owned()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "wattage_meter_rt_c".to_owned()
}

/// Shortest MQTT keep-alive accepted. Zero (keep-alive disabled) is refused.
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_capacity() -> usize {
    16
}

fn default_reconnect_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_reconnect_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_period() -> Duration {
    Duration::from_millis(1000)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(3)
}

fn default_seconds_per_hour() -> u64 {
    10
}

fn default_daylight_start() -> u8 {
    6
}

fn default_daylight_end() -> u8 {
    22
}

fn default_noise() -> bool {
    true
}

fn default_precision() -> u8 {
    2
}

fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9464))
}

/// Primary configuration object for the publisher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    /// `None` when no file was found and built-in defaults are in effect.
    pub source: Option<PathBuf>,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &'static str = "WATTMETER_CONFIG";

    /// Load configuration, preferring an explicit path, then `WATTMETER_CONFIG`,
    /// then the first existing candidate. Falls back to defaults when nothing
    /// is found. Validation is left to the caller so overrides can be applied
    /// first.
    pub fn load_with_source<P: AsRef<Path>>(
        explicit: Option<&Path>,
        candidates: &[P],
    ) -> Result<LoadedAppConfig> {
        if let Some(path) = explicit {
            return Self::required(path.to_path_buf());
        }

        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                return Self::required(PathBuf::from(env_path));
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        debug!("no configuration file found; using built-in defaults");
        Ok(LoadedAppConfig {
            config: AppConfig::default(),
            source: None,
        })
    }

    fn required(path: PathBuf) -> Result<LoadedAppConfig> {
        if !path.exists() {
            return Err(anyhow!("configuration file {} does not exist", path.display()));
        }
        let config = Self::from_path(&path)?;
        Ok(LoadedAppConfig {
            config,
            source: Some(path),
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Apply command line or environment overrides on top of the loaded file.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(host) = &overrides.host {
            self.broker.host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.broker.port = port;
        }
        if let Some(period_ms) = overrides.period_ms {
            self.schedule.period_ms = Duration::from_millis(period_ms);
        }
        if let Some(topic) = &overrides.topic {
            self.broker.topic = Some(topic.clone());
        }
        if let Some(client_id) = &overrides.client_id {
            self.broker.client_id = client_id.clone();
        }
        if let Some(transport) = overrides.transport {
            self.broker.transport = transport;
        }
        if let Some(strategy) = overrides.strategy {
            self.schedule.strategy = strategy;
        }
        if let Some(profile) = overrides.profile {
            self.simulation.profile = profile;
        }
        if let Some(seconds_per_hour) = overrides.seconds_per_hour {
            self.simulation.seconds_per_hour = seconds_per_hour;
        }
        if let Some(precision) = overrides.precision {
            self.publish.precision = precision;
        }
        if overrides.echo {
            self.publish.echo = true;
        }
        if let Some(priority) = overrides.realtime_priority {
            self.schedule.realtime_priority = Some(priority);
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    /// Topic the publisher emits on, derived from the profile unless set.
    pub fn topic(&self) -> &str {
        match &self.broker.topic {
            Some(topic) => topic,
            None => self.simulation.profile.default_topic(),
        }
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        if let Some(topic) = &self.broker.topic {
            validate_topic(topic)?;
        }
        self.schedule.validate()?;
        self.simulation.validate()?;
        self.publish.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_topic(topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        return Err(anyhow!("broker topic must not be empty"));
    }
    if topic.contains(['#', '+']) {
        return Err(anyhow!(
            "broker topic '{}' must not contain wildcards",
            topic
        ));
    }
    Ok(())
}

/// Transport used to reach the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    #[default]
    Mqtt,
    /// Loopback link that logs payloads instead of sending them.
    InMemory,
}

/// Delivery guarantee requested per publish. Exactly-once is not offered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum QosLevel {
    AtMostOnce,
    #[default]
    AtLeastOnce,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reconnect_base_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay_ms: Duration,
    #[serde(default = "default_reconnect_max_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay_ms: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_delay_ms: default_reconnect_base_delay(),
            max_delay_ms: default_reconnect_max_delay(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub qos: QosLevel,
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_keep_alive")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub keep_alive_secs: Duration,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout_secs: Duration,
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            topic: None,
            qos: QosLevel::default(),
            transport: TransportKind::default(),
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            request_capacity: default_request_capacity(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(anyhow!("broker host must not be empty"));
        }
        if self.port == 0 {
            return Err(anyhow!("broker port must be non-zero"));
        }
        if self.client_id.trim().is_empty() {
            return Err(anyhow!("broker client_id must not be empty"));
        }
        if self.request_capacity == 0 {
            return Err(anyhow!("broker request_capacity must be at least 1"));
        }
        if self.keep_alive_secs < MIN_KEEP_ALIVE {
            return Err(anyhow!(
                "broker keep_alive_secs must be at least {}",
                MIN_KEEP_ALIVE.as_secs()
            ));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(anyhow!("broker password requires a username"));
        }
        if self.reconnect.base_delay_ms.is_zero()
            || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms
        {
            return Err(anyhow!(
                "reconnect delays must satisfy 0 < base_delay_ms <= max_delay_ms"
            ));
        }
        Ok(())
    }
}

/// How ticks are delivered to the publish pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TickStrategy {
    /// Timer task on absolute deadlines handing off to a worker task.
    #[default]
    Deadline,
    /// Single task sleeping to the next deadline and running the tick inline.
    Cooperative,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub period_ms: Duration,
    #[serde(default = "default_initial_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay_ms: Duration,
    #[serde(default)]
    pub strategy: TickStrategy,
    /// Requested SCHED_FIFO priority; `0` selects the policy maximum.
    #[serde(default)]
    pub realtime_priority: Option<i32>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            period_ms: default_period(),
            initial_delay_ms: default_initial_delay(),
            strategy: TickStrategy::default(),
            realtime_priority: None,
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.period_ms.is_zero() {
            return Err(anyhow!("schedule period_ms must be greater than zero"));
        }
        if let Some(priority) = self.realtime_priority {
            if !(0..=99).contains(&priority) {
                return Err(anyhow!(
                    "realtime_priority must be between 0 and 99, got {}",
                    priority
                ));
            }
        }
        Ok(())
    }
}

/// Which synthetic sensor is simulated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SimulationProfile {
    /// Household consumption and solar production in watts.
    #[default]
    Wattage,
    /// Ambient temperature and humidity next to the panel.
    Environment,
}

impl SimulationProfile {
    pub fn default_topic(&self) -> &'static str {
        match self {
            SimulationProfile::Wattage => DEFAULT_WATTAGE_TOPIC,
            SimulationProfile::Environment => DEFAULT_ENVIRONMENT_TOPIC,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub profile: SimulationProfile,
    #[serde(default = "default_seconds_per_hour")]
    pub seconds_per_hour: u64,
    #[serde(default = "default_daylight_start")]
    pub daylight_start: u8,
    #[serde(default = "default_daylight_end")]
    pub daylight_end: u8,
    #[serde(default = "default_noise")]
    pub noise: bool,
    /// Fixed seed for reproducible runs; entropy-seeded when absent.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            profile: SimulationProfile::default(),
            seconds_per_hour: default_seconds_per_hour(),
            daylight_start: default_daylight_start(),
            daylight_end: default_daylight_end(),
            noise: default_noise(),
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.seconds_per_hour == 0 {
            return Err(anyhow!("simulation seconds_per_hour must be greater than zero"));
        }
        if self.daylight_end > 23 || self.daylight_start > self.daylight_end {
            return Err(anyhow!(
                "daylight window {}..={} must satisfy start <= end <= 23",
                self.daylight_start,
                self.daylight_end
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Decimal digits used for every number in the payload.
    #[serde(default = "default_precision")]
    pub precision: u8,
    /// Log every successful publish at info level.
    #[serde(default)]
    pub echo: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            precision: default_precision(),
            echo: false,
        }
    }
}

impl PublishConfig {
    pub fn validate(&self) -> Result<()> {
        if !(2..=5).contains(&self.precision) {
            return Err(anyhow!(
                "publish precision must be between 2 and 5, got {}",
                self.precision
            ));
        }
        Ok(())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub grace_period_ms: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Also write a daily rolling JSON log file.
    #[serde(default)]
    pub file: bool,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            file: false,
            directory: default_logging_directory(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_metrics_listen(),
        }
    }
}

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub period_ms: Option<u64>,
    pub topic: Option<String>,
    pub client_id: Option<String>,
    pub transport: Option<TransportKind>,
    pub strategy: Option<TickStrategy>,
    pub profile: Option<SimulationProfile>,
    pub seconds_per_hour: Option<u64>,
    pub precision: Option<u8>,
    pub echo: bool,
    pub realtime_priority: Option<i32>,
    pub log_format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.schedule.period_ms, Duration::from_secs(1));
        assert_eq!(config.topic(), DEFAULT_WATTAGE_TOPIC);
        assert_eq!(config.publish.precision, 2);
        assert!(!config.broker.reconnect.enabled);
        config.validate().expect("defaults are valid");
    }

    #[test]
    fn parses_partial_toml() {
        let config: AppConfig = r#"
            [broker]
            host = "broker.local"
            qos = "at-most-once"

            [schedule]
            period_ms = 250
            strategy = "cooperative"

            [simulation]
            profile = "environment"
            seed = 7
        "#
        .parse()
        .expect("valid config");
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.qos, QosLevel::AtMostOnce);
        assert_eq!(config.schedule.period_ms, Duration::from_millis(250));
        assert_eq!(config.schedule.strategy, TickStrategy::Cooperative);
        assert_eq!(config.topic(), DEFAULT_ENVIRONMENT_TOPIC);
        assert_eq!(config.simulation.seed, Some(7));
    }

    #[test]
    fn overrides_take_precedence() {
        let mut config = AppConfig::default();
        config.apply_overrides(&ConfigOverrides {
            host: Some("10.0.0.5".into()),
            port: Some(8883),
            period_ms: Some(200),
            topic: Some("sensor/custom".into()),
            echo: true,
            ..ConfigOverrides::default()
        });
        assert_eq!(config.broker.host, "10.0.0.5");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.schedule.period_ms, Duration::from_millis(200));
        assert_eq!(config.topic(), "sensor/custom");
        assert!(config.publish.echo);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = AppConfig::default();
        config.publish.precision = 6;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.schedule.period_ms = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.simulation.daylight_start = 20;
        config.simulation.daylight_end = 5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.broker.topic = Some("sensor/#".into());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.broker.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn keep_alive_below_minimum_is_rejected() {
        for secs in [0, 4] {
            let err = format!("[broker]\nkeep_alive_secs = {secs}\n")
                .parse::<AppConfig>()
                .expect_err("keep-alive too short");
            assert!(format!("{err:#}").contains("keep_alive_secs"), "{err:#}");
        }
        let config: AppConfig = "[broker]\nkeep_alive_secs = 5\n".parse().expect("minimum");
        assert_eq!(config.broker.keep_alive_secs, MIN_KEEP_ALIVE);
    }

    #[test]
    fn example_file_matches_defaults() {
        let example: AppConfig = include_str!("../../../configs/wattmeter.example.toml")
            .parse()
            .expect("example config is valid");
        let defaults = AppConfig::default();
        assert_eq!(example.broker.port, defaults.broker.port);
        assert_eq!(example.broker.client_id, defaults.broker.client_id);
        assert_eq!(example.schedule.initial_delay_ms, defaults.schedule.initial_delay_ms);
        assert_eq!(example.broker.reconnect.max_delay_ms, defaults.broker.reconnect.max_delay_ms);
        assert_eq!(example.metrics.listen, defaults.metrics.listen);
        assert_eq!(example.topic(), DEFAULT_WATTAGE_TOPIC);
    }

    #[test]
    fn load_prefers_explicit_path_and_falls_back_to_defaults() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "[broker]\nport = 1999")?;
        file.flush()?;

        let loaded = AppConfig::load_with_source(Some(file.path()), &["does/not/exist.toml"])?;
        assert_eq!(loaded.config.broker.port, 1999);
        assert_eq!(loaded.source.as_deref(), Some(file.path()));

        let missing = AppConfig::load_with_source(
            Some(Path::new("does/not/exist.toml")),
            &["also/missing.toml"],
        );
        assert!(missing.is_err());
        Ok(())
    }
}
