//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "binary"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Binary entrypoint for the wattmeter publisher."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::{error, info, warn};
use wattmeter_common::{
    init_tracing, AppConfig, ConfigOverrides, LogFormat, LogGuards, SimulationProfile,
    TickStrategy, TransportKind,
};
use wattmeter_core::{link_for, PublisherRuntime, ShutdownReport, StartupError};
use wattmeter_rt::{request_realtime_priority, ShutdownCoordinator};

const DEFAULT_CONFIG_CANDIDATES: [&str; 2] =
    ["configs/wattmeter.toml", "/etc/wattmeter/wattmeter.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Publishes simulated household power readings to an MQTT broker",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "WATTMETER_BROKER_HOST", help = "Broker hostname")]
    host: Option<String>,

    #[arg(long, env = "WATTMETER_BROKER_PORT", help = "Broker TCP port")]
    port: Option<u16>,

    #[arg(long, env = "WATTMETER_PERIOD_MS", value_name = "MS", help = "Publish period in milliseconds")]
    period_ms: Option<u64>,

    #[arg(long, help = "Topic to publish on")]
    topic: Option<String>,

    #[arg(long, help = "MQTT client identifier")]
    client_id: Option<String>,

    #[arg(long, value_enum, help = "Broker transport")]
    transport: Option<CliTransport>,

    #[arg(long, value_enum, help = "Tick delivery strategy")]
    strategy: Option<CliStrategy>,

    #[arg(long, value_enum, help = "Simulated sensor")]
    profile: Option<CliProfile>,

    #[arg(long, value_name = "SECS", help = "Wall-clock seconds per simulated hour")]
    seconds_per_hour: Option<u64>,

    #[arg(long, value_parser = clap::value_parser!(u8).range(2..=5), help = "Decimal places in payloads")]
    precision: Option<u8>,

    #[arg(long, help = "Log every published payload at info level")]
    echo: bool,

    #[arg(
        long = "rt-priority",
        value_parser = clap::value_parser!(i32).range(0..=99),
        help = "Request SCHED_FIFO at this priority (0 = maximum)"
    )]
    rt_priority: Option<i32>,

    #[arg(long, value_enum, help = "Console log format")]
    log_format: Option<CliLogFormat>,

    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTransport {
    Mqtt,
    InMemory,
}

impl From<CliTransport> for TransportKind {
    fn from(value: CliTransport) -> Self {
        match value {
            CliTransport::Mqtt => TransportKind::Mqtt,
            CliTransport::InMemory => TransportKind::InMemory,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliStrategy {
    Deadline,
    Cooperative,
}

impl From<CliStrategy> for TickStrategy {
    fn from(value: CliStrategy) -> Self {
        match value {
            CliStrategy::Deadline => TickStrategy::Deadline,
            CliStrategy::Cooperative => TickStrategy::Cooperative,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliProfile {
    Wattage,
    Environment,
}

impl From<CliProfile> for SimulationProfile {
    fn from(value: CliProfile) -> Self {
        match value {
            CliProfile::Wattage => SimulationProfile::Wattage,
            CliProfile::Environment => SimulationProfile::Environment,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliLogFormat {
    Pretty,
    Json,
}

impl From<CliLogFormat> for LogFormat {
    fn from(value: CliLogFormat) -> Self {
        match value {
            CliLogFormat::Pretty => LogFormat::Pretty,
            CliLogFormat::Json => LogFormat::StructuredJson,
        }
    }
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            period_ms: self.period_ms,
            topic: self.topic.clone(),
            client_id: self.client_id.clone(),
            transport: self.transport.map(Into::into),
            strategy: self.strategy.map(Into::into),
            profile: self.profile.map(Into::into),
            seconds_per_hour: self.seconds_per_hour,
            precision: self.precision,
            echo: self.echo,
            realtime_priority: self.rt_priority,
            log_format: self.log_format.map(Into::into),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version {
        println!("wattmeterd {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }
    // Dropped last so buffered events, including the fatal one, are flushed.
    let mut log_guards = LogGuards::default();
    match run(cli, &mut log_guards) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "wattmeterd exiting on fatal error");
            eprintln!("wattmeterd: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, log_guards: &mut LogGuards) -> Result<()> {
    let loaded = AppConfig::load_with_source(cli.config.as_deref(), &DEFAULT_CONFIG_CANDIDATES)?;
    let mut config = loaded.config;
    config.apply_overrides(&cli.overrides());
    config.validate().context("invalid configuration")?;

    *log_guards = init_tracing("wattmeterd", &config.logging)?;
    info!(
        config_path = ?loaded.source,
        broker = %format!("{}:{}", config.broker.host, config.broker.port),
        topic = %config.topic(),
        version = env!("CARGO_PKG_VERSION"),
        "configuration loaded"
    );

    // Runtime worker threads inherit the policy set here.
    if let Some(priority) = config.schedule.realtime_priority {
        match request_realtime_priority(priority) {
            Ok(applied) => info!(priority = applied, "SCHED_FIFO priority applied"),
            Err(err) => warn!(error = %err, "continuing without real-time priority"),
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("wattmeterd-worker")
        .build()
        .context("failed to build async runtime")?;
    let outcome = runtime.block_on(serve(config));
    runtime.shutdown_timeout(Duration::from_millis(500));

    let report = outcome?;
    if report.timed_out {
        warn!("shutdown cut steps short to stay within the grace period");
    }
    Ok(())
}

async fn serve(config: AppConfig) -> Result<ShutdownReport, StartupError> {
    let shutdown = ShutdownCoordinator::new();
    let _signals = shutdown
        .listen_for_signals()
        .map_err(StartupError::Signals)?;
    let link = link_for(&config.broker);
    PublisherRuntime::new(config, link).run(shutdown).await
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_onto_overrides() {
        let cli = Cli::try_parse_from([
            "wattmeterd",
            "--host",
            "broker.local",
            "--period-ms",
            "250",
            "--transport",
            "in-memory",
            "--strategy",
            "cooperative",
            "--precision",
            "3",
            "--log-format",
            "json",
            "--echo",
        ])
        .expect("parse");
        let mut config = AppConfig::default();
        config.apply_overrides(&cli.overrides());
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.schedule.period_ms, Duration::from_millis(250));
        assert_eq!(config.broker.transport, TransportKind::InMemory);
        assert_eq!(config.schedule.strategy, TickStrategy::Cooperative);
        assert_eq!(config.publish.precision, 3);
        assert_eq!(config.logging.format, LogFormat::StructuredJson);
        assert!(config.publish.echo);
        config.validate().expect("valid");
    }

    #[test]
    fn out_of_range_precision_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["wattmeterd", "--precision", "7"]).is_err());
        assert!(Cli::try_parse_from(["wattmeterd", "--rt-priority", "120"]).is_err());
    }
}
