//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Shared primitives for the wattmeter workspace."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
//! Configuration loading and logging setup consumed across the workspace.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BrokerConfig, ConfigOverrides, LoadedAppConfig, LoggingConfig, MetricsConfig,
    PublishConfig, QosLevel, ReconnectConfig, ScheduleConfig, ShutdownConfig, SimulationConfig,
    SimulationProfile, TickStrategy, TransportKind,
};
pub use logging::{init_tracing, LogFormat, LogGuards};
