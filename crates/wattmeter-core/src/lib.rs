//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Publisher runtime and lifecycle management."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
//! Wires the simulation, tick source, and broker connection together.

pub mod pipeline;
pub mod runtime;

pub use pipeline::{PipelineStats, PipelineStatsHandle, PublishPipeline};
pub use runtime::{link_for, PublisherRuntime, RuntimeHandle, ShutdownReport, StartupError};
