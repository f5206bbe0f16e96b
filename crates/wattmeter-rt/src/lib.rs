//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Runtime helpers driving the publish cadence."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
//! Real-time scheduling helpers for the wattmeter publisher.

pub mod jitter;
pub mod priority;
pub mod shutdown;
pub mod tick;

pub use jitter::{JitterHistogram, JitterSummary, LoopTimingReporter};
pub use priority::{request_realtime_priority, PriorityError};
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
pub use tick::{
    StopOutcome, Tick, TickError, TickHandler, TickSchedule, TickSource, TickStatsSnapshot,
};
