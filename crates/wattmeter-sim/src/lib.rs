//! ---
//! wm_section: "11-simulation"
//! wm_subsection: "01-bootstrap"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Simulation module exports and shared types."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
//! Synthetic readings for the wattmeter publisher.

pub mod clock;
pub mod environment;
pub mod generator;
pub mod reading;

pub use clock::SimulatedClock;
pub use environment::EnvironmentReading;
pub use generator::{Sample, SimulationEngine};
pub use reading::{DaylightWindow, Reading, WattageNoise};
