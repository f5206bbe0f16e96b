//! ---
//! wm_section: "11-simulation"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Seeded reading generator driven by the simulated clock."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use rand::prelude::*;
use rand_distr::Uniform;
use tracing::debug;
use wattmeter_common::config::{SimulationConfig, SimulationProfile};

use crate::clock::SimulatedClock;
use crate::environment::{
    EnvironmentNoise, EnvironmentReading, HUMIDITY_NOISE_PCT, TEMPERATURE_NOISE_C,
};
use crate::reading::{
    DaylightWindow, Reading, WattageNoise, CONSUMPTION_NOISE_W, PRODUCTION_NOISE_W,
};

/// One generated sample for the active profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Wattage(Reading),
    Environment(EnvironmentReading),
}

impl Sample {
    /// All numeric fields are finite.
    pub fn is_finite(&self) -> bool {
        match self {
            Sample::Wattage(reading) => {
                reading.consumption.is_finite() && reading.production.is_finite()
            }
            Sample::Environment(reading) => {
                reading.temperature.is_finite() && reading.humidity.is_finite()
            }
        }
    }
}

/// Produces readings for the current simulated hour.
///
/// The random source is seeded once at construction; every sample draws from
/// the same stream.
#[derive(Debug)]
pub struct SimulationEngine {
    profile: SimulationProfile,
    clock: SimulatedClock,
    daylight: DaylightWindow,
    rng: StdRng,
    noise: bool,
    consumption_noise: Uniform<f64>,
    production_noise: Uniform<f64>,
    temperature_noise: Uniform<f64>,
    humidity_noise: Uniform<f64>,
}

impl SimulationEngine {
    pub fn from_config(config: &SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        debug!(profile = ?config.profile, seeded = config.seed.is_some(), noise = config.noise, "simulation engine created");
        Self {
            profile: config.profile,
            clock: SimulatedClock::new(config.seconds_per_hour),
            daylight: DaylightWindow::new(config.daylight_start, config.daylight_end),
            rng,
            noise: config.noise,
            consumption_noise: Uniform::new_inclusive(-CONSUMPTION_NOISE_W, CONSUMPTION_NOISE_W),
            production_noise: Uniform::new_inclusive(-PRODUCTION_NOISE_W, PRODUCTION_NOISE_W),
            temperature_noise: Uniform::new_inclusive(-TEMPERATURE_NOISE_C, TEMPERATURE_NOISE_C),
            humidity_noise: Uniform::new_inclusive(-HUMIDITY_NOISE_PCT, HUMIDITY_NOISE_PCT),
        }
    }

    pub fn profile(&self) -> SimulationProfile {
        self.profile
    }

    pub fn clock(&self) -> SimulatedClock {
        self.clock
    }

    /// Sample for the hour the simulated clock currently shows.
    pub fn next_sample(&mut self) -> (u8, Sample) {
        let hour = self.clock.current_hour();
        (hour, self.sample_at(hour))
    }

    pub fn sample_at(&mut self, hour: u8) -> Sample {
        match self.profile {
            SimulationProfile::Wattage => Sample::Wattage(self.reading_at(hour)),
            SimulationProfile::Environment => Sample::Environment(self.environment_at(hour)),
        }
    }

    pub fn reading_at(&mut self, hour: u8) -> Reading {
        let noise = if self.noise {
            WattageNoise {
                consumption: self.consumption_noise.sample(&mut self.rng),
                production: self.production_noise.sample(&mut self.rng),
            }
        } else {
            WattageNoise::default()
        };
        Reading::at_hour(hour, noise, self.daylight)
    }

    pub fn environment_at(&mut self, hour: u8) -> EnvironmentReading {
        let noise = if self.noise {
            EnvironmentNoise {
                temperature: self.temperature_noise.sample(&mut self.rng),
                humidity: self.humidity_noise.sample(&mut self.rng),
            }
        } else {
            EnvironmentNoise::default()
        };
        EnvironmentReading::at_hour(hour, noise)
    }
}
