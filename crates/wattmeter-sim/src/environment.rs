//! ---
//! wm_section: "11-simulation"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Panel-side temperature and humidity model."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

pub const TEMPERATURE_NOISE_C: f64 = 1.0;
pub const HUMIDITY_NOISE_PCT: f64 = 3.0;

/// Ambient conditions next to the panel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentReading {
    pub temperature: f64,
    pub humidity: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EnvironmentNoise {
    pub temperature: f64,
    pub humidity: f64,
}

/// Coldest around 05:00, warmest around 17:00.
pub fn base_temperature(hour: u8) -> f64 {
    let h = f64::from(hour);
    10.0 + 10.0 * ((h - 5.0) / 24.0 * 2.0 * PI).sin()
}

/// Humidity runs opposite to the daytime warming.
pub fn base_humidity(hour: u8) -> f64 {
    let h = f64::from(hour);
    70.0 - 20.0 * ((h - 2.0) / 24.0 * 2.0 * PI).sin()
}

impl EnvironmentReading {
    pub fn at_hour(hour: u8, noise: EnvironmentNoise) -> Self {
        Self {
            temperature: base_temperature(hour) + noise.temperature,
            humidity: base_humidity(hour) + noise.humidity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_crosses_baseline_at_five() {
        let reading = EnvironmentReading::at_hour(5, EnvironmentNoise::default());
        assert!((reading.temperature - 10.0).abs() < 1e-9);
    }

    #[test]
    fn humidity_stays_in_plausible_band() {
        for hour in 0..24 {
            let reading = EnvironmentReading::at_hour(hour, EnvironmentNoise::default());
            assert!((50.0..=90.0).contains(&reading.humidity), "hour {hour}");
            assert!((0.0..=20.0).contains(&reading.temperature), "hour {hour}");
        }
    }
}
