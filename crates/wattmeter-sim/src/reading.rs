//! ---
//! wm_section: "11-simulation"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Household consumption and solar production model."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Half-width of the uniform noise added to consumption, in watts.
pub const CONSUMPTION_NOISE_W: f64 = 20.0;
/// Half-width of the uniform noise added to production, in watts.
pub const PRODUCTION_NOISE_W: f64 = 30.0;

/// Inclusive range of simulated hours during which the panel may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaylightWindow {
    pub start: u8,
    pub end: u8,
}

impl DaylightWindow {
    pub fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, hour: u8) -> bool {
        hour >= self.start && hour <= self.end
    }
}

impl Default for DaylightWindow {
    fn default() -> Self {
        Self::new(6, 22)
    }
}

/// One consumption/production pair in watts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub consumption: f64,
    pub production: f64,
}

/// Noise offsets applied to a single reading.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WattageNoise {
    pub consumption: f64,
    pub production: f64,
}

/// Demand peaks around 08:00 and 18:00 on top of a 200 W base load.
pub fn base_consumption(hour: u8) -> f64 {
    let h = f64::from(hour);
    200.0 + 150.0 * ((-(h - 8.0).powi(2) / 10.0).exp() + (-(h - 18.0).powi(2) / 10.0).exp())
}

/// Half sine wave rising at 06:00 and peaking at noon. Negative outside daytime.
pub fn base_production(hour: u8) -> f64 {
    let h = f64::from(hour);
    300.0 * (((h - 6.0) / 12.0) * PI).sin()
}

impl Reading {
    /// Compose a reading for `hour` with explicit noise offsets.
    pub fn at_hour(hour: u8, noise: WattageNoise, daylight: DaylightWindow) -> Self {
        let consumption = base_consumption(hour) + noise.consumption;
        let mut production = base_production(hour) + noise.production;
        if !daylight.contains(hour) || production < 0.0 {
            production = 0.0;
        }
        Self {
            consumption,
            production,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn morning_peak_without_noise() {
        let reading = Reading::at_hour(8, WattageNoise::default(), DaylightWindow::default());
        assert!((reading.consumption - 350.0).abs() < 0.01);
        assert!((reading.production - 150.0).abs() < 1e-9);
    }

    #[test]
    fn sunrise_has_zero_base_production() {
        assert!(base_production(6).abs() < 1e-9);
        let reading = Reading::at_hour(6, WattageNoise::default(), DaylightWindow::default());
        assert_eq!(reading.production, 0.0);
    }

    #[test]
    fn night_forces_zero_production_even_with_positive_noise() {
        let noise = WattageNoise {
            consumption: 0.0,
            production: PRODUCTION_NOISE_W,
        };
        for hour in [0, 1, 2, 3, 4, 5, 23] {
            let reading = Reading::at_hour(hour, noise, DaylightWindow::default());
            assert_eq!(reading.production, 0.0, "hour {hour}");
        }
    }

    #[test]
    fn production_is_clamped_at_zero() {
        let noise = WattageNoise {
            consumption: 0.0,
            production: -PRODUCTION_NOISE_W,
        };
        let reading = Reading::at_hour(7, noise, DaylightWindow::default());
        assert!(reading.production >= 0.0);
    }

    #[test]
    fn noon_is_the_production_peak() {
        let noon = base_production(12);
        for hour in 0..24 {
            assert!(base_production(hour) <= noon);
        }
        assert!((noon - 300.0).abs() < 1e-9);
    }

    #[test]
    fn daylight_window_is_inclusive() {
        let window = DaylightWindow::new(6, 22);
        assert!(window.contains(6));
        assert!(window.contains(22));
        assert!(!window.contains(5));
        assert!(!window.contains(23));
    }
}
