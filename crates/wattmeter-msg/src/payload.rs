//! ---
//! wm_section: "02-messaging"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Fixed-precision JSON encoding of samples."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use wattmeter_sim::Sample;

use crate::PayloadError;

/// Smallest supported number of decimals.
pub const MIN_PRECISION: u8 = 2;
/// Largest supported number of decimals.
pub const MAX_PRECISION: u8 = 5;

/// Wire shape of a wattage reading, for consumers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WattagePayload {
    /// Household consumption in watts.
    pub consumption_wattage: f64,
    /// Panel production in watts.
    pub production_wattage: f64,
}

/// Wire shape of an environment reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentPayload {
    /// Relative humidity in percent.
    pub humidity: f64,
    /// Air temperature in degrees Celsius.
    pub temperature: f64,
}

/// Encodes samples with a fixed number of decimals for the whole run.
///
/// The text is written by hand instead of through `serde_json` so that
/// numbers keep trailing zeros (`150.00`) and the key spacing stays stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadEncoder {
    precision: u8,
}

impl Default for PayloadEncoder {
    fn default() -> Self {
        Self {
            precision: MIN_PRECISION,
        }
    }
}

impl PayloadEncoder {
    /// Build an encoder, rejecting precisions outside `2..=5`.
    pub fn new(precision: u8) -> Result<Self, PayloadError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return Err(PayloadError::Precision(precision));
        }
        Ok(Self { precision })
    }

    /// Configured number of decimals.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Render a sample as a single JSON object without trailing newline.
    pub fn encode(&self, sample: &Sample) -> Result<String, PayloadError> {
        match sample {
            Sample::Wattage(reading) => Ok(format!(
                "{{\"consumption_wattage\": {}, \"production_wattage\": {}}}",
                self.number("consumption_wattage", reading.consumption)?,
                self.number("production_wattage", reading.production)?,
            )),
            Sample::Environment(reading) => Ok(format!(
                "{{\"humidity\": {}, \"temperature\": {}}}",
                self.number("humidity", reading.humidity)?,
                self.number("temperature", reading.temperature)?,
            )),
        }
    }

    fn number(&self, field: &'static str, value: f64) -> Result<String, PayloadError> {
        if !value.is_finite() {
            return Err(PayloadError::NonFinite(field));
        }
        // `+ 0.0` folds negative zero into positive zero.
        Ok(format!("{:.*}", usize::from(self.precision), value + 0.0))
    }
}

#[cfg(test)]
mod tests {
    use wattmeter_sim::{EnvironmentReading, Reading};

    use super::*;

    fn wattage(consumption: f64, production: f64) -> Sample {
        Sample::Wattage(Reading {
            consumption,
            production,
        })
    }

    #[test]
    fn morning_reading_matches_wire_format() {
        let consumption = 200.0 + 150.0 * (1.0 + (-10.0f64).exp());
        let production = 300.0 * (std::f64::consts::PI / 6.0).sin();
        let text = PayloadEncoder::default()
            .encode(&wattage(consumption, production))
            .expect("encode");
        assert_eq!(
            text,
            r#"{"consumption_wattage": 350.01, "production_wattage": 150.00}"#
        );
    }

    #[test]
    fn precision_is_applied_to_every_field() {
        let encoder = PayloadEncoder::new(4).expect("precision");
        let text = encoder.encode(&wattage(212.5, 0.0)).expect("encode");
        assert_eq!(
            text,
            r#"{"consumption_wattage": 212.5000, "production_wattage": 0.0000}"#
        );
        let parsed: WattagePayload = serde_json::from_str(&text).expect("valid json");
        assert_eq!(parsed.production_wattage, 0.0);
    }

    #[test]
    fn environment_payload_parses_back() {
        let sample = Sample::Environment(EnvironmentReading {
            temperature: 18.666,
            humidity: 61.2,
        });
        let text = PayloadEncoder::default().encode(&sample).expect("encode");
        assert_eq!(text, r#"{"humidity": 61.20, "temperature": 18.67}"#);
        let parsed: EnvironmentPayload = serde_json::from_str(&text).expect("valid json");
        assert!((parsed.temperature - 18.67).abs() < 1e-9);
    }

    #[test]
    fn negative_zero_prints_unsigned() {
        let text = PayloadEncoder::default()
            .encode(&wattage(1.0, -0.0))
            .expect("encode");
        assert!(text.ends_with("\"production_wattage\": 0.00}"));
    }

    #[test]
    fn rejects_non_finite_and_bad_precision() {
        let encoder = PayloadEncoder::default();
        assert_eq!(
            encoder.encode(&wattage(f64::NAN, 1.0)),
            Err(PayloadError::NonFinite("consumption_wattage"))
        );
        assert_eq!(PayloadEncoder::new(1), Err(PayloadError::Precision(1)));
        assert_eq!(PayloadEncoder::new(6), Err(PayloadError::Precision(6)));
        assert!(!encoder.encode(&wattage(1.0, 2.0)).expect("encode").ends_with('\n'));
    }
}
