//! ---
//! wm_section: "11-simulation"
//! wm_subsection: "tests"
//! wm_type: "source"
//! wm_scope: "test"
//! wm_description: "Property checks across the whole simulated day."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use statrs::statistics::Statistics;
use wattmeter_common::config::{SimulationConfig, SimulationProfile};
use wattmeter_sim::reading::base_consumption;
use wattmeter_sim::{Sample, SimulationEngine};

fn engine(profile: SimulationProfile, seed: u64) -> SimulationEngine {
    SimulationEngine::from_config(&SimulationConfig {
        profile,
        seed: Some(seed),
        ..SimulationConfig::default()
    })
}

#[test]
fn every_hour_yields_finite_non_negative_production() {
    let mut engine = engine(SimulationProfile::Wattage, 2024);
    for _ in 0..500 {
        for hour in 0..24 {
            match engine.sample_at(hour) {
                Sample::Wattage(reading) => {
                    assert!(reading.consumption.is_finite());
                    assert!(reading.production.is_finite());
                    assert!(reading.production >= 0.0, "hour {hour}");
                    assert!((0.0..=500.0).contains(&reading.consumption), "hour {hour}");
                }
                other => panic!("unexpected sample {other:?}"),
            }
        }
    }
}

#[test]
fn consumption_noise_is_centred() {
    let mut engine = engine(SimulationProfile::Wattage, 11);
    let offsets: Vec<f64> = (0..5_000)
        .map(|_| engine.reading_at(3).consumption - base_consumption(3))
        .collect();
    let mean = offsets.iter().mean();
    let spread = offsets.iter().std_dev();
    assert!(mean.abs() < 1.5, "mean offset {mean}");
    // uniform(-20, 20) has a standard deviation of 40 / sqrt(12) ~= 11.5
    assert!((spread - 11.55).abs() < 1.0, "std dev {spread}");
}

#[test]
fn environment_samples_are_finite() {
    let mut engine = engine(SimulationProfile::Environment, 5);
    for hour in 0..24 {
        assert!(engine.sample_at(hour).is_finite());
    }
}
