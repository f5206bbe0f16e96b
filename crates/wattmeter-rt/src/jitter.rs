//! ---
//! wm_section: "01-core-functionality"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Tick lateness and interval jitter accounting."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::tick::Tick;

/// Running lateness/jitter aggregates. Memory stays constant no matter how
/// long the publisher runs; the per-sample distribution is exported through
/// the Prometheus histogram instead.
#[derive(Debug, Default)]
pub struct JitterHistogram {
    stats: Mutex<RunningStats>,
}

/// Welford accumulator over nanosecond samples.
#[derive(Debug, Default, Clone, Copy)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    fn push(&mut self, sample: f64) {
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    /// Sample standard deviation (n - 1 denominator).
    fn std_dev(&self) -> f64 {
        if self.count > 1 {
            (self.m2 / (self.count - 1) as f64).sqrt()
        } else {
            0.0
        }
    }
}

impl JitterHistogram {
    pub fn record(&self, jitter: Duration) {
        self.stats.lock().push(jitter.as_nanos() as f64);
    }

    pub fn len(&self) -> u64 {
        self.stats.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> Option<JitterSummary> {
        let stats = *self.stats.lock();
        if stats.count == 0 {
            return None;
        }
        Some(JitterSummary {
            mean_ns: stats.mean,
            std_dev_ns: stats.std_dev(),
            max_ns: stats.max,
            min_ns: stats.min,
            samples: stats.count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JitterSummary {
    pub mean_ns: f64,
    pub std_dev_ns: f64,
    pub max_ns: f64,
    pub min_ns: f64,
    pub samples: u64,
}

impl JitterSummary {
    pub fn max(&self) -> Duration {
        Duration::from_nanos(self.max_ns.max(0.0).round() as u64)
    }

    pub fn mean(&self) -> Duration {
        Duration::from_nanos(self.mean_ns.max(0.0).round() as u64)
    }
}

/// Measures delivered ticks against the configured period.
///
/// Two figures are kept: lateness (fire time minus scheduled deadline) and
/// interval jitter (distance between consecutive fire times minus the
/// nominal period, ignoring ticks skipped in between).
#[derive(Debug)]
pub struct LoopTimingReporter {
    target_interval: Duration,
    last_tick: Mutex<Option<(u64, Instant)>>,
    lateness: JitterHistogram,
    interval_jitter: JitterHistogram,
}

impl LoopTimingReporter {
    pub fn new(target_interval: Duration) -> Self {
        Self {
            target_interval,
            last_tick: Mutex::new(None),
            lateness: JitterHistogram::default(),
            interval_jitter: JitterHistogram::default(),
        }
    }

    pub fn record(&self, tick: &Tick) {
        self.lateness.record(tick.lateness());
        let mut last_tick = self.last_tick.lock();
        if let Some((previous_seq, previous_fired)) = *last_tick {
            let steps = tick.seq.saturating_sub(previous_seq).max(1);
            let expected = self
                .target_interval
                .checked_mul(u32::try_from(steps).unwrap_or(u32::MAX))
                .unwrap_or(Duration::MAX);
            let actual = tick.fired.saturating_duration_since(previous_fired);
            let jitter = if actual > expected {
                actual - expected
            } else {
                expected - actual
            };
            self.interval_jitter.record(jitter);
        }
        *last_tick = Some((tick.seq, tick.fired));
    }

    pub fn target_interval(&self) -> Duration {
        self.target_interval
    }

    pub fn lateness(&self) -> &JitterHistogram {
        &self.lateness
    }

    pub fn interval_jitter(&self) -> &JitterHistogram {
        &self.interval_jitter
    }
}
