//! ---
//! wm_section: "11-simulation"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Accelerated simulated hour of day."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use chrono::Utc;

/// Maps wall-clock time onto an accelerated day.
///
/// One simulated hour lasts `seconds_per_hour` real seconds, counted from the
/// Unix epoch, so with `3600` the hour matches UTC. Nothing is stored between
/// calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulatedClock {
    seconds_per_hour: u64,
}

impl SimulatedClock {
    /// `seconds_per_hour` of zero is treated as one.
    pub fn new(seconds_per_hour: u64) -> Self {
        Self {
            seconds_per_hour: seconds_per_hour.max(1),
        }
    }

    pub fn seconds_per_hour(&self) -> u64 {
        self.seconds_per_hour
    }

    /// Simulated hour (0-23) for a Unix timestamp in seconds.
    pub fn hour_at(&self, unix_secs: i64) -> u8 {
        let hours = unix_secs.div_euclid(self.seconds_per_hour as i64);
        hours.rem_euclid(24) as u8
    }

    pub fn current_hour(&self) -> u8 {
        self.hour_at(Utc::now().timestamp())
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(10)
    }
}
