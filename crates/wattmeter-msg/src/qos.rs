//! ---
//! wm_section: "02-messaging"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Delivery guarantees and publish acknowledgment tracking."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rumqttc::QoS;
use wattmeter_common::QosLevel;

/// Delivery guarantees offered for outbound readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryGuarantee {
    /// Fire and forget.
    AtMostOnce,
    /// Broker acknowledges each publish; the client retransmits until it does.
    #[default]
    AtLeastOnce,
}

impl DeliveryGuarantee {
    /// Protocol level used on the wire.
    pub fn to_mqtt(self) -> QoS {
        match self {
            DeliveryGuarantee::AtMostOnce => QoS::AtMostOnce,
            DeliveryGuarantee::AtLeastOnce => QoS::AtLeastOnce,
        }
    }

    /// Whether publishes under this guarantee expect an acknowledgment.
    pub fn expects_ack(self) -> bool {
        matches!(self, DeliveryGuarantee::AtLeastOnce)
    }
}

impl From<QosLevel> for DeliveryGuarantee {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => DeliveryGuarantee::AtMostOnce,
            QosLevel::AtLeastOnce => DeliveryGuarantee::AtLeastOnce,
        }
    }
}

/// Pairs outgoing packet identifiers with broker acknowledgments.
#[derive(Debug, Default)]
pub struct AckTracker {
    pending: Mutex<HashMap<u16, Instant>>,
    acknowledged: AtomicU64,
}

impl AckTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a publish handed to the network. Packet id `0` marks an
    /// unacknowledged publish and is ignored.
    pub fn record_sent(&self, pkid: u16) {
        if pkid != 0 {
            self.pending.lock().insert(pkid, Instant::now());
        }
    }

    /// Resolve an acknowledgment, returning the round trip if the id was known.
    pub fn acknowledge(&self, pkid: u16) -> Option<Duration> {
        let sent = self.pending.lock().remove(&pkid)?;
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        Some(sent.elapsed())
    }

    /// Publishes still waiting on the broker.
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Total acknowledgments matched so far.
    pub fn acknowledged(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_config_levels() {
        assert_eq!(
            DeliveryGuarantee::from(QosLevel::AtLeastOnce).to_mqtt(),
            QoS::AtLeastOnce
        );
        assert_eq!(
            DeliveryGuarantee::from(QosLevel::AtMostOnce).to_mqtt(),
            QoS::AtMostOnce
        );
        assert!(DeliveryGuarantee::default().expects_ack());
    }

    #[test]
    fn tracker_matches_acks() {
        let tracker = AckTracker::new();
        tracker.record_sent(0);
        tracker.record_sent(7);
        tracker.record_sent(8);
        assert_eq!(tracker.pending(), 2);
        assert!(tracker.acknowledge(7).is_some());
        assert!(tracker.acknowledge(7).is_none());
        assert_eq!(tracker.pending(), 1);
        assert_eq!(tracker.acknowledged(), 1);
    }
}
