//! ---
//! wm_section: "02-messaging"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Connection state machine wrapping a broker link."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::{BrokerLink, DeliveryGuarantee, LifecycleError, LinkError};

/// Lifecycle of the broker connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `connect` not yet called.
    Uninitialized,
    /// Waiting for the broker to acknowledge the session.
    Connecting,
    /// Session acknowledged; publishes are accepted.
    Connected,
    /// Teardown in progress.
    Disconnecting,
    /// Terminal.
    Closed,
}

impl ConnectionState {
    /// Numeric encoding for gauges, in transition order.
    pub fn ordinal(self) -> i64 {
        match self {
            ConnectionState::Uninitialized => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Disconnecting => 3,
            ConnectionState::Closed => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Uninitialized => "uninitialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Result of a [`ConnectionManager::teardown`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// This call closed the connection.
    Closed,
    /// The connection was already closing or closed; nothing was done.
    AlreadyClosed,
}

/// Owns the broker link and gates every operation on the connection state.
///
/// The state lock is never held across an `.await`; the link calls run
/// outside it and the result is written back afterwards.
pub struct ConnectionManager {
    link: Arc<dyn BrokerLink>,
    topic: String,
    guarantee: DeliveryGuarantee,
    state: Mutex<ConnectionState>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("link", &self.link.name())
            .field("topic", &self.topic)
            .field("guarantee", &self.guarantee)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Wrap a link that will publish to `topic` with `guarantee`.
    pub fn new(
        link: Arc<dyn BrokerLink>,
        topic: impl Into<String>,
        guarantee: DeliveryGuarantee,
    ) -> Self {
        Self {
            link,
            topic: topic.into(),
            guarantee,
            state: Mutex::new(ConnectionState::Uninitialized),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Destination topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Name of the underlying link.
    pub fn link_name(&self) -> &'static str {
        self.link.name()
    }

    /// Whether the connection is `Connected` and the link is currently up.
    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Connected && self.link.is_up()
    }

    /// Open the link. Valid only once, from `Uninitialized`; a failure is
    /// terminal and leaves the manager `Closed`.
    pub async fn connect(&self) -> Result<(), LifecycleError> {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Uninitialized {
                return Err(LifecycleError::InvalidTransition(*state));
            }
            *state = ConnectionState::Connecting;
        }
        info!(link = self.link.name(), topic = %self.topic, "connecting to broker");
        match self.link.open().await {
            Ok(()) => {
                *self.state.lock() = ConnectionState::Connected;
                info!(link = self.link.name(), "broker connection established");
                Ok(())
            }
            Err(err) => {
                *self.state.lock() = ConnectionState::Closed;
                error!(link = self.link.name(), error = %err, "broker connection failed");
                Err(err.into())
            }
        }
    }

    /// Hand one payload to the link. Rejected unless `Connected` with the
    /// link up.
    pub async fn publish(&self, payload: Bytes) -> Result<(), LifecycleError> {
        let state = self.state();
        if state != ConnectionState::Connected {
            return Err(LifecycleError::NotConnected(state));
        }
        if !self.link.is_up() {
            return Err(LifecycleError::LinkDown);
        }
        self.link
            .send(&self.topic, self.guarantee, payload)
            .await
            .map_err(|err| match err {
                LinkError::Down => LifecycleError::LinkDown,
                other => LifecycleError::Link(other),
            })
    }

    /// Disconnect and release the link. Repeated calls are no-ops.
    pub async fn teardown(&self) -> Result<TeardownOutcome, LifecycleError> {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            match previous {
                ConnectionState::Connected => *state = ConnectionState::Disconnecting,
                ConnectionState::Uninitialized => *state = ConnectionState::Closed,
                _ => {}
            }
            previous
        };
        match previous {
            ConnectionState::Uninitialized => Ok(TeardownOutcome::Closed),
            ConnectionState::Connecting => Err(LifecycleError::InvalidTransition(previous)),
            ConnectionState::Disconnecting | ConnectionState::Closed => {
                Ok(TeardownOutcome::AlreadyClosed)
            }
            ConnectionState::Connected => {
                let result = self.link.close().await;
                *self.state.lock() = ConnectionState::Closed;
                match result {
                    Ok(()) => {
                        info!(link = self.link.name(), "broker connection closed");
                        Ok(TeardownOutcome::Closed)
                    }
                    Err(err) => {
                        warn!(link = self.link.name(), error = %err, "broker link close reported an error");
                        Err(err.into())
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryLink;

    #[test]
    fn ordinals_follow_transition_order() {
        assert!(ConnectionState::Uninitialized.ordinal() < ConnectionState::Connected.ordinal());
        assert!(ConnectionState::Connected.ordinal() < ConnectionState::Closed.ordinal());
        assert_eq!(ConnectionState::Disconnecting.to_string(), "disconnecting");
    }

    #[tokio::test]
    async fn teardown_before_connect_closes_directly() {
        let manager = ConnectionManager::new(
            Arc::new(InMemoryLink::new()),
            "sensor/test",
            DeliveryGuarantee::AtLeastOnce,
        );
        assert_eq!(manager.teardown().await.expect("teardown"), TeardownOutcome::Closed);
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(
            manager.connect().await,
            Err(LifecycleError::InvalidTransition(ConnectionState::Closed))
        ));
    }
}
