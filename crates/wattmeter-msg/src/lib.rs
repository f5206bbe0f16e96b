//! ---
//! wm_section: "02-messaging"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Broker link abstraction, connection lifecycle, and payload codec."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
//! Everything between a generated sample and the broker.
#![warn(missing_docs)]

pub mod lifecycle;
pub mod link;
pub mod mqtt;
pub mod payload;
pub mod qos;

use std::time::Duration;

use lifecycle::ConnectionState;

/// Errors raised by a [`link::BrokerLink`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// The broker answered the connect request with a non-success code.
    #[error("broker refused the connection: {0}")]
    Refused(String),
    /// The broker could not be reached at the network level.
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    /// No acknowledgment arrived before the connect timeout.
    #[error("no connection acknowledgment within {0:?}")]
    Timeout(Duration),
    /// The link was established but is currently down.
    #[error("broker link is down")]
    Down,
    /// The link rejected an outbound request locally.
    #[error("publish rejected locally: {0}")]
    Rejected(String),
    /// `open` was called twice on the same link.
    #[error("link already open")]
    AlreadyOpen,
    /// The link has not been opened, or was already closed.
    #[error("link not open")]
    NotOpen,
}

/// Errors raised by the [`lifecycle::ConnectionManager`].
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The requested operation is not valid from the current state.
    #[error("invalid transition from {0}")]
    InvalidTransition(ConnectionState),
    /// Publish attempted while not connected.
    #[error("publish rejected: connection is {0}")]
    NotConnected(ConnectionState),
    /// Publish attempted while the connection is up but the link is down.
    #[error("publish rejected: broker link is down")]
    LinkDown,
    /// Underlying link failure.
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Errors raised while encoding a sample.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PayloadError {
    /// A field was NaN or infinite.
    #[error("field `{0}` is not a finite number")]
    NonFinite(&'static str),
    /// Decimal places outside the supported range.
    #[error("precision {0} outside 2..=5")]
    Precision(u8),
}

pub use lifecycle::{ConnectionManager, TeardownOutcome};
pub use link::{BrokerLink, InMemoryLink, LinkFaults, PublishedMessage};
pub use mqtt::{MqttLink, MqttSettings};
pub use payload::{EnvironmentPayload, PayloadEncoder, WattagePayload};
pub use qos::{AckTracker, DeliveryGuarantee};
