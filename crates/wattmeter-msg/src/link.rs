//! ---
//! wm_section: "02-messaging"
//! wm_subsection: "module"
//! wm_type: "source"
//! wm_scope: "code"
//! wm_description: "Broker link abstraction and the in-memory implementation."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{DeliveryGuarantee, LinkError};

/// Transport to a broker, driven by the connection manager.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Establish the session; resolves once the broker has acknowledged it.
    async fn open(&self) -> Result<(), LinkError>;
    /// Queue one publish. Does not wait for the broker acknowledgment.
    async fn send(
        &self,
        topic: &str,
        guarantee: DeliveryGuarantee,
        payload: Bytes,
    ) -> Result<(), LinkError>;
    /// Disconnect gracefully and stop any background work.
    async fn close(&self) -> Result<(), LinkError>;
    /// Whether the session is currently usable.
    fn is_up(&self) -> bool;
    /// Human-readable link name for logging.
    fn name(&self) -> &'static str;
}

/// Failures an [`InMemoryLink`] will simulate.
#[derive(Debug, Clone, Default)]
pub struct LinkFaults {
    /// Fail `open` as if the broker refused the session.
    pub refuse_connect: bool,
    /// Fail every `send` locally.
    pub fail_sends: bool,
    /// Delay applied to each `send` before it is recorded.
    pub send_delay: Option<Duration>,
}

/// A publish captured by the [`InMemoryLink`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Destination topic.
    pub topic: String,
    /// Requested guarantee.
    pub guarantee: DeliveryGuarantee,
    /// Raw payload bytes.
    pub payload: Bytes,
}

impl PublishedMessage {
    /// Payload as UTF-8 text, if valid.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    open: AtomicBool,
    up: AtomicBool,
    opens: AtomicU64,
    closes: AtomicU64,
    echo: bool,
    faults: Mutex<LinkFaults>,
    published: Mutex<Vec<PublishedMessage>>,
}

/// Loopback link that records publishes instead of sending them.
///
/// Used for dry runs without a broker and for exercising the lifecycle and
/// pipeline under injected failures. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLink {
    state: Arc<InMemoryState>,
}

impl InMemoryLink {
    /// Silent link with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Link that logs every payload at `info`.
    pub fn dry_run() -> Self {
        Self {
            state: Arc::new(InMemoryState {
                echo: true,
                ..InMemoryState::default()
            }),
        }
    }

    /// Link preloaded with faults.
    pub fn with_faults(faults: LinkFaults) -> Self {
        let link = Self::new();
        link.set_faults(faults);
        link
    }

    /// Replace the active faults.
    pub fn set_faults(&self, faults: LinkFaults) {
        *self.state.faults.lock() = faults;
    }

    /// Simulate an unsolicited connection loss.
    pub fn drop_link(&self) {
        if self.state.up.swap(false, Ordering::AcqRel) {
            warn!(link = self.name(), "broker link lost");
        }
    }

    /// Bring a dropped link back while the session is still open.
    pub fn restore_link(&self) {
        if self.state.open.load(Ordering::Acquire) && !self.state.up.swap(true, Ordering::AcqRel) {
            info!(link = self.name(), "broker link restored");
        }
    }

    /// Messages recorded so far.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> u64 {
        self.state.opens.load(Ordering::Relaxed)
    }

    /// Number of `close` calls that closed an open session.
    pub fn close_count(&self) -> u64 {
        self.state.closes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerLink for InMemoryLink {
    async fn open(&self) -> Result<(), LinkError> {
        if self.state.faults.lock().refuse_connect {
            return Err(LinkError::Refused("injected refusal".into()));
        }
        if self.state.open.swap(true, Ordering::AcqRel) {
            return Err(LinkError::AlreadyOpen);
        }
        self.state.up.store(true, Ordering::Release);
        self.state.opens.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        guarantee: DeliveryGuarantee,
        payload: Bytes,
    ) -> Result<(), LinkError> {
        let faults = self.state.faults.lock().clone();
        if !self.state.open.load(Ordering::Acquire) {
            return Err(LinkError::NotOpen);
        }
        if !self.state.up.load(Ordering::Acquire) {
            return Err(LinkError::Down);
        }
        if faults.fail_sends {
            return Err(LinkError::Rejected("injected send failure".into()));
        }
        if let Some(delay) = faults.send_delay {
            tokio::time::sleep(delay).await;
        }
        let message = PublishedMessage {
            topic: topic.to_owned(),
            guarantee,
            payload,
        };
        if self.state.echo {
            info!(
                topic = %message.topic,
                payload = message.text().unwrap_or("<binary>"),
                "dry-run publish"
            );
        }
        self.state.published.lock().push(message);
        Ok(())
    }

    async fn close(&self) -> Result<(), LinkError> {
        if !self.state.open.swap(false, Ordering::AcqRel) {
            return Err(LinkError::NotOpen);
        }
        self.state.up.store(false, Ordering::Release);
        self.state.closes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_up(&self) -> bool {
        self.state.up.load(Ordering::Acquire)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_publishes_while_open() {
        let link = InMemoryLink::new();
        assert!(matches!(
            link.send("t", DeliveryGuarantee::AtLeastOnce, Bytes::from_static(b"x"))
                .await,
            Err(LinkError::NotOpen)
        ));
        link.open().await.expect("open");
        link.send("t", DeliveryGuarantee::AtLeastOnce, Bytes::from_static(b"{}"))
            .await
            .expect("send");
        let published = link.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].text(), Some("{}"));
        link.close().await.expect("close");
        assert!(matches!(link.close().await, Err(LinkError::NotOpen)));
    }

    #[tokio::test]
    async fn dropped_link_rejects_until_restored() {
        let link = InMemoryLink::new();
        link.open().await.expect("open");
        link.drop_link();
        assert!(!link.is_up());
        assert!(matches!(
            link.send("t", DeliveryGuarantee::AtMostOnce, Bytes::new()).await,
            Err(LinkError::Down)
        ));
        link.restore_link();
        assert!(link.is_up());
    }

    #[tokio::test]
    async fn injected_faults_apply() {
        let link = InMemoryLink::with_faults(LinkFaults {
            refuse_connect: true,
            ..LinkFaults::default()
        });
        assert!(matches!(link.open().await, Err(LinkError::Refused(_))));
        link.set_faults(LinkFaults {
            fail_sends: true,
            ..LinkFaults::default()
        });
        link.open().await.expect("open");
        assert!(matches!(
            link.send("t", DeliveryGuarantee::AtLeastOnce, Bytes::new()).await,
            Err(LinkError::Rejected(_))
        ));
        assert!(link.published().is_empty());
    }
}
