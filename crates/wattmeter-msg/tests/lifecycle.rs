//! ---
//! wm_section: "02-messaging"
//! wm_subsection: "tests"
//! wm_type: "test"
//! wm_scope: "code"
//! wm_description: "Connection lifecycle behaviour against the in-memory link."
//! wm_version: "v0.1.0"
//! wm_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use wattmeter_msg::lifecycle::ConnectionState;
use wattmeter_msg::{
    ConnectionManager, DeliveryGuarantee, InMemoryLink, LifecycleError, LinkError, LinkFaults,
    TeardownOutcome,
};

const TOPIC: &str = "sensor/wattage_meter_rt_c_component";

fn manager(link: &InMemoryLink) -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(link.clone()),
        TOPIC,
        DeliveryGuarantee::AtLeastOnce,
    )
}

fn payload() -> Bytes {
    Bytes::from_static(br#"{"consumption_wattage": 350.01, "production_wattage": 150.00}"#)
}

#[tokio::test]
async fn publish_before_connect_is_rejected() {
    let link = InMemoryLink::new();
    let manager = manager(&link);
    let err = manager.publish(payload()).await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::NotConnected(ConnectionState::Uninitialized)
    ));
    assert!(link.published().is_empty());
}

#[tokio::test]
async fn connect_publish_teardown() -> Result<()> {
    let link = InMemoryLink::new();
    let manager = manager(&link);
    manager.connect().await?;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_ready());

    manager.publish(payload()).await?;
    let published = link.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, TOPIC);
    assert_eq!(published[0].guarantee, DeliveryGuarantee::AtLeastOnce);

    assert_eq!(manager.teardown().await?, TeardownOutcome::Closed);
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(link.close_count(), 1);
    Ok(())
}

#[tokio::test]
async fn teardown_twice_is_a_no_op() -> Result<()> {
    let link = InMemoryLink::new();
    let manager = manager(&link);
    manager.connect().await?;
    assert_eq!(manager.teardown().await?, TeardownOutcome::Closed);
    assert_eq!(manager.teardown().await?, TeardownOutcome::AlreadyClosed);
    assert_eq!(link.close_count(), 1);
    Ok(())
}

#[tokio::test]
async fn connect_after_teardown_and_publish_after_close_are_rejected() -> Result<()> {
    let link = InMemoryLink::new();
    let manager = manager(&link);
    manager.connect().await?;
    manager.teardown().await?;

    assert!(matches!(
        manager.connect().await,
        Err(LifecycleError::InvalidTransition(ConnectionState::Closed))
    ));
    assert!(matches!(
        manager.publish(payload()).await,
        Err(LifecycleError::NotConnected(ConnectionState::Closed))
    ));
    assert_eq!(link.open_count(), 1);
    Ok(())
}

#[tokio::test]
async fn refused_connect_is_terminal() {
    let link = InMemoryLink::with_faults(LinkFaults {
        refuse_connect: true,
        ..LinkFaults::default()
    });
    let manager = manager(&link);
    let err = manager.connect().await.unwrap_err();
    assert!(matches!(err, LifecycleError::Link(LinkError::Refused(_))));
    assert_eq!(manager.state(), ConnectionState::Closed);
    assert!(matches!(
        manager.teardown().await,
        Ok(TeardownOutcome::AlreadyClosed)
    ));
}

#[tokio::test]
async fn link_loss_keeps_state_but_fails_publishes() -> Result<()> {
    let link = InMemoryLink::new();
    let manager = manager(&link);
    manager.connect().await?;

    link.drop_link();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(!manager.is_ready());
    assert!(matches!(
        manager.publish(payload()).await,
        Err(LifecycleError::LinkDown)
    ));

    link.restore_link();
    manager.publish(payload()).await?;
    assert_eq!(link.published().len(), 1);
    Ok(())
}

#[tokio::test]
async fn local_send_failure_surfaces_as_link_error() -> Result<()> {
    let link = InMemoryLink::new();
    let manager = manager(&link);
    manager.connect().await?;
    link.set_faults(LinkFaults {
        fail_sends: true,
        ..LinkFaults::default()
    });
    assert!(matches!(
        manager.publish(payload()).await,
        Err(LifecycleError::Link(LinkError::Rejected(_)))
    ));

    link.set_faults(LinkFaults {
        send_delay: Some(Duration::from_millis(20)),
        ..LinkFaults::default()
    });
    manager.publish(payload()).await?;
    assert_eq!(link.published().len(), 1);
    Ok(())
}
