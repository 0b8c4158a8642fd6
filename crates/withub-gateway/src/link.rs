/*!
 * Network link boundary.
 *
 * The link brings the gateway onto a wireless network and reports its
 * progress as [`LinkEvent`]s. On hosts whose operating system manages the
 * network, [`HostLink`] reports the link as up as soon as it is asked to
 * connect.
 */
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info};

use withub_core::types::AccessPoint;

use crate::error::{Error, Result};

/// Progress reported by a network link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkEvent {
    /// Associated with the access point
    LinkUp,
    /// Association lost
    LinkDown,
    /// A network address was assigned
    AddressAcquired,
    /// The network address was withdrawn
    AddressLost,
}

/// Wireless network link
#[async_trait]
pub trait NetworkLink: Send + Sync + Debug {
    /// Ask the link to join `access_point`
    ///
    /// Success means the request was accepted; progress arrives as events.
    async fn connect(&self, access_point: &AccessPoint) -> Result<()>;

    /// Ask the link to leave the current access point
    async fn disconnect(&self) -> Result<()>;
}

/// Link for hosts with an already configured network
#[derive(Debug)]
pub struct HostLink {
    events: mpsc::Sender<LinkEvent>,
    up: AtomicBool,
}

impl HostLink {
    /// Create a host link and the receiver for its events
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (events, rx) = mpsc::channel(depth.max(1));
        (
            Self {
                events,
                up: AtomicBool::new(false),
            },
            rx,
        )
    }

    async fn emit(&self, event: LinkEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| Error::link("link event receiver dropped"))
    }
}

#[async_trait]
impl NetworkLink for HostLink {
    async fn connect(&self, access_point: &AccessPoint) -> Result<()> {
        if self.up.swap(true, Ordering::SeqCst) {
            debug!("Host link already up");
            return Ok(());
        }
        info!("Using host network for {}", access_point.ssid);
        self.emit(LinkEvent::LinkUp).await?;
        self.emit(LinkEvent::AddressAcquired).await
    }

    async fn disconnect(&self) -> Result<()> {
        if !self.up.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Releasing host network");
        self.emit(LinkEvent::LinkDown).await?;
        self.emit(LinkEvent::AddressLost).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_link_events() {
        let (link, mut rx) = HostLink::new(8);
        let ap = AccessPoint::new("lab", "secret");

        link.connect(&ap).await.unwrap();
        link.connect(&ap).await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::LinkUp));
        assert_eq!(rx.recv().await, Some(LinkEvent::AddressAcquired));
        assert!(rx.try_recv().is_err());

        link.disconnect().await.unwrap();
        assert_eq!(rx.recv().await, Some(LinkEvent::LinkDown));
        assert_eq!(rx.recv().await, Some(LinkEvent::AddressLost));
    }

    #[tokio::test]
    async fn test_host_link_without_receiver() {
        let (link, rx) = HostLink::new(8);
        drop(rx);
        let err = link.connect(&AccessPoint::new("lab", "")).await.unwrap_err();
        assert!(matches!(err, Error::LinkFailure(_)));
    }
}
