//! The seam between the negotiation state machine and a concrete peer
//! connection. `connection::RtcTransport` is the webrtc-rs implementation.

use crate::error::TransportError;
use crate::peer::media::MediaTrack;
use crate::peer::types::{CandidateRecord, ConnectionStatus, MediaKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub enum TransportEvent {
    NegotiationNeeded,
    ConnectionStateChange(ConnectionStatus),
    Track(Arc<MediaTrack>),
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<CandidateRecord>),
    DataChannel(Arc<dyn DataChannelTransport>),
}

impl TransportEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TransportEvent::NegotiationNeeded => "negotiation-needed",
            TransportEvent::ConnectionStateChange(_) => "connection-state-change",
            TransportEvent::Track(_) => "track-received",
            TransportEvent::IceCandidate(_) => "local-candidate-discovered",
            TransportEvent::DataChannel(_) => "data-channel-established",
        }
    }
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::ConnectionStateChange(status) => {
                write!(f, "{}({:?})", self.name(), status)
            }
            TransportEvent::Track(track) => write!(f, "{}({})", self.name(), track.id()),
            TransportEvent::DataChannel(dc) => write!(f, "{}({})", self.name(), dc.label()),
            _ => f.write_str(self.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataChannelEvent {
    Open,
    Message(String),
    Close,
}

/// An outgoing transceiver slot. Its kind is fixed when it is created, even
/// while no track is bound.
#[async_trait]
pub trait TrackSender: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn track(&self) -> Option<Arc<MediaTrack>>;

    async fn replace_track(&self, track: Option<Arc<MediaTrack>>) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DataChannelTransport: Send + Sync {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<(), TransportError>;

    /// Events buffered since the channel was wrapped. Only the first caller
    /// gets the receiver.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<DataChannelEvent>>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Events buffered since construction. Only the first caller gets the
    /// receiver.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<Arc<dyn TrackSender>, TransportError>;

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn local_description(&self) -> Option<SessionDescription>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: CandidateRecord) -> Result<(), TransportError>;

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannelTransport>, TransportError>;

    fn connection_state(&self) -> ConnectionStatus;

    async fn close(&self) -> Result<(), TransportError>;
}

/// A registered reaction. Dropping or disposing it stops the reaction.
#[derive(Debug)]
pub struct Subscription {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn dispose(self) {
        self.handle.abort();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn disposing_subscription_aborts_reaction() {
        let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
        let handle = tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let sub = Subscription::new("sleeper", handle);
        assert!(sub.is_active());
        sub.dispose();
        // the sender is dropped with the aborted task
        assert_eq!(rx.recv().await, None);
    }
}
