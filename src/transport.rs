//! Peer-connection capability
//!
//! The session only talks to peer connections and data channels through these
//! traits. Lifecycle notifications arrive as events on a channel instead of
//! callbacks, so the session dispatches them from its own tasks.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::PeerConfig;
use crate::error::Result;
use crate::signaling::SessionDescription;

/// Notifications from a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local change (such as a new data channel) needs an offer.
    NegotiationNeeded,
    /// A local ICE candidate was gathered.
    IceCandidate(String),
    /// Candidate gathering finished; the local description is final.
    IceGatheringComplete,
    /// The remote side opened a data channel with this label.
    DataChannel(String),
}

/// Notifications from a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Close,
    Message(Bytes),
}

/// A bidirectional message channel inside a peer connection.
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Send one message to the peer.
    async fn send(&self, data: Bytes) -> Result<()>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// One negotiated connection to a remote peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create a data channel; negotiation is requested through
    /// [`PeerEvent::NegotiationNeeded`].
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<(Arc<dyn DataChannel>, mpsc::UnboundedReceiver<ChannelEvent>)>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// The current local description, including gathered candidates.
    fn local_description(&self) -> Option<SessionDescription>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Close the connection and, with it, its data channels.
    async fn close(&self);
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn new_peer_connection(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)>;
}
