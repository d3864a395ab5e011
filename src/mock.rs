//! In-memory implementations for testing and simulation
//!
//! Provides a peer-connection factory and a broker that never touch the network.
//! Negotiation completes instantly: setting a local description "gathers" one
//! candidate, and applying an answer opens the data channel (unless disabled).
//! Tests drive the remote side through [`MockDataChannel::deliver`] and
//! [`MockDataChannel::remote_close`].

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::signaling::{Broker, SdpType, SessionDescription};
use crate::transport::{ChannelEvent, DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted behavior for mock peer connections.
#[derive(Debug, Clone)]
pub struct MockOptions {
    /// `create_offer` fails.
    pub fail_offer: bool,
    /// Creating a data channel also reports a remote-initiated one.
    pub remote_channel: bool,
    /// Applying an answer opens the data channel.
    pub auto_open: bool,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            fail_offer: false,
            remote_channel: false,
            auto_open: true,
        }
    }
}

// ============================================================================
// Mock Data Channel
// ============================================================================

/// Data channel that records what is sent and lets tests inject remote traffic.
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
    events: Mutex<Option<mpsc::UnboundedSender<ChannelEvent>>>,
}

impl MockDataChannel {
    /// Create a channel in the not-yet-open state.
    pub fn new(label: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            label: label.into(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            events: Mutex::new(Some(tx)),
        });
        (channel, rx)
    }

    fn emit(&self, event: ChannelEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Mark the channel open and fire [`ChannelEvent::Open`].
    pub fn open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.emit(ChannelEvent::Open);
        }
    }

    /// Inject a message from the remote peer.
    pub fn deliver(&self, data: impl Into<Bytes>) {
        self.emit(ChannelEvent::Message(data.into()));
    }

    /// Simulate the remote peer closing the channel.
    pub fn remote_close(&self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.emit(ChannelEvent::Close);
        }
        lock(&self.events).take();
    }

    /// Every message sent so far, in order.
    pub fn sent_messages(&self) -> Vec<Bytes> {
        lock(&self.sent).clone()
    }

    /// Everything sent so far, concatenated.
    pub fn sent_bytes(&self) -> Vec<u8> {
        lock(&self.sent).iter().flat_map(|m| m.iter().copied()).collect()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Transport("data channel not open".to_string()));
        }
        lock(&self.sent).push(data);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shutdown();
    }
}

// ============================================================================
// Mock Peer Connection
// ============================================================================

/// Peer connection that negotiates instantly.
pub struct MockPeerConnection {
    id: u64,
    options: MockOptions,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    channel: Mutex<Option<Arc<MockDataChannel>>>,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<SessionDescription>>,
    closed: AtomicBool,
}

impl MockPeerConnection {
    fn emit(&self, event: PeerEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// The data channel created on this connection, if any.
    pub fn channel(&self) -> Option<Arc<MockDataChannel>> {
        lock(&self.channel).clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.remote).clone()
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<(Arc<dyn DataChannel>, mpsc::UnboundedReceiver<ChannelEvent>)> {
        if self.is_closed() {
            return Err(Error::Transport("peer connection closed".to_string()));
        }
        let (channel, events) = MockDataChannel::new(label);
        *lock(&self.channel) = Some(channel.clone());

        if self.options.remote_channel {
            self.emit(PeerEvent::DataChannel("remote".to_string()));
        }
        self.emit(PeerEvent::NegotiationNeeded);
        Ok((channel, events))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.options.fail_offer {
            return Err(Error::Negotiation("mock offer failure".to_string()));
        }
        Ok(SessionDescription::offer(format!("mock-offer-{}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *lock(&self.local) = Some(desc);
        self.emit(PeerEvent::IceCandidate(format!("candidate:mock-{}", self.id)));
        self.emit(PeerEvent::IceGatheringComplete);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.local).clone()
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if desc.kind() != SdpType::Answer {
            return Err(Error::Negotiation("expected an answer".to_string()));
        }
        *lock(&self.remote) = Some(desc);
        if self.options.auto_open {
            if let Some(channel) = self.channel() {
                channel.open();
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(channel) = self.channel() {
            channel.shutdown();
        }
        lock(&self.events).take();
    }
}

// ============================================================================
// Mock Factory
// ============================================================================

/// Creates [`MockPeerConnection`]s and keeps them for inspection.
pub struct MockPeerFactory {
    options: Mutex<MockOptions>,
    connections: Mutex<Vec<Arc<MockPeerConnection>>>,
    next_id: AtomicU64,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Self::with_options(MockOptions::default())
    }

    pub fn with_options(options: MockOptions) -> Arc<Self> {
        Arc::new(Self {
            options: Mutex::new(options),
            connections: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Change the behavior of connections created from now on.
    pub fn set_options(&self, options: MockOptions) {
        *lock(&self.options) = options;
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.connections).clone()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Data channels of all connections, oldest first.
    pub fn channels(&self) -> Vec<Arc<MockDataChannel>> {
        self.connections().iter().filter_map(|c| c.channel()).collect()
    }

    pub fn latest_channel(&self) -> Option<Arc<MockDataChannel>> {
        self.connections().last().and_then(|c| c.channel())
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn new_peer_connection(
        &self,
        _config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockPeerConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            options: lock(&self.options).clone(),
            events: Mutex::new(Some(tx)),
            channel: Mutex::new(None),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        lock(&self.connections).push(connection.clone());
        Ok((connection, rx))
    }
}

// ============================================================================
// Mock Broker
// ============================================================================

/// Broker that answers every offer, optionally failing the first few attempts.
#[derive(Default)]
pub struct MockBroker {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A broker whose first `failures` negotiations fail.
    pub fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(failures),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn negotiate(&self, offer: SessionDescription) -> Result<SessionDescription> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Broker("mock broker unavailable".to_string()));
        }
        Ok(SessionDescription::answer(format!("answer-to-{}", offer.sdp())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_negotiation_opens_channel() {
        let factory = MockPeerFactory::new();
        let (pc, mut events) = factory
            .new_peer_connection(&PeerConfig::default())
            .await
            .unwrap();

        let (dc, mut channel_events) = pc.create_data_channel("test").await.unwrap();
        assert_eq!(events.recv().await, Some(PeerEvent::NegotiationNeeded));

        let offer = pc.create_offer().await.unwrap();
        pc.set_local_description(offer.clone()).await.unwrap();
        assert!(matches!(events.recv().await, Some(PeerEvent::IceCandidate(_))));
        assert_eq!(events.recv().await, Some(PeerEvent::IceGatheringComplete));
        assert_eq!(pc.local_description(), Some(offer));

        pc.set_remote_description(SessionDescription::answer("a"))
            .await
            .unwrap();
        assert_eq!(channel_events.recv().await, Some(ChannelEvent::Open));
        assert!(dc.is_open());

        dc.send(Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(factory.latest_channel().unwrap().sent_bytes(), b"hi");

        pc.close().await;
        assert_eq!(channel_events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(channel_events.recv().await, None);
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_mock_rejects_offer_as_remote() {
        let factory = MockPeerFactory::new();
        let (pc, _events) = factory
            .new_peer_connection(&PeerConfig::default())
            .await
            .unwrap();
        let result = pc.set_remote_description(SessionDescription::offer("o")).await;
        assert!(matches!(result, Err(Error::Negotiation(_))));
    }

    #[tokio::test]
    async fn test_mock_broker_failures() {
        let broker = MockBroker::failing(1);
        assert!(broker.negotiate(SessionDescription::offer("x")).await.is_err());
        let answer = broker.negotiate(SessionDescription::offer("x")).await.unwrap();
        assert_eq!(answer.sdp(), "answer-to-x");
        assert_eq!(broker.calls(), 2);
    }
}
