//! Offer/answer payloads, the broker seam, and the session's single-slot signal lines.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::error::{Error, Result};

/// Whether a description is an offer or an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An opaque negotiation payload. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    kind: SdpType,
    sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn kind(&self) -> SdpType {
        self.kind
    }

    pub fn sdp(&self) -> &str {
        &self.sdp
    }

    /// JSON form, `{"type":"offer","sdp":"..."}`, as relayed out of band.
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn deserialize(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

/// External signaling service that trades a local offer for the remote answer.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn negotiate(&self, offer: SessionDescription) -> Result<SessionDescription>;
}

/// A one-slot line: posting never blocks, a pending value is never overwritten.
pub(crate) struct Slot<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
}

impl<T> Slot<T> {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Post without waiting. Returns `false` if a value is already pending.
    pub(crate) fn post(&self, value: T) -> bool {
        self.tx.try_send(value).is_ok()
    }

    /// Post, waiting for the slot to free up.
    pub(crate) async fn send(&self, value: T) {
        let _ = self.tx.send(value).await;
    }

    /// Wait for the next value.
    pub(crate) async fn recv(&self) -> T {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(value) => value,
            // The sender lives as long as the slot.
            None => std::future::pending().await,
        }
    }

    /// Drop a pending value, if any and if no one is waiting on the slot.
    pub(crate) fn clear(&self) {
        if let Ok(mut rx) = self.rx.try_lock() {
            while rx.try_recv().is_ok() {}
        }
    }
}

/// The signal lines a session's tasks post to.
pub(crate) struct Signals {
    pub(crate) offer: Slot<SessionDescription>,
    pub(crate) answer: Slot<Option<SessionDescription>>,
    pub(crate) error: Slot<Error>,
    pub(crate) reset: Slot<()>,
    pub(crate) fatal: Slot<crate::error::Violation>,
}

impl Signals {
    pub(crate) fn new() -> Self {
        Self {
            offer: Slot::new(),
            answer: Slot::new(),
            error: Slot::new(),
            reset: Slot::new(),
            fatal: Slot::new(),
        }
    }

    /// Forget negotiation leftovers from a previous cycle.
    pub(crate) fn clear_negotiation(&self) {
        self.offer.clear();
        self.answer.clear();
        self.error.clear();
        self.reset.clear();
    }
}
