//! The loop that keeps a [`PeerSession`] connected.
//!
//! Each cycle builds a fresh peer connection and data channel, hands off the
//! offer, waits for the answer in the background, and then blocks until the
//! session asks for a reset. Writes made while a cycle is in progress are
//! buffered by the session and flushed when the new channel opens.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{PeerSession, SessionState, Wake};

/// Drives the establish cycle of one session until it is closed.
pub struct ReconnectLoop {
    session: Arc<PeerSession>,
}

impl ReconnectLoop {
    pub fn new(session: Arc<PeerSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    /// Run the loop on its own task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }

    /// Run until the session closes.
    ///
    /// Returns an error only for protocol violations, which are not retried.
    pub async fn run(&self) -> Result<()> {
        let session = &self.session;
        loop {
            if session.is_closed() {
                return Ok(());
            }
            info!("Establishing WebRTC connection...");

            if let Err(e) = self.establish().await {
                match e {
                    Error::Fatal(violation) => return Err(Error::Fatal(violation)),
                    e if session.is_closed() => {
                        debug!("Establish interrupted by close: {}", e);
                        return Ok(());
                    }
                    e => {
                        warn!("Failed to establish WebRTC connection: {}", e);
                        let delay = session.config().retry_delay;
                        if !self.pause(delay).await {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            match session.wait_reset().await {
                Wake::Reset => info!(" --- connection reset ---"),
                Wake::Negotiation(e) => {
                    warn!("Negotiation failed: {}", e);
                    session.close_connection().await;
                }
                Wake::Fatal(violation) => return Err(Error::Fatal(violation)),
                Wake::Closed => return Ok(()),
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        let session = &self.session;
        session.prepare_connection().await?;
        session.establish_data_channel().await?;
        session.send_offer().await?;
        session.receive_answer();
        Ok(())
    }

    /// Sleep unless the session closes first. Returns `false` on close.
    async fn pause(&self, delay: Duration) -> bool {
        let mut state = self.session.subscribe_state();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = state.wait_for(|s| *s == SessionState::Closed) => false,
        }
    }
}
