//! Bridges one remote peer's data channel into a shared [`QueuePacketConn`].
//!
//! Messages from the channel become inbound packets tagged with the peer's
//! address; packets written to that address go out over the channel.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::Result;
use crate::queue_conn::QueuePacketConn;
use crate::registry::PeerAddr;
use crate::transport::{ChannelEvent, DataChannel};

/// Pump packets between `channel` and `conn` until the channel closes, the
/// connection closes, or `cancel` fires.
///
/// A failed send on the channel ends the relay with that error.
pub async fn serve_peer<A: PeerAddr>(
    conn: Arc<QueuePacketConn<A>>,
    addr: A,
    channel: Arc<dyn DataChannel>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    debug!("Relaying {} over data channel {:?}", addr, channel.label());
    let mut queue = conn.outgoing_queue(&addr);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Message(data)) => {
                    trace!("Received {} bytes from {}", data.len(), addr);
                    conn.queue_incoming(&data, addr.clone());
                }
                Some(ChannelEvent::Open) => {}
                Some(ChannelEvent::Close) | None => {
                    debug!("Data channel for {} closed", addr);
                    return Ok(());
                }
            },
            packet = queue.recv() => match packet {
                Some(p) => {
                    let result = channel.send(Bytes::copy_from_slice(&p)).await;
                    trace!("Sent {} bytes to {}", p.len(), addr);
                    conn.restore(p);
                    result?;
                }
                None => {
                    // Evicted while idle; pick up the replacement queue.
                    trace!("Outbound queue for {} evicted", addr);
                    queue = conn.outgoing_queue(&addr);
                }
            },
            _ = conn.closed() => {
                debug!("Packet connection closed, stopping relay for {}", addr);
                return Ok(());
            }
            _ = cancel.cancelled() => {
                debug!("Relay for {} cancelled", addr);
                return Ok(());
            }
        }
    }
}
