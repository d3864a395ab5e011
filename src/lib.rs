//! Reconnecting peer data-channel transport for relay clients
//!
//! This crate provides the two halves of a relay transport built on top of a
//! peer-connection capability (anything implementing [`PeerConnectionFactory`]):
//!
//! - [`PeerSession`]: a single byte stream to a remote peer that outlives the data
//!   channel carrying it. Writes made while no channel is open are buffered and
//!   flushed, in order, when the next one opens.
//! - [`QueuePacketConn`]: a packet endpoint that multiplexes many remote peers
//!   over in-memory queues, for an upper session protocol to run on.
//!
//! # Architecture
//!
//! ```text
//! Client side                              Relay side
//!
//! Application                              upper session protocol
//!     ↓                                        ↓
//! PeerSession ◄── ReconnectLoop            QueuePacketConn  (read_from / write_to)
//!     ↓                                        ↑↓
//! DataChannel                              relay::serve_peer (one per peer)
//!     ↓                                        ↑↓
//! PeerConnection  ════ signaling ════      DataChannel
//! (Broker or manual copy & paste)
//! ```
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use snowlink::{PeerSession, ReconnectLoop, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = PeerSession::new(SessionConfig::default(), factory, Some(broker));
//!     let driver = ReconnectLoop::new(session.clone()).spawn();
//!
//!     // Writes are accepted immediately and delivered once a channel is open
//!     session.write(b"hello").await?;
//!
//!     let mut buf = vec![0u8; 1024];
//!     let n = session.read(&mut buf).await?;
//!
//!     session.close().await?;
//!     driver.await??;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod mock;
pub mod pool;
pub mod queue_conn;
pub mod reconnect;
pub mod registry;
pub mod relay;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod transport;

// Re-export main types
pub use buffer::BufferedWriter;
pub use config::{PeerConfig, QueueConfig, SessionConfig, DATA_CHANNEL_LABEL, DEFAULT_MTU, DEFAULT_QUEUE_SIZE};
pub use error::{CloseReason, Error, Op, OpError, Result, Violation};
pub use pool::BufferPool;
pub use queue_conn::{PacketConn, QueuePacketConn};
pub use reconnect::ReconnectLoop;
pub use registry::{ClientRegistry, OutgoingQueue, PeerAddr, SendQueue};
pub use relay::serve_peer;
pub use session::{PeerSession, SessionState};
pub use signaling::{Broker, SdpType, SessionDescription};
pub use stats::{ByteCounter, TrafficSnapshot};
pub use transport::{ChannelEvent, DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent};
