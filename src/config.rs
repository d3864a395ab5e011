//! Configuration for sessions and the packet multiplexer.
//!
//! There is no file or command-line layer here; callers build these structs
//! directly, starting from `Default`.

use std::time::Duration;

/// Default maximum packet payload for [`QueuePacketConn`](crate::QueuePacketConn).
pub const DEFAULT_MTU: usize = 1400;

/// Default capacity of the inbound queue and of every per-address outbound queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1024;

/// Default label of the data channel a session opens.
pub const DATA_CHANNEL_LABEL: &str = "snowflake";

/// Settings handed to the peer-connection capability for every new connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// STUN/TURN server URLs.
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Settings for a [`PeerSession`](crate::PeerSession) and its reconnect loop.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Label of the data channel.
    pub label: String,
    /// Passed to the capability when a peer connection is created.
    pub peer: PeerConfig,
    /// How long to wait before retrying after a missing answer.
    pub reconnect_timeout: Duration,
    /// Pause before retrying a cycle that failed before reaching the answer stage.
    pub retry_delay: Duration,
    /// Capacity of the in-memory pipe behind `read`.
    pub read_buffer_size: usize,
    /// Interval of the traffic log, `None` disables it.
    pub stats_interval: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            label: DATA_CHANNEL_LABEL.to_string(),
            peer: PeerConfig::default(),
            reconnect_timeout: Duration::from_secs(5),
            retry_delay: Duration::from_secs(1),
            read_buffer_size: 64 * 1024,
            stats_interval: Some(Duration::from_secs(5)),
        }
    }
}

/// Settings for a [`QueuePacketConn`](crate::QueuePacketConn).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum packet size; longer payloads are truncated.
    pub mtu: usize,
    /// Idle time after which a client's outbound queue is evicted.
    pub idle_timeout: Duration,
    /// Capacity of the inbound queue and of each outbound queue.
    pub queue_size: usize,
    /// Maximum number of idle buffers the pool keeps.
    pub pool_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            idle_timeout: Duration::from_secs(60),
            queue_size: DEFAULT_QUEUE_SIZE,
            pool_capacity: DEFAULT_QUEUE_SIZE,
        }
    }
}

impl QueueConfig {
    pub fn new(mtu: usize, idle_timeout: Duration) -> Self {
        Self {
            mtu,
            idle_timeout,
            ..Default::default()
        }
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size.max(1);
        self
    }
}
