//! Traffic byte counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

/// Totals since the last log interval.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub inbound: u64,
    pub outbound: u64,
    pub in_events: u64,
    pub out_events: u64,
}

/// Counts bytes and messages in each direction. Purely observational.
#[derive(Debug, Default)]
pub struct ByteCounter {
    inbound: AtomicU64,
    outbound: AtomicU64,
    in_events: AtomicU64,
    out_events: AtomicU64,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_inbound(&self, n: usize) {
        self.inbound.fetch_add(n as u64, Ordering::Relaxed);
        self.in_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_outbound(&self, n: usize) {
        self.outbound.fetch_add(n as u64, Ordering::Relaxed);
        self.out_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            inbound: self.inbound.load(Ordering::Relaxed),
            outbound: self.outbound.load(Ordering::Relaxed),
            in_events: self.in_events.load(Ordering::Relaxed),
            out_events: self.out_events.load(Ordering::Relaxed),
        }
    }

    fn take(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            inbound: self.inbound.swap(0, Ordering::Relaxed),
            outbound: self.outbound.swap(0, Ordering::Relaxed),
            in_events: self.in_events.swap(0, Ordering::Relaxed),
            out_events: self.out_events.swap(0, Ordering::Relaxed),
        }
    }

    /// Log and reset the counters every `interval` until `cancel` fires.
    /// Quiet intervals are not logged.
    pub fn spawn_logger(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let s = self.take();
                        if s.in_events > 0 || s.out_events > 0 {
                            info!(
                                "Traffic Bytes (in|out): {} | {} -- ({} OnMessages, {} Sends)",
                                s.inbound, s.outbound, s.in_events, s.out_events
                            );
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }
}
