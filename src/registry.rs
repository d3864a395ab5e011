//! Address-keyed directory of outbound packet queues with idle eviction.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Anything usable as a remote (or local) packet address.
pub trait PeerAddr: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

impl<T> PeerAddr for T where T: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Read side of one address's outbound queue.
///
/// Clones share the same queue. Once the address is evicted, `recv` drains what is
/// left and then returns `None`.
#[derive(Clone)]
pub struct OutgoingQueue {
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>>,
    generation: u64,
}

impl OutgoingQueue {
    /// Wait for the next packet.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    /// Take a packet if one is ready and no other task is receiving.
    pub fn try_recv(&self) -> Option<Vec<u8>> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Identifies the registry entry this queue belongs to. A re-created entry for
    /// the same address gets a new generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Both sides of an address's outbound queue, as handed to writers.
#[derive(Clone)]
pub struct SendQueue {
    tx: mpsc::Sender<Vec<u8>>,
    queue: OutgoingQueue,
}

impl SendQueue {
    /// Enqueue without waiting. A full queue hands the packet back.
    pub fn try_send(&self, packet: Vec<u8>) -> Result<(), Vec<u8>> {
        self.tx.try_send(packet).map_err(|e| match e {
            TrySendError::Full(p) | TrySendError::Closed(p) => p,
        })
    }

    pub fn queue(&self) -> &OutgoingQueue {
        &self.queue
    }

    pub fn into_queue(self) -> OutgoingQueue {
        self.queue
    }
}

struct ClientEntry {
    queue: SendQueue,
    last_seen: Instant,
}

impl ClientEntry {
    /// Pull out whatever is still queued, if no reader is holding the queue.
    fn drain(self) -> Vec<Vec<u8>> {
        let mut drained = Vec::new();
        if let Ok(mut rx) = self.queue.queue.rx.try_lock() {
            while let Ok(p) = rx.try_recv() {
                drained.push(p);
            }
        }
        drained
    }
}

/// Maps addresses to bounded outbound queues, forgetting addresses that have been
/// idle for longer than the timeout.
pub struct ClientRegistry<A: PeerAddr> {
    timeout: Duration,
    queue_size: usize,
    clients: Mutex<HashMap<A, ClientEntry>>,
    next_generation: AtomicU64,
}

impl<A: PeerAddr> ClientRegistry<A> {
    pub fn new(timeout: Duration, queue_size: usize) -> Self {
        Self {
            timeout,
            queue_size: queue_size.max(1),
            clients: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<A, ClientEntry>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Return the queue for `addr`, refreshing its last-seen time, or create one.
    ///
    /// An entry that has already outlived the timeout is replaced, even if the
    /// sweep has not reached it yet. Packets still queued in a replaced entry are
    /// returned alongside so the caller can recycle their buffers.
    pub fn send_queue(&self, addr: &A) -> (SendQueue, Vec<Vec<u8>>) {
        let now = Instant::now();
        let mut clients = self.lock();
        let mut drained = Vec::new();

        if let Some(entry) = clients.get_mut(addr) {
            if now.saturating_duration_since(entry.last_seen) <= self.timeout {
                entry.last_seen = now;
                return (entry.queue.clone(), drained);
            }
            trace!("Replacing expired queue for {}", addr);
            if let Some(stale) = clients.remove(addr) {
                drained = stale.drain();
            }
        }

        let (tx, rx) = mpsc::channel(self.queue_size);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let queue = SendQueue {
            tx,
            queue: OutgoingQueue {
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                generation,
            },
        };
        clients.insert(
            addr.clone(),
            ClientEntry {
                queue: queue.clone(),
                last_seen: now,
            },
        );
        debug!("New client queue for {} (generation {})", addr, generation);
        (queue, drained)
    }

    /// Evict every entry idle since before `now - timeout`.
    ///
    /// Returns the packets that were still queued for evicted addresses so the
    /// caller can recycle their buffers. Queues that a reader is currently draining
    /// are left to that reader.
    pub fn remove_expired(&self, now: Instant) -> Vec<Vec<u8>> {
        let expired: Vec<ClientEntry> = {
            let mut clients = self.lock();
            let keys: Vec<A> = clients
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.last_seen) > self.timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| {
                    debug!("Evicting idle client {}", k);
                    clients.remove(k)
                })
                .collect()
        };
        expired.into_iter().flat_map(ClientEntry::drain).collect()
    }

    pub fn contains(&self, addr: &A) -> bool {
        self.lock().contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ClientRegistry<String> {
        ClientRegistry::new(Duration::from_secs(10), 4)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_queue_reuses_entry() {
        let registry = registry();
        let a = registry.send_queue(&"a".to_string()).0;
        let b = registry.send_queue(&"a".to_string()).0;
        assert_eq!(a.queue().generation(), b.queue().generation());
        assert_eq!(registry.len(), 1);

        a.try_send(b"x".to_vec()).unwrap();
        assert_eq!(b.queue().recv().await.unwrap(), b"x");
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_is_bounded() {
        let registry = ClientRegistry::new(Duration::from_secs(10), 1);
        let q = registry.send_queue(&"a".to_string()).0;
        assert!(q.try_send(b"1".to_vec()).is_ok());
        assert_eq!(q.try_send(b"2".to_vec()).unwrap_err(), b"2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entry_is_evicted() {
        let registry = registry();
        let addr = "a".to_string();
        let first = registry.send_queue(&addr).0;
        first.try_send(b"pending".to_vec()).unwrap();

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(registry.remove_expired(Instant::now()).is_empty());
        assert!(registry.contains(&addr));

        tokio::time::advance(Duration::from_secs(11)).await;
        let drained = registry.remove_expired(Instant::now());
        assert_eq!(drained, vec![b"pending".to_vec()]);
        assert!(registry.is_empty());

        let fresh = registry.send_queue(&addr).0;
        assert_ne!(fresh.queue().generation(), first.queue().generation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_refreshes_entry() {
        let registry = registry();
        let addr = "a".to_string();
        let first = registry.send_queue(&addr).0;

        tokio::time::advance(Duration::from_secs(8)).await;
        let _ = registry.send_queue(&addr);
        tokio::time::advance(Duration::from_secs(8)).await;

        assert!(registry.remove_expired(Instant::now()).is_empty());
        let again = registry.send_queue(&addr).0;
        assert_eq!(again.queue().generation(), first.queue().generation());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_replaced_on_access() {
        let registry = registry();
        let addr = "a".to_string();
        let first = registry.send_queue(&addr).0;

        first.try_send(b"left over".to_vec()).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let (fresh, drained) = registry.send_queue(&addr);
        assert_ne!(fresh.queue().generation(), first.queue().generation());
        assert_eq!(drained, vec![b"left over".to_vec()]);
        assert_eq!(registry.len(), 1);

        let (_, drained) = registry.send_queue(&addr);
        assert!(drained.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_ends_draining_reader() {
        let registry = registry();
        let addr = "a".to_string();
        let queue = registry.send_queue(&addr).0.into_queue();

        let reader = tokio::spawn(async move { queue.recv().await });
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(11)).await;
        registry.remove_expired(Instant::now());
        assert_eq!(reader.await.unwrap(), None);
    }
}
