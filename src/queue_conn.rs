//! A virtual packet endpoint backed by in-memory queues.
//!
//! ```text
//!  peer sessions ──queue_incoming(p, addr)──► [ inbound queue ] ──► read_from()
//!                                                                    (upper layer)
//!  write_to(p, addr) ──► [ outbound queue per addr ] ──► outgoing_queue(addr)
//!                                                        (per-peer sender)
//! ```
//!
//! Both directions are best effort: a full queue drops the newest packet.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant as StdInstant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::QueueConfig;
use crate::error::{CloseReason, Error, Op, OpError, Result};
use crate::pool::BufferPool;
use crate::registry::{ClientRegistry, OutgoingQueue, PeerAddr, SendQueue};

/// Packet-oriented send/receive surface consumed by an upper session protocol.
#[async_trait]
pub trait PacketConn: Send + Sync {
    type Addr: PeerAddr;

    /// Wait for a packet, copy it into `buf` and return its length and source.
    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, Self::Addr)>;

    /// Send a packet to `addr`.
    async fn write_to(&self, buf: &[u8], addr: &Self::Addr) -> Result<usize>;

    /// Close the endpoint, unblocking pending reads.
    fn close(&self) -> Result<()>;

    fn local_addr(&self) -> &Self::Addr;

    fn set_deadline(&self, _deadline: StdInstant) -> Result<()> {
        Err(Error::NotImplemented("set_deadline"))
    }

    fn set_read_deadline(&self, _deadline: StdInstant) -> Result<()> {
        Err(Error::NotImplemented("set_read_deadline"))
    }

    fn set_write_deadline(&self, _deadline: StdInstant) -> Result<()> {
        Err(Error::NotImplemented("set_write_deadline"))
    }
}

/// A packet buffer plus the address it came from.
struct TaggedPacket<A> {
    data: Vec<u8>,
    addr: A,
}

/// One inbound queue shared by every client, one outbound queue per client address.
///
/// [`queue_incoming`](Self::queue_incoming) feeds packets that
/// [`read_from`](Self::read_from) returns; [`write_to`](Self::write_to) fills the
/// per-address queue returned by [`outgoing_queue`](Self::outgoing_queue).
pub struct QueuePacketConn<A: PeerAddr> {
    clients: Arc<ClientRegistry<A>>,
    local_addr: A,
    recv_tx: mpsc::Sender<TaggedPacket<A>>,
    recv_rx: Mutex<mpsc::Receiver<TaggedPacket<A>>>,
    closed: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    mtu: usize,
    pool: Arc<BufferPool>,
}

impl<A: PeerAddr> QueuePacketConn<A> {
    /// Create a connection that remembers clients for at least `timeout` and
    /// truncates packets to `mtu` bytes.
    ///
    /// Must be called inside a tokio runtime: a background task sweeps idle clients.
    pub fn new(local_addr: A, timeout: Duration, mtu: usize) -> Self {
        Self::with_config(local_addr, QueueConfig::new(mtu, timeout))
    }

    pub fn with_config(local_addr: A, config: QueueConfig) -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(config.queue_size.max(1));
        let conn = Self {
            clients: Arc::new(ClientRegistry::new(config.idle_timeout, config.queue_size)),
            local_addr,
            recv_tx,
            recv_rx: Mutex::new(recv_rx),
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
            mtu: config.mtu,
            pool: Arc::new(BufferPool::new(config.mtu, config.pool_capacity)),
        };

        let clients = conn.clients.clone();
        let pool = conn.pool.clone();
        let closed = conn.closed.clone();
        tokio::spawn(async move {
            sweep_task(clients, pool, closed).await;
        });

        conn
    }

    /// Queue a packet from `addr` for a future `read_from`.
    ///
    /// Never blocks: the packet is dropped if the connection is closed or the
    /// inbound queue is full. Only the first `mtu` bytes are kept.
    pub fn queue_incoming(&self, p: &[u8], addr: A) {
        if self.closed.is_cancelled() {
            return;
        }
        let data = self.pool.copy_from(p);
        if let Err(e) = self.recv_tx.try_send(TaggedPacket { data, addr }) {
            let packet = match e {
                mpsc::error::TrySendError::Full(p) | mpsc::error::TrySendError::Closed(p) => p,
            };
            trace!("Inbound queue full, dropping {} bytes from {}", packet.data.len(), packet.addr);
            self.restore(packet.data);
        }
    }

    /// The outbound queue for `addr`, created on first use.
    pub fn outgoing_queue(&self, addr: &A) -> OutgoingQueue {
        self.send_queue(addr).into_queue()
    }

    /// Look up the queue for `addr`, recycling whatever a replaced entry still held.
    fn send_queue(&self, addr: &A) -> SendQueue {
        let (queue, drained) = self.clients.send_queue(addr);
        for buf in drained {
            self.restore(buf);
        }
        queue
    }

    /// Hand a buffer back to the pool once done with it. Skipping this only costs
    /// an allocation later.
    pub fn restore(&self, p: Vec<u8>) {
        if p.capacity() >= self.mtu {
            self.pool.put(p);
        }
    }

    /// Wait for a packet queued by `queue_incoming`.
    pub async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, A)> {
        if self.closed.is_cancelled() {
            return Err(self.op_error(Op::Read));
        }
        let mut rx = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.op_error(Op::Read)),
            rx = self.recv_rx.lock() => rx,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.op_error(Op::Read)),
            packet = rx.recv() => match packet {
                Some(packet) => {
                    let n = packet.data.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet.data[..n]);
                    self.restore(packet.data);
                    Ok((n, packet.addr))
                }
                None => Err(self.op_error(Op::Read)),
            },
        }
    }

    /// Queue a packet for `addr`. Only the first `mtu` bytes are kept.
    ///
    /// A full outbound queue drops the packet silently and still reports the whole
    /// of `p` as written; the layer above tolerates loss.
    pub fn write_to(&self, p: &[u8], addr: &A) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(self.op_error(Op::Write));
        }
        let buf = self.pool.copy_from(p);
        let n = buf.len();
        match self.send_queue(addr).try_send(buf) {
            Ok(()) => Ok(n),
            Err(buf) => {
                trace!("Outbound queue for {} full, dropping {} bytes", addr, n);
                self.restore(buf);
                Ok(p.len())
            }
        }
    }

    /// Close with the default reason.
    pub fn close(&self) -> Result<()> {
        self.close_with_reason(None)
    }

    /// Unblock pending operations and make all later ones fail with `reason`.
    ///
    /// Only the first call has any effect; later calls return a close error
    /// carrying the stored reason.
    pub fn close_with_reason(&self, reason: Option<CloseReason>) -> Result<()> {
        let reason = reason.unwrap_or(CloseReason::Closed);
        if self.close_reason.set(reason).is_err() {
            return Err(self.op_error(Op::Close));
        }
        self.closed.cancel();
        debug!("QueuePacketConn {} closed", self.local_addr);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// The address passed to the constructor.
    pub fn local_addr(&self) -> &A {
        &self.local_addr
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn clients(&self) -> &ClientRegistry<A> {
        &self.clients
    }

    fn op_error(&self, op: Op) -> Error {
        Error::Op(OpError {
            op,
            addr: Some(self.local_addr.to_string()),
            reason: self.close_reason.get().cloned().unwrap_or(CloseReason::Closed),
        })
    }
}

#[async_trait]
impl<A: PeerAddr> PacketConn for QueuePacketConn<A> {
    type Addr = A;

    async fn read_from(&self, buf: &mut [u8]) -> Result<(usize, A)> {
        QueuePacketConn::read_from(self, buf).await
    }

    async fn write_to(&self, buf: &[u8], addr: &A) -> Result<usize> {
        QueuePacketConn::write_to(self, buf, addr)
    }

    fn close(&self) -> Result<()> {
        QueuePacketConn::close(self)
    }

    fn local_addr(&self) -> &A {
        &self.local_addr
    }
}

impl<A: PeerAddr> Drop for QueuePacketConn<A> {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Periodically evicts idle clients and recycles their queued buffers.
async fn sweep_task<A: PeerAddr>(
    clients: Arc<ClientRegistry<A>>,
    pool: Arc<BufferPool>,
    closed: CancellationToken,
) {
    let period = (clients.timeout() / 2).max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            now = interval.tick() => {
                for buf in clients.remove_expired(now) {
                    pool.put(buf);
                }
            }
            _ = closed.cancelled() => {
                trace!("Client sweep stopped");
                return;
            }
        }
    }
}
