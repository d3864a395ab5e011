//! A byte stream over a peer data channel that survives reconnections.
//!
//! ```text
//!  write() ──► channel active? ──yes──► DataChannel::send
//!                    │ no
//!                    ▼
//!              BufferedWriter ──(flushed on Open)──► DataChannel::send
//!
//!  ChannelEvent::Message ──► pipe ──► read()
//! ```
//!
//! The pipe behind `read` is created once, so the reader never sees which data
//! channel a byte arrived on. Every lifecycle notification from the capability is
//! handled by a task owned by the session and completes by posting to one of the
//! signal lines in [`Signals`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Instant as StdInstant;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::BufferedWriter;
use crate::config::SessionConfig;
use crate::error::{CloseReason, Error, Op, OpError, Result, Violation};
use crate::signaling::{Broker, SdpType, SessionDescription, Signals, Slot};
use crate::stats::ByteCounter;
use crate::transport::{ChannelEvent, DataChannel, PeerConnection, PeerConnectionFactory, PeerEvent};

/// Where a session is in its establish cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No data channel; either never started or reset and waiting for the next cycle
    Idle,
    /// Replacing the peer connection
    Preparing,
    /// Data channel created, waiting for the local offer
    AwaitingOffer,
    /// Offer handed off, waiting for the answer
    AwaitingAnswer,
    /// Data channel open, writes go straight out
    Open,
    /// Closed for good
    Closed,
}

/// What ended a wait for the current cycle.
pub(crate) enum Wake {
    Reset,
    Negotiation(Error),
    Fatal(Violation),
    Closed,
}

/// Write side state. The active channel and the pending buffer change together.
struct WriteState {
    channel: Option<Arc<dyn DataChannel>>,
    pending: BufferedWriter,
}

/// One end-to-end logical connection to a remote peer.
///
/// Owns at most one peer connection and one data channel at a time; the
/// [`ReconnectLoop`](crate::ReconnectLoop) replaces them whenever the channel is
/// lost.
pub struct PeerSession {
    config: SessionConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    broker: Option<Arc<dyn Broker>>,

    /// Current peer connection
    pc: StdMutex<Option<Arc<dyn PeerConnection>>>,

    /// Bumped for every new peer connection; events tagged with an older
    /// generation are ignored. Posts to the signal lines happen under this lock.
    generation: StdMutex<u64>,

    writes: Mutex<WriteState>,

    /// Read end of the pipe behind `read`
    recv_pipe: Mutex<DuplexStream>,

    /// Write end of the pipe, fed by data-channel messages
    write_pipe: Mutex<DuplexStream>,

    signals: Arc<Signals>,

    /// Tasks belonging to the current establish cycle
    cycle_tasks: StdMutex<Vec<JoinHandle<()>>>,

    state: watch::Sender<SessionState>,
    offers: watch::Sender<Option<SessionDescription>>,
    stats: Arc<ByteCounter>,

    closed: CancellationToken,
    close_once: AtomicBool,
}

impl PeerSession {
    /// Create a session. With no broker, offers are surfaced for manual relay.
    ///
    /// Must be called inside a tokio runtime when traffic logging is enabled.
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        broker: Option<Arc<dyn Broker>>,
    ) -> Arc<Self> {
        let (recv_pipe, write_pipe) = tokio::io::duplex(config.read_buffer_size.max(1));
        let stats = Arc::new(ByteCounter::new());
        let closed = CancellationToken::new();

        if let Some(interval) = config.stats_interval {
            stats.clone().spawn_logger(interval, closed.clone());
        }

        Arc::new(Self {
            config,
            factory,
            broker,
            pc: StdMutex::new(None),
            generation: StdMutex::new(0),
            writes: Mutex::new(WriteState {
                channel: None,
                pending: BufferedWriter::new(),
            }),
            recv_pipe: Mutex::new(recv_pipe),
            write_pipe: Mutex::new(write_pipe),
            signals: Arc::new(Signals::new()),
            cycle_tasks: StdMutex::new(Vec::new()),
            state: watch::Sender::new(SessionState::Idle),
            offers: watch::Sender::new(None),
            stats,
            closed,
            close_once: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The most recent local offer, for relaying out of band.
    pub fn subscribe_offers(&self) -> watch::Receiver<Option<SessionDescription>> {
        self.offers.subscribe()
    }

    pub fn stats(&self) -> &ByteCounter {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Bytes written while no channel was open, waiting for the next one.
    pub async fn buffered_len(&self) -> usize {
        self.writes.lock().await.pending.len()
    }

    fn set_state(&self, state: SessionState) {
        if !self.closed.is_cancelled() {
            self.state.send_replace(state);
        }
    }

    fn lock_generation(&self) -> MutexGuard<'_, u64> {
        self.generation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_generation(&self) -> u64 {
        *self.lock_generation()
    }

    /// Post `value` only if `generation` is still the current one. A connection
    /// replaced in the meantime cannot leak a value into the next cycle.
    fn post_current<T>(&self, generation: u64, slot: &Slot<T>, value: T) -> bool {
        let current = self.lock_generation();
        if *current != generation {
            trace!("Dropping signal from replaced peer connection");
            return false;
        }
        slot.post(value)
    }

    fn reset_current(&self, generation: u64) {
        if self.post_current(generation, &self.signals.reset, ()) {
            info!("WebRTC resetting...");
        }
    }

    fn current_pc(&self) -> Option<Arc<dyn PeerConnection>> {
        self.pc.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn take_pc(&self) -> Option<Arc<dyn PeerConnection>> {
        self.pc.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.cycle_tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    async fn abort_cycle_tasks(&self) {
        let tasks: Vec<_> = self
            .cycle_tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
    }

    fn op_error(&self, op: Op) -> Error {
        Error::Op(OpError {
            op,
            addr: None,
            reason: CloseReason::Closed,
        })
    }

    // ── establish cycle ─────────────────────────────────────────────────────

    /// Replace the peer connection with a fresh one.
    ///
    /// Closes the previous connection first. Its channel, if still marked active,
    /// is dropped without a reset.
    pub async fn prepare_connection(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(self.op_error(Op::Connect));
        }
        self.set_state(SessionState::Preparing);
        let generation = {
            let mut current = self.lock_generation();
            *current += 1;
            *current
        };

        self.abort_cycle_tasks().await;
        if let Some(old) = self.take_pc() {
            old.close().await;
        }
        {
            let mut writes = self.writes.lock().await;
            if writes.channel.take().is_some() {
                debug!("Dropped channel of replaced peer connection");
            }
        }
        self.signals.clear_negotiation();

        let (pc, events) = self.factory.new_peer_connection(&self.config.peer).await?;
        *self.pc.lock().unwrap_or_else(|e| e.into_inner()) = Some(pc.clone());
        self.spawn_peer_events(generation, pc, events);
        info!("WebRTC: PeerConnection created.");
        Ok(())
    }

    /// Create the data channel on the current peer connection. Negotiation starts
    /// in the background.
    pub async fn establish_data_channel(self: &Arc<Self>) -> Result<()> {
        let pc = self.current_pc().ok_or(Error::NoPeerConnection)?;
        let generation = self.current_generation();
        let (channel, events) = pc.create_data_channel(&self.config.label).await?;
        self.set_state(SessionState::AwaitingOffer);
        self.spawn_channel_events(generation, channel, events);
        info!("WebRTC: DataChannel created.");
        Ok(())
    }

    /// Wait for the local offer and hand it off.
    ///
    /// With a broker, negotiation runs in the background and its result lands on
    /// the answer line. Without one, the offer is surfaced for manual relay and
    /// this returns at once; the answer must come through
    /// [`deliver_answer`](Self::deliver_answer).
    pub async fn send_offer(self: &Arc<Self>) -> Result<()> {
        debug!("sendOffer...");
        let offer = tokio::select! {
            offer = self.signals.offer.recv() => offer,
            err = self.signals.error.recv() => {
                if let Some(pc) = self.current_pc() {
                    pc.close().await;
                }
                return Err(err);
            }
            violation = self.signals.fatal.recv() => return Err(Error::Fatal(violation)),
            _ = self.closed.cancelled() => return Err(self.op_error(Op::Connect)),
        };

        self.set_state(SessionState::AwaitingAnswer);
        self.offers.send_replace(Some(offer.clone()));

        let Some(broker) = self.broker.clone() else {
            info!("Please Copy & Paste the following to the peer:");
            info!("----------------");
            info!("\n{}\n", offer.serialize()?);
            info!("----------------");
            return Ok(());
        };

        info!("Sending offer via broker...");
        let signals = self.signals.clone();
        self.track(tokio::spawn(async move {
            let answer = match broker.negotiate(offer).await {
                Ok(answer) => Some(answer),
                Err(e) => {
                    warn!("Broker error: {}", e);
                    None
                }
            };
            signals.answer.send(answer).await;
        }));
        Ok(())
    }

    /// Wait in the background for the answer and apply it.
    ///
    /// A missing answer triggers a reset after `reconnect_timeout`. Failing to
    /// apply one is reported on the error line.
    pub fn receive_answer(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let signals = self.signals.clone();
        let generation = self.current_generation();
        let delay = self.config.reconnect_timeout;
        let pc = self.current_pc();
        self.track(tokio::spawn(async move {
            let answer = signals.answer.recv().await;
            let Some(answer) = answer else {
                warn!("Failed to retrieve answer. Retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                if let Some(session) = session.upgrade() {
                    session.reset_current(generation);
                }
                return;
            };
            info!("Received answer");
            debug!("Answer SDP: {}", answer.sdp());
            let result = match pc {
                Some(pc) => pc.set_remote_description(answer).await,
                None => Err(Error::NoPeerConnection),
            };
            if let Err(e) = result {
                warn!("Failed to apply answer: {}", e);
                if let Some(session) = session.upgrade() {
                    session.post_current(generation, &session.signals.error, e);
                }
            }
        }));
    }

    /// Supply an answer obtained out of band (manual signaling).
    pub fn deliver_answer(&self, answer: SessionDescription) -> Result<()> {
        if answer.kind() != SdpType::Answer {
            return Err(Error::InvalidDescription("expected an answer".to_string()));
        }
        if !self.signals.answer.post(Some(answer)) {
            warn!("An answer is already pending, ignoring the new one");
        }
        Ok(())
    }

    /// Ask the reconnect loop to start a new cycle. Coalesced with a pending reset.
    pub fn reset(&self) {
        if self.signals.reset.post(()) {
            info!("WebRTC resetting...");
        }
    }

    /// Wait until the current cycle ends.
    pub(crate) async fn wait_reset(&self) -> Wake {
        tokio::select! {
            _ = self.signals.reset.recv() => Wake::Reset,
            err = self.signals.error.recv() => Wake::Negotiation(err),
            violation = self.signals.fatal.recv() => Wake::Fatal(violation),
            _ = self.closed.cancelled() => Wake::Closed,
        }
    }

    /// Close the current peer connection, leaving the session usable for the next cycle.
    pub(crate) async fn close_connection(&self) {
        if let Some(pc) = self.current_pc() {
            pc.close().await;
        }
    }

    // ── event dispatch ──────────────────────────────────────────────────────

    fn spawn_peer_events(
        self: &Arc<Self>,
        generation: u64,
        pc: Arc<dyn PeerConnection>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let session = Arc::downgrade(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match (event, session.upgrade()) {
                        (Some(event), Some(session)) => session.handle_peer_event(generation, &pc, event),
                        _ => break,
                    },
                    _ = closed.cancelled() => break,
                }
            }
            trace!("Peer events for generation {} finished", generation);
        });
    }

    fn handle_peer_event(self: &Arc<Self>, generation: u64, pc: &Arc<dyn PeerConnection>, event: PeerEvent) {
        if generation != self.current_generation() {
            trace!("Ignoring {:?} from replaced peer connection", event);
            return;
        }
        match event {
            PeerEvent::NegotiationNeeded => {
                debug!("WebRTC: OnNegotiationNeeded");
                let session = Arc::downgrade(self);
                let pc = pc.clone();
                self.track(tokio::spawn(async move {
                    let result: Result<()> = async {
                        let offer = pc.create_offer().await?;
                        pc.set_local_description(offer).await
                    }
                    .await;
                    if let Err(e) = result {
                        if let Some(session) = session.upgrade() {
                            session.post_current(generation, &session.signals.error, e);
                        }
                    }
                }));
            }
            PeerEvent::IceCandidate(candidate) => {
                debug!("WebRTC: ICE candidate {}", candidate);
            }
            PeerEvent::IceGatheringComplete => {
                debug!("WebRTC: OnIceComplete");
                match pc.local_description() {
                    Some(desc) => {
                        self.post_current(generation, &self.signals.offer, desc);
                    }
                    None => {
                        let err = Error::Negotiation("no local description".to_string());
                        self.post_current(generation, &self.signals.error, err);
                    }
                }
            }
            PeerEvent::DataChannel(label) => {
                error!("Unexpected remote data channel {:?}", label);
                self.post_current(generation, &self.signals.fatal, Violation::UnexpectedDataChannel);
            }
        }
    }

    fn spawn_channel_events(
        self: &Arc<Self>,
        generation: u64,
        channel: Arc<dyn DataChannel>,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        let session = Arc::downgrade(self);
        let closed = self.closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match (event, session.upgrade()) {
                        (Some(event), Some(session)) => {
                            session.handle_channel_event(generation, &channel, event).await
                        }
                        _ => break,
                    },
                    _ = closed.cancelled() => break,
                }
            }
            trace!("Channel events for generation {} finished", generation);
        });
    }

    async fn handle_channel_event(&self, generation: u64, channel: &Arc<dyn DataChannel>, event: ChannelEvent) {
        if generation != self.current_generation() {
            trace!("Ignoring channel event from replaced peer connection");
            return;
        }
        match event {
            ChannelEvent::Open => self.on_open(generation, channel).await,
            ChannelEvent::Close => self.on_close(generation).await,
            ChannelEvent::Message(data) => self.on_message(data).await,
        }
    }

    /// Flush buffered writes to the new channel, then make it the write target.
    /// Holding the write lock across both keeps later writes behind the flush.
    ///
    /// The generation is checked again under the lock: `prepare_connection` may
    /// have replaced the connection while this was waiting for it.
    async fn on_open(&self, generation: u64, channel: &Arc<dyn DataChannel>) {
        info!("WebRTC: DataChannel.OnOpen");
        let mut writes = self.writes.lock().await;
        if generation != self.current_generation() {
            debug!("Ignoring open of channel from replaced peer connection");
            return;
        }
        if writes.channel.is_some() {
            error!("Data channel opened while another one is active");
            self.signals.fatal.post(Violation::ChannelAlreadyOpen);
            return;
        }

        let pending = writes.pending.take();
        if !pending.is_empty() {
            let n = pending.len();
            if let Err(e) = channel.send(pending.clone()).await {
                warn!("Flush to new data channel failed: {}", e);
                writes.pending.write(&pending);
                drop(writes);
                self.reset_current(generation);
                return;
            }
            info!("Flushed {} bytes", n);
        }
        writes.channel = Some(channel.clone());
        drop(writes);
        self.set_state(SessionState::Open);
    }

    /// Stop writing to the channel. Only a close of the active channel resets;
    /// closes we caused by replacing the connection do not.
    async fn on_close(&self, generation: u64) {
        let mut writes = self.writes.lock().await;
        if generation != self.current_generation() {
            debug!("Ignoring close of channel from replaced peer connection");
            return;
        }
        if writes.channel.take().is_some() {
            drop(writes);
            info!("WebRTC: DataChannel.OnClose");
            self.set_state(SessionState::Idle);
            self.reset_current(generation);
        } else {
            debug!("WebRTC: DataChannel.OnClose with no active channel");
        }
    }

    async fn on_message(&self, data: Bytes) {
        if data.is_empty() {
            debug!("0 length message");
            return;
        }
        self.stats.add_inbound(data.len());
        let mut pipe = tokio::select! {
            pipe = self.write_pipe.lock() => pipe,
            _ = self.closed.cancelled() => return,
        };
        let result = tokio::select! {
            result = pipe.write_all(&data) => result,
            _ = self.closed.cancelled() => return,
        };
        // write_all only fails once the message cannot be written completely
        if let Err(e) = result {
            error!("Short write into read stream: {}", e);
            self.signals.fatal.post(Violation::ShortWrite);
        }
    }

    // ── byte stream ─────────────────────────────────────────────────────────

    /// Read bytes received over any data channel of this session.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(self.op_error(Op::Read));
        }
        let mut pipe = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(self.op_error(Op::Read)),
            pipe = self.recv_pipe.lock() => pipe,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(self.op_error(Op::Read)),
            n = pipe.read(buf) => Ok(n?),
        }
    }

    /// Write bytes to the peer, buffering them while no channel is open.
    ///
    /// Always accepts the whole of `buf`.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(self.op_error(Op::Write));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.stats.add_outbound(buf.len());

        let mut writes = self.writes.lock().await;
        match writes.channel.clone() {
            None => {
                writes.pending.write(buf);
                debug!("Buffered {} bytes --> WebRTC", buf.len());
            }
            Some(channel) => {
                if let Err(e) = channel.send(Bytes::copy_from_slice(buf)).await {
                    warn!("Data channel send failed, buffering: {}", e);
                    writes.channel = None;
                    writes.pending.write(buf);
                    drop(writes);
                    self.set_state(SessionState::Idle);
                    self.reset();
                }
            }
        }
        Ok(buf.len())
    }

    /// Close the session. The data channel closes along with the peer connection.
    ///
    /// Later calls return a close error.
    pub async fn close(&self) -> Result<()> {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return Err(self.op_error(Op::Close));
        }
        self.closed.cancel();
        self.state.send_replace(SessionState::Closed);
        self.abort_cycle_tasks().await;
        if let Some(pc) = self.take_pc() {
            pc.close().await;
        }
        debug!("PeerSession closed");
        Ok(())
    }

    pub fn local_addr(&self) -> Option<String> {
        None
    }

    pub fn remote_addr(&self) -> Option<String> {
        None
    }

    pub fn set_deadline(&self, _deadline: StdInstant) -> Result<()> {
        Err(Error::NotImplemented("set_deadline"))
    }

    pub fn set_read_deadline(&self, _deadline: StdInstant) -> Result<()> {
        Err(Error::NotImplemented("set_read_deadline"))
    }

    pub fn set_write_deadline(&self, _deadline: StdInstant) -> Result<()> {
        Err(Error::NotImplemented("set_write_deadline"))
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.closed.cancel();
        let tasks = self.cycle_tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockBroker, MockDataChannel, MockOptions, MockPeerFactory};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig {
            reconnect_timeout: Duration::from_millis(50),
            retry_delay: Duration::from_millis(10),
            stats_interval: None,
            ..Default::default()
        }
    }

    fn session(broker: Option<Arc<dyn Broker>>) -> (Arc<PeerSession>, Arc<MockPeerFactory>) {
        let factory = MockPeerFactory::new();
        (PeerSession::new(config(), factory.clone(), broker), factory)
    }

    fn open_channel() -> Arc<dyn DataChannel> {
        let (channel, _events) = MockDataChannel::new("test");
        channel.open();
        channel
    }

    async fn wait_state(session: &PeerSession, state: SessionState) {
        let mut rx = session.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    #[tokio::test]
    async fn test_writes_buffer_until_open_then_flush_in_order() {
        let (session, _factory) = session(None);
        session.write(b"one ").await.unwrap();
        session.write(b"two ").await.unwrap();
        session.write(b"three").await.unwrap();
        assert_eq!(session.buffered_len().await, 13);

        let (mock, _events) = MockDataChannel::new("test");
        mock.open();
        let channel: Arc<dyn DataChannel> = mock.clone();
        session.on_open(session.current_generation(), &channel).await;

        assert_eq!(session.buffered_len().await, 0);
        assert_eq!(mock.sent_bytes(), b"one two three");
        assert_eq!(mock.sent_messages().len(), 1);
        assert_eq!(session.state(), SessionState::Open);

        session.write(b" four").await.unwrap();
        assert_eq!(mock.sent_bytes(), b"one two three four");
        assert_eq!(session.stats().snapshot().outbound, 18);
    }

    #[tokio::test]
    async fn test_second_open_is_fatal() {
        let (session, _factory) = session(None);
        session.on_open(session.current_generation(), &open_channel()).await;
        session.on_open(session.current_generation(), &open_channel()).await;

        let violation = tokio::time::timeout(Duration::from_secs(1), session.signals.fatal.recv())
            .await
            .unwrap();
        assert_eq!(violation, Violation::ChannelAlreadyOpen);
    }

    #[tokio::test]
    async fn test_close_without_active_channel_does_not_reset() {
        let (session, _factory) = session(None);
        session.on_close(session.current_generation()).await;
        let reset = tokio::time::timeout(Duration::from_millis(20), session.signals.reset.recv()).await;
        assert!(reset.is_err());

        session.on_open(session.current_generation(), &open_channel()).await;
        session.on_close(session.current_generation()).await;
        tokio::time::timeout(Duration::from_secs(1), session.signals.reset.recv())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_failed_send_falls_back_to_buffer() {
        let (session, _factory) = session(None);
        let (mock, _events) = MockDataChannel::new("test");
        mock.open();
        let channel: Arc<dyn DataChannel> = mock.clone();
        session.on_open(session.current_generation(), &channel).await;

        mock.remote_close();
        assert_eq!(session.write(b"kept").await.unwrap(), 4);
        assert_eq!(session.buffered_len().await, 4);
        tokio::time::timeout(Duration::from_secs(1), session.signals.reset.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_messages_reach_reader() {
        let (session, _factory) = session(None);
        session.on_message(Bytes::from_static(b"hello")).await;
        session.on_message(Bytes::new()).await;
        session.on_message(Bytes::from_static(b" world")).await;

        let mut buf = [0u8; 32];
        let mut got = Vec::new();
        while got.len() < 11 {
            let n = session.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello world");
        assert_eq!(session.stats().snapshot().in_events, 2);
    }

    #[tokio::test]
    async fn test_manual_offer_returns_without_answer() {
        let (session, _factory) = session(None);
        session.prepare_connection().await.unwrap();
        session.establish_data_channel().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), session.send_offer())
            .await
            .expect("send_offer blocked")
            .unwrap();
        assert_eq!(session.state(), SessionState::AwaitingAnswer);

        let offer = session.subscribe_offers().borrow().clone().unwrap();
        assert_eq!(offer.kind(), SdpType::Offer);
    }

    #[tokio::test]
    async fn test_manual_answer_opens_channel() {
        let (session, factory) = session(None);
        session.prepare_connection().await.unwrap();
        session.establish_data_channel().await.unwrap();
        session.send_offer().await.unwrap();
        session.receive_answer();

        assert!(session.deliver_answer(SessionDescription::offer("wrong")).is_err());
        session.deliver_answer(SessionDescription::answer("manual")).unwrap();
        wait_state(&session, SessionState::Open).await;

        let pc = factory.connections().pop().unwrap();
        assert_eq!(pc.remote_description().unwrap().sdp(), "manual");
    }

    #[tokio::test]
    async fn test_broker_answer_opens_channel() {
        let broker = MockBroker::new();
        let (session, factory) = session(Some(broker.clone()));
        session.write(b"early").await.unwrap();

        session.prepare_connection().await.unwrap();
        session.establish_data_channel().await.unwrap();
        session.send_offer().await.unwrap();
        session.receive_answer();
        wait_state(&session, SessionState::Open).await;

        assert_eq!(broker.calls(), 1);
        assert_eq!(factory.latest_channel().unwrap().sent_bytes(), b"early");
    }

    #[tokio::test]
    async fn test_missing_answer_resets_after_timeout() {
        let broker = MockBroker::failing(1);
        let (session, _factory) = session(Some(broker));
        session.prepare_connection().await.unwrap();
        session.establish_data_channel().await.unwrap();
        session.send_offer().await.unwrap();
        session.receive_answer();

        let wake = tokio::time::timeout(Duration::from_secs(1), session.wait_reset())
            .await
            .unwrap();
        assert!(matches!(wake, Wake::Reset));
    }

    #[tokio::test]
    async fn test_offer_failure_closes_connection() {
        let factory = MockPeerFactory::with_options(MockOptions {
            fail_offer: true,
            ..Default::default()
        });
        let session = PeerSession::new(config(), factory.clone(), None);
        session.prepare_connection().await.unwrap();
        session.establish_data_channel().await.unwrap();

        let result = session.send_offer().await;
        assert!(matches!(result, Err(Error::Negotiation(_))));
        assert!(factory.connections()[0].is_closed());
    }

    #[tokio::test]
    async fn test_prepare_replaces_connection() {
        let (session, factory) = session(None);
        session.prepare_connection().await.unwrap();
        session.prepare_connection().await.unwrap();

        let connections = factory.connections();
        assert_eq!(connections.len(), 2);
        assert!(connections[0].is_closed());
        assert!(!connections[1].is_closed());
    }

    #[tokio::test]
    async fn test_close_is_exactly_once() {
        let (session, factory) = session(None);
        session.prepare_connection().await.unwrap();

        session.close().await.unwrap();
        assert!(factory.connections()[0].is_closed());
        assert_eq!(session.state(), SessionState::Closed);

        let err = session.close().await.unwrap_err();
        assert_eq!(err.op(), Some(Op::Close));

        let mut buf = [0u8; 8];
        assert_eq!(session.read(&mut buf).await.unwrap_err().op(), Some(Op::Read));
        assert_eq!(session.write(b"x").await.unwrap_err().op(), Some(Op::Write));
        assert!(session.prepare_connection().await.is_err());
    }

    #[tokio::test]
    async fn test_close_unblocks_read() {
        let (session, _factory) = session(None);
        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                session.read(&mut buf).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        session.close().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(result.unwrap_err().is_closed());
    }

    #[tokio::test]
    async fn test_reset_is_coalesced() {
        let (session, _factory) = session(None);
        session.reset();
        session.reset();
        assert!(matches!(session.wait_reset().await, Wake::Reset));

        let again = tokio::time::timeout(Duration::from_millis(20), session.wait_reset()).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_open_from_replaced_connection_is_ignored() {
        let (session, _factory) = session(None);
        let stale_generation = session.current_generation();
        let (old, _old_events) = MockDataChannel::new("old");
        old.open();

        // The open passes the first generation check, then waits for the write lock
        let writes = session.writes.lock().await;
        let pending_open = {
            let session = session.clone();
            let old: Arc<dyn DataChannel> = old.clone();
            tokio::spawn(async move {
                session
                    .handle_channel_event(stale_generation, &old, ChannelEvent::Open)
                    .await;
            })
        };
        tokio::task::yield_now().await;
        *session.lock_generation() += 1;
        drop(writes);
        pending_open.await.unwrap();

        assert!(session.writes.lock().await.channel.is_none());
        assert_ne!(session.state(), SessionState::Open);

        session.on_open(session.current_generation(), &open_channel()).await;
        assert_eq!(session.state(), SessionState::Open);
        let fatal = tokio::time::timeout(Duration::from_millis(20), session.signals.fatal.recv()).await;
        assert!(fatal.is_err());
    }

    #[tokio::test]
    async fn test_signals_from_replaced_connection_are_dropped() {
        let (session, factory) = session(None);
        session.prepare_connection().await.unwrap();
        let stale = session.current_generation();
        session.prepare_connection().await.unwrap();

        let stale_offer = SessionDescription::offer("stale");
        assert!(!session.post_current(stale, &session.signals.offer, stale_offer));
        let stale_error = Error::Negotiation("stale".to_string());
        assert!(!session.post_current(stale, &session.signals.error, stale_error));
        assert!(!session.post_current(stale, &session.signals.reset, ()));

        session.establish_data_channel().await.unwrap();
        session.send_offer().await.unwrap();
        let offer = session.subscribe_offers().borrow().clone().unwrap();
        let current = &factory.connections()[1];
        assert_eq!(offer.sdp(), format!("mock-offer-{}", current.id()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_flush_is_atomic_with_concurrent_writes() {
        let (session, _factory) = session(None);
        let mut expected = Vec::new();
        for i in 0..50 {
            let chunk = format!("pre{};", i);
            session.write(chunk.as_bytes()).await.unwrap();
            expected.extend_from_slice(chunk.as_bytes());
        }

        let writer = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut written = Vec::new();
                for i in 0..500 {
                    let chunk = format!("w{};", i);
                    session.write(chunk.as_bytes()).await.unwrap();
                    written.extend_from_slice(chunk.as_bytes());
                    if i % 25 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                written
            })
        };

        let (mock, _events) = MockDataChannel::new("test");
        mock.open();
        let channel: Arc<dyn DataChannel> = mock.clone();
        tokio::task::yield_now().await;
        session.on_open(session.current_generation(), &channel).await;

        expected.extend(writer.await.unwrap());
        assert_eq!(mock.sent_bytes(), expected);
        assert_eq!(session.buffered_len().await, 0);
    }

    #[tokio::test]
    async fn test_failed_write_into_read_stream_is_fatal() {
        let (session, _factory) = session(None);
        // Swap out the read half so the pipe has no reader left
        let (replacement, _other) = tokio::io::duplex(8);
        *session.recv_pipe.lock().await = replacement;

        session.on_message(Bytes::from_static(b"lost")).await;
        let violation = tokio::time::timeout(Duration::from_secs(1), session.signals.fatal.recv())
            .await
            .unwrap();
        assert_eq!(violation, Violation::ShortWrite);
    }

    #[tokio::test]
    async fn test_dropped_session_is_released() {
        let (session, factory) = session(None);
        session.prepare_connection().await.unwrap();
        session.establish_data_channel().await.unwrap();
        session.send_offer().await.unwrap();
        session.receive_answer();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The capability still holds its event senders
        assert!(!factory.connections()[0].is_closed());

        let weak = Arc::downgrade(&session);
        drop(session);
        assert!(weak.upgrade().is_none());
    }
}
